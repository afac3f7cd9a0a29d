// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::block::Block;
use crate::block_size::BlockSize;
use crate::error::AfsError;
use crate::storage::AfsStorage;
use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

/// In-memory block storage.
///
/// This is the reference [`AfsStorage`] implementation: block indices
/// are dense, a journaled write stages added blocks until completion,
/// and completion replaces all committed images at once (trivially
/// atomic in memory). It also enforces the parts of the storage
/// contract the core depends on: a single active journaled write, and
/// each block obtained at most once per write (two live handles to
/// one block inside a scope would let edits diverge).
pub struct MemStorage {
    block_size: BlockSize,
    max_blocks: u64,
    /// Committed block images, indexed by block index.
    blocks: Vec<Vec<u8>>,

    in_journaled_write: bool,
    /// Indices obtained during the active journaled write.
    obtained: BTreeSet<u64>,
    /// Indices of blocks added during the active journaled write.
    /// Storage does not grow until the write completes.
    staged_adds: Vec<u64>,
}

impl MemStorage {
    /// Create an empty storage with the given geometry.
    #[must_use]
    pub fn new(block_size: BlockSize, max_blocks: u64) -> Self {
        Self {
            block_size,
            max_blocks,
            blocks: Vec::new(),
            in_journaled_write: false,
            obtained: BTreeSet::new(),
            staged_adds: Vec::new(),
        }
    }

    /// Create a storage from a raw image, as produced by
    /// [`Self::to_image`].
    ///
    /// # Panics
    ///
    /// Panics if the image length is not a multiple of the block size.
    #[cfg(feature = "std")]
    pub fn from_image(
        block_size: BlockSize,
        max_blocks: u64,
        image: &[u8],
    ) -> Self {
        let bs = block_size.to_usize();
        assert!(image.len() % bs == 0, "image is not whole blocks");
        let mut storage = Self::new(block_size, max_blocks);
        for chunk in image.chunks_exact(bs) {
            storage.blocks.push(chunk.to_vec());
        }
        storage
    }

    /// Concatenate all committed blocks into one image.
    #[cfg(feature = "std")]
    #[must_use]
    pub fn to_image(&self) -> Vec<u8> {
        let mut image =
            Vec::with_capacity(self.blocks.len() * self.block_size.to_usize());
        for block in &self.blocks {
            image.extend_from_slice(block);
        }
        image
    }
}

impl AfsStorage for MemStorage {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn max_blocks(&self) -> u64 {
        self.max_blocks
    }

    fn nr_blocks(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn add_new_block(&mut self) -> Result<Block, AfsError> {
        assert!(self.in_journaled_write);

        let index = self.blocks.len() as u64 + self.staged_adds.len() as u64;
        if index == self.max_blocks {
            return Err(AfsError::OutOfSpace);
        }

        self.staged_adds.push(index);
        Ok(Block::new(index, vec![0; self.block_size.to_usize()]))
    }

    fn obtain_block(&mut self, block_index: u64) -> Result<Block, AfsError> {
        // Blocks staged by the active journaled write are not yet
        // obtainable; the core keeps its own handles to them.
        let Ok(i) = usize::try_from(block_index) else {
            return Err(AfsError::BlockIndexInvalid);
        };
        let Some(bytes) = self.blocks.get(i) else {
            return Err(AfsError::BlockIndexInvalid);
        };

        if self.in_journaled_write {
            assert!(
                self.obtained.insert(block_index),
                "block {block_index} obtained twice in one journaled write"
            );
        }

        Ok(Block::new(block_index, bytes.clone()))
    }

    fn begin_journaled_write(&mut self) {
        assert!(!self.in_journaled_write);
        assert!(self.staged_adds.is_empty());
        self.obtained.clear();
        self.in_journaled_write = true;
    }

    fn abort_journaled_write(&mut self) {
        assert!(self.in_journaled_write);
        self.staged_adds.clear();
        self.obtained.clear();
        self.in_journaled_write = false;
    }

    fn complete_journaled_write(
        &mut self,
        changed: &[Block],
    ) -> Result<(), AfsError> {
        assert!(self.in_journaled_write);

        let committed = self.blocks.len() as u64;
        let mut new_blocks: Vec<Option<Vec<u8>>> =
            vec![None; self.staged_adds.len()];
        let mut written = BTreeSet::new();

        for block in changed {
            assert!(block.change_pending());
            let index = block.index();
            assert!(
                written.insert(index),
                "block {index} written twice in one journaled write"
            );

            if index < committed {
                // Block existed before the current journaled write.
                self.blocks[usize::try_from(index).unwrap()] =
                    block.bytes().to_vec();
            } else {
                // Block was added in the current journaled write.
                let staged = usize::try_from(index - committed).unwrap();
                assert!(staged < self.staged_adds.len());
                new_blocks[staged] = Some(block.bytes().to_vec());
            }
        }

        // Every block added in this journaled write must be written.
        for (staged, bytes) in new_blocks.into_iter().enumerate() {
            let bytes = bytes.unwrap_or_else(|| {
                panic!("added block {} was never written", self.staged_adds[staged])
            });
            self.blocks.push(bytes);
        }

        self.staged_adds.clear();
        self.obtained.clear();
        self.in_journaled_write = false;
        Ok(())
    }
}
