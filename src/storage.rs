// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::block::{Block, BlockKind};
use crate::block_size::BlockSize;
use crate::error::AfsError;

/// Interface used by [`Afs`] to read and write blocks on the
/// underlying storage device.
///
/// Implementations may be in-memory (see [`MemStorage`]) or backed by
/// a file or device. The contract the core relies on:
///
/// * **Atomicity**: [`complete_journaled_write`] must make all
///   supplied block images durable as a group. After a crash, either
///   all or none of the writes in a group are visible.
/// * Reads during a journaled write return the pre-scope contents;
///   the core buffers its own edits and never requires
///   read-your-writes from the storage.
/// * At most one journaled write is active at a time; the core
///   serializes mutators.
///
/// [`Afs`]: crate::Afs
/// [`MemStorage`]: crate::MemStorage
/// [`complete_journaled_write`]: Self::complete_journaled_write
pub trait AfsStorage {
    /// Size of every block.
    fn block_size(&self) -> BlockSize;

    /// Maximum number of blocks the storage can hold, or `u64::MAX`
    /// if unbounded.
    fn max_blocks(&self) -> u64;

    /// Number of blocks currently allocated.
    fn nr_blocks(&self) -> u64;

    /// Extend the storage by one zero-filled block and return a handle
    /// to it. Only valid during a journaled write; the new block is
    /// discarded if the write is aborted.
    ///
    /// Fails with [`AfsError::OutOfSpace`] if the storage cannot grow,
    /// or [`AfsError::StorageInErrorState`] if the storage can no
    /// longer be written.
    fn add_new_block(&mut self) -> Result<Block, AfsError>;

    /// Read an existing block.
    ///
    /// Fails with [`AfsError::BlockIndexInvalid`] if `block_index` has
    /// never been allocated.
    fn obtain_block(&mut self, block_index: u64) -> Result<Block, AfsError>;

    /// Start a journaled write. The core guarantees no other journaled
    /// write is active.
    fn begin_journaled_write(&mut self);

    /// Abandon the active journaled write. Blocks added since
    /// [`begin_journaled_write`] are discarded.
    ///
    /// [`begin_journaled_write`]: Self::begin_journaled_write
    fn abort_journaled_write(&mut self);

    /// Atomically persist the images of all `changed` blocks and end
    /// the journaled write. Every block added during the write must
    /// appear in `changed`.
    fn complete_journaled_write(
        &mut self,
        changed: &[Block],
    ) -> Result<(), AfsError>;
}

/// Obtain a block and require its kind tag.
///
/// A mismatched kind maps to [`AfsError::UnexpectedBlockKind`]; the
/// caller decides whether that means "not found" (a recycled object
/// block) or corruption.
pub(crate) fn obtain_block_check_kind(
    storage: &mut dyn AfsStorage,
    block_index: u64,
    kind: BlockKind,
) -> Result<Block, AfsError> {
    let block = storage.obtain_block(block_index)?;
    if block.kind() != kind {
        return Err(AfsError::UnexpectedBlockKind);
    }
    Ok(block)
}
