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
use crate::storage::{AfsStorage, obtain_block_check_kind};
use crate::views::{FreeListView, MasterView, NO_PREV_FREE_LIST};
use alloc::vec::Vec;
use core::cell::RefMut;
use core::mem;

/// A journaled write: the scope of one atomic mutation.
///
/// The scope tracks every block edited through it, the blocks to be
/// released to the free list, and the current free-list tail (which
/// the scope may replace). [`complete`] pushes the pending frees onto
/// the free list and hands the full set of changed block images to
/// the storage as one atomic group; [`abort`] restores every edited
/// block to its pre-scope image and tells the storage to discard the
/// write.
///
/// Cursors that buffer decoded node edits register with the scope's
/// finalization counter; [`complete`] asserts the counter is zero, so
/// a cursor whose changes were never encoded back cannot slip through.
///
/// [`complete`]: Self::complete
/// [`abort`]: Self::abort
pub(crate) struct JournaledWrite {
    block_size: BlockSize,
    master: Block,
    /// The scope's current free-list tail. Starts as the cached tail;
    /// reclaiming the tail or overflowing it replaces this handle.
    free_tail: Block,
    tail_replaced: bool,
    changed: Vec<Block>,
    to_free: Vec<Block>,
    finalizations_pending: u32,
}

impl JournaledWrite {
    pub(crate) fn begin(
        storage: &mut dyn AfsStorage,
        master: &Block,
        free_tail: &Block,
    ) -> Self {
        storage.begin_journaled_write();
        Self {
            block_size: storage.block_size(),
            master: master.clone(),
            free_tail: free_tail.clone(),
            tail_replaced: false,
            changed: Vec::new(),
            to_free: Vec::new(),
            finalizations_pending: 0,
        }
    }

    /// Mutably borrow a block's bytes, saving its pre-scope image and
    /// registering it as changed on the first edit.
    pub(crate) fn edit<'b>(&mut self, block: &'b Block) -> RefMut<'b, Vec<u8>> {
        if !block.change_pending() {
            block.begin_change();
            self.changed.push(block.clone());
        }
        block.bytes_mut()
    }

    pub(crate) fn set_block_kind(&mut self, block: &Block, kind: BlockKind) {
        let mut bytes = self.edit(block);
        bytes[0] = kind.as_raw();
    }

    /// Allocate the next object unique id from the master block.
    pub(crate) fn take_next_unique_id(&mut self) -> u64 {
        let id = {
            let bytes = self.master.bytes();
            MasterView::new(&*bytes).next_unique_id()
        };
        let master = self.master.clone();
        let mut bytes = self.edit(&master);
        MasterView::new(bytes.as_mut_slice()).set_next_unique_id(id + 1);
        id
    }

    /// Zero a block's image and schedule it for release to the free
    /// list when the scope completes.
    pub(crate) fn add_block_to_free(&mut self, block: &Block) {
        {
            let mut bytes = self.edit(block);
            bytes.fill(0);
        }
        self.to_free.push(block.clone());
    }

    /// Return a block for reuse, tagged with `kind` and otherwise
    /// zero-filled: first from this scope's to-free list, then from
    /// the free-list tail, then the former tail itself once drained,
    /// else a freshly allocated block.
    pub(crate) fn reclaim_block_or_add_new(
        &mut self,
        storage: &mut dyn AfsStorage,
        kind: BlockKind,
    ) -> Result<Block, AfsError> {
        let block = match self.try_reclaim(storage) {
            Some(block) => block,
            None => {
                let block = storage.add_new_block()?;
                // A fresh block is registered as changed right away;
                // every added block must be written at completion.
                block.begin_change();
                self.changed.push(block.clone());
                block
            }
        };
        self.set_block_kind(&block, kind);
        Ok(block)
    }

    fn try_reclaim(&mut self, storage: &mut dyn AfsStorage) -> Option<Block> {
        // A block this scope already freed can be taken straight back.
        if let Some(block) = self.to_free.pop() {
            return Some(block);
        }

        // Pop an index from the free-list tail block.
        let (nr_indices, prev_index) = {
            let bytes = self.free_tail.bytes();
            let view = FreeListView::new(&*bytes);
            (view.nr_indices(), view.prev_free_list_index())
        };
        if nr_indices != 0 {
            let block_index = {
                let bytes = self.free_tail.bytes();
                FreeListView::new(&*bytes).free_block_index(nr_indices - 1)
            };
            let tail = self.free_tail.clone();
            {
                let mut bytes = self.edit(&tail);
                FreeListView::new(bytes.as_mut_slice())
                    .set_nr_indices(nr_indices - 1);
            }
            let block =
                obtain_block_check_kind(storage, block_index, BlockKind::FreeBlock)
                    .unwrap_or_else(|e| {
                        panic!("free list entry {block_index} unusable: {e}")
                    });
            return Some(block);
        }

        // The tail is empty. If there is a previous free-list block,
        // it becomes the new tail and the drained tail is reclaimed.
        if prev_index != NO_PREV_FREE_LIST {
            let new_tail = obtain_block_check_kind(
                storage,
                prev_index,
                BlockKind::FreeList,
            )
            .unwrap_or_else(|e| {
                panic!("free list block {prev_index} unusable: {e}")
            });
            {
                let bytes = new_tail.bytes();
                let view = FreeListView::new(&*bytes);
                assert_eq!(
                    view.nr_indices(),
                    FreeListView::max_indices(self.block_size),
                    "non-tail free list block is not full"
                );
            }

            let old_tail = mem::replace(&mut self.free_tail, new_tail);
            self.tail_replaced = true;

            let nr_full = {
                let bytes = self.master.bytes();
                MasterView::new(&*bytes).nr_full_free_list_nodes()
            };
            assert!(nr_full != 0);
            let master = self.master.clone();
            {
                let mut bytes = self.edit(&master);
                let mut view = MasterView::new(bytes.as_mut_slice());
                view.set_free_list_tail_index(prev_index);
                view.set_nr_full_free_list_nodes(nr_full - 1);
            }

            // The drained tail still holds stale free-list bytes; zero
            // them so they can never surface as file content.
            {
                let mut bytes = self.edit(&old_tail);
                bytes.fill(0);
            }
            return Some(old_tail);
        }

        None
    }

    pub(crate) fn inc_finalizations_pending(&mut self) {
        self.finalizations_pending += 1;
    }

    pub(crate) fn dec_finalizations_pending(&mut self) {
        assert!(self.finalizations_pending != 0);
        self.finalizations_pending -= 1;
    }

    /// Push pending frees onto the free list, atomically persist all
    /// changed blocks, and end the scope. Returns the new free-list
    /// tail handle if the scope replaced it.
    pub(crate) fn complete(
        mut self,
        storage: &mut dyn AfsStorage,
    ) -> Result<Option<Block>, AfsError> {
        assert_eq!(
            self.finalizations_pending, 0,
            "a cursor was not finalized before completion"
        );

        let max_indices = FreeListView::max_indices(self.block_size);
        let to_free = mem::take(&mut self.to_free);
        for block in to_free {
            let nr_indices = {
                let bytes = self.free_tail.bytes();
                FreeListView::new(&*bytes).nr_indices()
            };
            if nr_indices != max_indices {
                // The tail has room; record the block as free.
                assert!(nr_indices < max_indices);
                let tail = self.free_tail.clone();
                {
                    let mut bytes = self.edit(&tail);
                    let mut view = FreeListView::new(bytes.as_mut_slice());
                    view.set_free_block_index(nr_indices, block.index());
                    view.set_nr_indices(nr_indices + 1);
                }
                self.set_block_kind(&block, BlockKind::FreeBlock);
            } else {
                // The tail is full; the freed block becomes the new
                // tail, chained to the old one.
                let prev_tail =
                    mem::replace(&mut self.free_tail, block.clone());
                self.tail_replaced = true;
                self.set_block_kind(&block, BlockKind::FreeList);
                {
                    let mut bytes = self.edit(&block);
                    let mut view = FreeListView::new(bytes.as_mut_slice());
                    view.set_prev_free_list_index(prev_tail.index());
                    view.set_nr_indices(0);
                }
                let nr_full = {
                    let bytes = self.master.bytes();
                    MasterView::new(&*bytes).nr_full_free_list_nodes()
                };
                let master = self.master.clone();
                {
                    let mut bytes = self.edit(&master);
                    let mut view = MasterView::new(bytes.as_mut_slice());
                    view.set_free_list_tail_index(block.index());
                    view.set_nr_full_free_list_nodes(nr_full + 1);
                }
            }
        }

        match storage.complete_journaled_write(&self.changed) {
            Ok(()) => {
                for block in &self.changed {
                    block.commit_change();
                }
                Ok(self.tail_replaced.then(|| self.free_tail.clone()))
            }
            Err(e) => {
                storage.abort_journaled_write();
                for block in &self.changed {
                    block.revert_change();
                }
                Err(e)
            }
        }
    }

    /// Abandon the scope: restore every edited block and discard the
    /// storage-side write.
    pub(crate) fn abort(self, storage: &mut dyn AfsStorage) {
        storage.abort_journaled_write();
        for block in &self.changed {
            block.revert_change();
        }
    }
}
