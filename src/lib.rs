// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

mod block;
mod block_size;
mod dir_entry;
mod dir_tree;
mod error;
mod file_tree;
mod journal;
mod mem_storage;
mod obj_id;
mod stat;
mod storage;
#[cfg(test)]
mod test_util;
mod time;
mod tree;
mod util;
mod views;

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::cell::RefCell;
use dir_tree::DirCursor;
use file_tree::{FileCursor, implied_capacity};
use journal::JournaledWrite;
use storage::obtain_block_check_kind;
use tree::{CanAddNode, EnumDir, FindResult, NavPath, StopEarly, REBALANCE_FRACTION};
use views::{
    DirLeafEntry, DirNodeView, FileNodeView, FreeListView, MasterView, NodeCat,
    NodeView, TopView, FS_VERSION, NO_PREV_FREE_LIST,
};

pub use block::{Block, BlockKind};
pub use block_size::BlockSize;
pub use dir_entry::DirEntry;
pub use error::AfsError;
pub use mem_storage::MemStorage;
pub use obj_id::{ObjId, ObjType};
pub use stat::{StatFields, StatInfo, StatKind};
pub use storage::AfsStorage;
pub use time::AfsTime;
pub use tree::NameCmp;

/// Upper bound on the number of data blocks one journaled write may
/// add or drop during a chunked resize. Keeps the changed-block set
/// of a single scope bounded; [`Afs::file_set_size`] loops scopes
/// until the target size is reached.
const SET_SIZE_MAX_BLOCKS_PER_ROUND: u64 = 64;

fn byte_name_cmp(a: &[u8], b: &[u8]) -> core::cmp::Ordering {
    a.cmp(b)
}

/// A journaled, block-addressed object store: hierarchical
/// directories and variable-sized files over a flat block device.
///
/// Every object (directory or file) is rooted in a *top node* block
/// whose index doubles as the object's [`ObjId`]. Directory bodies
/// are B+-trees ordered by name; file bodies are B+-trees keyed by
/// byte offset, with small files stored inline in the top node.
/// Every mutation runs inside one journaled write: the set of changed
/// blocks becomes visible atomically, or not at all.
///
/// Mutating operations take `&mut self`; the caller serializes them.
/// Read operations take `&self` and see the committed state.
pub struct Afs {
    /// The underlying block device.
    ///
    /// `AfsStorage` methods take `&mut self` (obtaining a block can
    /// update journaling state), but reads through `Afs` are
    /// logically const, so the box is wrapped in `RefCell` to let
    /// `&self` operations borrow it mutably. `RefCell` enforces at
    /// runtime that only one borrow is active at a time.
    storage: RefCell<Box<dyn AfsStorage>>,
    block_size: BlockSize,
    cmp: NameCmp,
    max_name_bytes: u32,
    max_meta_bytes: u32,

    /// Cached long-lived blocks. While a journaled write is active,
    /// edits to these go through copy-on-write so an abort restores
    /// them.
    master: Block,
    free_tail: Block,
    root_top: Block,
}

impl core::fmt::Debug for Afs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Afs").finish_non_exhaustive()
    }
}

impl Afs {
    /// Open a filesystem on `storage`, creating it if the storage is
    /// empty, with names ordered bytewise.
    ///
    /// On an empty storage this creates the three seed blocks: the
    /// root directory's top node at block 0 (carrying `root_meta`),
    /// the master block at block 1, and the free-list tail at
    /// block 2. On a non-empty storage it loads and validates them;
    /// a master block written by a different version fails with
    /// [`AfsError::UnsupportedFsVersion`].
    pub fn init(
        storage: Box<dyn AfsStorage>,
        root_meta: &[u8],
        now: AfsTime,
    ) -> Result<Self, AfsError> {
        Self::init_with_cmp(storage, root_meta, now, byte_name_cmp)
    }

    /// Like [`Self::init`], with a caller-supplied name comparator.
    ///
    /// The comparator defines entry order within every directory and
    /// must stay the same across reopens of the same storage.
    pub fn init_with_cmp(
        mut storage: Box<dyn AfsStorage>,
        root_meta: &[u8],
        now: AfsTime,
        cmp: NameCmp,
    ) -> Result<Self, AfsError> {
        let block_size = storage.block_size();
        if root_meta.len() > 255 {
            return Err(AfsError::MetaDataTooLong);
        }

        let first_init = storage.nr_blocks() == 0;
        let (root_top, master, free_tail) = if first_init {
            storage.begin_journaled_write();
            let (root, master, tail) =
                match seed_filesystem(storage.as_mut(), root_meta, now) {
                    Ok(blocks) => blocks,
                    Err(e) => {
                        storage.abort_journaled_write();
                        return Err(e);
                    }
                };

            // Validate the derived name limit before committing; an
            // oversized root metadata would leave no entry space.
            let (max_name, max_meta) = name_limits(block_size, &root);
            if max_name == 0 || root_meta.len() > max_meta {
                storage.abort_journaled_write();
                for block in [&root, &master, &tail] {
                    block.revert_change();
                }
                return Err(AfsError::MetaDataTooLong);
            }

            match storage.complete_journaled_write(&[
                root.clone(),
                master.clone(),
                tail.clone(),
            ]) {
                Ok(()) => {
                    for block in [&root, &master, &tail] {
                        block.commit_change();
                    }
                }
                Err(e) => {
                    storage.abort_journaled_write();
                    for block in [&root, &master, &tail] {
                        block.revert_change();
                    }
                    return Err(e);
                }
            }
            (root, master, tail)
        } else {
            let master = obtain_block_check_kind(
                storage.as_mut(),
                1,
                BlockKind::Master,
            )
            .unwrap_or_else(|e| panic!("master block unusable: {e}"));

            let (version, tail_index, root_index) = {
                let bytes = master.bytes();
                let view = MasterView::new(&*bytes);
                (
                    view.fs_version(),
                    view.free_list_tail_index(),
                    view.root_dir_top_node_index(),
                )
            };
            if version != FS_VERSION {
                return Err(AfsError::UnsupportedFsVersion);
            }

            let free_tail = obtain_block_check_kind(
                storage.as_mut(),
                tail_index,
                BlockKind::FreeList,
            )
            .unwrap_or_else(|e| panic!("free list tail unusable: {e}"));
            let root_top = obtain_block_check_kind(
                storage.as_mut(),
                root_index,
                BlockKind::Node,
            )
            .unwrap_or_else(|e| panic!("root directory unusable: {e}"));
            (root_top, master, free_tail)
        };

        let (max_name_bytes, max_meta_bytes) =
            name_limits(block_size, &root_top);
        assert!(max_name_bytes != 0, "block size leaves no room for names");
        if root_meta.len() > max_meta_bytes {
            return Err(AfsError::MetaDataTooLong);
        }

        Ok(Self {
            storage: RefCell::new(storage),
            block_size,
            cmp,
            max_name_bytes,
            max_meta_bytes: u32::try_from(max_meta_bytes).unwrap(),
            master,
            free_tail,
            root_top,
        })
    }

    /// Tear down the handle and return the storage, e.g. to reopen it
    /// later or to persist an image.
    pub fn into_storage(self) -> Box<dyn AfsStorage> {
        self.storage.into_inner()
    }

    /// Block size of the underlying storage.
    pub fn block_size(&self) -> u32 {
        self.block_size.to_u32()
    }

    /// Number of blocks currently allocated by the storage.
    pub fn nr_blocks(&self) -> u64 {
        self.storage.borrow().nr_blocks()
    }

    /// Maximum directory entry name length, derived from the block
    /// size such that a maximum-length entry always fits in a
    /// rebalance-threshold-sized node.
    pub fn max_name_bytes(&self) -> u32 {
        self.max_name_bytes
    }

    /// Maximum object metadata length.
    pub fn max_meta_bytes(&self) -> u32 {
        self.max_meta_bytes
    }

    /// Upper bound on the number of additional blocks available for
    /// new objects: unallocated storage plus free-list contents.
    pub fn free_space_blocks(&self) -> u64 {
        let storage = self.storage.borrow();
        let max_blocks = storage.max_blocks();
        if max_blocks == u64::MAX {
            return u64::MAX;
        }
        let unallocated = max_blocks.saturating_sub(storage.nr_blocks());

        let nr_full = {
            let bytes = self.master.bytes();
            MasterView::new(&*bytes).nr_full_free_list_nodes()
        };
        let tail_nr = {
            let bytes = self.free_tail.bytes();
            u64::from(FreeListView::new(&*bytes).nr_indices())
        };
        let max_indices = u64::from(FreeListView::max_indices(self.block_size));

        // Full free-list blocks themselves become reusable once
        // drained, hence the extra `nr_full`.
        unallocated.saturating_add(nr_full * max_indices + nr_full + tail_nr)
    }

    /// Walk the whole free-list chain, asserting uniqueness of all
    /// recorded indices and consistency with the master block. For
    /// diagnostics; not needed for correctness.
    ///
    /// # Panics
    ///
    /// Panics if the free list is inconsistent.
    pub fn verify_free_list(&self) {
        let mut storage = self.storage.borrow_mut();
        let storage = storage.as_mut();

        let mut seen = BTreeSet::new();
        let mut current = self.free_tail.clone();
        let mut nr_full = 0u64;
        let max_indices = FreeListView::max_indices(self.block_size);

        loop {
            assert!(current.index() > 1);
            assert!(seen.insert(current.index()), "free list block repeated");

            let (free_indices, prev_index) = {
                let bytes = current.bytes();
                let view = FreeListView::new(&*bytes);
                let indices: Vec<u64> = (0..view.nr_indices())
                    .map(|i| view.free_block_index(i))
                    .collect();
                (indices, view.prev_free_list_index())
            };
            for index in free_indices {
                assert!(index > 2);
                assert!(seen.insert(index), "free block index repeated");
            }

            if prev_index == NO_PREV_FREE_LIST {
                break;
            }
            let next = obtain_block_check_kind(
                storage,
                prev_index,
                BlockKind::FreeList,
            )
            .unwrap_or_else(|e| panic!("free list block unusable: {e}"));
            {
                let bytes = next.bytes();
                assert_eq!(
                    FreeListView::new(&*bytes).nr_indices(),
                    max_indices,
                    "non-tail free list block is not full"
                );
            }
            current = next;
            nr_full += 1;
        }

        let (master_nr_full, master_root_index) = {
            let bytes = self.master.bytes();
            let view = MasterView::new(&*bytes);
            (view.nr_full_free_list_nodes(), view.root_dir_top_node_index())
        };
        assert_eq!(master_nr_full, nr_full);
        assert_eq!(master_root_index, self.root_top.index());
    }

    // ---------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------

    /// Look up `name` in a directory.
    pub fn find(
        &self,
        parent_dir: ObjId,
        name: &[u8],
    ) -> Result<DirEntry, AfsError> {
        let mut storage = self.storage.borrow_mut();
        find_in(storage.as_mut(), self.block_size, self.cmp, parent_dir, name)
    }

    /// Resolve a slash-separated absolute path from the root, returning
    /// the entries for each component. `"/"` resolves to an empty list.
    pub fn crack_path(
        &self,
        abs_path: &[u8],
    ) -> Result<Vec<DirEntry>, AfsError> {
        let Some(mut reader) = abs_path.strip_prefix(b"/") else {
            return Err(AfsError::InvalidPathSyntax);
        };

        let mut names: Vec<&[u8]> = Vec::new();
        while !reader.is_empty() {
            let len = reader
                .iter()
                .position(|b| *b == b'/')
                .unwrap_or(reader.len());
            if len == 0 {
                return Err(AfsError::InvalidPathSyntax);
            }
            names.push(&reader[..len]);
            reader = &reader[len..];
            if let Some(rest) = reader.strip_prefix(b"/") {
                reader = rest;
            }
        }

        let mut entries: Vec<DirEntry> = Vec::with_capacity(names.len());
        let mut parent_dir = ObjId::ROOT;
        for name in names {
            if let Some(parent) = entries.last() {
                if !parent.obj_type().is_dir() {
                    return Err(AfsError::ObjNotDir);
                }
                parent_dir = parent.id();
            }
            let entry = self.find(parent_dir, name)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Read an object's status from its top node.
    pub fn stat(&self, id: ObjId) -> Result<StatInfo, AfsError> {
        let mut storage = self.storage.borrow_mut();
        let block = top_block(storage.as_mut(), id, None)?;
        let bytes = block.bytes();
        let node = NodeView::new(&*bytes);
        let top = TopView::new(&*bytes);

        let kind = match node.obj_type() {
            ObjType::Dir => StatKind::Dir {
                nr_entries: top.dir_nr_entries(),
            },
            ObjType::File => StatKind::File {
                size_bytes: top.file_size_bytes(),
            },
        };
        Ok(StatInfo {
            id,
            parent_id: top.parent_id(),
            kind,
            create_time: AfsTime::from_ticks(top.create_time()),
            modify_time: AfsTime::from_ticks(top.modify_time()),
            meta: top.meta().to_vec(),
        })
    }

    /// Overwrite selected status fields. Metadata can only be
    /// rewritten at its original length; the payload that follows it
    /// in the top node cannot move.
    pub fn set_stat(
        &mut self,
        id: ObjId,
        info: &StatInfo,
        fields: StatFields,
    ) -> Result<(), AfsError> {
        let mut jw = JournaledWrite::begin(
            self.storage.get_mut().as_mut(),
            &self.master,
            &self.free_tail,
        );
        let result =
            set_stat_in(self.storage.get_mut().as_mut(), &mut jw, id, info, fields);
        self.finish(jw, result)
    }

    // ---------------------------------------------------------------
    // Directories
    // ---------------------------------------------------------------

    /// Create an empty directory named `name` under `parent_dir`.
    pub fn dir_create(
        &mut self,
        parent_dir: ObjId,
        name: &[u8],
        meta: &[u8],
        now: AfsTime,
    ) -> Result<ObjId, AfsError> {
        self.check_name(name)?;
        self.check_meta(meta)?;
        let mut jw = JournaledWrite::begin(
            self.storage.get_mut().as_mut(),
            &self.master,
            &self.free_tail,
        );
        let result = create_obj(
            self.storage.get_mut().as_mut(),
            &mut jw,
            self.block_size,
            self.cmp,
            parent_dir,
            name,
            meta,
            now,
            ObjType::Dir,
        );
        self.finish(jw, result)
    }

    /// Read a batch of directory entries ordered by name, starting
    /// after `last_name_read` (pass an empty slice to start at the
    /// beginning). Returns `true` once the end of the directory has
    /// been reached.
    ///
    /// A call stops early after a bounded number of node-to-node
    /// advancements, so one call does at most work logarithmic in the
    /// directory size beyond the entries it returns; iterate by
    /// passing the last returned name back in.
    pub fn read_dir(
        &self,
        dir: ObjId,
        last_name_read: &[u8],
        entries: &mut Vec<DirEntry>,
    ) -> Result<bool, AfsError> {
        let mut storage = self.storage.borrow_mut();
        let storage = storage.as_mut();

        let mut dcx = DirCursor::new(self.block_size, self.cmp);
        let top = top_block(storage, dir, Some(ObjType::Dir))?;
        dcx.load_top(top);

        let mut path = NavPath::new();
        let fr = dcx.nav_to_leaf_entry_equal_or_less_than(
            storage,
            &mut path,
            last_name_read,
            StopEarly::No,
        )?;
        if fr == FindResult::FoundEqual || fr == FindResult::FoundLessThan {
            path.last_mut().pos += 1;
        }

        let max_advancements = u32::from(dcx.top().level);
        let mut nr_advancements = 0u32;
        let mut reached_end = false;
        loop {
            let nav = *path.last();
            let at_node_end = {
                let node = dcx.node(nav.node);
                assert_eq!(node.level, 0);
                assert!(nav.pos <= node.leaf_entries.len());
                nav.pos == node.leaf_entries.len()
            };

            if at_node_end {
                // Bound the number of advancements so one call's work
                // correlates with the logarithm of the entry count.
                let advancements = nr_advancements;
                nr_advancements += 1;
                if advancements > max_advancements {
                    break;
                }

                if !dcx.nav_to_sibling_node(
                    storage,
                    &mut path,
                    EnumDir::Forward,
                )? {
                    reached_end = true;
                    break;
                }
                {
                    let nav = *path.last();
                    let node = dcx.node(nav.node);
                    assert_eq!(node.level, 0);
                    assert_eq!(nav.pos, 0);
                    assert!(!node.leaf_entries.is_empty());
                }
                continue;
            }

            {
                let node = dcx.node(nav.node);
                let entry = &node.leaf_entries[nav.pos];
                entries.push(DirEntry::new(
                    entry.id,
                    entry.obj_type,
                    entry.name.clone(),
                ));
            }
            path.last_mut().pos += 1;
        }

        Ok(reached_end)
    }

    /// Move or rename an object. Same-directory moves are renames;
    /// cross-directory moves also rewrite the object's parent
    /// pointer. Moving a directory under one of its own descendants
    /// fails with [`AfsError::MoveDestInvalid`].
    pub fn obj_move(
        &mut self,
        parent_dir_old: ObjId,
        name_old: &[u8],
        parent_dir_new: ObjId,
        name_new: &[u8],
        now: AfsTime,
    ) -> Result<(), AfsError> {
        self.check_name(name_new)?;
        let mut jw = JournaledWrite::begin(
            self.storage.get_mut().as_mut(),
            &self.master,
            &self.free_tail,
        );
        let result = obj_move_in(
            self.storage.get_mut().as_mut(),
            &mut jw,
            self.block_size,
            self.cmp,
            parent_dir_old,
            name_old,
            parent_dir_new,
            name_new,
            now,
        );
        self.finish(jw, result)
    }

    /// Delete the named object. Directories must be empty. A file
    /// with content is first truncated to zero size (in separately
    /// committed rounds) and then deleted.
    pub fn obj_delete(
        &mut self,
        parent_dir: ObjId,
        name: &[u8],
        now: AfsTime,
    ) -> Result<(), AfsError> {
        match self.obj_delete_once(parent_dir, name, now) {
            Ok(()) => Ok(()),
            Err((AfsError::FileNotEmpty, Some(file))) => {
                self.file_set_size_inner(file, 0, now)?;
                self.obj_delete_once(parent_dir, name, now)
                    .map_err(|(e, _)| e)
            }
            Err((e, _)) => Err(e),
        }
    }

    fn obj_delete_once(
        &mut self,
        parent_dir: ObjId,
        name: &[u8],
        now: AfsTime,
    ) -> Result<(), (AfsError, Option<ObjId>)> {
        let mut jw = JournaledWrite::begin(
            self.storage.get_mut().as_mut(),
            &self.master,
            &self.free_tail,
        );
        let mut found = None;
        let result = obj_delete_in(
            self.storage.get_mut().as_mut(),
            &mut jw,
            self.block_size,
            self.cmp,
            parent_dir,
            name,
            now,
            &mut found,
        );
        self.finish(jw, result).map_err(|e| (e, found))
    }

    // ---------------------------------------------------------------
    // Files
    // ---------------------------------------------------------------

    /// Create an empty file named `name` under `parent_dir`. New
    /// files start in the mini representation: content lives inline
    /// in the top node until it outgrows it.
    pub fn file_create(
        &mut self,
        parent_dir: ObjId,
        name: &[u8],
        meta: &[u8],
        now: AfsTime,
    ) -> Result<ObjId, AfsError> {
        self.check_name(name)?;
        self.check_meta(meta)?;
        let mut jw = JournaledWrite::begin(
            self.storage.get_mut().as_mut(),
            &self.master,
            &self.free_tail,
        );
        let result = create_obj(
            self.storage.get_mut().as_mut(),
            &mut jw,
            self.block_size,
            self.cmp,
            parent_dir,
            name,
            meta,
            now,
            ObjType::File,
        );
        self.finish(jw, result)
    }

    /// Number of content bytes the file's top node can hold inline.
    pub fn file_max_mini_bytes(&self, file: ObjId) -> Result<u32, AfsError> {
        let mut storage = self.storage.borrow_mut();
        let block = top_block(storage.as_mut(), file, Some(ObjType::File))?;
        let bytes = block.bytes();
        Ok(FileNodeView::new(&*bytes).mini_capacity())
    }

    /// Read up to `n` bytes starting at `offset`, yielding successive
    /// slices to `on_data`. The final slice is flagged `true` iff the
    /// read ends at the end of the file. Reads past `offset ==
    /// size` fail with [`AfsError::InvalidOffset`]; `n` is clamped to
    /// the remaining length.
    pub fn file_read(
        &self,
        file: ObjId,
        offset: u64,
        n: usize,
        mut on_data: impl FnMut(&[u8], bool),
    ) -> Result<(), AfsError> {
        let mut storage = self.storage.borrow_mut();
        let storage = storage.as_mut();

        let mut fcx = FileCursor::new(self.block_size);
        let top = top_block(storage, file, Some(ObjType::File))?;
        let top_handle = top.clone();
        fcx.load_top(top);

        let (file_size, is_mini) = {
            let bytes = top_handle.bytes();
            (
                TopView::new(&*bytes).file_size_bytes(),
                FileNodeView::new(&*bytes).is_mini(),
            )
        };

        if offset > file_size {
            return Err(AfsError::InvalidOffset);
        }
        let n = u64::try_from(n).unwrap_or(u64::MAX).min(file_size - offset);
        if n == 0 {
            on_data(&[], true);
            return Ok(());
        }
        let reached_end = offset + n == file_size;

        if is_mini {
            let bytes = top_handle.bytes();
            let view = FileNodeView::new(&*bytes);
            let start = usize::try_from(offset).unwrap();
            let len = usize::try_from(n).unwrap();
            on_data(&view.mini_content()[start..start + len], reached_end);
        } else {
            let blocks =
                fcx.data_blocks_for_range(storage, offset, offset + n)?;
            let bs = self.block_size.to_u64();
            let first_start = usize::try_from(offset % bs).unwrap();
            if blocks.len() == 1 {
                let len = usize::try_from(n).unwrap();
                let bytes = blocks[0].bytes();
                on_data(&bytes[first_start..first_start + len], reached_end);
            } else {
                {
                    let bytes = blocks[0].bytes();
                    on_data(&bytes[first_start..], false);
                }
                for block in &blocks[1..blocks.len() - 1] {
                    let bytes = block.bytes();
                    on_data(&bytes[..], false);
                }
                let last_end =
                    usize::try_from((offset + n - 1) % bs).unwrap() + 1;
                let bytes = blocks[blocks.len() - 1].bytes();
                on_data(&bytes[..last_end], reached_end);
            }
        }
        Ok(())
    }

    /// Read the entire file content into a `Vec<u8>`.
    pub fn file_read_all(&self, file: ObjId) -> Result<Vec<u8>, AfsError> {
        let mut content = Vec::new();
        self.file_read(file, 0, usize::MAX, |data, _| {
            content.extend_from_slice(data);
        })?;
        Ok(content)
    }

    /// Write `data` at `offset`, enlarging the file first if the
    /// write extends past its current end.
    pub fn file_write(
        &mut self,
        file: ObjId,
        offset: u64,
        data: &[u8],
        now: AfsTime,
    ) -> Result<(), AfsError> {
        let mut jw = JournaledWrite::begin(
            self.storage.get_mut().as_mut(),
            &self.master,
            &self.free_tail,
        );
        let result = file_write_in(
            self.storage.get_mut().as_mut(),
            &mut jw,
            self.block_size,
            file,
            offset,
            data,
            now,
        );
        self.finish(jw, result)
    }

    /// Resize a file to `new_size_bytes`, returning the size actually
    /// reached. Enlargement zero-fills the grown range.
    ///
    /// Large resizes are chunked: each round moves at most a bounded
    /// number of data blocks inside its own journaled write, so a
    /// single scope never does unbounded work. Rounds commit
    /// individually; if a later round fails, the size reached by the
    /// committed rounds is observable via [`Self::stat`].
    pub fn file_set_size(
        &mut self,
        file: ObjId,
        new_size_bytes: u64,
        now: AfsTime,
    ) -> Result<u64, AfsError> {
        self.file_set_size_inner(file, new_size_bytes, now)
    }

    fn file_set_size_inner(
        &mut self,
        file: ObjId,
        new_size_bytes: u64,
        now: AfsTime,
    ) -> Result<u64, AfsError> {
        let mut actual_new_size;
        loop {
            let mut jw = JournaledWrite::begin(
                self.storage.get_mut().as_mut(),
                &self.master,
                &self.free_tail,
            );
            let result = file_set_size_round(
                self.storage.get_mut().as_mut(),
                &mut jw,
                self.block_size,
                file,
                new_size_bytes,
                now,
            );
            let (achieved, last_round) = self.finish(jw, result)?;
            actual_new_size = achieved;
            if last_round {
                break;
            }
        }
        Ok(actual_new_size)
    }

    // ---------------------------------------------------------------
    // Internal helpers
    // ---------------------------------------------------------------

    fn check_name(&self, name: &[u8]) -> Result<(), AfsError> {
        if name.len() > usize::try_from(self.max_name_bytes).unwrap() {
            return Err(AfsError::NameTooLong);
        }
        if name.is_empty() || name.contains(&b'/') {
            return Err(AfsError::NameInvalid);
        }
        Ok(())
    }

    fn check_meta(&self, meta: &[u8]) -> Result<(), AfsError> {
        if meta.len() > usize::try_from(self.max_meta_bytes).unwrap() {
            return Err(AfsError::MetaDataTooLong);
        }
        Ok(())
    }

    /// Complete or abort the journaled write depending on `result`,
    /// adopting a replacement free-list tail on success.
    fn finish<T>(
        &mut self,
        jw: JournaledWrite,
        result: Result<T, AfsError>,
    ) -> Result<T, AfsError> {
        let storage = self.storage.get_mut().as_mut();
        match result {
            Ok(value) => {
                let new_tail = jw.complete(storage)?;
                if let Some(tail) = new_tail {
                    self.free_tail = tail;
                }
                Ok(value)
            }
            Err(e) => {
                jw.abort(storage);
                Err(e)
            }
        }
    }
}

/// Derive the maximum name and metadata lengths from the block size
/// and the root top node's layout.
///
/// A directory leaf entry is larger than the corresponding branch
/// entry, and a top node has more overhead than a non-top node, so
/// the root top node as a leaf is the worst case: a maximum-length
/// entry must fit in a node at the rebalance threshold.
fn name_limits(block_size: BlockSize, root_top: &Block) -> (u32, usize) {
    let overhead = {
        let bytes = root_top.bytes();
        u32::try_from(DirNodeView::new(&*bytes).entries_offset()).unwrap()
    };
    let space_for_entries = block_size.to_u32().saturating_sub(overhead);
    let max_name = core::cmp::min(
        0xffff,
        (space_for_entries / REBALANCE_FRACTION)
            .saturating_sub(DirLeafEntry::OVERHEAD),
    );
    // The on-disk metadata length is a single byte.
    let max_meta = core::cmp::min(usize::try_from(max_name).unwrap(), 255);
    (max_name, max_meta)
}

/// Create the three seed blocks of an empty filesystem: root
/// directory top node (block 0), master (block 1), free-list tail
/// (block 2). The caller completes or aborts the surrounding
/// journaled write.
fn seed_filesystem(
    storage: &mut dyn AfsStorage,
    root_meta: &[u8],
    now: AfsTime,
) -> Result<(Block, Block, Block), AfsError> {
    let root = storage.add_new_block()?;
    assert_eq!(root.index(), ObjId::ROOT.index);
    let master = storage.add_new_block()?;
    assert_eq!(master.index(), 1);
    let tail = storage.add_new_block()?;
    assert_eq!(tail.index(), 2);

    root.begin_change();
    {
        let mut bytes = root.bytes_mut();
        bytes[0] = BlockKind::Node.as_raw();
        {
            let mut node = NodeView::new(bytes.as_mut_slice());
            node.set_cat(NodeCat::Top);
            node.set_obj_type(ObjType::Dir);
        }
        {
            let mut top = TopView::new(bytes.as_mut_slice());
            top.set_unique_id(ObjId::ROOT.unique_id);
            top.set_parent_id(ObjId::NONE);
            top.set_create_time(now.ticks());
            top.set_modify_time(now.ticks());
            top.set_meta(root_meta);
            top.set_dir_nr_entries(0);
        }
        NodeView::new(bytes.as_mut_slice()).set_level(0);
        DirNodeView::new(bytes.as_mut_slice()).encode_leaf_entries(&[]);
    }

    master.begin_change();
    {
        let mut bytes = master.bytes_mut();
        bytes[0] = BlockKind::Master.as_raw();
        let mut view = MasterView::new(bytes.as_mut_slice());
        view.set_fs_version(FS_VERSION);
        view.set_next_unique_id(ObjId::ROOT.unique_id + 1);
        view.set_root_dir_top_node_index(root.index());
        view.set_free_list_tail_index(tail.index());
        view.set_nr_full_free_list_nodes(0);
    }

    tail.begin_change();
    {
        let mut bytes = tail.bytes_mut();
        bytes[0] = BlockKind::FreeList.as_raw();
        let mut view = FreeListView::new(bytes.as_mut_slice());
        view.set_prev_free_list_index(NO_PREV_FREE_LIST);
        view.set_nr_indices(0);
    }

    Ok((root, master, tail))
}

/// Obtain and validate an object's top node block.
///
/// The unique id stored in the node must match the id; a recycled
/// block whose unique id differs means the object is gone, and the
/// stale id must not resolve to the block's new occupant.
fn top_block(
    storage: &mut dyn AfsStorage,
    id: ObjId,
    expect: Option<ObjType>,
) -> Result<Block, AfsError> {
    let not_found = match expect {
        Some(ObjType::Dir) => AfsError::DirNotFound,
        _ => AfsError::ObjNotFound,
    };

    let block = match storage.obtain_block(id.index) {
        Ok(block) => block,
        Err(AfsError::StorageInErrorState) => {
            return Err(AfsError::StorageInErrorState);
        }
        // The id could never have been valid.
        Err(AfsError::BlockIndexInvalid) => return Err(AfsError::InvalidObjId),
        Err(e) => panic!("unexpected storage error: {e}"),
    };

    // The id could have referred to the intended object, but the
    // block has since been reused for something else.
    if block.kind() != BlockKind::Node {
        return Err(not_found);
    }
    {
        let bytes = block.bytes();
        let node = NodeView::new(&*bytes);
        if node.cat() != NodeCat::Top {
            return Err(not_found);
        }
        if TopView::new(&*bytes).unique_id() != id.unique_id {
            return Err(not_found);
        }
        match expect {
            Some(ObjType::Dir) if !node.obj_type().is_dir() => {
                return Err(AfsError::ObjNotDir);
            }
            Some(ObjType::File) if !node.obj_type().is_file() => {
                return Err(AfsError::ObjNotFile);
            }
            _ => {}
        }
    }
    Ok(block)
}

fn find_in(
    storage: &mut dyn AfsStorage,
    block_size: BlockSize,
    cmp: NameCmp,
    parent_dir: ObjId,
    name: &[u8],
) -> Result<DirEntry, AfsError> {
    let mut dcx = DirCursor::new(block_size, cmp);
    let top = top_block(storage, parent_dir, Some(ObjType::Dir))?;
    dcx.load_top(top);

    let mut path = NavPath::new();
    let fr = dcx.nav_to_leaf_entry_equal_or_less_than(
        storage,
        &mut path,
        name,
        StopEarly::IfCantFind,
    )?;
    if fr != FindResult::FoundEqual {
        return Err(AfsError::NameNotInDir);
    }

    let entry = dcx.leaf_entry_at(&path);
    Ok(DirEntry::new(entry.id, entry.obj_type, entry.name.clone()))
}

/// Create a directory or file object: allocate and fill its top node,
/// then insert the parent directory entry.
#[expect(clippy::too_many_arguments)]
fn create_obj(
    storage: &mut dyn AfsStorage,
    jw: &mut JournaledWrite,
    block_size: BlockSize,
    cmp: NameCmp,
    parent_dir: ObjId,
    name: &[u8],
    meta: &[u8],
    now: AfsTime,
    obj_type: ObjType,
) -> Result<ObjId, AfsError> {
    let mut dcx = DirCursor::new(block_size, cmp);
    let parent_top = top_block(storage, parent_dir, Some(ObjType::Dir))?;
    dcx.load_top(parent_top);

    let mut path = NavPath::new();
    let fr = dcx.nav_to_leaf_entry_equal_or_less_than(
        storage,
        &mut path,
        name,
        StopEarly::No,
    )?;
    if fr == FindResult::FoundEqual {
        return Err(AfsError::NameExists);
    }
    if fr == FindResult::FoundLessThan {
        path.last_mut().pos += 1;
    }

    let top = jw.reclaim_block_or_add_new(storage, BlockKind::Node)?;
    let unique_id = jw.take_next_unique_id();
    {
        let mut bytes = jw.edit(&top);
        {
            let mut node = NodeView::new(bytes.as_mut_slice());
            node.set_cat(NodeCat::Top);
            node.set_obj_type(obj_type);
        }
        {
            let mut view = TopView::new(bytes.as_mut_slice());
            view.set_unique_id(unique_id);
            view.set_parent_id(parent_dir);
            view.set_create_time(now.ticks());
            view.set_modify_time(now.ticks());
            view.set_meta(meta);
            match obj_type {
                ObjType::Dir => view.set_dir_nr_entries(0),
                ObjType::File => view.set_file_size_bytes(0),
            }
        }
        match obj_type {
            ObjType::Dir => {
                NodeView::new(bytes.as_mut_slice()).set_level(0);
                DirNodeView::new(bytes.as_mut_slice())
                    .encode_leaf_entries(&[]);
            }
            ObjType::File => {
                // New files start mini: content inline, no blocks.
                NodeView::new(bytes.as_mut_slice())
                    .set_level(views::NODE_LEVEL_BEYOND_MAX);
            }
        }
    }

    let id = ObjId {
        index: top.index(),
        unique_id,
    };
    let entry = DirLeafEntry {
        id,
        obj_type,
        name: name.to_vec(),
    };
    dcx.add_leaf_entry_at(storage, jw, entry, &mut path, now, CanAddNode::Yes)?;
    dcx.finalize(jw);
    Ok(id)
}

fn set_stat_in(
    storage: &mut dyn AfsStorage,
    jw: &mut JournaledWrite,
    id: ObjId,
    info: &StatInfo,
    fields: StatFields,
) -> Result<(), AfsError> {
    let block = top_block(storage, id, None)?;
    if fields.is_empty() {
        return Ok(());
    }

    if fields.contains(StatFields::META_DATA) {
        let existing_len = {
            let bytes = block.bytes();
            TopView::new(&*bytes).meta_len()
        };
        if info.meta.len() != existing_len {
            return Err(AfsError::MetaDataCannotChangeLen);
        }
    }

    let mut bytes = jw.edit(&block);
    let mut view = TopView::new(bytes.as_mut_slice());
    if fields.contains(StatFields::CREATE_TIME) {
        view.set_create_time(info.create_time.ticks());
    }
    if fields.contains(StatFields::MODIFY_TIME) {
        view.set_modify_time(info.modify_time.ticks());
    }
    if fields.contains(StatFields::META_DATA) {
        view.set_meta(&info.meta);
    }
    Ok(())
}

#[expect(clippy::too_many_arguments)]
fn obj_move_in(
    storage: &mut dyn AfsStorage,
    jw: &mut JournaledWrite,
    block_size: BlockSize,
    cmp: NameCmp,
    parent_dir_old: ObjId,
    name_old: &[u8],
    parent_dir_new: ObjId,
    name_new: &[u8],
    now: AfsTime,
) -> Result<(), AfsError> {
    let mut dcx_old = DirCursor::new(block_size, cmp);
    let top_old = top_block(storage, parent_dir_old, Some(ObjType::Dir))?;
    dcx_old.load_top(top_old);

    let mut path_old = NavPath::new();
    let fr_old = dcx_old.nav_to_leaf_entry_equal_or_less_than(
        storage,
        &mut path_old,
        name_old,
        StopEarly::IfCantFind,
    )?;
    if fr_old != FindResult::FoundEqual {
        return Err(AfsError::NameNotInDir);
    }
    let entry = dcx_old.leaf_entry_at(&path_old).clone();

    if parent_dir_new == parent_dir_old {
        // Rename within one directory.
        let mut path_new = NavPath::new();
        let fr_new = dcx_old.nav_to_leaf_entry_equal_or_less_than(
            storage,
            &mut path_new,
            name_new,
            StopEarly::IfCantFind,
        )?;
        if fr_new == FindResult::FoundEqual {
            return Err(AfsError::NameExists);
        }

        dcx_old.remove_leaf_entry_at(storage, jw, &mut path_old, entry.id, now)?;
        let moved = DirLeafEntry {
            id: entry.id,
            obj_type: entry.obj_type,
            name: name_new.to_vec(),
        };
        // Removal restructured the tree; navigate afresh to insert.
        dcx_old.add_leaf_entry(storage, jw, moved, now)?;

        update_parent_pointer(
            storage,
            jw,
            entry.id,
            parent_dir_old,
            parent_dir_new,
        )?;
        dcx_old.finalize(jw);
    } else {
        if parent_dir_new == entry.id {
            return Err(AfsError::MoveDestInvalid);
        }

        let mut dcx_new = DirCursor::new(block_size, cmp);
        let top_new = top_block(storage, parent_dir_new, Some(ObjType::Dir))?;
        let top_new_handle = top_new.clone();
        dcx_new.load_top(top_new);

        if entry.obj_type.is_dir() {
            // Walk the destination's ancestry to refuse a move that
            // would create a cycle.
            let mut ancestor = {
                let bytes = top_new_handle.bytes();
                TopView::new(&*bytes).parent_id()
            };
            while ancestor != ObjId::NONE
                && ancestor != ObjId::ROOT
                && ancestor != parent_dir_old
            {
                if ancestor == entry.id {
                    return Err(AfsError::MoveDestInvalid);
                }
                let ancestor_block =
                    top_block(storage, ancestor, Some(ObjType::Dir))?;
                ancestor = {
                    let bytes = ancestor_block.bytes();
                    TopView::new(&*bytes).parent_id()
                };
            }
        }

        let mut path_new = NavPath::new();
        let fr_new = dcx_new.nav_to_leaf_entry_equal_or_less_than(
            storage,
            &mut path_new,
            name_new,
            StopEarly::No,
        )?;
        if fr_new == FindResult::FoundEqual {
            return Err(AfsError::NameExists);
        }

        dcx_old.remove_leaf_entry_at(storage, jw, &mut path_old, entry.id, now)?;

        if fr_new == FindResult::FoundLessThan {
            path_new.last_mut().pos += 1;
        }
        let moved = DirLeafEntry {
            id: entry.id,
            obj_type: entry.obj_type,
            name: name_new.to_vec(),
        };
        dcx_new.add_leaf_entry_at(
            storage,
            jw,
            moved,
            &mut path_new,
            now,
            CanAddNode::Yes,
        )?;

        update_parent_pointer(
            storage,
            jw,
            entry.id,
            parent_dir_old,
            parent_dir_new,
        )?;
        dcx_old.finalize(jw);
        dcx_new.finalize(jw);
    }
    Ok(())
}

fn update_parent_pointer(
    storage: &mut dyn AfsStorage,
    jw: &mut JournaledWrite,
    id: ObjId,
    parent_old: ObjId,
    parent_new: ObjId,
) -> Result<(), AfsError> {
    let block = top_block(storage, id, None)?;
    {
        let bytes = block.bytes();
        assert_eq!(TopView::new(&*bytes).parent_id(), parent_old);
    }
    let mut bytes = jw.edit(&block);
    TopView::new(bytes.as_mut_slice()).set_parent_id(parent_new);
    Ok(())
}

#[expect(clippy::too_many_arguments)]
fn obj_delete_in(
    storage: &mut dyn AfsStorage,
    jw: &mut JournaledWrite,
    block_size: BlockSize,
    cmp: NameCmp,
    parent_dir: ObjId,
    name: &[u8],
    now: AfsTime,
    found: &mut Option<ObjId>,
) -> Result<(), AfsError> {
    let mut dcx = DirCursor::new(block_size, cmp);
    let parent_top = top_block(storage, parent_dir, Some(ObjType::Dir))?;
    dcx.load_top(parent_top);

    let mut path = NavPath::new();
    let fr = dcx.nav_to_leaf_entry_equal_or_less_than(
        storage,
        &mut path,
        name,
        StopEarly::IfCantFind,
    )?;
    if fr != FindResult::FoundEqual {
        return Err(AfsError::NameNotInDir);
    }
    let entry = dcx.leaf_entry_at(&path).clone();
    *found = Some(entry.id);

    // The object must be empty before its top node can be freed.
    let obj_block = top_block(storage, entry.id, None)?;
    {
        let bytes = obj_block.bytes();
        match NodeView::new(&*bytes).obj_type() {
            ObjType::Dir => {
                if TopView::new(&*bytes).dir_nr_entries() != 0 {
                    return Err(AfsError::DirNotEmpty);
                }
            }
            ObjType::File => {
                if !FileNodeView::new(&*bytes).is_mini() {
                    return Err(AfsError::FileNotEmpty);
                }
            }
        }
    }

    jw.add_block_to_free(&obj_block);

    // Removing the entry can cascade joins and frees in the parent
    // directory, and a longer name replacing a shorter one in branch
    // nodes can even require more storage.
    dcx.remove_leaf_entry_at(storage, jw, &mut path, entry.id, now)?;
    dcx.finalize(jw);
    Ok(())
}

fn file_write_in(
    storage: &mut dyn AfsStorage,
    jw: &mut JournaledWrite,
    block_size: BlockSize,
    file: ObjId,
    offset: u64,
    data: &[u8],
    now: AfsTime,
) -> Result<(), AfsError> {
    let mut fcx = FileCursor::new(block_size);
    let top = top_block(storage, file, Some(ObjType::File))?;
    let top_handle = top.clone();
    fcx.load_top(top);

    let size_required = offset + u64::try_from(data.len()).unwrap();
    let cur_size = {
        let bytes = top_handle.bytes();
        TopView::new(&*bytes).file_size_bytes()
    };
    if cur_size < size_required {
        fcx.enlarge_to_size(storage, jw, size_required)?;
    }

    if !data.is_empty() {
        let is_mini = {
            let bytes = top_handle.bytes();
            FileNodeView::new(&*bytes).is_mini()
        };
        if is_mini {
            let start = usize::try_from(offset).unwrap();
            let mut bytes = jw.edit(&top_handle);
            let mut view = FileNodeView::new(bytes.as_mut_slice());
            view.mini_content_mut()[start..start + data.len()]
                .copy_from_slice(data);
        } else {
            let blocks = fcx.data_blocks_for_range(
                storage,
                offset,
                offset + u64::try_from(data.len()).unwrap(),
            )?;
            let bs = block_size.to_usize();
            let mut pos = 0;
            for (i, block) in blocks.iter().enumerate() {
                let start = if i == 0 {
                    usize::try_from(offset % block_size.to_u64()).unwrap()
                } else {
                    0
                };
                let take = (bs - start).min(data.len() - pos);
                let mut bytes = jw.edit(block);
                bytes[start..start + take]
                    .copy_from_slice(&data[pos..pos + take]);
                pos += take;
            }
            assert_eq!(pos, data.len());
        }
    }

    {
        let mut bytes = jw.edit(&top_handle);
        TopView::new(bytes.as_mut_slice()).set_modify_time(now.ticks());
    }
    fcx.finalize(jw);
    Ok(())
}

/// One chunk of a resize: move at most
/// [`SET_SIZE_MAX_BLOCKS_PER_ROUND`] data blocks toward the target
/// size. Returns the size reached and whether it is the target.
fn file_set_size_round(
    storage: &mut dyn AfsStorage,
    jw: &mut JournaledWrite,
    block_size: BlockSize,
    file: ObjId,
    new_size_bytes: u64,
    now: AfsTime,
) -> Result<(u64, bool), AfsError> {
    let mut fcx = FileCursor::new(block_size);
    let top = top_block(storage, file, Some(ObjType::File))?;
    let top_handle = top.clone();
    fcx.load_top(top);

    let prev_size = {
        let bytes = top_handle.bytes();
        TopView::new(&*bytes).file_size_bytes()
    };

    if prev_size == new_size_bytes {
        let mut bytes = jw.edit(&top_handle);
        TopView::new(bytes.as_mut_slice()).set_modify_time(now.ticks());
        return Ok((prev_size, true));
    }

    let bs = block_size.to_u64();
    let achieved;
    let mut last_round = false;

    if prev_size > new_size_bytes {
        let target = if (prev_size - new_size_bytes) / bs
            <= SET_SIZE_MAX_BLOCKS_PER_ROUND
        {
            last_round = true;
            new_size_bytes
        } else {
            implied_capacity(
                prev_size - bs * SET_SIZE_MAX_BLOCKS_PER_ROUND,
                block_size,
            )
        };
        fcx.shrink_to_size(storage, jw, target)?;
        achieved = target;
    } else {
        let target = if (new_size_bytes - prev_size) / bs
            <= SET_SIZE_MAX_BLOCKS_PER_ROUND
        {
            last_round = true;
            new_size_bytes
        } else {
            implied_capacity(
                prev_size + bs * SET_SIZE_MAX_BLOCKS_PER_ROUND,
                block_size,
            )
        };
        fcx.enlarge_to_size(storage, jw, target)?;
        achieved = target;

        // Resizing promises zeroed content for the grown range.
        let is_mini = {
            let bytes = top_handle.bytes();
            FileNodeView::new(&*bytes).is_mini()
        };
        if is_mini {
            let start = usize::try_from(prev_size).unwrap();
            let end = usize::try_from(target).unwrap();
            let mut bytes = jw.edit(&top_handle);
            let mut view = FileNodeView::new(bytes.as_mut_slice());
            view.mini_content_mut()[start..end].fill(0);
        } else {
            let blocks =
                fcx.data_blocks_for_range(storage, prev_size, target)?;
            for (i, block) in blocks.iter().enumerate() {
                let start = if i == 0 {
                    usize::try_from(prev_size % bs).unwrap()
                } else {
                    0
                };
                let mut bytes = jw.edit(block);
                bytes[start..].fill(0);
            }
        }
    }

    {
        let mut bytes = jw.edit(&top_handle);
        TopView::new(bytes.as_mut_slice()).set_modify_time(now.ticks());
    }
    fcx.finalize(jw);
    Ok((achieved, last_round))
}
