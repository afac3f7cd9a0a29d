// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! File B+-tree: an offset-to-data-block index per file.
//!
//! A file body has three regimes, selected automatically: *mini*
//! (content inline in the top node, level tag `0xFF`), a single leaf
//! of data-block entries, or a branch tree keyed by byte offset.
//! Unlike the directory tree, file trees only grow and shrink at the
//! right edge, so there is no rebalance threshold; shrinking removes
//! emptied nodes and hoists the remaining child when the top is down
//! to one entry.

use crate::block::{Block, BlockKind};
use crate::block_size::BlockSize;
use crate::error::AfsError;
use crate::journal::JournaledWrite;
use crate::obj_id::ObjType;
use crate::storage::{AfsStorage, obtain_block_check_kind};
use crate::tree::{CanAddNode, EnumDir, NavPath, NodeState};
use crate::views::{
    FileBranchEntry, FileLeafEntry, FileNodeView, NodeCat, NodeView, TopView,
    NODE_LEVEL_BEYOND_MAX,
};
use alloc::vec;
use alloc::vec::Vec;

/// Arena index of the top node.
const TOP: usize = 0;

/// Round `size` up to a whole number of blocks: the storage capacity
/// implied by a non-mini file of that size.
pub(crate) fn implied_capacity(size_bytes: u64, block_size: BlockSize) -> u64 {
    size_bytes.div_ceil(block_size.to_u64()) * block_size.to_u64()
}

/// A decoded file tree node.
pub(crate) struct FileNode {
    pub(crate) block: Block,
    pub(crate) is_top: bool,
    pub(crate) level: u8,
    pub(crate) leaf_entries: Vec<FileLeafEntry>,
    /// Obtained data block handles, parallel to `leaf_entries`.
    pub(crate) data_blocks: Vec<Option<Block>>,
    pub(crate) branch_entries: Vec<FileBranchEntry>,
    /// Arena indices of decoded children, parallel to
    /// `branch_entries`.
    pub(crate) children: Vec<Option<usize>>,
    pub(crate) state: NodeState,
}

impl FileNode {
    fn decode(block: Block) -> Self {
        let (is_top, level) = {
            let bytes = block.bytes();
            let node = NodeView::new(&*bytes);
            assert!(node.obj_type().is_file());
            (node.cat() == NodeCat::Top, node.level())
        };

        let mut leaf_entries = Vec::new();
        let mut data_blocks = Vec::new();
        let mut branch_entries = Vec::new();
        let mut children = Vec::new();
        if level != NODE_LEVEL_BEYOND_MAX {
            let bytes = block.bytes();
            let view = FileNodeView::new(&*bytes);
            if level == 0 {
                leaf_entries = view.decode_leaf_entries();
                data_blocks = vec![None; leaf_entries.len()];
            } else {
                branch_entries = view.decode_branch_entries();
                children = vec![None; branch_entries.len()];
            }
        }

        Self {
            block,
            is_top,
            level,
            leaf_entries,
            data_blocks,
            branch_entries,
            children,
            state: NodeState::Clean,
        }
    }

    fn entries_encoded_size(&self) -> u32 {
        if self.level == 0 {
            u32::try_from(self.leaf_entries.len()).unwrap()
                * FileLeafEntry::ENCODED_SIZE
        } else {
            u32::try_from(self.branch_entries.len()).unwrap()
                * FileBranchEntry::ENCODED_SIZE
        }
    }

    fn encoded_size(&self) -> u32 {
        assert!(self.level != NODE_LEVEL_BEYOND_MAX);
        let overhead = {
            let bytes = self.block.bytes();
            let view = FileNodeView::new(&*bytes);
            if self.level == 0 {
                view.leaf_entries_offset()
            } else {
                view.branch_entries_offset()
            }
        };
        u32::try_from(overhead).unwrap() + self.entries_encoded_size()
    }
}

/// Cursor into one file's tree.
pub(crate) struct FileCursor {
    block_size: BlockSize,
    nodes: Vec<FileNode>,
    any_changed: bool,
}

impl FileCursor {
    pub(crate) fn new(block_size: BlockSize) -> Self {
        Self {
            block_size,
            nodes: Vec::new(),
            any_changed: false,
        }
    }

    /// Decode the file's top node, previously obtained and validated
    /// by the façade.
    pub(crate) fn load_top(&mut self, block: Block) {
        assert!(self.nodes.is_empty());
        let node = FileNode::decode(block);
        assert!(node.is_top);
        self.nodes.push(node);
    }

    pub(crate) fn top(&self) -> &FileNode {
        &self.nodes[TOP]
    }

    fn mark(&mut self, jw: &mut JournaledWrite, idx: usize, state: NodeState) {
        let node = &mut self.nodes[idx];
        assert!(node.state <= state);
        node.state = state;

        if !self.any_changed {
            jw.inc_finalizations_pending();
            self.any_changed = true;
        }
    }

    // ---------------------------------------------------------------
    // Navigation
    // ---------------------------------------------------------------

    /// Descend from the top to the leaf entry whose data block covers
    /// `offset`. The offset must be within the allocated capacity.
    pub(crate) fn nav_to_leaf_entry_containing_offset(
        &mut self,
        storage: &mut dyn AfsStorage,
        path: &mut NavPath,
        offset: u64,
    ) -> Result<(), AfsError> {
        path.clear();
        path.push(TOP);

        loop {
            let node_idx = path.last().node;
            let level = {
                let node = &self.nodes[node_idx];
                assert!(node.level != NODE_LEVEL_BEYOND_MAX);
                node.level
            };

            if level == 0 {
                let file_offset = {
                    let bytes = self.nodes[node_idx].block.bytes();
                    FileNodeView::new(&*bytes).leaf_file_offset()
                };
                assert_eq!(file_offset % self.block_size.to_u64(), 0);
                assert!(offset >= file_offset);
                let pos = usize::try_from(
                    (offset - file_offset) / self.block_size.to_u64(),
                )
                .unwrap();
                assert!(pos < self.nodes[node_idx].leaf_entries.len());
                path.last_mut().pos = pos;
                return Ok(());
            }

            let pos = {
                let node = &self.nodes[node_idx];
                assert!(!node.branch_entries.is_empty());
                assert!(offset >= node.branch_entries[0].file_offset);
                // Last entry whose first offset is <= the target.
                let mut i = node.branch_entries.len();
                loop {
                    i -= 1;
                    if offset >= node.branch_entries[i].file_offset || i == 0 {
                        break;
                    }
                }
                i
            };
            path.last_mut().pos = pos;
            self.descend_to_next_child_node(storage, path, EnumDir::Forward)?;
        }
    }

    fn descend_to_next_child_node(
        &mut self,
        storage: &mut dyn AfsStorage,
        path: &mut NavPath,
        enum_dir: EnumDir,
    ) -> Result<(), AfsError> {
        let nav = *path.last();
        let parent_level = {
            let node = &self.nodes[nav.node];
            assert!(node.level != 0);
            assert!(nav.pos < node.children.len());
            node.level
        };

        let existing = self.nodes[nav.node].children[nav.pos];
        let child_idx = match existing {
            Some(idx) => idx,
            None => {
                let block_index =
                    self.nodes[nav.node].branch_entries[nav.pos].block_index;
                let block = obtain_block_check_kind(
                    storage,
                    block_index,
                    BlockKind::Node,
                )
                .unwrap_or_else(|e| {
                    panic!("file node block {block_index} unusable: {e}")
                });
                let child = FileNode::decode(block);
                assert!(!child.is_top);
                assert_eq!(u32::from(child.level) + 1, u32::from(parent_level));
                let idx = self.nodes.len();
                self.nodes.push(child);
                self.nodes[nav.node].children[nav.pos] = Some(idx);
                idx
            }
        };

        path.push(child_idx);
        if enum_dir == EnumDir::Reverse {
            let node = &self.nodes[child_idx];
            let nr_entries = if node.level == 0 {
                node.leaf_entries.len()
            } else {
                node.branch_entries.len()
            };
            assert!(nr_entries != 0);
            path.last_mut().pos = nr_entries - 1;
        }
        Ok(())
    }

    fn nav_to_sibling_node(
        &mut self,
        storage: &mut dyn AfsStorage,
        path: &mut NavPath,
        enum_dir: EnumDir,
    ) -> Result<bool, AfsError> {
        let target_level = self.nodes[path.last().node].level;

        let mut child_level = u32::from(target_level);
        loop {
            let child_block_index = self.nodes[path.last().node].block.index();
            path.pop();
            if path.is_empty() {
                return Ok(false);
            }

            let nav = *path.last();
            let node = &self.nodes[nav.node];
            assert_eq!(child_level + 1, u32::from(node.level));
            assert!(nav.pos < node.branch_entries.len());
            assert_eq!(
                node.branch_entries[nav.pos].block_index,
                child_block_index
            );

            match enum_dir {
                EnumDir::Forward => {
                    if nav.pos + 1 < node.branch_entries.len() {
                        path.last_mut().pos += 1;
                        break;
                    }
                }
                EnumDir::Reverse => {
                    if nav.pos > 0 {
                        path.last_mut().pos -= 1;
                        break;
                    }
                }
            }
            child_level += 1;
        }

        loop {
            self.descend_to_next_child_node(storage, path, enum_dir)?;
            let node = &self.nodes[path.last().node];
            if node.level == target_level {
                break;
            }
            assert!(node.level != 0);
            assert!(!node.branch_entries.is_empty());
        }
        Ok(true)
    }

    // ---------------------------------------------------------------
    // Data blocks
    // ---------------------------------------------------------------

    /// Obtain (and memoize) the data block behind leaf entry `i` of
    /// node `node_idx`.
    pub(crate) fn data_block(
        &mut self,
        storage: &mut dyn AfsStorage,
        node_idx: usize,
        i: usize,
    ) -> Block {
        if let Some(block) = &self.nodes[node_idx].data_blocks[i] {
            return block.clone();
        }
        let block_index = self.nodes[node_idx].leaf_entries[i].block_index;
        let block = storage.obtain_block(block_index).unwrap_or_else(|e| {
            panic!("file data block {block_index} unusable: {e}")
        });
        self.nodes[node_idx].data_blocks[i] = Some(block.clone());
        block
    }

    /// Collect the data blocks covering byte range
    /// `[offset_first, offset_beyond_last)`, in order.
    pub(crate) fn data_blocks_for_range(
        &mut self,
        storage: &mut dyn AfsStorage,
        offset_first: u64,
        offset_beyond_last: u64,
    ) -> Result<Vec<Block>, AfsError> {
        assert!(offset_first <= offset_beyond_last);
        let mut blocks = Vec::new();

        let mut path = NavPath::new();
        self.nav_to_leaf_entry_containing_offset(
            storage,
            &mut path,
            offset_first,
        )?;

        let mut end_path = NavPath::new();
        if offset_first == offset_beyond_last {
            end_path = path.clone();
        } else {
            self.nav_to_leaf_entry_containing_offset(
                storage,
                &mut end_path,
                offset_beyond_last - 1,
            )?;
        }
        let end_nav = *end_path.last();

        loop {
            let nav = *path.last();
            assert_eq!(self.nodes[nav.node].level, 0);
            blocks.push(self.data_block(storage, nav.node, nav.pos));

            if nav.node == end_nav.node && nav.pos == end_nav.pos {
                break;
            }

            path.last_mut().pos += 1;
            if self.nodes[nav.node].leaf_entries.len() == path.last().pos {
                let moved =
                    self.nav_to_sibling_node(storage, &mut path, EnumDir::Forward)?;
                assert!(moved, "file tree ends before the requested range");
            }
        }
        Ok(blocks)
    }

    // ---------------------------------------------------------------
    // Enlarge
    // ---------------------------------------------------------------

    /// Grow the file to `new_size_bytes`, converting out of mini and
    /// appending data blocks as needed. Newly exposed bytes are
    /// zeroed only insofar as reclaimed blocks are zero-filled;
    /// callers that require zeroed content drive the zero-fill path.
    pub(crate) fn enlarge_to_size(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        new_size_bytes: u64,
    ) -> Result<(), AfsError> {
        let top_block = self.nodes[TOP].block.clone();
        let (prev_size, mini_cap, is_mini) = {
            let bytes = top_block.bytes();
            let top = TopView::new(&*bytes);
            let view = FileNodeView::new(&*bytes);
            (
                top.file_size_bytes(),
                u64::from(view.mini_capacity()),
                view.is_mini(),
            )
        };
        assert!(prev_size < new_size_bytes);

        if new_size_bytes <= mini_cap {
            // The intended size fits inline, so the node must already
            // be mini; nothing structural changes.
            assert!(is_mini);
        } else {
            if is_mini {
                self.convert_mini_to_leaf(storage, jw, prev_size)?;
            }

            let mut cur_cap = implied_capacity(prev_size, self.block_size);
            if cur_cap == 0 {
                cur_cap = self.block_size.to_u64();
            }

            if new_size_bytes > cur_cap {
                // Navigate to the last leaf entry and append blocks.
                let nav_to_offset = prev_size.saturating_sub(1);
                let mut path = NavPath::new();
                self.nav_to_leaf_entry_containing_offset(
                    storage,
                    &mut path,
                    nav_to_offset,
                )?;
                {
                    let nav = *path.last();
                    let node = &self.nodes[nav.node];
                    assert_eq!(node.level, 0);
                    assert_eq!(nav.pos + 1, node.leaf_entries.len());
                }

                loop {
                    let data_block = jw
                        .reclaim_block_or_add_new(storage, BlockKind::None)?;
                    self.add_leaf_entry_at_end(
                        storage,
                        jw,
                        data_block,
                        &mut path,
                        CanAddNode::Yes,
                    )?;
                    cur_cap += self.block_size.to_u64();
                    if new_size_bytes <= cur_cap {
                        break;
                    }
                }
            }
        }

        {
            let mut bytes = jw.edit(&top_block);
            TopView::new(bytes.as_mut_slice()).set_file_size_bytes(new_size_bytes);
        }
        Ok(())
    }

    /// Convert a mini top node into a level-0 leaf whose single data
    /// block holds the former inline content.
    fn convert_mini_to_leaf(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        prev_size: u64,
    ) -> Result<(), AfsError> {
        let top_block = self.nodes[TOP].block.clone();
        let prev_size = usize::try_from(prev_size).unwrap();

        let data_block = jw.reclaim_block_or_add_new(storage, BlockKind::None)?;
        {
            let content = {
                let bytes = top_block.bytes();
                FileNodeView::new(&*bytes).mini_content()[..prev_size].to_vec()
            };
            let mut bytes = jw.edit(&data_block);
            bytes[..prev_size].copy_from_slice(&content);
        }

        {
            let mut bytes = jw.edit(&top_block);
            NodeView::new(bytes.as_mut_slice()).set_level(0);
        }
        {
            let mut bytes = jw.edit(&top_block);
            FileNodeView::new(bytes.as_mut_slice()).set_leaf_file_offset(0);
        }

        let top = &mut self.nodes[TOP];
        top.level = 0;
        assert!(top.leaf_entries.is_empty());
        top.leaf_entries.push(FileLeafEntry {
            block_index: data_block.index(),
        });
        top.data_blocks.push(Some(data_block));
        self.mark(jw, TOP, NodeState::Changed);
        Ok(())
    }

    /// Append a data block behind the last leaf entry.
    fn add_leaf_entry_at_end(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        data_block: Block,
        path: &mut NavPath,
        can_add_node: CanAddNode,
    ) -> Result<(), AfsError> {
        let nav = *path.last();
        let node_idx = nav.node;
        let fits = {
            let node = &self.nodes[node_idx];
            assert_eq!(node.level, 0);
            node.encoded_size() + FileLeafEntry::ENCODED_SIZE
                <= self.block_size.to_u32()
        };

        if fits {
            {
                let node = &mut self.nodes[node_idx];
                assert_eq!(node.leaf_entries.len(), node.data_blocks.len());
                node.leaf_entries.push(FileLeafEntry {
                    block_index: data_block.index(),
                });
                node.data_blocks.push(Some(data_block));
            }
            self.mark(jw, node_idx, NodeState::Changed);
            path.last_mut().pos = self.nodes[node_idx].leaf_entries.len() - 1;
            Ok(())
        } else {
            assert!(can_add_node == CanAddNode::Yes);
            let new_block_offset = {
                let bytes = self.nodes[node_idx].block.bytes();
                FileNodeView::new(&*bytes).leaf_file_offset()
            } + self.block_size.to_u64()
                * u64::try_from(self.nodes[node_idx].leaf_entries.len())
                    .unwrap();
            self.make_room_for_entry_at_end(
                storage,
                jw,
                path,
                new_block_offset,
                FileLeafEntry::ENCODED_SIZE,
            )?;
            self.add_leaf_entry_at_end(
                storage,
                jw,
                data_block,
                path,
                CanAddNode::No,
            )
        }
    }

    /// The node at the end of the path is full. Either add a sibling
    /// node at the end (non-top), or push the top's entries down into
    /// a fresh child, growing the tree by one level.
    fn make_room_for_entry_at_end(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
        new_block_offset: u64,
        entry_size: u32,
    ) -> Result<(), AfsError> {
        if !self.nodes[path.last().node].is_top {
            self.add_non_top_node_at_end(storage, jw, path, new_block_offset)
        } else {
            let bytes_gained = self.split_top_node(storage, jw, path)?;
            assert_eq!(path.len(), 2);

            // Separation may have created enough room; if not, recurse.
            if bytes_gained < entry_size {
                self.add_non_top_node_at_end(
                    storage,
                    jw,
                    path,
                    new_block_offset,
                )?;
            }
            Ok(())
        }
    }

    /// Allocate a fresh non-top file node block at `level`.
    fn new_non_top_node(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        level: u8,
        leaf_file_offset: u64,
    ) -> Result<usize, AfsError> {
        let block = jw.reclaim_block_or_add_new(storage, BlockKind::Node)?;
        {
            let mut bytes = jw.edit(&block);
            let mut node = NodeView::new(bytes.as_mut_slice());
            node.set_cat(NodeCat::NonTop);
            node.set_obj_type(ObjType::File);
            node.set_level(level);
        }
        if level == 0 {
            let mut bytes = jw.edit(&block);
            FileNodeView::new(bytes.as_mut_slice())
                .set_leaf_file_offset(leaf_file_offset);
        }
        let idx = self.nodes.len();
        self.nodes.push(FileNode {
            block,
            is_top: false,
            level,
            leaf_entries: Vec::new(),
            data_blocks: Vec::new(),
            branch_entries: Vec::new(),
            children: Vec::new(),
            state: NodeState::Clean,
        });
        self.mark(jw, idx, NodeState::Changed);
        Ok(idx)
    }

    /// Push all of the top node's entries into a fresh child and turn
    /// the top into a one-entry branch a level up. Returns the entry
    /// bytes gained by shedding the object header overhead.
    fn split_top_node(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
    ) -> Result<u32, AfsError> {
        assert_eq!(path.len(), 1);
        assert!(self.nodes[TOP].is_top);
        let level = self.nodes[TOP].level;
        let prev_encoded_size = self.nodes[TOP].encoded_size();

        let child = self.new_non_top_node(storage, jw, level, 0)?;

        if level == 0 {
            assert!(self.nodes[TOP].branch_entries.is_empty());
            assert!(self.nodes[TOP].children.is_empty());
            assert!(!self.nodes[TOP].leaf_entries.is_empty());
            assert_eq!(
                self.nodes[TOP].leaf_entries.len(),
                self.nodes[TOP].data_blocks.len()
            );
            let entries = core::mem::take(&mut self.nodes[TOP].leaf_entries);
            let data_blocks = core::mem::take(&mut self.nodes[TOP].data_blocks);
            self.nodes[child].leaf_entries = entries;
            self.nodes[child].data_blocks = data_blocks;
        } else {
            assert!(self.nodes[TOP].leaf_entries.is_empty());
            assert!(self.nodes[TOP].data_blocks.is_empty());
            assert!(!self.nodes[TOP].branch_entries.is_empty());
            assert_eq!(
                self.nodes[TOP].branch_entries.len(),
                self.nodes[TOP].children.len()
            );
            let entries = core::mem::take(&mut self.nodes[TOP].branch_entries);
            let children = core::mem::take(&mut self.nodes[TOP].children);
            self.nodes[child].branch_entries = entries;
            self.nodes[child].children = children;
        }

        let new_level = level.checked_add(1).unwrap();
        assert!(new_level < NODE_LEVEL_BEYOND_MAX);
        {
            let block = self.nodes[TOP].block.clone();
            let mut bytes = jw.edit(&block);
            NodeView::new(bytes.as_mut_slice()).set_level(new_level);
        }
        let child_block_index = self.nodes[child].block.index();
        {
            let top = &mut self.nodes[TOP];
            top.level = new_level;
            top.leaf_entries.clear();
            top.branch_entries = vec![FileBranchEntry {
                file_offset: 0,
                block_index: child_block_index,
            }];
            top.children = vec![Some(child)];
        }
        self.mark(jw, TOP, NodeState::Changed);

        // Re-point the path through the new child.
        let old_pos = path.last().pos;
        path.last_mut().pos = 0;
        path.push(child);
        path.last_mut().pos = old_pos;

        let child_encoded_size = self.nodes[child].encoded_size();
        Ok(prev_encoded_size.saturating_sub(child_encoded_size))
    }

    /// Append a fresh node at the right edge, at the same level as the
    /// node the path points at.
    fn add_non_top_node_at_end(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
        new_block_offset: u64,
    ) -> Result<(), AfsError> {
        assert_eq!(new_block_offset % self.block_size.to_u64(), 0);
        assert!(path.len() > 1);
        let node_idx = path.last().node;
        assert!(!self.nodes[node_idx].is_top);
        let level = self.nodes[node_idx].level;

        let new_idx =
            self.new_non_top_node(storage, jw, level, new_block_offset)?;

        let mut path_new = path.clone();
        path_new.pop();

        let entry = FileBranchEntry {
            file_offset: new_block_offset,
            block_index: self.nodes[new_idx].block.index(),
        };
        self.add_branch_entry_at_end(
            storage,
            jw,
            entry,
            &mut path_new,
            new_idx,
            CanAddNode::Yes,
        )?;

        path_new.push(new_idx);
        *path = path_new;
        Ok(())
    }

    fn add_branch_entry_at_end(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        entry: FileBranchEntry,
        path: &mut NavPath,
        new_node_idx: usize,
        can_add_node: CanAddNode,
    ) -> Result<(), AfsError> {
        let node_idx = path.last().node;
        let fits = {
            let node = &self.nodes[node_idx];
            assert!(node.level != 0);
            node.encoded_size() + FileBranchEntry::ENCODED_SIZE
                <= self.block_size.to_u32()
        };

        if fits {
            {
                let node = &mut self.nodes[node_idx];
                assert_eq!(node.branch_entries.len(), node.children.len());
                node.branch_entries.push(entry);
                node.children.push(Some(new_node_idx));

                let nr_entries = node.branch_entries.len();
                if nr_entries > 1 {
                    assert!(
                        node.branch_entries[nr_entries - 2].file_offset
                            < node.branch_entries[nr_entries - 1].file_offset
                    );
                }
            }
            self.mark(jw, node_idx, NodeState::Changed);
            path.last_mut().pos = self.nodes[node_idx].branch_entries.len() - 1;
            Ok(())
        } else {
            assert!(can_add_node == CanAddNode::Yes);
            self.make_room_for_entry_at_end(
                storage,
                jw,
                path,
                entry.file_offset,
                FileBranchEntry::ENCODED_SIZE,
            )?;
            self.add_branch_entry_at_end(
                storage,
                jw,
                entry,
                path,
                new_node_idx,
                CanAddNode::No,
            )
        }
    }

    // ---------------------------------------------------------------
    // Shrink
    // ---------------------------------------------------------------

    /// Shrink the file to `new_size_bytes`, dropping trailing data
    /// blocks, collapsing emptied nodes, and converting back to mini
    /// when the remaining content fits inline.
    pub(crate) fn shrink_to_size(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        new_size_bytes: u64,
    ) -> Result<(), AfsError> {
        let top_block = self.nodes[TOP].block.clone();
        let (prev_size, mini_cap, is_mini) = {
            let bytes = top_block.bytes();
            let top = TopView::new(&*bytes);
            let view = FileNodeView::new(&*bytes);
            (
                top.file_size_bytes(),
                u64::from(view.mini_capacity()),
                view.is_mini(),
            )
        };
        assert!(new_size_bytes < prev_size);

        if prev_size <= mini_cap {
            // Already inline; zero the truncated tail and stay mini.
            assert!(is_mini);
            let mut bytes = jw.edit(&top_block);
            let mut view = FileNodeView::new(bytes.as_mut_slice());
            let new_size = usize::try_from(new_size_bytes).unwrap();
            let prev = usize::try_from(prev_size).unwrap();
            view.mini_content_mut()[new_size..prev].fill(0);
        } else {
            assert!(!is_mini);

            let cur_cap = implied_capacity(prev_size, self.block_size);
            let new_cap = implied_capacity(new_size_bytes, self.block_size);
            if new_cap < cur_cap {
                // Drop trailing data blocks until at the new capacity.
                let mut path = NavPath::new();
                self.nav_to_leaf_entry_containing_offset(
                    storage,
                    &mut path,
                    prev_size - 1,
                )?;

                let mut cap = cur_cap;
                loop {
                    self.remove_data_block_at_end(storage, jw, &mut path)?;
                    cap -= self.block_size.to_u64();
                    if cap <= new_cap {
                        break;
                    }
                }
            }

            if new_size_bytes == 0 {
                // No blocks left; become an empty mini node.
                {
                    let top = &self.nodes[TOP];
                    assert_eq!(top.level, 0);
                    assert!(top.leaf_entries.is_empty());
                    assert!(top.data_blocks.is_empty());
                }
                {
                    let mut bytes = jw.edit(&top_block);
                    NodeView::new(bytes.as_mut_slice())
                        .set_level(NODE_LEVEL_BEYOND_MAX);
                }
                {
                    let mut bytes = jw.edit(&top_block);
                    FileNodeView::new(bytes.as_mut_slice())
                        .mini_content_mut()
                        .fill(0);
                }
                self.nodes[TOP].level = NODE_LEVEL_BEYOND_MAX;
                self.mark(jw, TOP, NodeState::Changed);
            } else if new_size_bytes <= mini_cap {
                // The remaining content fits inline; copy the last
                // data block's prefix into the top node and free it.
                {
                    let top = &self.nodes[TOP];
                    assert_eq!(top.level, 0);
                    assert_eq!(top.leaf_entries.len(), 1);
                    assert_eq!(top.data_blocks.len(), 1);
                }
                let new_size = usize::try_from(new_size_bytes).unwrap();
                let data_block = self.data_block(storage, TOP, 0);
                let content = data_block.bytes()[..new_size].to_vec();

                {
                    let mut bytes = jw.edit(&top_block);
                    NodeView::new(bytes.as_mut_slice())
                        .set_level(NODE_LEVEL_BEYOND_MAX);
                }
                {
                    let mut bytes = jw.edit(&top_block);
                    let mut view = FileNodeView::new(bytes.as_mut_slice());
                    let mini = view.mini_content_mut();
                    mini[..new_size].copy_from_slice(&content);
                    mini[new_size..].fill(0);
                }
                jw.add_block_to_free(&data_block);

                let top = &mut self.nodes[TOP];
                top.level = NODE_LEVEL_BEYOND_MAX;
                top.leaf_entries.clear();
                top.data_blocks.clear();
                self.mark(jw, TOP, NodeState::Changed);
            } else {
                // Zero any bytes past the new size in the final block.
                let bytes_in_last_block = usize::try_from(
                    new_size_bytes % self.block_size.to_u64(),
                )
                .unwrap();
                if bytes_in_last_block != 0 {
                    let mut path = NavPath::new();
                    self.nav_to_leaf_entry_containing_offset(
                        storage,
                        &mut path,
                        new_size_bytes - 1,
                    )?;
                    let nav = *path.last();
                    assert_eq!(self.nodes[nav.node].level, 0);
                    let block = self.data_block(storage, nav.node, nav.pos);
                    let mut bytes = jw.edit(&block);
                    bytes[bytes_in_last_block..].fill(0);
                }
            }
        }

        {
            let mut bytes = jw.edit(&top_block);
            TopView::new(bytes.as_mut_slice()).set_file_size_bytes(new_size_bytes);
        }
        Ok(())
    }

    /// Free the last data block of the file. Cascades node removal
    /// and hoisting as the right edge retreats.
    fn remove_data_block_at_end(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
    ) -> Result<(), AfsError> {
        let nav = *path.last();
        let node_idx = nav.node;
        {
            let node = &self.nodes[node_idx];
            assert_eq!(node.level, 0);
            assert_eq!(nav.pos + 1, node.leaf_entries.len());
            assert_eq!(node.leaf_entries.len(), node.data_blocks.len());
        }

        let block = self.data_block(storage, node_idx, nav.pos);
        jw.add_block_to_free(&block);

        {
            let node = &mut self.nodes[node_idx];
            node.leaf_entries.pop();
            node.data_blocks.pop();
        }
        if nav.pos != 0 {
            path.last_mut().pos -= 1;
        }
        self.mark(jw, node_idx, NodeState::Changed);

        if path.len() == 2 && self.nodes[TOP].branch_entries.len() == 1 {
            if self.try_hoist_into_top_node(jw, path)? {
                return Ok(());
            }
        }

        if !self.nodes[node_idx].leaf_entries.is_empty() {
            // The leaf still holds at least one entry.
        } else if self.nodes[node_idx].is_top {
            // Empty top leaf. It may need to become a mini node, but
            // that decision belongs to the caller.
        } else {
            self.remove_node_at_end_nav_to_prev_sibling(storage, jw, path)?;
        }
        Ok(())
    }

    /// Free the emptied node at the end of the path, drop its parent
    /// branch entry, and leave the path at the previous sibling.
    fn remove_node_at_end_nav_to_prev_sibling(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
    ) -> Result<(), AfsError> {
        {
            assert!(path.len() > 1);
            let idx = path.last().node;
            let node = &self.nodes[idx];
            assert!(node.leaf_entries.is_empty());
            assert!(node.branch_entries.is_empty());
            self.mark(jw, idx, NodeState::Free);
            path.pop();
        }

        let nav = *path.last();
        let node_idx = nav.node;
        {
            let node = &mut self.nodes[node_idx];
            assert_eq!(nav.pos + 1, node.branch_entries.len());
            assert_eq!(node.branch_entries.len(), node.children.len());
            node.branch_entries.pop();
            node.children.pop();
        }
        if nav.pos != 0 {
            path.last_mut().pos -= 1;
        }
        self.mark(jw, node_idx, NodeState::Changed);

        if path.len() == 2 && self.nodes[TOP].branch_entries.len() == 1 {
            if self.try_hoist_into_top_node(jw, path)? {
                self.descend_to_next_child_node(storage, path, EnumDir::Reverse)?;
                return Ok(());
            }
        }

        if !self.nodes[node_idx].branch_entries.is_empty() {
            self.descend_to_next_child_node(storage, path, EnumDir::Reverse)?;

            if path.len() == 2 && self.nodes[TOP].branch_entries.len() == 1 {
                self.try_hoist_into_top_node(jw, path)?;
            }
        } else {
            assert!(!self.nodes[node_idx].is_top);
            self.remove_node_at_end_nav_to_prev_sibling(storage, jw, path)?;
            self.descend_to_next_child_node(storage, path, EnumDir::Reverse)?;
        }
        Ok(())
    }

    /// Collapse the tree by one level when the top's single remaining
    /// child fits into the top node. Checked both when the top first
    /// drops to one entry and whenever the single child loses one.
    fn try_hoist_into_top_node(
        &mut self,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
    ) -> Result<bool, AfsError> {
        assert_eq!(path.len(), 2);
        {
            let top = &self.nodes[TOP];
            assert!(top.level != 0);
            assert!(top.level != NODE_LEVEL_BEYOND_MAX);
            assert_eq!(top.branch_entries.len(), 1);
            assert_eq!(path.entry(0).pos, 0);
        }

        let child_idx = path.last().node;
        let child_level = self.nodes[child_idx].level;

        let top_overhead = {
            let bytes = self.nodes[TOP].block.bytes();
            let view = FileNodeView::new(&*bytes);
            u32::try_from(if child_level == 0 {
                view.leaf_entries_offset()
            } else {
                view.branch_entries_offset()
            })
            .unwrap()
        };
        if top_overhead + self.nodes[child_idx].entries_encoded_size()
            > self.block_size.to_u32()
        {
            return Ok(false);
        }

        // The child fits; hoist it.
        let top_block = self.nodes[TOP].block.clone();
        {
            let mut bytes = jw.edit(&top_block);
            NodeView::new(bytes.as_mut_slice()).set_level(child_level);
        }
        self.nodes[TOP].level = child_level;

        if child_level == 0 {
            let child_file_offset = {
                let bytes = self.nodes[child_idx].block.bytes();
                FileNodeView::new(&*bytes).leaf_file_offset()
            };
            {
                let mut bytes = jw.edit(&top_block);
                FileNodeView::new(bytes.as_mut_slice())
                    .set_leaf_file_offset(child_file_offset);
            }
            let entries = core::mem::take(&mut self.nodes[child_idx].leaf_entries);
            let data_blocks =
                core::mem::take(&mut self.nodes[child_idx].data_blocks);
            let top = &mut self.nodes[TOP];
            top.leaf_entries = entries;
            top.data_blocks = data_blocks;
            top.branch_entries.clear();
            top.children.clear();
        } else {
            let entries =
                core::mem::take(&mut self.nodes[child_idx].branch_entries);
            let children = core::mem::take(&mut self.nodes[child_idx].children);
            let top = &mut self.nodes[TOP];
            top.branch_entries = entries;
            top.children = children;
        }

        self.mark(jw, TOP, NodeState::Changed);
        self.mark(jw, child_idx, NodeState::Free);

        let child_pos = path.last().pos;
        path.entry_mut(0).pos = child_pos;
        path.pop();
        Ok(true)
    }

    // ---------------------------------------------------------------
    // Finalization
    // ---------------------------------------------------------------

    /// Encode every changed node back into its block and hand freed
    /// node blocks to the journaled write.
    pub(crate) fn finalize(&mut self, jw: &mut JournaledWrite) {
        if !self.any_changed {
            return;
        }
        jw.dec_finalizations_pending();

        for idx in 0..self.nodes.len() {
            match self.nodes[idx].state {
                NodeState::Changed => {
                    self.encode_node(jw, idx);
                    self.nodes[idx].state = NodeState::Finalized;
                }
                NodeState::Free => {
                    let block = self.nodes[idx].block.clone();
                    jw.add_block_to_free(&block);
                    self.nodes[idx].state = NodeState::Finalized;
                }
                NodeState::Clean | NodeState::Finalized => {}
            }
        }
    }

    fn encode_node(&mut self, jw: &mut JournaledWrite, idx: usize) {
        let node = &self.nodes[idx];
        let block = node.block.clone();
        let mut bytes = jw.edit(&block);

        {
            let view = NodeView::new(bytes.as_slice());
            assert_eq!(view.cat() == NodeCat::Top, node.is_top);
            assert_eq!(view.level(), node.level);
        }

        if node.level == NODE_LEVEL_BEYOND_MAX {
            // Mini content is written in place; there are no entries.
            assert!(node.leaf_entries.is_empty());
            assert!(node.data_blocks.is_empty());
            assert!(node.branch_entries.is_empty());
            assert!(node.children.is_empty());
        } else if node.level == 0 {
            assert!(node.branch_entries.is_empty());
            assert!(node.children.is_empty());
            assert_eq!(node.leaf_entries.len(), node.data_blocks.len());
            FileNodeView::new(bytes.as_mut_slice())
                .encode_leaf_entries(&node.leaf_entries);
        } else {
            assert!(node.leaf_entries.is_empty());
            assert!(node.data_blocks.is_empty());
            assert_eq!(node.branch_entries.len(), node.children.len());
            FileNodeView::new(bytes.as_mut_slice())
                .encode_branch_entries(&node.branch_entries);
        }
    }
}
