// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Directory B+-tree: an ordered name-to-`(id, type)` map per
//! directory.
//!
//! A cursor decodes the blocks it visits into an arena of [`DirNode`]
//! values linked by arena indices; [`NavPath`] entries refer into the
//! arena. Read-only operations never mutate; mutating operations
//! record per-node states and encode everything back in one
//! [`finalize`] pass before the journaled write completes.
//!
//! [`finalize`]: DirCursor::finalize

use crate::block::{Block, BlockKind};
use crate::block_size::BlockSize;
use crate::error::AfsError;
use crate::journal::JournaledWrite;
use crate::obj_id::{ObjId, ObjType};
use crate::storage::{AfsStorage, obtain_block_check_kind};
use crate::time::AfsTime;
use crate::tree::{
    CanAddNode, EnumDir, FindResult, NameCmp, NavPath, NodeState, StopEarly,
    find_equal_or_less_than, REBALANCE_FRACTION,
};
use crate::views::{
    DirBranchEntry, DirLeafEntry, DirNodeView, NodeCat, NodeView, TopView,
};
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::mem;

/// Arena index of the top node; it is always decoded first.
const TOP: usize = 0;

/// A decoded directory tree node.
pub(crate) struct DirNode {
    pub(crate) block: Block,
    pub(crate) is_top: bool,
    pub(crate) level: u8,
    pub(crate) leaf_entries: Vec<DirLeafEntry>,
    pub(crate) branch_entries: Vec<DirBranchEntry>,
    /// Arena indices of decoded children, parallel to
    /// `branch_entries`. `None` until a child is first visited.
    pub(crate) children: Vec<Option<usize>>,
    pub(crate) state: NodeState,
}

impl DirNode {
    fn decode(block: Block) -> Self {
        let (is_top, level) = {
            let bytes = block.bytes();
            let node = NodeView::new(&*bytes);
            assert!(node.obj_type().is_dir());
            (node.cat() == NodeCat::Top, node.level())
        };

        let mut leaf_entries = Vec::new();
        let mut branch_entries = Vec::new();
        let mut children = Vec::new();
        {
            let bytes = block.bytes();
            let view = DirNodeView::new(&*bytes);
            if level == 0 {
                leaf_entries = view.decode_leaf_entries();
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
            branch_entries,
            children,
            state: NodeState::Clean,
        }
    }

    pub(crate) fn nr_vec_entries(&self) -> usize {
        if self.level == 0 {
            self.leaf_entries.len()
        } else {
            self.branch_entries.len()
        }
    }

    fn entries_encoded_size(&self) -> u32 {
        if self.level == 0 {
            self.leaf_entries.iter().map(DirLeafEntry::encoded_size).sum()
        } else {
            self.branch_entries
                .iter()
                .map(DirBranchEntry::encoded_size)
                .sum()
        }
    }

    /// Full encoded size of the node: fixed fields plus entries. Leaf
    /// and branch directory nodes share the same fixed-field shape.
    fn encoded_size(&self) -> u32 {
        let overhead = {
            let bytes = self.block.bytes();
            u32::try_from(DirNodeView::new(&*bytes).entries_offset()).unwrap()
        };
        overhead + self.entries_encoded_size()
    }

    fn first_name(&self) -> &[u8] {
        if self.level == 0 {
            &self.leaf_entries[0].name
        } else {
            &self.branch_entries[0].name
        }
    }
}

/// Cursor into one directory's tree.
///
/// The same cursor type serves read-only and mutating operations;
/// mutating methods additionally take the journaled write.
pub(crate) struct DirCursor {
    block_size: BlockSize,
    cmp: NameCmp,
    nodes: Vec<DirNode>,
    any_changed: bool,
}

impl DirCursor {
    pub(crate) fn new(block_size: BlockSize, cmp: NameCmp) -> Self {
        Self {
            block_size,
            cmp,
            nodes: Vec::new(),
            any_changed: false,
        }
    }

    /// Decode the directory's top node, previously obtained and
    /// validated by the façade.
    pub(crate) fn load_top(&mut self, block: Block) {
        assert!(self.nodes.is_empty());
        let node = DirNode::decode(block);
        assert!(node.is_top);
        self.nodes.push(node);
    }

    pub(crate) fn top(&self) -> &DirNode {
        &self.nodes[TOP]
    }

    pub(crate) fn node(&self, idx: usize) -> &DirNode {
        &self.nodes[idx]
    }

    fn cmp_names(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.cmp)(a, b)
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

    /// Descend from the top to the leaf entry equal to or immediately
    /// less than `name`.
    pub(crate) fn nav_to_leaf_entry_equal_or_less_than(
        &mut self,
        storage: &mut dyn AfsStorage,
        path: &mut NavPath,
        name: &[u8],
        stop_early: StopEarly,
    ) -> Result<FindResult, AfsError> {
        path.clear();
        path.push(TOP);

        loop {
            let node_idx = path.last().node;
            let node = &self.nodes[node_idx];

            if node.level == 0 {
                let (pos, fr) =
                    find_equal_or_less_than(&node.leaf_entries, |e| {
                        self.cmp_names(&e.name, name)
                    });
                path.last_mut().pos = pos;
                if fr == FindResult::NoEntries {
                    // A leaf node may be empty only if it is the top node.
                    assert_eq!(node_idx, TOP);
                }
                return Ok(fr);
            }

            let (pos, fr) = find_equal_or_less_than(&node.branch_entries, |e| {
                self.cmp_names(&e.name, name)
            });
            // A branch node may not be empty.
            assert!(fr != FindResult::NoEntries);
            path.last_mut().pos = pos;

            if stop_early == StopEarly::IfCantFind
                && fr == FindResult::FirstIsGreater
            {
                // The name cannot be in this directory.
                return Ok(fr);
            }

            self.descend_to_next_child_node(storage, path, EnumDir::Forward)?;
        }
    }

    pub(crate) fn leaf_entry_at(&self, path: &NavPath) -> &DirLeafEntry {
        let nav = path.last();
        let node = &self.nodes[nav.node];
        assert_eq!(node.level, 0);
        assert!(nav.pos < node.leaf_entries.len());
        &node.leaf_entries[nav.pos]
    }

    /// Load (if needed) and step into the child at the current branch
    /// position. `Reverse` enters at the child's last entry.
    fn descend_to_next_child_node(
        &mut self,
        storage: &mut dyn AfsStorage,
        path: &mut NavPath,
        enum_dir: EnumDir,
    ) -> Result<(), AfsError> {
        assert!(!path.is_empty());
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
                    panic!("directory node block {block_index} unusable: {e}")
                });
                let child = DirNode::decode(block);
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
            let nr_entries = self.nodes[child_idx].nr_vec_entries();
            assert!(nr_entries != 0);
            path.last_mut().pos = nr_entries - 1;
        }
        Ok(())
    }

    /// Move the path to the lateral sibling of its current node, at
    /// the same level. Returns false if no such sibling exists; the
    /// path is left cleared in that case.
    pub(crate) fn nav_to_sibling_node(
        &mut self,
        storage: &mut dyn AfsStorage,
        path: &mut NavPath,
        enum_dir: EnumDir,
    ) -> Result<bool, AfsError> {
        let target_level = self.nodes[path.last().node].level;

        // Ascend until some level permits a lateral move.
        let mut child_level = u32::from(target_level);
        loop {
            let child_block_index = self.nodes[path.last().node].block.index();
            path.pop();
            if path.is_empty() {
                return Ok(false);
            }

            // The parent position must correspond to the child we
            // ascended from.
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

        // Descend first-or-last back down to the target level.
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

    /// Rebuild `path` to point at `(node_idx, pos)` after a structural
    /// change, by descending along the node's first name.
    fn rebuild_nav_path(
        &self,
        path: &mut NavPath,
        node_idx: usize,
        pos: usize,
    ) {
        let node = &self.nodes[node_idx];
        assert!(pos < node.nr_vec_entries());
        let name = node.first_name();

        path.clear();
        path.push(TOP);
        loop {
            let cur_idx = path.last().node;
            if cur_idx == node_idx {
                path.last_mut().pos = pos;
                break;
            }

            let cur = &self.nodes[cur_idx];
            assert!(cur.level != 0);
            let (found_pos, fr) =
                find_equal_or_less_than(&cur.branch_entries, |e| {
                    self.cmp_names(&e.name, name)
                });
            assert!(fr != FindResult::NoEntries);
            assert!(fr != FindResult::FirstIsGreater);
            assert_eq!(cur.branch_entries.len(), cur.children.len());
            path.last_mut().pos = found_pos;
            let child = cur.children[found_pos]
                .expect("path rebuild crossed an unloaded child");
            path.push(child);
        }
    }

    // ---------------------------------------------------------------
    // Insertion
    // ---------------------------------------------------------------

    /// Insert a leaf entry, navigating to its position first.
    pub(crate) fn add_leaf_entry(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        entry: DirLeafEntry,
        now: AfsTime,
    ) -> Result<(), AfsError> {
        let mut path = NavPath::new();
        let fr = self.nav_to_leaf_entry_equal_or_less_than(
            storage,
            &mut path,
            &entry.name,
            StopEarly::No,
        )?;
        // The caller has already established the name is absent.
        assert!(fr != FindResult::FoundEqual);
        if fr == FindResult::FoundLessThan {
            path.last_mut().pos += 1;
        }
        self.add_leaf_entry_at(storage, jw, entry, &mut path, now, CanAddNode::Yes)
    }

    /// Insert a leaf entry at an already-navigated position.
    pub(crate) fn add_leaf_entry_at(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        entry: DirLeafEntry,
        path: &mut NavPath,
        now: AfsTime,
        can_add_node: CanAddNode,
    ) -> Result<(), AfsError> {
        let entry_size = entry.encoded_size();
        let nav = *path.last();
        let node_idx = nav.node;
        let fits = {
            let node = &self.nodes[node_idx];
            assert_eq!(node.level, 0);
            node.encoded_size() + entry_size <= self.block_size.to_u32()
        };

        if !fits {
            // Insufficient room; the node block must split.
            assert!(can_add_node == CanAddNode::Yes);
            self.split_node(storage, jw, path)?;
            return self.add_leaf_entry_at(
                storage,
                jw,
                entry,
                path,
                now,
                CanAddNode::No,
            );
        }

        let cmp = self.cmp;
        let is_top = {
            let node = &mut self.nodes[node_idx];
            node.leaf_entries.insert(nav.pos, entry);
            if nav.pos > 0 {
                assert!(
                    cmp(
                        &node.leaf_entries[nav.pos - 1].name,
                        &node.leaf_entries[nav.pos].name,
                    ) == Ordering::Less
                );
            }
            if node.leaf_entries.len() > nav.pos + 1 {
                assert!(
                    cmp(
                        &node.leaf_entries[nav.pos].name,
                        &node.leaf_entries[nav.pos + 1].name,
                    ) == Ordering::Less
                );
            }
            node.is_top
        };
        self.mark(jw, node_idx, NodeState::Changed);

        if !is_top && nav.pos == 0 {
            self.update_ancestors(storage, jw, path)?;
        }

        // Update the top node's entry count and modify time.
        let top_block = self.nodes[TOP].block.clone();
        {
            let mut bytes = jw.edit(&top_block);
            let mut top = TopView::new(bytes.as_mut_slice());
            let nr = top.dir_nr_entries();
            top.set_dir_nr_entries(nr + 1);
            top.set_modify_time(now.ticks());
        }
        self.mark(jw, TOP, NodeState::Changed);
        Ok(())
    }

    /// Insert a branch entry (and its decoded child link) at an
    /// already-navigated position.
    fn add_branch_entry_at(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        entry: DirBranchEntry,
        path: &mut NavPath,
        new_node_idx: usize,
        can_add_node: CanAddNode,
    ) -> Result<(), AfsError> {
        let entry_size = entry.encoded_size();
        let nav = *path.last();
        let node_idx = nav.node;
        let fits = {
            let node = &self.nodes[node_idx];
            assert!(node.level != 0);
            node.encoded_size() + entry_size <= self.block_size.to_u32()
        };

        if !fits {
            assert!(can_add_node == CanAddNode::Yes);
            self.split_node(storage, jw, path)?;
            return self.add_branch_entry_at(
                storage,
                jw,
                entry,
                path,
                new_node_idx,
                CanAddNode::No,
            );
        }

        let cmp = self.cmp;
        let is_top = {
            let node = &mut self.nodes[node_idx];
            assert_eq!(node.branch_entries.len(), node.children.len());
            node.branch_entries.insert(nav.pos, entry);
            node.children.insert(nav.pos, Some(new_node_idx));

            if nav.pos > 0 {
                assert!(
                    cmp(
                        &node.branch_entries[nav.pos - 1].name,
                        &node.branch_entries[nav.pos].name,
                    ) == Ordering::Less
                );
            }
            if node.branch_entries.len() > nav.pos + 1 {
                assert!(
                    cmp(
                        &node.branch_entries[nav.pos].name,
                        &node.branch_entries[nav.pos + 1].name,
                    ) == Ordering::Less
                );
            }
            node.is_top
        };
        self.mark(jw, node_idx, NodeState::Changed);

        if !is_top && nav.pos == 0 {
            self.update_ancestors(storage, jw, path)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Removal
    // ---------------------------------------------------------------

    /// Remove the leaf entry the path points at. `expected_id` guards
    /// against a stale path.
    pub(crate) fn remove_leaf_entry_at(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
        expected_id: ObjId,
        now: AfsTime,
    ) -> Result<(), AfsError> {
        assert!(!path.is_empty());
        let nav = *path.last();
        let node_idx = nav.node;
        {
            let node = &mut self.nodes[node_idx];
            assert_eq!(node.level, 0);
            assert!(nav.pos < node.leaf_entries.len());
            assert_eq!(node.leaf_entries[nav.pos].id, expected_id);
            node.leaf_entries.remove(nav.pos);
        }
        self.mark(jw, node_idx, NodeState::Changed);

        self.on_entry_removed_maintenance(storage, jw, path)?;

        // Update the top node's entry count and modify time.
        let top_block = self.nodes[TOP].block.clone();
        {
            let mut bytes = jw.edit(&top_block);
            let mut top = TopView::new(bytes.as_mut_slice());
            let nr = top.dir_nr_entries();
            assert!(nr != 0);
            top.set_dir_nr_entries(nr - 1);
            top.set_modify_time(now.ticks());
        }
        self.mark(jw, TOP, NodeState::Changed);
        Ok(())
    }

    /// Free the non-top node the path points at and remove its branch
    /// entry from the parent. Can cascade upward.
    fn remove_non_top_node(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
    ) -> Result<(), AfsError> {
        assert!(path.len() >= 2);
        let removed_idx = path.last().node;
        let (block_index, removed_level) = {
            let node = &self.nodes[removed_idx];
            assert!(!node.is_top);
            (node.block.index(), node.level)
        };
        self.mark(jw, removed_idx, NodeState::Free);
        path.pop();

        let nav = *path.last();
        let parent_idx = nav.node;
        {
            let node = &mut self.nodes[parent_idx];
            assert_eq!(u32::from(removed_level) + 1, u32::from(node.level));
            assert!(nav.pos < node.branch_entries.len());
            assert_eq!(node.branch_entries[nav.pos].block_index, block_index);
            node.branch_entries.remove(nav.pos);
            node.children.remove(nav.pos);
        }
        self.mark(jw, parent_idx, NodeState::Changed);

        self.on_entry_removed_maintenance(storage, jw, path)
    }

    /// Rebalance after an entry was removed from the node the path
    /// points at: hoist, cascade-remove an emptied node, propagate a
    /// changed first name, or join undersized siblings.
    fn on_entry_removed_maintenance(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
    ) -> Result<(), AfsError> {
        let nav = *path.last();
        let node_idx = nav.node;

        if self.nodes[node_idx].is_top {
            let nr_entries = self.nodes[node_idx].nr_vec_entries();
            if nr_entries == 0 {
                // An emptied top node must already be a leaf.
                assert_eq!(self.nodes[node_idx].level, 0);
            } else if nr_entries == 1 && self.nodes[node_idx].level != 0 {
                self.try_hoist_into_top_node(storage, jw, path)?;
            }
            return Ok(());
        }

        if path.len() == 2 && self.nodes[TOP].branch_entries.len() == 1 {
            if self.try_hoist_into_top_node(storage, jw, path)? {
                return Ok(());
            }
        }

        if self.nodes[node_idx].nr_vec_entries() == 0 {
            // Empty and non-top: remove the node. This can cascade to
            // higher levels, including joining and freeing.
            return self.remove_non_top_node(storage, jw, path);
        }

        if nav.pos == 0 {
            self.update_ancestors(storage, jw, path)?;
        }

        if self.nodes[node_idx].encoded_size()
            <= self.block_size.to_u32() / REBALANCE_FRACTION
        {
            // Below the rebalance threshold; try joining whichever
            // sibling yields the smaller combined node.
            let entries_size = self.nodes[node_idx].entries_encoded_size();
            let mut size_with_prev = u32::MAX;
            let mut size_with_next = u32::MAX;

            let mut path_prev = path.clone();
            if self.nav_to_sibling_node(
                storage,
                &mut path_prev,
                EnumDir::Reverse,
            )? {
                size_with_prev = self.nodes[path_prev.last().node]
                    .encoded_size()
                    + entries_size;
            }

            let mut path_next = path.clone();
            if self.nav_to_sibling_node(
                storage,
                &mut path_next,
                EnumDir::Forward,
            )? {
                size_with_next = self.nodes[path_next.last().node]
                    .encoded_size()
                    + entries_size;
            }

            if size_with_prev <= size_with_next {
                if size_with_prev <= self.block_size.to_u32() {
                    self.join_sibling_nodes(storage, jw, &mut path_prev, path)?;
                }
            } else if size_with_next <= self.block_size.to_u32() {
                self.join_sibling_nodes(storage, jw, path, &mut path_next)?;
            }
        }
        Ok(())
    }

    /// Propagate a changed first name up the ancestor chain, deferring
    /// any splits caused by a longer name until the walk finishes so
    /// paths remain well-defined.
    fn update_ancestors(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
    ) -> Result<(), AfsError> {
        let nav = *path.last();
        let node_idx = nav.node;
        assert!(!self.nodes[node_idx].is_top);

        if self.nodes[node_idx].nr_vec_entries() == 0 {
            // The node will be removed in maintenance.
            return Ok(());
        }

        let new_first_name = self.nodes[node_idx].first_name().to_vec();

        assert!(path.len() >= 2);
        let mut nav_index = path.len() - 2;
        let mut child_level = u32::from(self.nodes[node_idx].level);
        let mut child_block_index = self.nodes[node_idx].block.index();
        let mut split_nodes: Vec<usize> = Vec::new();

        loop {
            let anc_nav = *path.entry(nav_index);
            let anc_idx = anc_nav.node;
            {
                let anc = &self.nodes[anc_idx];
                assert_eq!(child_level + 1, u32::from(anc.level));
                assert!(anc_nav.pos < anc.branch_entries.len());
                assert_eq!(
                    anc.branch_entries[anc_nav.pos].block_index,
                    child_block_index
                );
            }

            if self.cmp_names(
                &self.nodes[anc_idx].branch_entries[anc_nav.pos].name,
                &new_first_name,
            ) == Ordering::Equal
            {
                break;
            }

            {
                let anc = &self.nodes[anc_idx];
                if anc_nav.pos != 0 {
                    assert!(
                        self.cmp_names(
                            &anc.branch_entries[anc_nav.pos - 1].name,
                            &new_first_name,
                        ) == Ordering::Less
                    );
                }
                if anc_nav.pos + 1 < anc.branch_entries.len() {
                    assert!(
                        self.cmp_names(
                            &new_first_name,
                            &anc.branch_entries[anc_nav.pos + 1].name,
                        ) == Ordering::Less
                    );
                }
            }

            let new_name_longer = {
                let anc = &mut self.nodes[anc_idx];
                let longer = new_first_name.len()
                    > anc.branch_entries[anc_nav.pos].name.len();
                anc.branch_entries[anc_nav.pos].name = new_first_name.clone();
                longer
            };
            self.mark(jw, anc_idx, NodeState::Changed);

            if new_name_longer
                && self.nodes[anc_idx].encoded_size()
                    > self.block_size.to_u32()
            {
                split_nodes.push(anc_idx);
            }

            if nav_index == 0 {
                break;
            }
            if anc_nav.pos != 0 {
                break;
            }

            child_level = u32::from(self.nodes[anc_idx].level);
            child_block_index = self.nodes[anc_idx].block.index();
            nav_index -= 1;
        }

        // Splits were deferred until ancestors were updated; without
        // that ordering the paths could not be rebuilt.
        if !split_nodes.is_empty() {
            while let Some(split_idx) = split_nodes.pop() {
                // The node may have been split while splitting another
                // node; recheck.
                if self.nodes[split_idx].encoded_size()
                    > self.block_size.to_u32()
                {
                    let mut split_path = NavPath::new();
                    self.rebuild_nav_path(&mut split_path, split_idx, 0);
                    self.split_node(storage, jw, &mut split_path)?;
                }
            }
            self.rebuild_nav_path(path, node_idx, nav.pos);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Split, join, hoist
    // ---------------------------------------------------------------

    /// Split the node the path points at, at the midpoint by encoded
    /// size.
    fn split_node(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
    ) -> Result<(), AfsError> {
        let node_idx = path.last().node;
        let node = &self.nodes[node_idx];

        let threshold = node.entries_encoded_size() / 2;
        let mut size_sum = 0u32;
        let mut split_index = None;
        if node.level == 0 {
            for (i, entry) in node.leaf_entries.iter().enumerate() {
                size_sum += entry.encoded_size();
                if size_sum >= threshold {
                    split_index = Some(i);
                    break;
                }
            }
        } else {
            for (i, entry) in node.branch_entries.iter().enumerate() {
                size_sum += entry.encoded_size();
                if size_sum >= threshold {
                    split_index = Some(i);
                    break;
                }
            }
        }
        let split_index = split_index.expect("split point not found");

        if self.nodes[node_idx].is_top {
            self.split_top_node(storage, jw, path, split_index)
        } else {
            self.split_non_top_node(storage, jw, path, split_index)
        }
    }

    /// Allocate a fresh non-top directory node block at `level`.
    fn new_non_top_node(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        level: u8,
    ) -> Result<usize, AfsError> {
        let block = jw.reclaim_block_or_add_new(storage, BlockKind::Node)?;
        {
            let mut bytes = jw.edit(&block);
            let mut node = NodeView::new(bytes.as_mut_slice());
            node.set_cat(NodeCat::NonTop);
            node.set_obj_type(ObjType::Dir);
            node.set_level(level);
        }
        let idx = self.nodes.len();
        self.nodes.push(DirNode {
            block,
            is_top: false,
            level,
            leaf_entries: Vec::new(),
            branch_entries: Vec::new(),
            children: Vec::new(),
            state: NodeState::Clean,
        });
        self.mark(jw, idx, NodeState::Changed);
        Ok(idx)
    }

    /// Split the top node: all entries move into two new children and
    /// the top becomes a two-entry branch one level up.
    fn split_top_node(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
        split_index: usize,
    ) -> Result<(), AfsError> {
        assert_eq!(path.len(), 1);
        assert!(split_index != 0);
        let level = self.nodes[TOP].level;
        assert!(self.nodes[TOP].is_top);

        let child1 = self.new_non_top_node(storage, jw, level)?;
        let child2 = self.new_non_top_node(storage, jw, level)?;

        if level == 0 {
            assert!(self.nodes[TOP].branch_entries.is_empty());
            assert!(self.nodes[TOP].children.is_empty());
            assert!(split_index < self.nodes[TOP].leaf_entries.len());

            let mut entries = mem::take(&mut self.nodes[TOP].leaf_entries);
            let tail = entries.split_off(split_index);
            self.nodes[child1].leaf_entries = entries;
            self.nodes[child2].leaf_entries = tail;
        } else {
            assert!(self.nodes[TOP].leaf_entries.is_empty());
            assert_eq!(
                self.nodes[TOP].branch_entries.len(),
                self.nodes[TOP].children.len()
            );
            assert!(split_index + 1 < self.nodes[TOP].branch_entries.len());

            let mut entries = mem::take(&mut self.nodes[TOP].branch_entries);
            let mut children = mem::take(&mut self.nodes[TOP].children);
            let entries_tail = entries.split_off(split_index);
            let children_tail = children.split_off(split_index);
            self.nodes[child1].branch_entries = entries;
            self.nodes[child1].children = children;
            self.nodes[child2].branch_entries = entries_tail;
            self.nodes[child2].children = children_tail;
        }

        let child1_first_name = self.nodes[child1].first_name().to_vec();
        let child2_first_name = self.nodes[child2].first_name().to_vec();
        assert!(
            self.cmp_names(&child1_first_name, &child2_first_name)
                == Ordering::Less
        );

        // The top node becomes a branch one level up.
        let new_level = level.checked_add(1).unwrap();
        assert!(new_level < crate::views::NODE_LEVEL_BEYOND_MAX);
        {
            let block = self.nodes[TOP].block.clone();
            let mut bytes = jw.edit(&block);
            NodeView::new(bytes.as_mut_slice()).set_level(new_level);
        }
        let child1_block_index = self.nodes[child1].block.index();
        let child2_block_index = self.nodes[child2].block.index();
        {
            let top = &mut self.nodes[TOP];
            top.level = new_level;
            top.leaf_entries.clear();
            top.branch_entries = vec![
                DirBranchEntry {
                    block_index: child1_block_index,
                    name: child1_first_name,
                },
                DirBranchEntry {
                    block_index: child2_block_index,
                    name: child2_first_name,
                },
            ];
            top.children = vec![Some(child1), Some(child2)];
        }
        self.mark(jw, TOP, NodeState::Changed);

        // Re-point the path at the child now holding the old position.
        let old_pos = path.last().pos;
        if old_pos < split_index {
            path.last_mut().pos = 0;
            path.push(child1);
            path.last_mut().pos = old_pos;
        } else {
            path.last_mut().pos = 1;
            path.push(child2);
            path.last_mut().pos = old_pos - split_index;
        }
        Ok(())
    }

    /// Split a non-top node: entries past the split move into a new
    /// sibling inserted after it in the parent.
    fn split_non_top_node(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
        split_index: usize,
    ) -> Result<(), AfsError> {
        let node_idx = path.last().node;
        assert!(!self.nodes[node_idx].is_top);
        assert!(split_index != 0);
        let level = self.nodes[node_idx].level;

        let new_idx = self.new_non_top_node(storage, jw, level)?;

        if level == 0 {
            assert!(self.nodes[node_idx].branch_entries.is_empty());
            assert!(self.nodes[node_idx].children.is_empty());
            assert!(split_index < self.nodes[node_idx].leaf_entries.len());
            let tail = self.nodes[node_idx].leaf_entries.split_off(split_index);
            self.nodes[new_idx].leaf_entries = tail;
        } else {
            assert!(self.nodes[node_idx].leaf_entries.is_empty());
            assert_eq!(
                self.nodes[node_idx].branch_entries.len(),
                self.nodes[node_idx].children.len()
            );
            assert!(split_index + 1 < self.nodes[node_idx].branch_entries.len());
            let entries_tail =
                self.nodes[node_idx].branch_entries.split_off(split_index);
            let children_tail =
                self.nodes[node_idx].children.split_off(split_index);
            self.nodes[new_idx].branch_entries = entries_tail;
            self.nodes[new_idx].children = children_tail;
        }
        self.mark(jw, node_idx, NodeState::Changed);

        let new_first_name = self.nodes[new_idx].first_name().to_vec();

        // Insert the new node into the parent, after the split node.
        assert!(path.len() > 1);
        let mut path_new = path.clone();
        path_new.pop();
        path_new.last_mut().pos += 1;

        let entry = DirBranchEntry {
            block_index: self.nodes[new_idx].block.index(),
            name: new_first_name,
        };
        self.add_branch_entry_at(
            storage,
            jw,
            entry,
            &mut path_new,
            new_idx,
            CanAddNode::Yes,
        )?;

        // Re-point the original path.
        let old_pos = path.last().pos;
        if old_pos < split_index {
            self.rebuild_nav_path(path, node_idx, old_pos);
        } else {
            path_new.push(new_idx);
            path_new.last_mut().pos = old_pos - split_index;
            *path = path_new;
        }
        Ok(())
    }

    /// Merge `from` into the lower-indexed sibling `to` and remove the
    /// emptied node. Both must be non-top, same-level siblings with
    /// `to` ordered before `from`.
    fn join_sibling_nodes(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path_to: &mut NavPath,
        path_from: &mut NavPath,
    ) -> Result<(), AfsError> {
        let to_idx = path_to.last().node;
        let from_idx = path_from.last().node;
        assert!(!self.nodes[to_idx].is_top);
        assert!(!self.nodes[from_idx].is_top);
        assert_eq!(self.nodes[to_idx].level, self.nodes[from_idx].level);

        if self.nodes[to_idx].level == 0 {
            assert!(!self.nodes[to_idx].leaf_entries.is_empty());
            assert!(!self.nodes[from_idx].leaf_entries.is_empty());
            assert!(
                self.cmp_names(
                    &self.nodes[to_idx].leaf_entries.last().unwrap().name,
                    &self.nodes[from_idx].leaf_entries[0].name,
                ) == Ordering::Less
            );
            let from_entries = mem::take(&mut self.nodes[from_idx].leaf_entries);
            self.nodes[to_idx].leaf_entries.extend(from_entries);
        } else {
            assert!(!self.nodes[to_idx].branch_entries.is_empty());
            assert!(!self.nodes[from_idx].branch_entries.is_empty());
            assert!(
                self.cmp_names(
                    &self.nodes[to_idx].branch_entries.last().unwrap().name,
                    &self.nodes[from_idx].branch_entries[0].name,
                ) == Ordering::Less
            );
            let from_entries =
                mem::take(&mut self.nodes[from_idx].branch_entries);
            let from_children = mem::take(&mut self.nodes[from_idx].children);
            self.nodes[to_idx].branch_entries.extend(from_entries);
            self.nodes[to_idx].children.extend(from_children);
        }

        assert!(
            self.nodes[to_idx].encoded_size() <= self.block_size.to_u32()
        );
        self.mark(jw, to_idx, NodeState::Changed);

        self.remove_non_top_node(storage, jw, path_from)
    }

    /// Try to collapse the tree by one level: when the top branch has
    /// a single child whose entries fit in the top node, move them up
    /// and free the child block.
    ///
    /// A top node carries the object header, so it may lack the space
    /// a non-top child has; the check therefore runs both when the top
    /// first drops to one entry and again whenever an entry is removed
    /// from the single child. The child is never empty at hoist time:
    /// the name length limit guarantees an under-threshold child fits
    /// before it can empty out.
    fn try_hoist_into_top_node(
        &mut self,
        storage: &mut dyn AfsStorage,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
    ) -> Result<bool, AfsError> {
        assert!(!path.is_empty());
        assert!(self.nodes[TOP].level != 0);
        assert_eq!(self.nodes[TOP].branch_entries.len(), 1);

        // If the path points at the top itself, descend to the child
        // to hoist.
        let mut path_descended = false;
        if path.len() == 1 {
            path.last_mut().pos = 0;
            self.descend_to_next_child_node(storage, path, EnumDir::Forward)?;
            path_descended = true;
        }

        assert_eq!(path.len(), 2);
        let child_idx = path.last().node;
        let child_level = self.nodes[child_idx].level;

        let top_overhead = {
            let bytes = self.nodes[TOP].block.bytes();
            u32::try_from(DirNodeView::new(&*bytes).entries_offset()).unwrap()
        };
        if top_overhead + self.nodes[child_idx].entries_encoded_size()
            > self.block_size.to_u32()
        {
            if path_descended {
                path.pop();
            }
            return Ok(false);
        }

        // The child fits; hoist it.
        {
            let block = self.nodes[TOP].block.clone();
            let mut bytes = jw.edit(&block);
            NodeView::new(bytes.as_mut_slice()).set_level(child_level);
        }
        self.nodes[TOP].level = child_level;

        if child_level == 0 {
            let entries = mem::take(&mut self.nodes[child_idx].leaf_entries);
            let top = &mut self.nodes[TOP];
            top.leaf_entries = entries;
            top.branch_entries.clear();
            top.children.clear();
        } else {
            let entries = mem::take(&mut self.nodes[child_idx].branch_entries);
            let children = mem::take(&mut self.nodes[child_idx].children);
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
    /// node blocks to the journaled write. Must run before the scope
    /// completes.
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

        let mut view = DirNodeView::new(bytes.as_mut_slice());
        if node.level == 0 {
            assert!(node.branch_entries.is_empty());
            assert!(node.children.is_empty());
            view.encode_leaf_entries(&node.leaf_entries);
        } else {
            assert!(node.leaf_entries.is_empty());
            assert_eq!(node.branch_entries.len(), node.children.len());
            view.encode_branch_entries(&node.branch_entries);
        }
    }
}
