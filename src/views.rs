// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Typed views over raw block bytes.
//!
//! These accessors are the single source of truth for the on-block
//! layout. All multi-byte integers are little-endian. Byte 0 of every
//! block is the [`BlockKind`] tag; each view asserts the tag (and node
//! category, where applicable) it requires, so obtaining a view for
//! the wrong block kind fails loudly rather than misreading.

use crate::block::BlockKind;
use crate::block_size::BlockSize;
use crate::obj_id::{ObjId, ObjType};
use crate::util::{
    read_u16le, read_u32le, read_u64le, usize_from_u32, write_u16le,
    write_u32le, write_u64le,
};
use alloc::vec::Vec;

/// Version written to and required in the master block.
pub(crate) const FS_VERSION: u32 = 1;

/// Level tag marking a file top node whose content is stored inline.
pub(crate) const NODE_LEVEL_BEYOND_MAX: u8 = 0xFF;

/// `prev_free_list_index` value marking the first free-list block.
pub(crate) const NO_PREV_FREE_LIST: u64 = u64::MAX;

// Master block field offsets (after the kind byte).
const MASTER_FS_VERSION: usize = 1;
const MASTER_NEXT_UNIQUE_ID: usize = 5;
const MASTER_ROOT_DIR_TOP: usize = 13;
const MASTER_FREE_LIST_TAIL: usize = 21;
const MASTER_NR_FULL_FREE_LIST: usize = 29;

// Free-list block field offsets.
const FREE_LIST_PREV: usize = 1;
const FREE_LIST_NR_INDICES: usize = 9;
const FREE_LIST_INDICES: usize = 13;

// Node block field offsets. The top-node header is followed by a
// type-specific counter (`dir_nr_entries: u32` or
// `file_size_bytes: u64`) and then the tree payload; a non-top node's
// payload starts right after the object type byte. The payload begins
// with the node level byte.
const NODE_CAT: usize = 1;
const NODE_OBJ_TYPE: usize = 2;
const NON_TOP_PAYLOAD: usize = 3;
const TOP_UNIQUE_ID: usize = 3;
const TOP_PARENT_INDEX: usize = 11;
const TOP_PARENT_UNIQUE: usize = 19;
const TOP_CREATE_FT: usize = 27;
const TOP_MODIFY_FT: usize = 35;
const TOP_META_LEN: usize = 43;
const TOP_META: usize = 44;

/// Category of a node block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum NodeCat {
    /// Root block of an object; carries the full object header.
    Top,

    /// Interior or leaf node of an object's tree.
    NonTop,
}

impl NodeCat {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Top),
            2 => Some(Self::NonTop),
            _ => None,
        }
    }

    fn as_raw(self) -> u8 {
        match self {
            Self::Top => 1,
            Self::NonTop => 2,
        }
    }
}

fn assert_kind(bytes: &[u8], kind: BlockKind) {
    let raw = bytes[0];
    assert!(
        BlockKind::from_raw(raw) == Some(kind),
        "expected block kind {kind:?}, found tag {raw}"
    );
}

/// Offset of the tree payload (the level byte) within a node block.
fn node_payload_offset(bytes: &[u8]) -> usize {
    assert_kind(bytes, BlockKind::Node);
    let cat = NodeCat::from_raw(bytes[NODE_CAT]).expect("invalid node cat");
    match cat {
        NodeCat::NonTop => NON_TOP_PAYLOAD,
        NodeCat::Top => {
            let meta_len = usize::from(bytes[TOP_META_LEN]);
            let counter_size = match ObjType::from_raw(bytes[NODE_OBJ_TYPE])
                .expect("invalid object type")
            {
                ObjType::Dir => 4,
                ObjType::File => 8,
            };
            TOP_META + meta_len + counter_size
        }
    }
}

// -------------------------------------------------------------------
// Master block
// -------------------------------------------------------------------

/// View of the master block (block index 1).
pub(crate) struct MasterView<B>(B);

impl<B: AsRef<[u8]>> MasterView<B> {
    pub(crate) fn new(bytes: B) -> Self {
        assert_kind(bytes.as_ref(), BlockKind::Master);
        Self(bytes)
    }

    pub(crate) fn fs_version(&self) -> u32 {
        read_u32le(self.0.as_ref(), MASTER_FS_VERSION)
    }

    pub(crate) fn next_unique_id(&self) -> u64 {
        read_u64le(self.0.as_ref(), MASTER_NEXT_UNIQUE_ID)
    }

    pub(crate) fn root_dir_top_node_index(&self) -> u64 {
        read_u64le(self.0.as_ref(), MASTER_ROOT_DIR_TOP)
    }

    pub(crate) fn free_list_tail_index(&self) -> u64 {
        read_u64le(self.0.as_ref(), MASTER_FREE_LIST_TAIL)
    }

    pub(crate) fn nr_full_free_list_nodes(&self) -> u64 {
        read_u64le(self.0.as_ref(), MASTER_NR_FULL_FREE_LIST)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> MasterView<B> {
    pub(crate) fn set_fs_version(&mut self, val: u32) {
        write_u32le(self.0.as_mut(), MASTER_FS_VERSION, val);
    }

    pub(crate) fn set_next_unique_id(&mut self, val: u64) {
        write_u64le(self.0.as_mut(), MASTER_NEXT_UNIQUE_ID, val);
    }

    pub(crate) fn set_root_dir_top_node_index(&mut self, val: u64) {
        write_u64le(self.0.as_mut(), MASTER_ROOT_DIR_TOP, val);
    }

    pub(crate) fn set_free_list_tail_index(&mut self, val: u64) {
        write_u64le(self.0.as_mut(), MASTER_FREE_LIST_TAIL, val);
    }

    pub(crate) fn set_nr_full_free_list_nodes(&mut self, val: u64) {
        write_u64le(self.0.as_mut(), MASTER_NR_FULL_FREE_LIST, val);
    }
}

// -------------------------------------------------------------------
// Free-list block
// -------------------------------------------------------------------

/// View of one block in the free-list chain.
pub(crate) struct FreeListView<B>(B);

impl FreeListView<()> {
    /// Number of free block indices one free-list block can record.
    pub(crate) fn max_indices(block_size: BlockSize) -> u32 {
        (block_size.to_u32() - FREE_LIST_INDICES as u32) / 8
    }
}

impl<B: AsRef<[u8]>> FreeListView<B> {
    pub(crate) fn new(bytes: B) -> Self {
        assert_kind(bytes.as_ref(), BlockKind::FreeList);
        Self(bytes)
    }

    pub(crate) fn prev_free_list_index(&self) -> u64 {
        read_u64le(self.0.as_ref(), FREE_LIST_PREV)
    }

    pub(crate) fn nr_indices(&self) -> u32 {
        read_u32le(self.0.as_ref(), FREE_LIST_NR_INDICES)
    }

    pub(crate) fn free_block_index(&self, i: u32) -> u64 {
        assert!(i < self.nr_indices());
        read_u64le(
            self.0.as_ref(),
            FREE_LIST_INDICES + usize_from_u32(i) * 8,
        )
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> FreeListView<B> {
    pub(crate) fn set_prev_free_list_index(&mut self, val: u64) {
        write_u64le(self.0.as_mut(), FREE_LIST_PREV, val);
    }

    pub(crate) fn set_nr_indices(&mut self, val: u32) {
        write_u32le(self.0.as_mut(), FREE_LIST_NR_INDICES, val);
    }

    pub(crate) fn set_free_block_index(&mut self, i: u32, val: u64) {
        write_u64le(
            self.0.as_mut(),
            FREE_LIST_INDICES + usize_from_u32(i) * 8,
            val,
        );
    }
}

// -------------------------------------------------------------------
// Node blocks
// -------------------------------------------------------------------

/// View of the fields common to every node block.
pub(crate) struct NodeView<B>(B);

impl<B: AsRef<[u8]>> NodeView<B> {
    pub(crate) fn new(bytes: B) -> Self {
        assert_kind(bytes.as_ref(), BlockKind::Node);
        Self(bytes)
    }

    pub(crate) fn cat(&self) -> NodeCat {
        NodeCat::from_raw(self.0.as_ref()[NODE_CAT]).expect("invalid node cat")
    }

    pub(crate) fn obj_type(&self) -> ObjType {
        ObjType::from_raw(self.0.as_ref()[NODE_OBJ_TYPE])
            .expect("invalid object type")
    }

    pub(crate) fn level(&self) -> u8 {
        let bytes = self.0.as_ref();
        bytes[node_payload_offset(bytes)]
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> NodeView<B> {
    pub(crate) fn set_cat(&mut self, cat: NodeCat) {
        self.0.as_mut()[NODE_CAT] = cat.as_raw();
    }

    pub(crate) fn set_obj_type(&mut self, obj_type: ObjType) {
        self.0.as_mut()[NODE_OBJ_TYPE] = obj_type.as_raw();
    }

    pub(crate) fn set_level(&mut self, level: u8) {
        let bytes = self.0.as_mut();
        let offset = node_payload_offset(bytes);
        bytes[offset] = level;
    }
}

/// View of a top node's object header.
pub(crate) struct TopView<B>(B);

impl<B: AsRef<[u8]>> TopView<B> {
    pub(crate) fn new(bytes: B) -> Self {
        assert_kind(bytes.as_ref(), BlockKind::Node);
        let cat = NodeCat::from_raw(bytes.as_ref()[NODE_CAT]);
        assert!(cat == Some(NodeCat::Top), "node is not a top node");
        Self(bytes)
    }

    fn obj_type(&self) -> ObjType {
        ObjType::from_raw(self.0.as_ref()[NODE_OBJ_TYPE])
            .expect("invalid object type")
    }

    pub(crate) fn unique_id(&self) -> u64 {
        read_u64le(self.0.as_ref(), TOP_UNIQUE_ID)
    }

    pub(crate) fn parent_id(&self) -> ObjId {
        ObjId {
            index: read_u64le(self.0.as_ref(), TOP_PARENT_INDEX),
            unique_id: read_u64le(self.0.as_ref(), TOP_PARENT_UNIQUE),
        }
    }

    pub(crate) fn create_time(&self) -> u64 {
        read_u64le(self.0.as_ref(), TOP_CREATE_FT)
    }

    pub(crate) fn modify_time(&self) -> u64 {
        read_u64le(self.0.as_ref(), TOP_MODIFY_FT)
    }

    pub(crate) fn meta_len(&self) -> usize {
        usize::from(self.0.as_ref()[TOP_META_LEN])
    }

    pub(crate) fn meta(&self) -> &[u8] {
        &self.0.as_ref()[TOP_META..TOP_META + self.meta_len()]
    }

    pub(crate) fn dir_nr_entries(&self) -> u32 {
        assert!(self.obj_type().is_dir());
        read_u32le(self.0.as_ref(), TOP_META + self.meta_len())
    }

    pub(crate) fn file_size_bytes(&self) -> u64 {
        assert!(self.obj_type().is_file());
        read_u64le(self.0.as_ref(), TOP_META + self.meta_len())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> TopView<B> {
    pub(crate) fn set_unique_id(&mut self, val: u64) {
        write_u64le(self.0.as_mut(), TOP_UNIQUE_ID, val);
    }

    pub(crate) fn set_parent_id(&mut self, val: ObjId) {
        write_u64le(self.0.as_mut(), TOP_PARENT_INDEX, val.index);
        write_u64le(self.0.as_mut(), TOP_PARENT_UNIQUE, val.unique_id);
    }

    pub(crate) fn set_create_time(&mut self, val: u64) {
        write_u64le(self.0.as_mut(), TOP_CREATE_FT, val);
    }

    pub(crate) fn set_modify_time(&mut self, val: u64) {
        write_u64le(self.0.as_mut(), TOP_MODIFY_FT, val);
    }

    /// Write the metadata length and bytes.
    ///
    /// The payload offset depends on the metadata length, so this must
    /// be written before the type counter and tree payload, and the
    /// length may never change afterwards.
    pub(crate) fn set_meta(&mut self, meta: &[u8]) {
        let len = u8::try_from(meta.len()).expect("metadata too long");
        let bytes = self.0.as_mut();
        bytes[TOP_META_LEN] = len;
        bytes[TOP_META..TOP_META + meta.len()].copy_from_slice(meta);
    }

    pub(crate) fn set_dir_nr_entries(&mut self, val: u32) {
        assert!(self.obj_type().is_dir());
        let offset = TOP_META + self.meta_len();
        write_u32le(self.0.as_mut(), offset, val);
    }

    pub(crate) fn set_file_size_bytes(&mut self, val: u64) {
        assert!(self.obj_type().is_file());
        let offset = TOP_META + self.meta_len();
        write_u64le(self.0.as_mut(), offset, val);
    }
}

// -------------------------------------------------------------------
// Directory tree payload
// -------------------------------------------------------------------

/// One directory leaf entry: `(id, type, name)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct DirLeafEntry {
    pub(crate) id: ObjId,
    pub(crate) obj_type: ObjType,
    pub(crate) name: Vec<u8>,
}

impl DirLeafEntry {
    /// Encoded size of an entry with an empty name.
    pub(crate) const OVERHEAD: u32 = 8 + 8 + 1 + 2;

    pub(crate) fn encoded_size(&self) -> u32 {
        Self::OVERHEAD + u32::try_from(self.name.len()).unwrap()
    }
}

/// One directory branch entry: `(child_block, first name in subtree)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct DirBranchEntry {
    pub(crate) block_index: u64,
    pub(crate) name: Vec<u8>,
}

impl DirBranchEntry {
    pub(crate) const OVERHEAD: u32 = 8 + 2;

    pub(crate) fn encoded_size(&self) -> u32 {
        Self::OVERHEAD + u32::try_from(self.name.len()).unwrap()
    }
}

/// Entry area of a directory node: `nr_entries: u32` directly after
/// the level byte, then the packed entries. Leaf and branch nodes
/// share the fixed-field shape and differ only in entry encoding.
pub(crate) struct DirNodeView<B>(B);

impl<B: AsRef<[u8]>> DirNodeView<B> {
    pub(crate) fn new(bytes: B) -> Self {
        let b = bytes.as_ref();
        assert_kind(b, BlockKind::Node);
        assert!(
            ObjType::from_raw(b[NODE_OBJ_TYPE]) == Some(ObjType::Dir),
            "node is not a directory node"
        );
        Self(bytes)
    }

    fn nr_entries_offset(&self) -> usize {
        node_payload_offset(self.0.as_ref()) + 1
    }

    /// Offset of the packed entry area.
    pub(crate) fn entries_offset(&self) -> usize {
        self.nr_entries_offset() + 4
    }

    pub(crate) fn nr_entries(&self) -> u32 {
        read_u32le(self.0.as_ref(), self.nr_entries_offset())
    }

    pub(crate) fn decode_leaf_entries(&self) -> Vec<DirLeafEntry> {
        let bytes = self.0.as_ref();
        let nr = self.nr_entries();
        let mut entries = Vec::with_capacity(usize_from_u32(nr));
        let mut pos = self.entries_offset();
        for _ in 0..nr {
            let id = ObjId {
                index: read_u64le(bytes, pos),
                unique_id: read_u64le(bytes, pos + 8),
            };
            let obj_type = ObjType::from_raw(bytes[pos + 16])
                .expect("invalid entry object type");
            let name_len = usize::from(read_u16le(bytes, pos + 17));
            pos += 19;
            let name = bytes[pos..pos + name_len].to_vec();
            pos += name_len;
            entries.push(DirLeafEntry { id, obj_type, name });
        }
        entries
    }

    pub(crate) fn decode_branch_entries(&self) -> Vec<DirBranchEntry> {
        let bytes = self.0.as_ref();
        let nr = self.nr_entries();
        let mut entries = Vec::with_capacity(usize_from_u32(nr));
        let mut pos = self.entries_offset();
        for _ in 0..nr {
            let block_index = read_u64le(bytes, pos);
            let name_len = usize::from(read_u16le(bytes, pos + 8));
            pos += 10;
            let name = bytes[pos..pos + name_len].to_vec();
            pos += name_len;
            entries.push(DirBranchEntry { block_index, name });
        }
        entries
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> DirNodeView<B> {
    pub(crate) fn encode_leaf_entries(&mut self, entries: &[DirLeafEntry]) {
        let nr_offset = self.nr_entries_offset();
        let mut pos = self.entries_offset();
        let bytes = self.0.as_mut();
        write_u32le(bytes, nr_offset, u32::try_from(entries.len()).unwrap());
        for entry in entries {
            assert!(pos + 19 + entry.name.len() <= bytes.len());
            write_u64le(bytes, pos, entry.id.index);
            write_u64le(bytes, pos + 8, entry.id.unique_id);
            bytes[pos + 16] = entry.obj_type.as_raw();
            write_u16le(bytes, pos + 17, u16::try_from(entry.name.len()).unwrap());
            pos += 19;
            bytes[pos..pos + entry.name.len()].copy_from_slice(&entry.name);
            pos += entry.name.len();
        }
    }

    pub(crate) fn encode_branch_entries(&mut self, entries: &[DirBranchEntry]) {
        let nr_offset = self.nr_entries_offset();
        let mut pos = self.entries_offset();
        let bytes = self.0.as_mut();
        write_u32le(bytes, nr_offset, u32::try_from(entries.len()).unwrap());
        for entry in entries {
            assert!(pos + 10 + entry.name.len() <= bytes.len());
            write_u64le(bytes, pos, entry.block_index);
            write_u16le(bytes, pos + 8, u16::try_from(entry.name.len()).unwrap());
            pos += 10;
            bytes[pos..pos + entry.name.len()].copy_from_slice(&entry.name);
            pos += entry.name.len();
        }
    }
}

// -------------------------------------------------------------------
// File tree payload
// -------------------------------------------------------------------

/// One file leaf entry: the index of a data block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct FileLeafEntry {
    pub(crate) block_index: u64,
}

impl FileLeafEntry {
    pub(crate) const ENCODED_SIZE: u32 = 8;
}

/// One file branch entry: `(first offset in subtree, child block)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct FileBranchEntry {
    pub(crate) file_offset: u64,
    pub(crate) block_index: u64,
}

impl FileBranchEntry {
    pub(crate) const ENCODED_SIZE: u32 = 16;
}

/// Entry area of a file node. A leaf carries `nr_entries: u32` and
/// `file_offset: u64` (the file offset its first data block covers)
/// before the entries; a branch carries only `nr_entries: u32`; a
/// mini top node stores file content directly after the level byte.
pub(crate) struct FileNodeView<B>(B);

impl<B: AsRef<[u8]>> FileNodeView<B> {
    pub(crate) fn new(bytes: B) -> Self {
        let b = bytes.as_ref();
        assert_kind(b, BlockKind::Node);
        assert!(
            ObjType::from_raw(b[NODE_OBJ_TYPE]) == Some(ObjType::File),
            "node is not a file node"
        );
        Self(bytes)
    }

    fn payload_offset(&self) -> usize {
        node_payload_offset(self.0.as_ref())
    }

    fn nr_entries_offset(&self) -> usize {
        self.payload_offset() + 1
    }

    /// Offset of the entry area of a leaf node.
    pub(crate) fn leaf_entries_offset(&self) -> usize {
        self.nr_entries_offset() + 4 + 8
    }

    /// Offset of the entry area of a branch node.
    pub(crate) fn branch_entries_offset(&self) -> usize {
        self.nr_entries_offset() + 4
    }

    /// Offset of the inline content of a mini top node.
    pub(crate) fn mini_offset(&self) -> usize {
        self.payload_offset() + 1
    }

    /// Capacity in bytes of the inline content area.
    pub(crate) fn mini_capacity(&self) -> u32 {
        u32::try_from(self.0.as_ref().len() - self.mini_offset()).unwrap()
    }

    pub(crate) fn is_mini(&self) -> bool {
        let bytes = self.0.as_ref();
        bytes[self.payload_offset()] == NODE_LEVEL_BEYOND_MAX
    }

    pub(crate) fn mini_content(&self) -> &[u8] {
        assert!(self.is_mini());
        &self.0.as_ref()[self.mini_offset()..]
    }

    pub(crate) fn nr_entries(&self) -> u32 {
        read_u32le(self.0.as_ref(), self.nr_entries_offset())
    }

    /// File offset covered by a leaf node's first data block.
    pub(crate) fn leaf_file_offset(&self) -> u64 {
        read_u64le(self.0.as_ref(), self.nr_entries_offset() + 4)
    }

    pub(crate) fn decode_leaf_entries(&self) -> Vec<FileLeafEntry> {
        let bytes = self.0.as_ref();
        let nr = self.nr_entries();
        let mut entries = Vec::with_capacity(usize_from_u32(nr));
        let mut pos = self.leaf_entries_offset();
        for _ in 0..nr {
            entries.push(FileLeafEntry {
                block_index: read_u64le(bytes, pos),
            });
            pos += 8;
        }
        entries
    }

    pub(crate) fn decode_branch_entries(&self) -> Vec<FileBranchEntry> {
        let bytes = self.0.as_ref();
        let nr = self.nr_entries();
        let mut entries = Vec::with_capacity(usize_from_u32(nr));
        let mut pos = self.branch_entries_offset();
        for _ in 0..nr {
            entries.push(FileBranchEntry {
                file_offset: read_u64le(bytes, pos),
                block_index: read_u64le(bytes, pos + 8),
            });
            pos += 16;
        }
        entries
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> FileNodeView<B> {
    pub(crate) fn mini_content_mut(&mut self) -> &mut [u8] {
        assert!(self.is_mini());
        let offset = self.mini_offset();
        &mut self.0.as_mut()[offset..]
    }

    pub(crate) fn set_leaf_file_offset(&mut self, val: u64) {
        let offset = self.nr_entries_offset() + 4;
        write_u64le(self.0.as_mut(), offset, val);
    }

    pub(crate) fn encode_leaf_entries(&mut self, entries: &[FileLeafEntry]) {
        let nr_offset = self.nr_entries_offset();
        let mut pos = self.leaf_entries_offset();
        let bytes = self.0.as_mut();
        write_u32le(bytes, nr_offset, u32::try_from(entries.len()).unwrap());
        assert!(pos + entries.len() * 8 <= bytes.len());
        for entry in entries {
            write_u64le(bytes, pos, entry.block_index);
            pos += 8;
        }
    }

    pub(crate) fn encode_branch_entries(&mut self, entries: &[FileBranchEntry]) {
        let nr_offset = self.nr_entries_offset();
        let mut pos = self.branch_entries_offset();
        let bytes = self.0.as_mut();
        write_u32le(bytes, nr_offset, u32::try_from(entries.len()).unwrap());
        assert!(pos + entries.len() * 16 <= bytes.len());
        for entry in entries {
            write_u64le(bytes, pos, entry.file_offset);
            write_u64le(bytes, pos + 8, entry.block_index);
            pos += 16;
        }
    }
}
