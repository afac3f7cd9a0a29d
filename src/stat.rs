// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::obj_id::{ObjId, ObjType};
use crate::time::AfsTime;
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// Selects which fields [`Afs::set_stat`] applies from the
    /// supplied [`StatInfo`].
    ///
    /// [`Afs::set_stat`]: crate::Afs::set_stat
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct StatFields: u32 {
        const CREATE_TIME = 0x1;
        const MODIFY_TIME = 0x2;
        const META_DATA = 0x4;
    }
}

/// Type-specific part of an object's status.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatKind {
    Dir {
        /// Number of entries in the directory.
        nr_entries: u32,
    },
    File {
        /// File content length in bytes.
        size_bytes: u64,
    },
}

/// Status of a directory or file, as stored in its top node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatInfo {
    pub id: ObjId,
    pub parent_id: ObjId,
    pub kind: StatKind,
    pub create_time: AfsTime,
    pub modify_time: AfsTime,
    pub meta: Vec<u8>,
}

impl StatInfo {
    pub fn obj_type(&self) -> ObjType {
        match self.kind {
            StatKind::Dir { .. } => ObjType::Dir,
            StatKind::File { .. } => ObjType::File,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.obj_type().is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.obj_type().is_file()
    }

    /// File size in bytes, or `None` for a directory.
    pub fn file_size(&self) -> Option<u64> {
        match self.kind {
            StatKind::File { size_bytes } => Some(size_bytes),
            StatKind::Dir { .. } => None,
        }
    }

    /// Number of directory entries, or `None` for a file.
    pub fn dir_nr_entries(&self) -> Option<u32> {
        match self.kind {
            StatKind::Dir { nr_entries } => Some(nr_entries),
            StatKind::File { .. } => None,
        }
    }
}
