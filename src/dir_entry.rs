// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::obj_id::{ObjId, ObjType};
use crate::util::format_bytes_debug;
use alloc::vec::Vec;
use core::fmt::{self, Debug, Formatter};

/// One entry of a directory: a name bound to an object.
#[derive(Clone, Eq, PartialEq)]
pub struct DirEntry {
    id: ObjId,
    obj_type: ObjType,
    name: Vec<u8>,
}

impl DirEntry {
    pub(crate) fn new(id: ObjId, obj_type: ObjType, name: Vec<u8>) -> Self {
        Self { id, obj_type, name }
    }

    /// Identifier of the object the entry refers to.
    pub fn id(&self) -> ObjId {
        self.id
    }

    /// Whether the entry refers to a directory or a file.
    pub fn obj_type(&self) -> ObjType {
        self.obj_type
    }

    /// Entry name. Names are arbitrary bytes without `/`; they are
    /// not required to be UTF-8.
    pub fn name(&self) -> &[u8] {
        &self.name
    }
}

impl Debug for DirEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirEntry")
            .field("id", &self.id)
            .field("obj_type", &self.obj_type)
            .field("name", &DebugName(&self.name))
            .finish()
    }
}

struct DebugName<'a>(&'a [u8]);

impl Debug for DebugName<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        format_bytes_debug(self.0, f)
    }
}
