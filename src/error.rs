// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use core::error::Error;
use core::fmt::{self, Display, Formatter};

/// Common error type for all [`Afs`] operations.
///
/// These are the expected, caller-surfaced failures. An operation that
/// returns an error leaves the filesystem unchanged (the journaled
/// write for the failing round is rolled back). Structural invariant
/// violations are not represented here; they indicate storage
/// corruption or an implementation bug and cause a panic instead.
///
/// [`Afs`]: crate::Afs
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AfsError {
    /// The storage cannot be extended by another block.
    OutOfSpace,

    /// A block index is outside the storage's allocated range.
    BlockIndexInvalid,

    /// The storage has entered an error state and can no longer be
    /// read or written.
    StorageInErrorState,

    /// A block does not have the kind tag required by the operation.
    UnexpectedBlockKind,

    /// The master block's version field does not match the version
    /// implemented by this library.
    UnsupportedFsVersion,

    /// An object identifier could never have referred to a valid
    /// object (its block index was never allocated).
    InvalidObjId,

    /// The identified directory does not exist.
    DirNotFound,

    /// The identified object does not exist.
    ObjNotFound,

    /// An operation that requires a directory was attempted on an
    /// object that is not a directory.
    ObjNotDir,

    /// An operation that requires a file was attempted on an object
    /// that is not a file.
    ObjNotFile,

    /// A name exceeds the maximum length derived from the block size.
    NameTooLong,

    /// Metadata exceeds the maximum length derived from the block size.
    MetaDataTooLong,

    /// Metadata can only be rewritten at its original length.
    MetaDataCannotChangeLen,

    /// A name is empty or contains a path separator.
    NameInvalid,

    /// The named entry does not exist in the parent directory.
    NameNotInDir,

    /// The name already exists in the destination directory.
    NameExists,

    /// An absolute path is empty, is not absolute, or contains an
    /// empty component.
    InvalidPathSyntax,

    /// The move destination is the moved object itself or one of its
    /// descendants.
    MoveDestInvalid,

    /// A directory must be empty before it can be deleted.
    DirNotEmpty,

    /// A file must have no data blocks before it can be deleted.
    FileNotEmpty,

    /// A file offset is past the end of the file.
    InvalidOffset,
}

impl Display for AfsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfSpace => write!(f, "storage is out of space"),
            Self::BlockIndexInvalid => write!(f, "block index is invalid"),
            Self::StorageInErrorState => {
                write!(f, "storage is in an error state")
            }
            Self::UnexpectedBlockKind => {
                write!(f, "block does not have the expected kind")
            }
            Self::UnsupportedFsVersion => {
                write!(f, "filesystem version is not supported")
            }
            Self::InvalidObjId => write!(f, "object id is invalid"),
            Self::DirNotFound => write!(f, "directory not found"),
            Self::ObjNotFound => write!(f, "object not found"),
            Self::ObjNotDir => write!(f, "object is not a directory"),
            Self::ObjNotFile => write!(f, "object is not a file"),
            Self::NameTooLong => write!(f, "name is too long"),
            Self::MetaDataTooLong => write!(f, "metadata is too long"),
            Self::MetaDataCannotChangeLen => {
                write!(f, "metadata cannot change length")
            }
            Self::NameInvalid => write!(f, "name is invalid"),
            Self::NameNotInDir => write!(f, "name is not in the directory"),
            Self::NameExists => write!(f, "name already exists"),
            Self::InvalidPathSyntax => write!(f, "path syntax is invalid"),
            Self::MoveDestInvalid => {
                write!(f, "move destination is invalid")
            }
            Self::DirNotEmpty => write!(f, "directory is not empty"),
            Self::FileNotEmpty => write!(f, "file is not empty"),
            Self::InvalidOffset => write!(f, "offset is past the end of file"),
        }
    }
}

impl Error for AfsError {}

#[cfg(feature = "std")]
impl From<AfsError> for std::io::Error {
    fn from(e: AfsError) -> Self {
        use std::io::ErrorKind::*;

        match e {
            AfsError::InvalidObjId
            | AfsError::NameTooLong
            | AfsError::MetaDataTooLong
            | AfsError::MetaDataCannotChangeLen
            | AfsError::NameInvalid
            | AfsError::InvalidPathSyntax
            | AfsError::ObjNotDir
            | AfsError::ObjNotFile
            | AfsError::MoveDestInvalid => InvalidInput.into(),
            AfsError::DirNotFound
            | AfsError::ObjNotFound
            | AfsError::NameNotInDir => NotFound.into(),
            AfsError::NameExists => AlreadyExists.into(),
            AfsError::OutOfSpace
            | AfsError::BlockIndexInvalid
            | AfsError::StorageInErrorState
            | AfsError::UnexpectedBlockKind
            | AfsError::UnsupportedFsVersion
            | AfsError::DirNotEmpty
            | AfsError::FileNotEmpty
            | AfsError::InvalidOffset => Self::other(e),
        }
    }
}
