// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Crash-consistency: a journaled write is all-or-nothing. The
//! storage wrapper here drops a whole commit at a scheduled point, as
//! an atomic block device would after a crash, and the filesystem is
//! reopened over the surviving bytes.

use crate::{bs512, read_dir_all, t0, t1};
use atomicfs::{
    Afs, AfsError, AfsStorage, AfsTime, Block, MemStorage, ObjId,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Storage that fails scheduled `complete_journaled_write` calls by
/// dropping the whole write: nothing is applied and the caller sees a
/// storage error. Everything else delegates to a shared `MemStorage`.
#[derive(Clone)]
struct CrashStorage {
    inner: Rc<RefCell<MemStorage>>,
    /// Number of completes to let through before failing one. `None`
    /// means never fail.
    completes_until_crash: Rc<Cell<Option<u64>>>,
}

impl CrashStorage {
    fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(MemStorage::new(bs512(), u64::MAX))),
            completes_until_crash: Rc::new(Cell::new(None)),
        }
    }

    fn crash_after_completes(&self, n: u64) {
        self.completes_until_crash.set(Some(n));
    }
}

impl AfsStorage for CrashStorage {
    fn block_size(&self) -> atomicfs::BlockSize {
        self.inner.borrow().block_size()
    }

    fn max_blocks(&self) -> u64 {
        self.inner.borrow().max_blocks()
    }

    fn nr_blocks(&self) -> u64 {
        self.inner.borrow().nr_blocks()
    }

    fn add_new_block(&mut self) -> Result<Block, AfsError> {
        self.inner.borrow_mut().add_new_block()
    }

    fn obtain_block(&mut self, block_index: u64) -> Result<Block, AfsError> {
        self.inner.borrow_mut().obtain_block(block_index)
    }

    fn begin_journaled_write(&mut self) {
        self.inner.borrow_mut().begin_journaled_write();
    }

    fn abort_journaled_write(&mut self) {
        self.inner.borrow_mut().abort_journaled_write();
    }

    fn complete_journaled_write(
        &mut self,
        changed: &[Block],
    ) -> Result<(), AfsError> {
        match self.completes_until_crash.get() {
            Some(0) => {
                // The write is lost in its entirety; the core will
                // tell us to abort. Stay armed so later writes in the
                // same operation fail too.
                Err(AfsError::StorageInErrorState)
            }
            Some(n) => {
                self.completes_until_crash.set(Some(n - 1));
                self.inner.borrow_mut().complete_journaled_write(changed)
            }
            None => self.inner.borrow_mut().complete_journaled_write(changed),
        }
    }
}

fn build_fs(storage: &CrashStorage) -> Afs {
    let mut fs =
        Afs::init(Box::new(storage.clone()), b"root", t0()).unwrap();
    for i in 0..40 {
        let name = format!("d{i:02}").into_bytes();
        fs.dir_create(ObjId::ROOT, &name, b"", t0()).unwrap();
    }
    fs
}

fn reopen(storage: &CrashStorage, now: AfsTime) -> Afs {
    storage.completes_until_crash.set(None);
    Afs::init(Box::new(storage.clone()), b"root", now).unwrap()
}

#[test]
fn test_lost_commit_leaves_no_trace() {
    let storage = CrashStorage::new();
    let mut fs = build_fs(&storage);
    let entries_before = read_dir_all(&fs, ObjId::ROOT);

    storage.crash_after_completes(0);
    assert_eq!(
        fs.dir_create(ObjId::ROOT, b"newdir", b"", t1()).unwrap_err(),
        AfsError::StorageInErrorState
    );

    // The same handle rolled back its in-memory state and keeps
    // working once the storage recovers.
    storage.completes_until_crash.set(None);
    assert_eq!(read_dir_all(&fs, ObjId::ROOT), entries_before);
    fs.dir_create(ObjId::ROOT, b"newdir", b"", t1()).unwrap();
    assert!(fs.find(ObjId::ROOT, b"newdir").is_ok());
    fs.verify_free_list();
}

#[test]
fn test_lost_commit_invisible_after_reopen() {
    let storage = CrashStorage::new();
    let mut fs = build_fs(&storage);

    storage.crash_after_completes(0);
    assert!(fs.dir_create(ObjId::ROOT, b"victim", b"", t1()).is_err());
    drop(fs);

    // None of the lost write is visible on reopen.
    let fs = reopen(&storage, t1());
    assert_eq!(
        fs.find(ObjId::ROOT, b"victim").unwrap_err(),
        AfsError::NameNotInDir
    );
    assert_eq!(read_dir_all(&fs, ObjId::ROOT).len(), 40);
    assert_eq!(fs.stat(ObjId::ROOT).unwrap().dir_nr_entries(), Some(40));
    fs.verify_free_list();
}

#[test]
fn test_crash_between_resize_rounds() {
    let storage = CrashStorage::new();
    let mut fs =
        Afs::init(Box::new(storage.clone()), b"root", t0()).unwrap();
    let f = fs.file_create(ObjId::ROOT, b"big", b"", t0()).unwrap();

    // Growing to 200000 bytes takes several rounds of at most 64
    // blocks each; let two commit, then lose the third.
    storage.crash_after_completes(2);
    assert_eq!(
        fs.file_set_size(f, 200_000, t1()).unwrap_err(),
        AfsError::StorageInErrorState
    );
    drop(fs);

    // The committed rounds survive: exactly two rounds of 64 blocks.
    let fs = reopen(&storage, t1());
    assert_eq!(
        fs.stat(f).unwrap().file_size(),
        Some(2 * 64 * 512),
        "earlier rounds stay committed, the lost round does not"
    );
    let content = fs.file_read_all(f).unwrap();
    assert!(content.iter().all(|b| *b == 0));
    fs.verify_free_list();
}

#[test]
fn test_crash_during_delete_preserves_object() {
    let storage = CrashStorage::new();
    let mut fs =
        Afs::init(Box::new(storage.clone()), b"root", t0()).unwrap();
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();
    fs.file_write(f, 0, b"still here", t0()).unwrap();

    storage.crash_after_completes(0);
    assert!(fs.obj_delete(ObjId::ROOT, b"f", t1()).is_err());
    drop(fs);

    let fs = reopen(&storage, t1());
    assert_eq!(fs.find(ObjId::ROOT, b"f").unwrap().id(), f);
    assert_eq!(fs.file_read_all(f).unwrap(), b"still here");
    fs.verify_free_list();
}
