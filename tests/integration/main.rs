// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

mod crash;
mod dir;
mod file;
mod fs;

use atomicfs::{
    Afs, AfsError, AfsStorage, AfsTime, Block, BlockSize, DirEntry,
    MemStorage, ObjId,
};
use std::cell::RefCell;
use std::rc::Rc;

fn bs512() -> BlockSize {
    BlockSize::new(512).unwrap()
}

fn t0() -> AfsTime {
    AfsTime::from_unix_seconds(1_700_000_000)
}

fn t1() -> AfsTime {
    AfsTime::from_unix_seconds(1_700_000_060)
}

/// A `MemStorage` behind an `Rc` so tests can hand the storage to
/// `Afs` and still inspect it, or reopen the same bytes later.
#[derive(Clone)]
struct SharedStorage(Rc<RefCell<MemStorage>>);

impl SharedStorage {
    fn new(max_blocks: u64) -> Self {
        Self(Rc::new(RefCell::new(MemStorage::new(bs512(), max_blocks))))
    }
}

impl AfsStorage for SharedStorage {
    fn block_size(&self) -> BlockSize {
        self.0.borrow().block_size()
    }

    fn max_blocks(&self) -> u64 {
        self.0.borrow().max_blocks()
    }

    fn nr_blocks(&self) -> u64 {
        self.0.borrow().nr_blocks()
    }

    fn add_new_block(&mut self) -> Result<Block, AfsError> {
        self.0.borrow_mut().add_new_block()
    }

    fn obtain_block(&mut self, block_index: u64) -> Result<Block, AfsError> {
        self.0.borrow_mut().obtain_block(block_index)
    }

    fn begin_journaled_write(&mut self) {
        self.0.borrow_mut().begin_journaled_write();
    }

    fn abort_journaled_write(&mut self) {
        self.0.borrow_mut().abort_journaled_write();
    }

    fn complete_journaled_write(
        &mut self,
        changed: &[Block],
    ) -> Result<(), AfsError> {
        self.0.borrow_mut().complete_journaled_write(changed)
    }
}

/// Fresh filesystem over an unbounded in-memory storage.
fn new_fs() -> Afs {
    Afs::init(
        Box::new(MemStorage::new(bs512(), u64::MAX)),
        b"root",
        t0(),
    )
    .unwrap()
}

/// Fresh filesystem whose storage the test can also reach directly.
fn new_fs_shared(max_blocks: u64) -> (Afs, SharedStorage) {
    let shared = SharedStorage::new(max_blocks);
    let fs = Afs::init(Box::new(shared.clone()), b"root", t0()).unwrap();
    (fs, shared)
}

/// Read a whole directory through the batched iteration interface.
fn read_dir_all(fs: &Afs, dir: ObjId) -> Vec<DirEntry> {
    let mut all = Vec::new();
    let mut last_name: Vec<u8> = Vec::new();
    loop {
        let mut batch = Vec::new();
        let reached_end = fs.read_dir(dir, &last_name, &mut batch).unwrap();
        if let Some(entry) = batch.last() {
            last_name = entry.name().to_vec();
        }
        all.extend(batch);
        if reached_end {
            return all;
        }
    }
}
