// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::{bs512, new_fs, new_fs_shared, read_dir_all, t0, t1, SharedStorage};
use atomicfs::{
    Afs, AfsError, AfsStorage, MemStorage, ObjId, StatFields, StatKind,
};

#[test]
fn test_reopen_preserves_tree() -> anyhow::Result<()> {
    let (mut fs, shared) = new_fs_shared(u64::MAX);

    let d = fs.dir_create(ObjId::ROOT, b"docs", b"dir-meta", t0())?;
    let f = fs.file_create(d, b"readme", b"file-meta", t0())?;
    fs.file_write(f, 0, b"remember me", t0())?;
    for i in 0..50 {
        let name = format!("extra{i:02}").into_bytes();
        fs.dir_create(ObjId::ROOT, &name, b"", t0())?;
    }
    drop(fs);

    // Reopen over the same committed bytes.
    let fs = Afs::init(Box::new(shared.clone()), b"root", t1())?;
    let d_entry = fs.find(ObjId::ROOT, b"docs")?;
    assert_eq!(d_entry.id(), d);
    let f_entry = fs.find(d, b"readme")?;
    assert_eq!(f_entry.id(), f);
    assert_eq!(fs.file_read_all(f)?, b"remember me");
    assert_eq!(fs.stat(d)?.meta, b"dir-meta");
    assert_eq!(read_dir_all(&fs, ObjId::ROOT).len(), 51);
    fs.verify_free_list();

    // Reopen does not rewrite anything.
    assert_eq!(fs.stat(ObjId::ROOT)?.create_time, t0());
    Ok(())
}

#[test]
fn test_reopen_rejects_unknown_version() {
    let (fs, shared) = new_fs_shared(u64::MAX);
    drop(fs);

    // Bump the version field in the master block (block 1, after the
    // kind byte).
    let mut image = shared.0.borrow().to_image();
    image[512 + 1] = 0xfe;
    let storage = MemStorage::from_image(bs512(), u64::MAX, &image);

    assert_eq!(
        Afs::init(Box::new(storage), b"root", t1()).unwrap_err(),
        AfsError::UnsupportedFsVersion
    );
}

#[test]
fn test_set_stat() {
    let mut fs = new_fs();
    let f = fs.file_create(ObjId::ROOT, b"f", b"12345678", t0()).unwrap();

    let mut info = fs.stat(f).unwrap();
    assert_eq!(info.meta, b"12345678");
    assert_eq!(info.create_time, t0());

    // Same-length metadata and times can be rewritten.
    info.meta = b"abcdefgh".to_vec();
    info.modify_time = t1();
    fs.set_stat(
        f,
        &info,
        StatFields::META_DATA | StatFields::MODIFY_TIME,
    )
    .unwrap();

    let after = fs.stat(f).unwrap();
    assert_eq!(after.meta, b"abcdefgh");
    assert_eq!(after.modify_time, t1());
    assert_eq!(after.create_time, t0());

    // Metadata may not change length: the tree payload sits right
    // after it in the top node.
    info.meta = b"short".to_vec();
    assert_eq!(
        fs.set_stat(f, &info, StatFields::META_DATA).unwrap_err(),
        AfsError::MetaDataCannotChangeLen
    );

    // Unselected fields are untouched even if set in the info.
    info.meta = b"hgfedcba".to_vec();
    info.create_time = t1();
    fs.set_stat(f, &info, StatFields::CREATE_TIME).unwrap();
    let after = fs.stat(f).unwrap();
    assert_eq!(after.create_time, t1());
    assert_eq!(after.meta, b"abcdefgh");
}

#[test]
fn test_modify_times_update() {
    let mut fs = new_fs();
    let d = fs.dir_create(ObjId::ROOT, b"d", b"", t0()).unwrap();
    assert_eq!(fs.stat(ObjId::ROOT).unwrap().modify_time, t0());

    fs.dir_create(d, b"x", b"", t1()).unwrap();
    assert_eq!(fs.stat(d).unwrap().modify_time, t1());

    let f = fs.file_create(d, b"f", b"", t1()).unwrap();
    fs.file_write(f, 0, b"data", t1()).unwrap();
    let info = fs.stat(f).unwrap();
    assert_eq!(info.create_time, t1());
    assert_eq!(info.modify_time, t1());
}

#[test]
fn test_free_space_accounting() {
    let (mut fs, shared) = new_fs_shared(10_000);
    assert_eq!(fs.free_space_blocks(), 10_000 - 3);

    // Unbounded storage reports unbounded free space.
    let unbounded = new_fs().free_space_blocks();
    assert_eq!(unbounded, u64::MAX);

    // Allocate a few hundred objects, then delete them all; free
    // space must return at least to the unallocated amount.
    let mut names = Vec::new();
    for i in 0..200 {
        let name = format!("d{i:03}").into_bytes();
        fs.dir_create(ObjId::ROOT, &name, b"", t0()).unwrap();
        names.push(name);
    }
    let nr_blocks = shared.0.borrow().nr_blocks();
    assert_eq!(
        fs.free_space_blocks(),
        10_000 - nr_blocks,
        "no free list content while everything is live"
    );

    for name in &names {
        fs.obj_delete(ObjId::ROOT, name, t1()).unwrap();
    }
    // Storage did not shrink, but everything freed is reusable again.
    assert_eq!(shared.0.borrow().nr_blocks(), nr_blocks);
    assert!(fs.free_space_blocks() >= 10_000 - 3);
    fs.verify_free_list();
}

#[test]
fn test_free_list_chains_across_blocks() {
    // Free more blocks than one free-list block can record (62 at a
    // 512-byte block size) so the chain grows and shrinks.
    let (mut fs, _shared) = new_fs_shared(u64::MAX);
    let f = fs.file_create(ObjId::ROOT, b"big", b"", t0()).unwrap();
    fs.file_set_size(f, 200 * 512, t0()).unwrap();
    fs.file_set_size(f, 0, t1()).unwrap();
    fs.verify_free_list();

    // Reuse everything; the chain drains again.
    fs.file_set_size(f, 200 * 512, t1()).unwrap();
    fs.verify_free_list();

    let info = fs.stat(f).unwrap();
    assert_eq!(info.kind, StatKind::File { size_bytes: 200 * 512 });
}

#[test]
fn test_many_objects_reopen_consistency() -> anyhow::Result<()> {
    let (mut fs, shared) = new_fs_shared(u64::MAX);

    // A wider tree: directories with files, some content.
    for i in 0..20 {
        let dname = format!("dir{i:02}").into_bytes();
        let d = fs.dir_create(ObjId::ROOT, &dname, b"", t0())?;
        for j in 0..10 {
            let fname = format!("file{j}").into_bytes();
            let f = fs.file_create(d, &fname, b"", t0())?;
            let content = format!("content-{i}-{j}").into_bytes();
            fs.file_write(f, 0, &content, t0())?;
        }
    }
    drop(fs);

    let fs = Afs::init(Box::new(shared.clone()), b"root", t1())?;
    for i in 0..20 {
        let dname = format!("dir{i:02}").into_bytes();
        let d = fs.find(ObjId::ROOT, &dname)?;
        assert_eq!(fs.stat(d.id())?.dir_nr_entries(), Some(10));
        assert_eq!(fs.stat(d.id())?.parent_id, ObjId::ROOT);
        for j in 0..10 {
            let fname = format!("file{j}").into_bytes();
            let f = fs.find(d.id(), &fname)?;
            assert_eq!(fs.stat(f.id())?.parent_id, d.id());
            let expected = format!("content-{i}-{j}").into_bytes();
            assert_eq!(fs.file_read_all(f.id())?, expected);
        }
    }
    Ok(())
}

#[test]
fn test_storage_survives_failed_ops() {
    let (mut fs, _shared) = new_fs_shared(u64::MAX);
    fs.dir_create(ObjId::ROOT, b"keep", b"", t0()).unwrap();

    // A run of failing operations must leave no trace.
    assert!(fs.dir_create(ObjId::ROOT, b"keep", b"", t1()).is_err());
    assert!(fs.obj_delete(ObjId::ROOT, b"nope", t1()).is_err());
    assert!(
        fs.obj_move(ObjId::ROOT, b"nope", ObjId::ROOT, b"x", t1())
            .is_err()
    );

    let entries = read_dir_all(&fs, ObjId::ROOT);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name(), b"keep");
    assert_eq!(fs.stat(ObjId::ROOT).unwrap().modify_time, t0());
    fs.verify_free_list();
}

#[test]
fn test_shared_storage_wrapper_delegates() {
    // Sanity-check the test fixture itself.
    let shared = SharedStorage::new(42);
    assert_eq!(shared.max_blocks(), 42);
    assert_eq!(shared.nr_blocks(), 0);
    assert_eq!(shared.block_size(), bs512());
}
