// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::{new_fs, new_fs_shared, t0, t1};
use atomicfs::{AfsError, AfsStorage, ObjId};

/// Deterministic non-trivial content for read-back checks.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

#[test]
fn test_mini_file_round_trip() {
    let (mut fs, shared) = new_fs_shared(u64::MAX);
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();
    let blocks_after_create = shared.0.borrow().nr_blocks();

    // With 512-byte blocks a file top node holds 459 inline bytes:
    // block minus kind/cat/type, the object header, the 64-bit size,
    // and the level tag.
    assert_eq!(fs.file_max_mini_bytes(f).unwrap(), 459);

    fs.file_write(f, 0, b"hello", t0()).unwrap();
    assert_eq!(fs.stat(f).unwrap().file_size(), Some(5));
    assert_eq!(fs.file_read_all(f).unwrap(), b"hello");

    let mut slices = Vec::new();
    fs.file_read(f, 0, 5, |data, reached_end| {
        slices.push((data.to_vec(), reached_end));
    })
    .unwrap();
    assert_eq!(slices, vec![(b"hello".to_vec(), true)]);

    // Mini content lives in the top node; no data blocks appear.
    assert_eq!(shared.0.borrow().nr_blocks(), blocks_after_create);

    // Overwrite within the inline content.
    fs.file_write(f, 1, b"ipp", t1()).unwrap();
    assert_eq!(fs.file_read_all(f).unwrap(), b"hippo");
}

#[test]
fn test_sparse_write_grows_with_zero_gap() {
    let (mut fs, shared) = new_fs_shared(u64::MAX);
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();
    fs.file_write(f, 0, b"hello", t0()).unwrap();

    fs.file_write(f, 10_000, b"X", t1()).unwrap();
    assert_eq!(fs.stat(f).unwrap().file_size(), Some(10_001));

    // ceil(10001 / 512) = 20 data blocks were allocated.
    assert!(shared.0.borrow().nr_blocks() >= 4 + 20);

    let content = fs.file_read_all(f).unwrap();
    assert_eq!(content.len(), 10_001);
    assert_eq!(&content[..5], b"hello");
    assert!(content[5..10_000].iter().all(|b| *b == 0));
    assert_eq!(content[10_000], b'X');
}

#[test]
fn test_read_write_length_matrix() {
    // Lengths around the representation boundaries: empty, one byte,
    // the mini capacity and one past it, a block and one past it, a
    // couple of blocks, and something that spans many tree nodes.
    let mini_cap = 459;
    let lengths = [
        0usize,
        1,
        mini_cap,
        mini_cap + 1,
        512,
        513,
        2 * 512 + 3,
        1024 * 1024,
    ];

    for (i, len) in lengths.into_iter().enumerate() {
        let mut fs = new_fs();
        let name = format!("f{i}").into_bytes();
        let f = fs.file_create(ObjId::ROOT, &name, b"", t0()).unwrap();
        let data = pattern(len);

        fs.file_write(f, 0, &data, t0()).unwrap();
        assert_eq!(fs.stat(f).unwrap().file_size(), Some(len as u64));
        assert_eq!(fs.file_read_all(f).unwrap(), data, "len={len}");

        // Reads honor block boundaries but concatenate seamlessly.
        if len > 3 {
            let mut partial = Vec::new();
            fs.file_read(f, 1, len - 2, |slice, _| {
                partial.extend_from_slice(slice);
            })
            .unwrap();
            assert_eq!(partial, &data[1..len - 1]);
        }
    }
}

#[test]
fn test_read_flags_and_bounds() {
    let mut fs = new_fs();
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();
    fs.file_write(f, 0, &pattern(2000), t0()).unwrap();

    // A read ending before the end of file is not flagged final.
    let mut flags = Vec::new();
    fs.file_read(f, 0, 100, |_, reached_end| flags.push(reached_end))
        .unwrap();
    assert_eq!(flags, vec![false]);

    // A read ending exactly at the end is.
    let mut flags = Vec::new();
    fs.file_read(f, 1990, 10, |_, reached_end| flags.push(reached_end))
        .unwrap();
    assert_eq!(flags, vec![true]);

    // Reads past the end are clamped; an offset past the end errors.
    let mut total = 0;
    fs.file_read(f, 1000, 100_000, |slice, _| total += slice.len())
        .unwrap();
    assert_eq!(total, 1000);
    assert_eq!(
        fs.file_read(f, 2001, 1, |_, _| {}).unwrap_err(),
        AfsError::InvalidOffset
    );

    // Reading zero bytes yields one empty final slice.
    let mut calls = Vec::new();
    fs.file_read(f, 2000, 0, |slice, reached_end| {
        calls.push((slice.len(), reached_end));
    })
    .unwrap();
    assert_eq!(calls, vec![(0, true)]);
}

#[test]
fn test_truncate_to_zero_returns_blocks() {
    let (mut fs, shared) = new_fs_shared(100_000);
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();
    fs.file_write(f, 0, &pattern(10_001), t0()).unwrap();

    let blocks = shared.0.borrow().nr_blocks();
    let free_before = fs.free_space_blocks();

    let actual = fs.file_set_size(f, 0, t1()).unwrap();
    assert_eq!(actual, 0);
    assert_eq!(fs.stat(f).unwrap().file_size(), Some(0));
    assert_eq!(fs.file_read_all(f).unwrap(), b"");

    // The storage does not shrink, but every data block moved to the
    // free list: 20 data blocks for 10001 bytes.
    assert_eq!(shared.0.borrow().nr_blocks(), blocks);
    assert!(fs.free_space_blocks() >= free_before + 20);
    fs.verify_free_list();

    // A rewrite reuses the freed blocks instead of growing.
    fs.file_write(f, 0, &pattern(10_001), t1()).unwrap();
    assert_eq!(shared.0.borrow().nr_blocks(), blocks);
    assert_eq!(fs.file_read_all(f).unwrap(), pattern(10_001));
}

#[test]
fn test_set_size_zero_fills_growth() {
    let mut fs = new_fs();
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();
    fs.file_write(f, 0, &vec![0xee; 5000], t0()).unwrap();

    fs.file_set_size(f, 100, t1()).unwrap();
    assert_eq!(fs.stat(f).unwrap().file_size(), Some(100));

    let actual = fs.file_set_size(f, 5000, t1()).unwrap();
    assert_eq!(actual, 5000);

    let content = fs.file_read_all(f).unwrap();
    assert_eq!(&content[..100], &[0xee; 100][..]);
    assert!(content[100..].iter().all(|b| *b == 0));
}

#[test]
fn test_set_size_idempotent() {
    let mut fs = new_fs();
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();
    fs.file_write(f, 0, &pattern(3000), t0()).unwrap();

    assert_eq!(fs.file_set_size(f, 1234, t1()).unwrap(), 1234);
    let after_first = fs.file_read_all(f).unwrap();
    assert_eq!(fs.file_set_size(f, 1234, t1()).unwrap(), 1234);
    assert_eq!(fs.file_read_all(f).unwrap(), after_first);
    assert_eq!(after_first, &pattern(3000)[..1234]);
}

#[test]
fn test_set_size_chunked_rounds() {
    let mut fs = new_fs();
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();

    // 200000 bytes is 391 blocks, several times the per-round bound,
    // so this runs multiple journaled writes.
    let actual = fs.file_set_size(f, 200_000, t0()).unwrap();
    assert_eq!(actual, 200_000);
    assert_eq!(fs.stat(f).unwrap().file_size(), Some(200_000));

    let content = fs.file_read_all(f).unwrap();
    assert_eq!(content.len(), 200_000);
    assert!(content.iter().all(|b| *b == 0));

    // Shrink back down across several rounds.
    let actual = fs.file_set_size(f, 700, t1()).unwrap();
    assert_eq!(actual, 700);
    assert_eq!(fs.file_read_all(f).unwrap(), vec![0; 700]);
    fs.verify_free_list();
}

#[test]
fn test_shrink_into_mini() {
    let (mut fs, shared) = new_fs_shared(u64::MAX);
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();
    fs.file_write(f, 0, &pattern(2000), t0()).unwrap();
    let blocks = shared.0.borrow().nr_blocks();

    // 300 bytes fit back inline; all data blocks are freed.
    fs.file_set_size(f, 300, t1()).unwrap();
    assert_eq!(fs.file_read_all(f).unwrap(), &pattern(2000)[..300]);

    let free = fs.free_space_blocks();
    let _ = free;
    assert_eq!(shared.0.borrow().nr_blocks(), blocks);
    fs.verify_free_list();

    // Growing within the inline capacity allocates nothing.
    fs.file_write(f, 300, &pattern(100), t1()).unwrap();
    assert_eq!(shared.0.borrow().nr_blocks(), blocks);
    assert_eq!(fs.stat(f).unwrap().file_size(), Some(400));
}

#[test]
fn test_delete_file_with_content() {
    let mut fs = new_fs();
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();
    fs.file_write(f, 0, &pattern(50_000), t0()).unwrap();

    // Delete truncates internally rather than failing.
    fs.obj_delete(ObjId::ROOT, b"f", t1()).unwrap();
    assert_eq!(
        fs.find(ObjId::ROOT, b"f").unwrap_err(),
        AfsError::NameNotInDir
    );
    assert_eq!(fs.stat(f).unwrap_err(), AfsError::ObjNotFound);
    fs.verify_free_list();
}

#[test]
fn test_type_mismatches() {
    let mut fs = new_fs();
    let d = fs.dir_create(ObjId::ROOT, b"d", b"", t0()).unwrap();
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();

    assert_eq!(
        fs.file_read(d, 0, 1, |_, _| {}).unwrap_err(),
        AfsError::ObjNotFile
    );
    assert_eq!(
        fs.file_write(d, 0, b"x", t0()).unwrap_err(),
        AfsError::ObjNotFile
    );
    assert_eq!(
        fs.file_set_size(d, 0, t0()).unwrap_err(),
        AfsError::ObjNotFile
    );
    let mut batch = Vec::new();
    assert_eq!(
        fs.read_dir(f, b"", &mut batch).unwrap_err(),
        AfsError::ObjNotDir
    );
    assert_eq!(
        fs.stat(ObjId {
            index: 1 << 40,
            unique_id: 0,
        })
        .unwrap_err(),
        AfsError::InvalidObjId
    );
}

#[test]
fn test_out_of_space() {
    // Room for the seed blocks, one file top node, and two data
    // blocks only.
    let (mut fs, _shared) = new_fs_shared(6);
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();

    assert_eq!(
        fs.file_write(f, 0, &pattern(4096), t0()).unwrap_err(),
        AfsError::OutOfSpace
    );

    // The failed write rolled back completely.
    assert_eq!(fs.stat(f).unwrap().file_size(), Some(0));
    assert_eq!(fs.file_read_all(f).unwrap(), b"");

    // A write that fits still succeeds afterwards.
    fs.file_write(f, 0, &pattern(1000), t0()).unwrap();
    assert_eq!(fs.file_read_all(f).unwrap(), pattern(1000));
}
