// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::{new_fs, new_fs_shared, read_dir_all, t0, t1};
use atomicfs::{AfsError, AfsStorage, ObjId};

#[test]
fn test_init_geometry() {
    let (fs, shared) = new_fs_shared(1000);

    // Seed blocks: root dir top node, master, free-list tail.
    assert_eq!(shared.0.borrow().nr_blocks(), 3);
    assert_eq!(fs.nr_blocks(), 3);

    // Init itself consumes no free space beyond the seed blocks.
    assert_eq!(fs.free_space_blocks(), 997);

    let root = fs.stat(ObjId::ROOT).unwrap();
    assert!(root.is_dir());
    assert_eq!(root.parent_id, ObjId::NONE);
    assert_eq!(root.dir_nr_entries(), Some(0));
    assert_eq!(root.meta, b"root");
    assert_eq!(root.create_time, t0());
}

#[test]
fn test_dir_create_and_find() {
    let (mut fs, shared) = new_fs_shared(u64::MAX);

    let a = fs.dir_create(ObjId::ROOT, b"a", b"", t0()).unwrap();
    assert_eq!(shared.0.borrow().nr_blocks(), 4);

    let found = fs.find(ObjId::ROOT, b"a").unwrap();
    assert_eq!(found.id(), a);
    assert!(found.obj_type().is_dir());

    let info = fs.stat(a).unwrap();
    assert_eq!(info.parent_id, ObjId::ROOT);
    assert_eq!(info.dir_nr_entries(), Some(0));

    assert_eq!(
        fs.stat(ObjId::ROOT).unwrap().dir_nr_entries(),
        Some(1)
    );

    assert_eq!(
        fs.find(ObjId::ROOT, b"missing").unwrap_err(),
        AfsError::NameNotInDir
    );
    assert_eq!(
        fs.find(a, b"anything").unwrap_err(),
        AfsError::NameNotInDir
    );
}

#[test]
fn test_create_validation() {
    let mut fs = new_fs();

    assert_eq!(
        fs.dir_create(ObjId::ROOT, b"", b"", t0()).unwrap_err(),
        AfsError::NameInvalid
    );
    assert_eq!(
        fs.dir_create(ObjId::ROOT, b"a/b", b"", t0()).unwrap_err(),
        AfsError::NameInvalid
    );

    let long_name = vec![b'x'; fs.max_name_bytes() as usize + 1];
    assert_eq!(
        fs.dir_create(ObjId::ROOT, &long_name, b"", t0()).unwrap_err(),
        AfsError::NameTooLong
    );
    let max_name = vec![b'x'; fs.max_name_bytes() as usize];
    fs.dir_create(ObjId::ROOT, &max_name, b"", t0()).unwrap();

    let long_meta = vec![0u8; fs.max_meta_bytes() as usize + 1];
    assert_eq!(
        fs.dir_create(ObjId::ROOT, b"m", &long_meta, t0()).unwrap_err(),
        AfsError::MetaDataTooLong
    );

    fs.dir_create(ObjId::ROOT, b"dup", b"", t0()).unwrap();
    assert_eq!(
        fs.dir_create(ObjId::ROOT, b"dup", b"", t0()).unwrap_err(),
        AfsError::NameExists
    );
    assert_eq!(
        fs.file_create(ObjId::ROOT, b"dup", b"", t0()).unwrap_err(),
        AfsError::NameExists
    );

    // Creating under a file is rejected.
    let f = fs.file_create(ObjId::ROOT, b"f", b"", t0()).unwrap();
    assert_eq!(
        fs.dir_create(f, b"x", b"", t0()).unwrap_err(),
        AfsError::ObjNotDir
    );

    // Creating under an id that was never allocated is rejected.
    let bogus = ObjId {
        index: 1 << 40,
        unique_id: 7,
    };
    assert_eq!(
        fs.dir_create(bogus, b"x", b"", t0()).unwrap_err(),
        AfsError::InvalidObjId
    );
}

#[test]
fn test_thousand_names_ascending() {
    let (mut fs, shared) = new_fs_shared(u64::MAX);

    let names: Vec<Vec<u8>> =
        (0..1000).map(|i| format!("k{i:04}").into_bytes()).collect();
    for name in &names {
        fs.dir_create(ObjId::ROOT, name, b"", t0()).unwrap();
    }

    assert_eq!(
        fs.stat(ObjId::ROOT).unwrap().dir_nr_entries(),
        Some(1000)
    );

    // One batched call cannot return the whole directory.
    let mut first_batch = Vec::new();
    let reached_end = fs.read_dir(ObjId::ROOT, b"", &mut first_batch).unwrap();
    assert!(!reached_end);
    assert!(!first_batch.is_empty());
    assert!(first_batch.len() < 1000);

    // Full iteration returns exactly the inserted names, in order.
    let all = read_dir_all(&fs, ObjId::ROOT);
    assert_eq!(all.len(), 1000);
    for (entry, name) in all.iter().zip(&names) {
        assert_eq!(entry.name(), &name[..]);
    }

    // 1000 top nodes plus the seed blocks plus interior tree nodes;
    // well beyond 1003 means the tree has split into several levels.
    assert!(shared.0.borrow().nr_blocks() > 1050);

    fs.verify_free_list();
}

#[test]
fn test_read_dir_resumes_mid_directory() {
    let mut fs = new_fs();
    for i in 0..100 {
        let name = format!("n{i:03}").into_bytes();
        fs.dir_create(ObjId::ROOT, &name, b"", t0()).unwrap();
    }

    // Resume from an arbitrary name, not necessarily present.
    let mut batch = Vec::new();
    fs.read_dir(ObjId::ROOT, b"n049", &mut batch).unwrap();
    assert_eq!(batch[0].name(), b"n050");

    let mut batch = Vec::new();
    fs.read_dir(ObjId::ROOT, b"n0495", &mut batch).unwrap();
    assert_eq!(batch[0].name(), b"n050");
}

#[test]
fn test_dir_churn_rebalances() {
    let (mut fs, _shared) = new_fs_shared(u64::MAX);

    // Names of varying length so removals exercise first-name
    // propagation with both longer and shorter replacements.
    let name = |i: usize| {
        let mut n = format!("c{:03}", (i * 7) % 1000).into_bytes();
        n.extend(std::iter::repeat(b'p').take(i % 40));
        n
    };

    let count = 300;
    for i in 0..count {
        fs.dir_create(ObjId::ROOT, &name(i), b"", t0()).unwrap();
    }

    // Delete in a scattered order to force joins and hoists.
    let mut deleted = Vec::new();
    for step in 0..count {
        let i = (step * 131) % count;
        fs.obj_delete(ObjId::ROOT, &name(i), t1()).unwrap();
        deleted.push(i);

        if step % 50 == 0 {
            fs.verify_free_list();
        }
    }

    assert_eq!(fs.stat(ObjId::ROOT).unwrap().dir_nr_entries(), Some(0));
    assert!(read_dir_all(&fs, ObjId::ROOT).is_empty());
    fs.verify_free_list();

    // Freed blocks are reused rather than growing the storage.
    let blocks_before = fs.nr_blocks();
    for i in 0..count {
        fs.dir_create(ObjId::ROOT, &name(i), b"", t1()).unwrap();
    }
    assert_eq!(fs.nr_blocks(), blocks_before);
}

#[test]
fn test_move_rename_within_dir() {
    let mut fs = new_fs();
    let a = fs.dir_create(ObjId::ROOT, b"a", b"", t0()).unwrap();
    fs.dir_create(ObjId::ROOT, b"b", b"", t0()).unwrap();

    fs.obj_move(ObjId::ROOT, b"a", ObjId::ROOT, b"c", t1()).unwrap();
    assert_eq!(fs.find(ObjId::ROOT, b"c").unwrap().id(), a);
    assert_eq!(
        fs.find(ObjId::ROOT, b"a").unwrap_err(),
        AfsError::NameNotInDir
    );

    assert_eq!(
        fs.obj_move(ObjId::ROOT, b"c", ObjId::ROOT, b"b", t1())
            .unwrap_err(),
        AfsError::NameExists
    );
    assert_eq!(
        fs.obj_move(ObjId::ROOT, b"nope", ObjId::ROOT, b"x", t1())
            .unwrap_err(),
        AfsError::NameNotInDir
    );
}

#[test]
fn test_move_across_dirs_and_back() {
    let mut fs = new_fs();
    let d1 = fs.dir_create(ObjId::ROOT, b"d1", b"", t0()).unwrap();
    let d2 = fs.dir_create(ObjId::ROOT, b"d2", b"", t0()).unwrap();
    let f = fs.file_create(d1, b"f", b"", t0()).unwrap();
    fs.file_write(f, 0, b"payload", t0()).unwrap();

    fs.obj_move(d1, b"f", d2, b"g", t1()).unwrap();
    assert_eq!(fs.find(d2, b"g").unwrap().id(), f);
    assert_eq!(fs.find(d1, b"f").unwrap_err(), AfsError::NameNotInDir);
    assert_eq!(fs.stat(f).unwrap().parent_id, d2);
    assert_eq!(fs.stat(d1).unwrap().dir_nr_entries(), Some(0));
    assert_eq!(fs.stat(d2).unwrap().dir_nr_entries(), Some(1));

    // Moving back restores the original tree.
    fs.obj_move(d2, b"g", d1, b"f", t1()).unwrap();
    assert_eq!(fs.find(d1, b"f").unwrap().id(), f);
    assert_eq!(fs.stat(f).unwrap().parent_id, d1);
    assert_eq!(fs.stat(d2).unwrap().dir_nr_entries(), Some(0));
    assert_eq!(fs.file_read_all(f).unwrap(), b"payload");
}

#[test]
fn test_move_rejects_cycles() {
    let mut fs = new_fs();
    let d1 = fs.dir_create(ObjId::ROOT, b"d1", b"", t0()).unwrap();
    let d2 = fs.dir_create(d1, b"d2", b"", t0()).unwrap();
    let d3 = fs.dir_create(d2, b"d3", b"", t0()).unwrap();

    // A directory cannot move under itself.
    assert_eq!(
        fs.obj_move(ObjId::ROOT, b"d1", d1, b"x", t1()).unwrap_err(),
        AfsError::MoveDestInvalid
    );
    // Nor under any of its descendants.
    assert_eq!(
        fs.obj_move(ObjId::ROOT, b"d1", d3, b"x", t1()).unwrap_err(),
        AfsError::MoveDestInvalid
    );

    // Moving a descendant up is fine.
    fs.obj_move(d2, b"d3", ObjId::ROOT, b"d3", t1()).unwrap();
    assert_eq!(fs.stat(d3).unwrap().parent_id, ObjId::ROOT);
}

#[test]
fn test_delete_dirs() {
    let mut fs = new_fs();
    let d = fs.dir_create(ObjId::ROOT, b"d", b"", t0()).unwrap();
    fs.dir_create(d, b"inner", b"", t0()).unwrap();

    assert_eq!(
        fs.obj_delete(ObjId::ROOT, b"d", t1()).unwrap_err(),
        AfsError::DirNotEmpty
    );

    fs.obj_delete(d, b"inner", t1()).unwrap();
    fs.obj_delete(ObjId::ROOT, b"d", t1()).unwrap();

    assert_eq!(
        fs.find(ObjId::ROOT, b"d").unwrap_err(),
        AfsError::NameNotInDir
    );
    assert_eq!(
        fs.obj_delete(ObjId::ROOT, b"d", t1()).unwrap_err(),
        AfsError::NameNotInDir
    );

    // The stale id no longer resolves.
    assert_eq!(fs.stat(d).unwrap_err(), AfsError::ObjNotFound);
}

#[test]
fn test_stale_id_rejected_after_block_reuse() {
    let mut fs = new_fs();
    let d = fs.dir_create(ObjId::ROOT, b"d", b"", t0()).unwrap();
    fs.obj_delete(ObjId::ROOT, b"d", t1()).unwrap();

    // The replacement object reuses the freed block, but gets a fresh
    // unique id, so the old id stays dead.
    let e = fs.dir_create(ObjId::ROOT, b"e", b"", t1()).unwrap();
    assert_eq!(e.index, d.index);
    assert_ne!(e.unique_id, d.unique_id);

    assert_eq!(fs.stat(d).unwrap_err(), AfsError::ObjNotFound);
    assert!(fs.stat(e).is_ok());
}

#[test]
fn test_crack_path() {
    let mut fs = new_fs();
    let a = fs.dir_create(ObjId::ROOT, b"a", b"", t0()).unwrap();
    let b = fs.dir_create(a, b"b", b"", t0()).unwrap();
    let f = fs.file_create(b, b"f", b"", t0()).unwrap();

    let entries = fs.crack_path(b"/a/b/f").unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].id(), a);
    assert_eq!(entries[1].id(), b);
    assert_eq!(entries[2].id(), f);

    // Trailing slash is tolerated; `/` resolves to nothing.
    assert_eq!(fs.crack_path(b"/a/b/").unwrap().len(), 2);
    assert!(fs.crack_path(b"/").unwrap().is_empty());

    assert_eq!(
        fs.crack_path(b"").unwrap_err(),
        AfsError::InvalidPathSyntax
    );
    assert_eq!(
        fs.crack_path(b"a/b").unwrap_err(),
        AfsError::InvalidPathSyntax
    );
    assert_eq!(
        fs.crack_path(b"/a//b").unwrap_err(),
        AfsError::InvalidPathSyntax
    );
    assert_eq!(
        fs.crack_path(b"/a/b/f/x").unwrap_err(),
        AfsError::ObjNotDir
    );
    assert_eq!(
        fs.crack_path(b"/a/missing").unwrap_err(),
        AfsError::NameNotInDir
    );
}

#[test]
fn test_custom_name_comparator() {
    fn caseless(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        let lower = |x: &u8| x.to_ascii_lowercase();
        a.iter().map(lower).cmp(b.iter().map(lower))
    }

    let mut fs = atomicfs::Afs::init_with_cmp(
        Box::new(atomicfs::MemStorage::new(crate::bs512(), u64::MAX)),
        b"root",
        t0(),
        caseless,
    )
    .unwrap();

    fs.dir_create(ObjId::ROOT, b"Alpha", b"", t0()).unwrap();
    assert_eq!(
        fs.dir_create(ObjId::ROOT, b"alpha", b"", t0()).unwrap_err(),
        AfsError::NameExists
    );
    let found = fs.find(ObjId::ROOT, b"ALPHA").unwrap();
    assert_eq!(found.name(), b"Alpha");
}
