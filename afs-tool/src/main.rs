// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Operate on AFS image files.
//!
//! The image is loaded into the in-memory storage, operated on, and
//! (after a mutation) written back whole. This is a debugging and
//! inspection surface; durable deployments use a real block device
//! behind the `AfsStorage` trait instead of image files.

use atomicfs::{
    Afs, AfsError, AfsStorage, AfsTime, Block, BlockSize, DirEntry,
    MemStorage, ObjId, StatKind,
};
use clap::{Parser, Subcommand};
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};
use tabled::builder::Builder;
use tabled::settings::object::Column;
use tabled::settings::{Alignment, Style};

type Error = Box<dyn std::error::Error>;

/// [`MemStorage`] behind an `Rc` so the tool can hand the storage to
/// [`Afs`] and still reach it afterwards to write the image back out.
#[derive(Clone)]
struct SharedStorage(Rc<RefCell<MemStorage>>);

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

/// Inspect or modify an AFS filesystem image.
#[derive(Parser)]
struct Opt {
    /// Path of the image file.
    #[arg(short, long)]
    image: std::path::PathBuf,

    /// Block size of the image.
    #[arg(long, default_value_t = 512)]
    block_size: u32,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Create an empty filesystem image.
    Mkfs,
    /// List a directory (or show one entry).
    Ls { path: String },
    /// Print an object's status.
    Stat { path: String },
    /// Write a file's content to stdout.
    Cat { path: String },
    /// Create a directory.
    Mkdir { path: String },
    /// Write stdin into a file, creating it if needed.
    Write { path: String },
    /// Delete a file or an empty directory.
    Rm { path: String },
    /// Move or rename an object.
    Mv { from: String, to: String },
}

fn now() -> AfsTime {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    AfsTime::from_unix_seconds(secs)
}

fn load(opt: &Opt) -> Result<(Afs, SharedStorage), Error> {
    let block_size =
        BlockSize::new(opt.block_size).ok_or("invalid block size")?;
    let image = std::fs::read(&opt.image)?;
    let shared = SharedStorage(Rc::new(RefCell::new(MemStorage::from_image(
        block_size,
        u64::MAX,
        &image,
    ))));
    let fs = Afs::init(Box::new(shared.clone()), b"", now())?;
    Ok((fs, shared))
}

fn save(opt: &Opt, fs: Afs, shared: &SharedStorage) -> Result<(), Error> {
    drop(fs);
    std::fs::write(&opt.image, shared.0.borrow().to_image())?;
    Ok(())
}

/// Split a path into its parent directory id and leaf name.
fn parent_and_name<'p>(
    fs: &Afs,
    path: &'p str,
) -> Result<(ObjId, &'p [u8]), Error> {
    let bytes = path.as_bytes();
    let Some(split) = bytes.iter().rposition(|b| *b == b'/') else {
        return Err("path must be absolute".into());
    };
    let name = &bytes[split + 1..];
    if name.is_empty() {
        return Err("path has no final component".into());
    }
    let parent = if split == 0 {
        ObjId::ROOT
    } else {
        let entries = fs.crack_path(&bytes[..split])?;
        // crack_path("/x") returns at least one entry.
        entries.last().unwrap().id()
    };
    Ok((parent, name))
}

fn resolve(fs: &Afs, path: &str) -> Result<Option<DirEntry>, Error> {
    if path == "/" {
        return Ok(None);
    }
    let entries = fs.crack_path(path.as_bytes())?;
    Ok(entries.into_iter().last())
}

fn ls_to_string(fs: &Afs, path: &str) -> Result<String, Error> {
    let dir_id = match resolve(fs, path)? {
        None => ObjId::ROOT,
        Some(entry) if entry.obj_type().is_dir() => entry.id(),
        Some(entry) => {
            // A single non-directory entry lists as itself.
            let mut builder = Builder::new();
            push_entry_row(&mut builder, fs, &entry)?;
            return Ok(builder.build().with(Style::empty()).to_string());
        }
    };

    let mut builder = Builder::new();
    builder.push_record(["Name:", "Type:", "Size:"]);

    let mut last_name = Vec::new();
    loop {
        let mut entries = Vec::new();
        let reached_end = fs.read_dir(dir_id, &last_name, &mut entries)?;
        for entry in &entries {
            push_entry_row(&mut builder, fs, entry)?;
        }
        if let Some(entry) = entries.last() {
            last_name = entry.name().to_vec();
        }
        if reached_end {
            break;
        }
    }

    let table = builder
        .build()
        .modify(Column::from(2), Alignment::right())
        .with(Style::empty())
        .to_string();
    Ok(table)
}

fn push_entry_row(
    builder: &mut Builder,
    fs: &Afs,
    entry: &DirEntry,
) -> Result<(), Error> {
    let info = fs.stat(entry.id())?;
    let (kind, size) = match info.kind {
        StatKind::Dir { nr_entries } => ("dir", format!("{nr_entries} entries")),
        StatKind::File { size_bytes } => ("file", size_bytes.to_string()),
    };
    builder.push_record([
        String::from_utf8_lossy(entry.name()).into_owned(),
        kind.to_string(),
        size,
    ]);
    Ok(())
}

fn stat_to_string(fs: &Afs, path: &str) -> Result<String, Error> {
    let id = match resolve(fs, path)? {
        None => ObjId::ROOT,
        Some(entry) => entry.id(),
    };
    let info = fs.stat(id)?;

    let mut out = String::new();
    out.push_str(&format!("id:      {}\n", info.id));
    out.push_str(&format!("parent:  {}\n", info.parent_id));
    match info.kind {
        StatKind::Dir { nr_entries } => {
            out.push_str(&format!("type:    dir ({nr_entries} entries)\n"));
        }
        StatKind::File { size_bytes } => {
            out.push_str(&format!("type:    file ({size_bytes} bytes)\n"));
        }
    }
    out.push_str(&format!(
        "created: {} (unix)\n",
        info.create_time.to_unix_seconds()
    ));
    out.push_str(&format!(
        "written: {} (unix)\n",
        info.modify_time.to_unix_seconds()
    ));
    out.push_str(&format!(
        "meta:    {}\n",
        String::from_utf8_lossy(&info.meta)
    ));
    Ok(out)
}

fn run(opt: &Opt) -> Result<(), Error> {
    match &opt.action {
        Action::Mkfs => {
            let block_size =
                BlockSize::new(opt.block_size).ok_or("invalid block size")?;
            let shared = SharedStorage(Rc::new(RefCell::new(
                MemStorage::new(block_size, u64::MAX),
            )));
            let fs = Afs::init(Box::new(shared.clone()), b"", now())?;
            save(opt, fs, &shared)?;
        }
        Action::Ls { path } => {
            let (fs, _) = load(opt)?;
            println!("{}", ls_to_string(&fs, path)?);
        }
        Action::Stat { path } => {
            let (fs, _) = load(opt)?;
            print!("{}", stat_to_string(&fs, path)?);
        }
        Action::Cat { path } => {
            let (fs, _) = load(opt)?;
            let entry =
                resolve(&fs, path)?.ok_or("cannot cat the root directory")?;
            let content = fs.file_read_all(entry.id())?;
            io::stdout().write_all(&content)?;
        }
        Action::Mkdir { path } => {
            let (mut fs, shared) = load(opt)?;
            let (parent, name) = parent_and_name(&fs, path)?;
            fs.dir_create(parent, name, b"", now())?;
            save(opt, fs, &shared)?;
        }
        Action::Write { path } => {
            let (mut fs, shared) = load(opt)?;
            let (parent, name) = parent_and_name(&fs, path)?;
            let id = match fs.find(parent, name) {
                Ok(entry) => entry.id(),
                Err(AfsError::NameNotInDir) => {
                    fs.file_create(parent, name, b"", now())?
                }
                Err(e) => return Err(e.into()),
            };
            let mut content = Vec::new();
            io::stdin().read_to_end(&mut content)?;
            fs.file_set_size(id, 0, now())?;
            fs.file_write(id, 0, &content, now())?;
            save(opt, fs, &shared)?;
        }
        Action::Rm { path } => {
            let (mut fs, shared) = load(opt)?;
            let (parent, name) = parent_and_name(&fs, path)?;
            fs.obj_delete(parent, name, now())?;
            save(opt, fs, &shared)?;
        }
        Action::Mv { from, to } => {
            let (mut fs, shared) = load(opt)?;
            let (parent_old, name_old) = parent_and_name(&fs, from)?;
            let (parent_new, name_new) = parent_and_name(&fs, to)?;
            fs.obj_move(parent_old, name_old, parent_new, name_new, now())?;
            save(opt, fs, &shared)?;
        }
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    let opt = Opt::parse();
    run(&opt)
}
