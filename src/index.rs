//! In-memory directory tree built from an MFT enumeration.
//!
//! Every directory seen during the scan is recorded as `fid -> (parent, name)`,
//! so full paths can be rebuilt without opening a single file.

use crate::{Fid, record::FILE_RECORD_NUMBER_MASK, record::UsnEntry};
use log::debug;
use lru::LruCache;
use std::{collections::HashMap, num::NonZeroUsize, path::PathBuf};

/// MFT record number of the volume root directory.
pub const ROOT_RECORD_NUMBER: u64 = 5;

const PATH_CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(4 * 1024).unwrap();

#[derive(Debug)]
struct DirNode {
    parent: Fid,
    name: String,
}

#[derive(Debug)]
pub struct DirectoryIndex {
    root: PathBuf,
    dirs: HashMap<Fid, DirNode>,
    cache: LruCache<Fid, PathBuf>,
}

impl DirectoryIndex {
    /// `root` is the path the volume root maps to, e.g. `C:\` or a mount point.
    pub fn new(root: PathBuf) -> Self {
        DirectoryIndex {
            root,
            dirs: HashMap::new(),
            cache: LruCache::new(PATH_CACHE_CAPACITY),
        }
    }

    /// Records `entry` if it is a directory. Non-directories are ignored.
    pub fn insert(&mut self, entry: &UsnEntry) {
        if !entry.is_dir() {
            return;
        }
        self.dirs.insert(
            entry.fid,
            DirNode {
                parent: entry.parent_fid,
                name: entry.file_name.clone(),
            },
        );
        self.cache.pop(&entry.fid);
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Full path of the directory `fid`, or `None` if the chain of parents
    /// is broken or loops.
    pub fn resolve(&mut self, fid: Fid) -> Option<PathBuf> {
        if is_root(fid) {
            return Some(self.root.clone());
        }
        if let Some(path) = self.cache.get(&fid) {
            return Some(path.clone());
        }

        let mut names: Vec<&str> = Vec::new();
        let mut current = fid;
        let mut base = self.root.clone();

        loop {
            if names.len() > self.dirs.len() {
                debug!("Parent chain of {:#x} loops, giving up", fid);
                return None;
            }
            if is_root(current) {
                break;
            }
            if let Some(cached) = self.cache.peek(&current) {
                base = cached.clone();
                break;
            }
            let node = self.dirs.get(&current)?;
            names.push(&node.name);
            if node.parent == current {
                break;
            }
            current = node.parent;
        }

        let mut path = base;
        for name in names.iter().rev() {
            path.push(name);
        }
        self.cache.put(fid, path.clone());
        Some(path)
    }

    /// Full path of `entry`: its parent directory joined with its name.
    pub fn path_of(&mut self, entry: &UsnEntry) -> Option<PathBuf> {
        self.resolve(entry.parent_fid)
            .map(|parent| parent.join(&entry.file_name))
    }
}

fn is_root(fid: Fid) -> bool {
    fid & FILE_RECORD_NUMBER_MASK == ROOT_RECORD_NUMBER
}
