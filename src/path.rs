//! Path resolution for journal entries.
//!
//! Journal records only carry a file id, a parent id and a bare name. The
//! resolver asks the volume for the parent directory's path and caches
//! directory paths so bursts of changes in one directory cost one lookup.

use crate::{Fid, GhostResult, record::UsnEntry};
use log::debug;
use lru::LruCache;
use std::{num::NonZeroUsize, path::PathBuf};

/// Something that can map a file id to its current full path.
pub trait FidLookup {
    fn fid_to_path(&self, fid: Fid) -> GhostResult<PathBuf>;
}

const LRU_CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(4 * 1024).unwrap();

/// Resolves file paths from file ids, using an LRU cache of directory paths.
#[derive(Debug)]
pub struct PathResolver<'a, L: FidLookup + ?Sized> {
    lookup: &'a L,
    // dir fid -> (path, name the path was built with)
    dir_fid_path_cache: Option<LruCache<Fid, (PathBuf, String)>>,
}

impl<'a, L: FidLookup + ?Sized> PathResolver<'a, L> {
    pub fn new(lookup: &'a L) -> Self {
        PathResolver {
            lookup,
            dir_fid_path_cache: None,
        }
    }

    pub fn new_with_cache(lookup: &'a L) -> Self {
        PathResolver {
            lookup,
            dir_fid_path_cache: Some(LruCache::new(LRU_CACHE_CAPACITY)),
        }
    }

    /// Drops every cached directory path, e.g. after a directory rename.
    pub fn invalidate(&mut self) {
        if let Some(cache) = &mut self.dir_fid_path_cache {
            cache.clear();
        }
    }

    pub fn resolve_path(&mut self, entry: &UsnEntry) -> Option<PathBuf> {
        match &mut self.dir_fid_path_cache {
            Some(cache) => resolve_path_with_cache(self.lookup, entry, cache),
            None => resolve_path(self.lookup, entry),
        }
    }
}

fn resolve_path<L: FidLookup + ?Sized>(lookup: &L, entry: &UsnEntry) -> Option<PathBuf> {
    if let Ok(parent_path) = lookup.fid_to_path(entry.parent_fid) {
        return Some(parent_path.join(&entry.file_name));
    }
    // The parent may be gone already; the file itself might still resolve.
    lookup.fid_to_path(entry.fid).ok()
}

fn resolve_path_with_cache<L: FidLookup + ?Sized>(
    lookup: &L,
    entry: &UsnEntry,
    cache: &mut LruCache<Fid, (PathBuf, String)>,
) -> Option<PathBuf> {
    if let Some((cached_path, cached_name)) = cache.get(&entry.fid) {
        if *cached_name == entry.file_name {
            return Some(cached_path.clone());
        }
        // Renamed since it was cached.
        cache.pop(&entry.fid);
    }

    let parent_dir_path = if let Some((cached_parent, _)) = cache.get(&entry.parent_fid) {
        cached_parent.clone()
    } else {
        match lookup.fid_to_path(entry.parent_fid) {
            Ok(resolved) => {
                let parent_name = resolved
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                cache.put(entry.parent_fid, (resolved.clone(), parent_name));
                resolved
            }
            Err(err) => {
                debug!(
                    "Parent {:#x} of {:?} unresolvable: {}",
                    entry.parent_fid, entry.file_name, err
                );
                return lookup.fid_to_path(entry.fid).ok();
            }
        }
    };

    let current_path = parent_dir_path.join(&entry.file_name);
    if entry.is_dir() {
        cache.put(entry.fid, (current_path.clone(), entry.file_name.clone()));
    }
    Some(current_path)
}
