//! Enumeration of files in a host repository store
//!
//! A repository backed by this cache keeps few or none of its file revlogs
//! locally, so the host's store needs a listing that reports whatever is on
//! disk and treats every path as potentially present. Hosts plug in through
//! [`StoreWalker`] rather than by replacing their store type.

use crate::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One regular file found in a store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DataFile {
    /// Path with directory-name escaping undone
    pub decoded: String,
    /// Path as stored on disk, relative to the store root
    pub encoded: String,
    /// Size in bytes
    pub size: u64,
}

/// Listing capability a host store exposes
pub trait StoreWalker {
    /// List regular files under `rel` (or the whole store), sorted by decoded
    /// path. Only revlog files (`.i`, `.d`) are listed unless `all_files`.
    fn walk(&self, rel: Option<&str>, recurse: bool, all_files: bool) -> Result<Vec<DataFile>>;

    /// Every file under the store's `data` directory
    fn data_files(&self) -> Result<Vec<DataFile>> {
        self.walk(Some("data"), true, true)
    }

    /// Whether the store may hold `path`
    fn contains(&self, path: &str) -> bool;
}

/// Filesystem walker for a shallow (cache-backed) store
#[derive(Debug, Clone)]
pub struct ShallowWalker {
    root: PathBuf,
}

impl ShallowWalker {
    /// Walker over the store at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StoreWalker for ShallowWalker {
    fn walk(&self, rel: Option<&str>, recurse: bool, all_files: bool) -> Result<Vec<DataFile>> {
        let base = match rel {
            Some(rel) if !rel.is_empty() => self.root.join(rel),
            _ => self.root.clone(),
        };
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let mut walker = WalkDir::new(&base).min_depth(1);
        if !recurse {
            walker = walker.max_depth(1);
        }

        let mut files = Vec::new();
        for item in walker {
            let entry = item.map_err(|e| walk_error(e, &base))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !all_files && !(name.ends_with(".i") || name.ends_with(".d")) {
                continue;
            }
            let size = entry
                .metadata()
                .map_err(|e| walk_error(e, entry.path()))?
                .len();
            let Some(encoded) = relative_key(&self.root, entry.path()) else {
                continue;
            };
            files.push(DataFile {
                decoded: decode_dir(&encoded),
                encoded,
                size,
            });
        }
        files.sort();
        Ok(files)
    }

    fn contains(&self, _path: &str) -> bool {
        // Anything may be fetched on demand
        true
    }
}

/// Undo the escaping hosts apply to directories named like revlog files
#[must_use]
pub fn decode_dir(path: &str) -> String {
    if !path.contains(".hg/") {
        return path.to_string();
    }
    path.replace(".d.hg/", ".d/")
        .replace(".i.hg/", ".i/")
        .replace(".hg.hg/", ".hg/")
}

/// `path` relative to `root`, with components joined by `/`
pub(crate) fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Some(parts.join("/"))
}

/// Convert a directory walk failure into a crate error
pub(crate) fn walk_error(err: walkdir::Error, fallback: &Path) -> Error {
    let path = err.path().unwrap_or(fallback).to_path_buf();
    Error::io(io::Error::from(err), path, "walk")
}

/// Whether a directory walk failed because something vanished
pub(crate) fn is_vanished(err: &walkdir::Error) -> bool {
    err.io_error()
        .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}
