//! Garbage collection for the blob cache
//!
//! One pass over the cache root in two phases:
//!
//! 1. **Sweep**: every file is stat'ed. Files named in the keep-set or
//!    accessed within the grace period are protected; everything else is
//!    deleted on the spot.
//! 2. **Trim**: while the protected files exceed the size limit, the least
//!    recently accessed one is deleted. Recent access does not protect a file
//!    here.
//!
//! Other processes may delete files at any point during the run. A file that
//! is gone when we stat or delete it is logged and skipped, never an error.

use crate::key::{Addressing, BlobKey};
use crate::registry::REPOS_FILE;
use crate::walk::{is_vanished, relative_key, walk_error};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Default grace period: files accessed within the last day survive the sweep
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60 * 60 * 24);

/// GC policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcPolicy {
    /// Maximum total size of entries kept after the run
    pub size_limit: u64,
    /// Recently accessed files are protected from the sweep for this long
    pub grace_period: Duration,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            size_limit: crate::config::DEFAULT_CACHE_LIMIT,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Result of a GC run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    /// Files encountered during the walk
    pub files_seen: usize,
    /// Files this run deleted
    pub removed: usize,
    /// Files another process deleted while we were looking at them
    pub vanished: usize,
    /// Total size of the files stat'ed, in bytes
    pub original_size: u64,
    /// Size of the protected files left after trimming, in bytes
    pub final_size: u64,
}

/// Cache-relative paths that must survive the sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepSet(HashSet<String>);

impl KeepSet {
    /// Empty keep-set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Protect a cache-relative path
    pub fn insert(&mut self, rel_path: impl Into<String>) {
        self.0.insert(rel_path.into());
    }

    /// Protect `key` as laid out by `addressing`
    pub fn insert_key(&mut self, addressing: &Addressing, key: &BlobKey) {
        self.0.insert(addressing.relative_path(key));
    }

    /// Whether `rel_path` is protected
    #[must_use]
    pub fn contains(&self, rel_path: &str) -> bool {
        self.0.contains(rel_path)
    }

    /// Number of protected paths
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is protected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for KeepSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Size and last access time of a cache file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStat {
    /// Size in bytes
    pub size: u64,
    /// Last access time
    pub accessed: SystemTime,
}

/// Filesystem operations the collector performs on individual files
pub trait CacheFs {
    /// Stat a file
    fn stat(&self, path: &Path) -> io::Result<EntryStat>;

    /// Delete a file
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// [`CacheFs`] backed by the real filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl CacheFs for OsFs {
    fn stat(&self, path: &Path) -> io::Result<EntryStat> {
        let meta = fs::symlink_metadata(path)?;
        // Fall back to mtime where the platform does not track access times
        let accessed = meta.accessed().or_else(|_| meta.modified())?;
        Ok(EntryStat {
            size: meta.len(),
            accessed,
        })
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// A protected file waiting for the trim phase, ordered oldest first
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    accessed: SystemTime,
    key: String,
    path: PathBuf,
    size: u64,
}

enum Removal {
    Removed,
    Vanished,
}

/// Two-phase garbage collector over a cache root
#[derive(Debug, Clone)]
pub struct GarbageCollector<F = OsFs> {
    root: PathBuf,
    policy: GcPolicy,
    fs: F,
}

impl GarbageCollector<OsFs> {
    /// Collector for the cache rooted at `root` with the default policy
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            policy: GcPolicy::default(),
            fs: OsFs,
        }
    }
}

impl<F: CacheFs> GarbageCollector<F> {
    /// Use `policy` for this collector
    #[must_use]
    pub fn with_policy(mut self, policy: GcPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Route file operations through `fs`
    #[must_use]
    pub fn with_fs<G: CacheFs>(self, fs: G) -> GarbageCollector<G> {
        GarbageCollector {
            root: self.root,
            policy: self.policy,
            fs,
        }
    }

    /// Run garbage collection, protecting the paths in `keep`
    ///
    /// # Errors
    ///
    /// Returns error on I/O failures other than files vanishing mid-run
    pub fn run(&self, keep: &KeepSet) -> Result<GcReport> {
        let mut report = GcReport::default();
        if !self.root.is_dir() {
            debug!(root = %self.root.display(), "Cache root does not exist, nothing to collect");
            return Ok(report);
        }

        let now = SystemTime::now();
        let cutoff = now
            .checked_sub(self.policy.grace_period)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut queue = BinaryHeap::new();
        let mut live_size = 0u64;

        for item in WalkDir::new(&self.root).follow_links(false) {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) if is_vanished(&e) => {
                    warn!(
                        path = %e.path().unwrap_or(self.root.as_path()).display(),
                        "Directory was removed by another process"
                    );
                    continue;
                }
                Err(e) => return Err(walk_error(e, &self.root)),
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = relative_key(&self.root, entry.path()) else {
                continue;
            };
            if key == REPOS_FILE {
                continue;
            }

            report.files_seen += 1;
            let path = entry.into_path();
            let stat = match self.fs.stat(&path) {
                Ok(stat) => stat,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "File was removed by another process");
                    report.vanished += 1;
                    continue;
                }
                Err(e) => return Err(Error::io(e, &path, "metadata")),
            };
            report.original_size += stat.size;

            if keep.contains(&key) || stat.accessed > cutoff {
                live_size += stat.size;
                queue.push(Reverse(Candidate {
                    accessed: stat.accessed,
                    key,
                    path,
                    size: stat.size,
                }));
                continue;
            }

            match self.remove(&path)? {
                Removal::Removed => {
                    debug!(key = %key, size = stat.size, "Removed unneeded cache file");
                    report.removed += 1;
                }
                Removal::Vanished => report.vanished += 1,
            }
        }

        let limit = self.policy.size_limit;
        if live_size > limit {
            info!(
                size_bytes = live_size,
                limit_bytes = limit,
                excess_bytes = live_size - limit,
                "Enforcing cache limit"
            );
        }
        while live_size > limit {
            let Some(Reverse(oldest)) = queue.pop() else {
                break;
            };
            match self.remove(&oldest.path)? {
                Removal::Removed => {
                    debug!(key = %oldest.key, size = oldest.size, "Evicted cache file over limit");
                    report.removed += 1;
                }
                Removal::Vanished => report.vanished += 1,
            }
            live_size = live_size.saturating_sub(oldest.size);
        }
        report.final_size = live_size;

        info!(
            root = %self.root.display(),
            files_seen = report.files_seen,
            removed = report.removed,
            vanished = report.vanished,
            original_bytes = report.original_size,
            final_bytes = report.final_size,
            "Cache garbage collection finished"
        );
        Ok(report)
    }

    fn remove(&self, path: &Path) -> Result<Removal> {
        match self.fs.remove(path) {
            Ok(()) => Ok(Removal::Removed),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "File was removed by another process");
                Ok(Removal::Vanished)
            }
            Err(e) => Err(Error::io(e, path, "remove_file")),
        }
    }
}
