//! Blob store: existence checks, reads, and atomic writes
//!
//! Many unrelated processes may use the same cache root at once, and no locks
//! are taken. Writes go to a temporary file in the destination directory and
//! are renamed into place, so a path that exists always holds a complete
//! entry. Entries are read-only once published.
//!
//! ## Directory Structure
//!
//! ```text
//! <root>/
//!   repos                                    registry of repositories using the cache
//!   <repo>/<nh[0:2]>/<nh[2:]>/<node>         entry (shared layout)
//!   <repo>/<nh[0:2]>/<nh[2:]>/<node>_old     previous copy after a rewrite
//!   <repo>/<nh[0:2]>/<nh[2:]>/<node>.corrupt quarantined entry
//! ```

use crate::config::{CacheConfig, ValidationMode};
use crate::entry;
use crate::gc::{GarbageCollector, GcPolicy, GcReport, KeepSet};
use crate::key::{Addressing, BlobKey};
use crate::perms::{self, CreateMode};
use crate::registry::RepoRegistry;
use crate::{Error, Result};
use chrono::Utc;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffix of quarantined entries
pub const CORRUPT_SUFFIX: &str = ".corrupt";

/// Suffix of the copy kept when an entry is rewritten
pub const OLD_SUFFIX: &str = "_old";

/// Prefix of in-flight temporary files
const TEMP_PREFIX: &str = ".tmp-";

/// Where a corrupt entry was noticed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPhase {
    /// While serving a read
    Read,
    /// While verifying a fresh write
    Write,
}

impl fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// Content-addressed blob cache rooted at one directory
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    addressing: Addressing,
    validation: ValidationMode,
    audit_log: Option<PathBuf>,
    cache_limit: u64,
    modes: CreateMode,
    registry: RepoRegistry,
}

impl BlobStore {
    /// Create a store at `root` with default settings
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, addressing: Addressing) -> Self {
        let root = root.into();
        let modes = CreateMode::default();
        Self {
            registry: RepoRegistry::new(&root).with_modes(modes),
            root,
            addressing,
            validation: ValidationMode::default(),
            audit_log: None,
            cache_limit: crate::config::DEFAULT_CACHE_LIMIT,
            modes,
        }
    }

    /// Open a store from configuration
    ///
    /// A shared cache root is created if it does not exist yet, and handed to
    /// the configured cache group when there is one.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let mut store = Self::new(&config.path, config.addressing()?)
            .with_validation(config.validate_cache)
            .with_cache_limit(config.cache_limit_bytes());
        if let Some(log) = &config.validate_cache_log {
            store = store.with_audit_log(log);
        }
        if store.addressing.is_shared() && !store.root.exists() {
            perms::create_dir_all(&store.root, store.modes.dir)?;
            if let Some(group) = &config.cache_group {
                perms::share_with_group(&store.root, group, store.modes.dir)?;
            }
        }
        Ok(store)
    }

    /// Set the validation mode
    #[must_use]
    pub fn with_validation(mut self, mode: ValidationMode) -> Self {
        self.validation = mode;
        self
    }

    /// Record corruption events in `path`
    #[must_use]
    pub fn with_audit_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log = Some(path.into());
        self
    }

    /// Set the size budget used by [`BlobStore::gc`]
    #[must_use]
    pub fn with_cache_limit(mut self, bytes: u64) -> Self {
        self.cache_limit = bytes;
        self
    }

    /// Override the permission bits used for created paths
    #[must_use]
    pub fn with_modes(mut self, modes: CreateMode) -> Self {
        self.modes = modes;
        self.registry = self.registry.with_modes(modes);
        self
    }

    /// Cache root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Key layout of this store
    #[must_use]
    pub fn addressing(&self) -> &Addressing {
        &self.addressing
    }

    /// Absolute path of the entry for `key`
    #[must_use]
    pub fn entry_path(&self, key: &BlobKey) -> PathBuf {
        self.root.join(self.addressing.relative_path(key))
    }

    /// Return the keys that are not cached, in input order
    ///
    /// In strict mode an entry only counts as present if it validates. Nothing
    /// on disk is modified.
    #[must_use]
    pub fn get_missing(&self, keys: &[BlobKey]) -> Vec<BlobKey> {
        keys.iter()
            .filter(|key| !self.contains(key))
            .cloned()
            .collect()
    }

    fn contains(&self, key: &BlobKey) -> bool {
        let path = self.entry_path(key);
        if !path.exists() {
            return false;
        }
        if !self.validation.validates_existence() {
            return true;
        }
        match fs::read(&path) {
            Ok(data) if entry::validate(&data, &key.node().to_hex()) => true,
            Ok(_) => {
                warn!(path = %path.display(), key = %key, "Cache entry failed validation during contains check");
                false
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Cache entry unreadable during contains check");
                false
            }
        }
    }

    /// Read the cached entry for `key`
    ///
    /// A missing entry and one that fails validation both produce
    /// [`Error::NotFound`]; the latter is quarantined first.
    pub fn get_data(&self, key: &BlobKey) -> Result<Vec<u8>> {
        let path = self.entry_path(key);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found(key.to_string(), &path, "no file found"));
            }
            Err(e) => return Err(Error::io(e, &path, "read")),
        };

        if self.validation.validates_data() && !entry::validate(&data, &key.node().to_hex()) {
            self.quarantine(&path, ValidationPhase::Read);
            return Err(Error::not_found(
                key.to_string(),
                &path,
                "corrupt local cache file",
            ));
        }

        debug!(key = %key, size = data.len(), "Cache hit");
        Ok(data)
    }

    /// Store `payload` as the entry for `key`
    ///
    /// An existing entry is kept as a `_old` sibling before being replaced.
    /// With validation enabled the written file is read back and checked; a
    /// failure quarantines it and returns [`Error::CorruptWrite`].
    pub fn put(&self, key: &BlobKey, payload: &[u8]) -> Result<()> {
        let path = self.entry_path(key);
        let dir = path
            .parent()
            .ok_or_else(|| Error::invalid_key(format!("entry path {} has no parent", path.display())))?;
        perms::create_dir_all(dir, self.modes.dir)?;

        self.backup_existing(&path)?;
        self.write_atomic(dir, &path, payload)?;

        if self.validation.validates_data() && !self.verify_written(&path, key)? {
            return Err(Error::corrupt_write(&path));
        }

        debug!(key = %key, path = %path.display(), size = payload.len(), "Cache entry stored");
        Ok(())
    }

    /// Keep-set protecting `keys` under this store's layout
    #[must_use]
    pub fn keep_set<'a>(&self, keys: impl IntoIterator<Item = &'a BlobKey>) -> KeepSet {
        let mut keep = KeepSet::new();
        for key in keys {
            keep.insert_key(&self.addressing, key);
        }
        keep
    }

    /// Run garbage collection over the whole cache root
    pub fn gc(&self, keep: &KeepSet) -> Result<GcReport> {
        let policy = GcPolicy {
            size_limit: self.cache_limit,
            ..GcPolicy::default()
        };
        GarbageCollector::new(&self.root)
            .with_policy(policy)
            .run(keep)
    }

    /// Record that the repository at `repo_path` uses this cache
    pub fn mark_repo(&self, repo_path: &Path) -> Result<()> {
        self.registry.mark_repo(repo_path)
    }

    /// The registry of repositories using this cache
    #[must_use]
    pub fn registry(&self) -> &RepoRegistry {
        &self.registry
    }

    fn backup_existing(&self, path: &Path) -> Result<()> {
        match fs::symlink_metadata(path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io(e, path, "metadata")),
        }

        // The previous backup is read-only, so it has to go before copying
        let backup = sibling(path, OLD_SUFFIX);
        remove_if_present(&backup)?;
        match fs::copy(path, &backup) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Existing entry removed by another process");
                return Ok(());
            }
            Err(e) => return Err(Error::io(e, &backup, "copy")),
        }
        remove_if_present(path)
    }

    fn write_atomic(&self, dir: &Path, path: &Path, payload: &[u8]) -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)
            .map_err(|e| Error::io(e, dir, "create_temp"))?;
        tmp.write_all(payload)
            .map_err(|e| Error::io(e, tmp.path(), "write"))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::io(e, tmp.path(), "sync"))?;
        perms::set_mode(tmp.path(), self.modes.readonly)?;

        tmp.persist(path)
            .map_err(|e| Error::io(e.error, path, "rename"))?;
        Ok(())
    }

    fn verify_written(&self, path: &Path, key: &BlobKey) -> Result<bool> {
        let data = fs::read(path).map_err(|e| Error::io(e, path, "read"))?;
        if entry::validate(&data, &key.node().to_hex()) {
            return Ok(true);
        }
        self.quarantine(path, ValidationPhase::Write);
        Ok(false)
    }

    /// Move a corrupt entry aside so it is never served again
    fn quarantine(&self, path: &Path, phase: ValidationPhase) {
        warn!(path = %path.display(), phase = %phase, "Corrupt cache entry detected");
        self.audit(path, phase);

        let target = sibling(path, CORRUPT_SUFFIX);
        let moved = match fs::rename(path, &target) {
            Ok(()) => return,
            // Another reader quarantined it first; its copy is the evidence
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    path = %path.display(),
                    "Corrupt cache entry already quarantined by another process"
                );
                return;
            }
            Err(e) => replace_quarantined(path, &target, e),
        };
        if let Err(e) = moved {
            warn!(
                path = %path.display(),
                error = %e,
                "Failed to quarantine corrupt cache entry"
            );
        }
    }

    fn audit(&self, path: &Path, phase: ValidationPhase) {
        let Some(log) = &self.audit_log else {
            return;
        };
        let line = format!(
            "{} corrupt {} during {phase}\n",
            Utc::now().to_rfc3339(),
            path.display()
        );
        if let Err(e) = perms::append_line(log, &line, self.modes.file) {
            warn!(log = %log.display(), error = %e, "Failed to append to validation log");
        }
    }
}

/// rename replaces an existing target on unix, so a failure there is final
#[cfg(unix)]
fn replace_quarantined(_path: &Path, _target: &Path, err: io::Error) -> io::Result<()> {
    Err(err)
}

/// rename refuses to replace an existing target here; drop the older copy first
#[cfg(not(unix))]
fn replace_quarantined(path: &Path, target: &Path, _err: io::Error) -> io::Result<()> {
    match fs::remove_file(target) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::rename(path, target)
}

/// `path` with `suffix` appended to its final component
#[must_use]
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(e, path, "remove_file")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::encode_entry;
    use crate::key::{NODE_LEN, NodeHash};
    use tempfile::TempDir;

    fn key(name: &str, byte: u8) -> BlobKey {
        BlobKey::new(name, NodeHash::new([byte; NODE_LEN])).unwrap()
    }

    fn store(tmp: &TempDir) -> BlobStore {
        BlobStore::new(tmp.path(), Addressing::shared("repo").unwrap())
    }

    #[test]
    fn test_entry_path_under_root() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let k = key("a.txt", 1);

        let path = store.entry_path(&k);
        assert!(path.starts_with(tmp.path().join("repo")));
        assert_eq!(path.file_name().unwrap(), k.node().to_hex().as_str());
    }

    #[test]
    fn test_sibling() {
        assert_eq!(
            sibling(Path::new("/c/ab/cd"), CORRUPT_SUFFIX),
            PathBuf::from("/c/ab/cd.corrupt")
        );
        assert_eq!(
            sibling(Path::new("/c/ab/cd"), OLD_SUFFIX),
            PathBuf::from("/c/ab/cd_old")
        );
    }

    #[test]
    fn test_put_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let k = key("a.txt", 1);
        store
            .put(&k, &encode_entry(b"data", &k.node(), b""))
            .unwrap();

        let dir = store.entry_path(&k).parent().unwrap().to_path_buf();
        let names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![k.node().to_hex()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_put_marks_entry_readonly() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let k = key("a.txt", 1);
        store
            .put(&k, &encode_entry(b"data", &k.node(), b""))
            .unwrap();

        let mode = fs::metadata(store.entry_path(&k))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o444);
    }

    #[test]
    fn test_quarantine_replaces_existing_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let k = key("a.txt", 1);
        let path = store.entry_path(&k);
        perms::create_dir_all(path.parent().unwrap(), 0o775).unwrap();

        fs::write(sibling(&path, CORRUPT_SUFFIX), b"older").unwrap();
        fs::write(&path, b"newer").unwrap();

        store.quarantine(&path, ValidationPhase::Read);

        assert!(!path.exists());
        assert_eq!(fs::read(sibling(&path, CORRUPT_SUFFIX)).unwrap(), b"newer");
    }

    #[test]
    fn test_racing_quarantine_keeps_evidence() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let k = key("a.txt", 1);
        let path = store.entry_path(&k);
        perms::create_dir_all(path.parent().unwrap(), 0o775).unwrap();
        fs::write(&path, b"garbage").unwrap();

        // Two readers detect the same corrupt entry
        store.quarantine(&path, ValidationPhase::Read);
        store.quarantine(&path, ValidationPhase::Read);

        assert!(!path.exists());
        assert_eq!(fs::read(sibling(&path, CORRUPT_SUFFIX)).unwrap(), b"garbage");
    }

    #[test]
    fn test_validation_phase_display() {
        assert_eq!(ValidationPhase::Read.to_string(), "read");
        assert_eq!(ValidationPhase::Write.to_string(), "write");
    }
}
