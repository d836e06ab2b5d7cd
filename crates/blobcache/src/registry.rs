//! Registry of repositories using a shared cache
//!
//! A flat `repos` file at the cache root, one repository directory per line.
//! Writers only ever append; consumers deduplicate when they read it back.

use crate::perms::{self, CreateMode};
use crate::{Error, Result};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File name of the registry under the cache root
pub const REPOS_FILE: &str = "repos";

/// Append-only list of repositories depending on a cache
#[derive(Debug, Clone)]
pub struct RepoRegistry {
    path: PathBuf,
    modes: CreateMode,
}

impl RepoRegistry {
    /// Registry for the cache rooted at `root`
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(REPOS_FILE),
            modes: CreateMode::default(),
        }
    }

    /// Override the permission bits used for the registry file
    #[must_use]
    pub fn with_modes(mut self, modes: CreateMode) -> Self {
        self.modes = modes;
        self
    }

    /// Path of the registry file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append the directory containing `repo_path` to the registry
    ///
    /// `repo_path` is usually the repository's metadata directory, so its
    /// parent is the working copy. Duplicate lines are expected.
    pub fn mark_repo(&self, repo_path: &Path) -> Result<()> {
        if let Some(root) = self.path.parent() {
            perms::create_dir_all(root, self.modes.dir)?;
        }

        let dir = repo_path.parent().unwrap_or_else(|| Path::new(""));
        let line = format!("{}\n", dir.to_string_lossy());
        perms::append_line(&self.path, &line, self.modes.file)?;

        tracing::debug!(repo = %dir.display(), registry = %self.path.display(), "Marked repository");
        Ok(())
    }

    /// Every registered repository, in registration order, duplicates included
    pub fn repos(&self) -> Result<Vec<PathBuf>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(e, &self.path, "read")),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Registered repositories with duplicates removed, first occurrence wins
    pub fn unique_repos(&self) -> Result<Vec<PathBuf>> {
        let mut seen = HashSet::new();
        Ok(self
            .repos()?
            .into_iter()
            .filter(|repo| seen.insert(repo.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mark_repo_creates_registry() {
        let tmp = TempDir::new().unwrap();
        let registry = RepoRegistry::new(tmp.path());

        registry.mark_repo(Path::new("/work/project/.hg")).unwrap();

        let content = fs::read_to_string(tmp.path().join(REPOS_FILE)).unwrap();
        assert_eq!(content, "/work/project\n");
    }

    #[test]
    fn test_mark_repo_appends() {
        let tmp = TempDir::new().unwrap();
        let registry = RepoRegistry::new(tmp.path());

        registry.mark_repo(Path::new("/work/a/.hg")).unwrap();
        registry.mark_repo(Path::new("/work/a/.hg")).unwrap();
        registry.mark_repo(Path::new("/work/b/.hg")).unwrap();

        assert_eq!(
            registry.repos().unwrap(),
            vec![
                PathBuf::from("/work/a"),
                PathBuf::from("/work/a"),
                PathBuf::from("/work/b"),
            ]
        );
        assert_eq!(
            registry.unique_repos().unwrap(),
            vec![PathBuf::from("/work/a"), PathBuf::from("/work/b")]
        );
    }

    #[test]
    fn test_repos_empty_when_absent() {
        let tmp = TempDir::new().unwrap();
        let registry = RepoRegistry::new(tmp.path());
        assert!(registry.repos().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_registry_is_group_writable() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let registry = RepoRegistry::new(tmp.path());
        registry.mark_repo(Path::new("/work/a/.hg")).unwrap();

        let mode = fs::metadata(registry.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o664);
    }
}
