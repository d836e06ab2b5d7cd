//! Cache key derivation
//!
//! Maps a `(name, node)` pair to a path relative to the cache root. The leaf
//! filename is always the lowercase hex form of the node, and the directories
//! above it are derived from a SHA-256 of the blob name:
//!
//! ```text
//! shared:  <repo>/<nh[0:2]>/<nh[2:]>/<hex(node)>
//! local:   <nh[0:2]>/<nh[2:]>/<hex(node)>
//! ```
//!
//! where `nh` is `hex(sha256(name))`. Components are always joined with `/` so
//! the relative path doubles as the identifier the garbage collector compares
//! against its keep-set.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a node hash in bytes
pub const NODE_LEN: usize = 20;

/// A 20-byte content hash identifying one version of a blob
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHash([u8; NODE_LEN]);

impl NodeHash {
    /// Wrap a raw 20-byte hash
    #[must_use]
    pub const fn new(bytes: [u8; NODE_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice
    ///
    /// # Errors
    ///
    /// Returns error if the slice is not exactly 20 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; NODE_LEN] = bytes.try_into().map_err(|_| {
            Error::invalid_key(format!(
                "node hash must be {NODE_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    /// Create from a 40 character hex string
    ///
    /// # Errors
    ///
    /// Returns error if the string is not valid hex of the right length
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != NODE_LEN * 2 {
            return Err(Error::invalid_key(format!(
                "node hash must be {} hex characters, got {}",
                NODE_LEN * 2,
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| Error::invalid_key(format!("node hash is not valid hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    /// Raw bytes of the hash
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NODE_LEN] {
        &self.0
    }

    /// Lowercase hex form, as used for entry filenames
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHash({})", self.to_hex())
    }
}

/// A `(name, node)` pair identifying a cached blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobKey {
    name: String,
    node: NodeHash,
}

impl BlobKey {
    /// Create a key for a blob
    ///
    /// # Errors
    ///
    /// Returns error if `name` is empty
    pub fn new(name: impl Into<String>, node: NodeHash) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::invalid_key("blob name must not be empty"));
        }
        Ok(Self { name, node })
    }

    /// The blob's file name within its repository
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The blob's content hash
    #[must_use]
    pub const fn node(&self) -> NodeHash {
        self.node
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.node)
    }
}

/// How keys are laid out under the cache root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// Pooled across repositories; entries live under a per-repo directory
    Shared {
        /// Repository identifier partitioning the shared cache
        repo: String,
    },
    /// Private to one repository
    Local,
}

impl Addressing {
    /// Shared addressing for the given repository id
    ///
    /// # Errors
    ///
    /// Returns error if the id is empty, `.`/`..`, or contains a path separator
    pub fn shared(repo: impl Into<String>) -> Result<Self> {
        let repo = repo.into();
        if repo.is_empty() || repo == "." || repo == ".." {
            return Err(Error::invalid_key(format!(
                "repository id {repo:?} is not usable as a directory name"
            )));
        }
        if repo.contains(['/', '\\']) {
            return Err(Error::invalid_key(format!(
                "repository id {repo:?} must not contain path separators"
            )));
        }
        Ok(Self::Shared { repo })
    }

    /// Whether this is the shared layout
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        matches!(self, Self::Shared { .. })
    }

    /// Relative path of `key` under the cache root
    #[must_use]
    pub fn relative_path(&self, key: &BlobKey) -> String {
        let name_hash = hex::encode(Sha256::digest(key.name().as_bytes()));
        let (fanout, rest) = name_hash.split_at(2);
        let node = key.node().to_hex();
        match self {
            Self::Shared { repo } => format!("{repo}/{fanout}/{rest}/{node}"),
            Self::Local => format!("{fanout}/{rest}/{node}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeHash {
        NodeHash::new([byte; NODE_LEN])
    }

    #[test]
    fn test_node_hash_hex_roundtrip() {
        let hex = "0123456789abcdef0123456789abcdef01234567";
        let node = NodeHash::from_hex(hex).unwrap();
        assert_eq!(node.to_hex(), hex);
        assert_eq!(node.to_string(), hex);
    }

    #[test]
    fn test_node_hash_rejects_wrong_length() {
        assert!(NodeHash::from_slice(&[0u8; 19]).is_err());
        assert!(NodeHash::from_slice(&[0u8; 21]).is_err());
        assert!(NodeHash::from_hex("abc").is_err());
        assert!(NodeHash::from_hex("zz23456789abcdef0123456789abcdef01234567").is_err());
    }

    #[test]
    fn test_blob_key_rejects_empty_name() {
        assert!(matches!(
            BlobKey::new("", node(1)),
            Err(Error::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_shared_rejects_bad_repo_ids() {
        assert!(Addressing::shared("").is_err());
        assert!(Addressing::shared("..").is_err());
        assert!(Addressing::shared("a/b").is_err());
        assert!(Addressing::shared("fbsource").is_ok());
    }

    #[test]
    fn test_shared_layout() {
        let key = BlobKey::new("src/main.rs", node(0xab)).unwrap();
        let path = Addressing::shared("myrepo").unwrap().relative_path(&key);
        let parts: Vec<&str> = path.split('/').collect();

        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "myrepo");
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2].len(), 62);
        assert_eq!(parts[3], "ab".repeat(20));
    }

    #[test]
    fn test_local_layout_omits_repo() {
        let key = BlobKey::new("README", node(7)).unwrap();
        let shared = Addressing::shared("r").unwrap().relative_path(&key);
        let local = Addressing::Local.relative_path(&key);

        assert_eq!(shared, format!("r/{local}"));
        assert_eq!(local.split('/').count(), 3);
    }

    #[test]
    fn test_distinct_inputs_distinct_paths() {
        let a = BlobKey::new("a.txt", node(1)).unwrap();
        let b = BlobKey::new("b.txt", node(1)).unwrap();
        let c = BlobKey::new("a.txt", node(2)).unwrap();
        let addressing = Addressing::Local;

        assert_ne!(addressing.relative_path(&a), addressing.relative_path(&b));
        assert_ne!(addressing.relative_path(&a), addressing.relative_path(&c));
    }
}
