//! Shared on-disk cache for file blobs fetched from a remote server
//!
//! This crate provides the cache engine that many checkouts on one machine
//! share:
//! - Deterministic key derivation from a blob's name and node hash
//! - Entry validation against the node embedded in each entry
//! - Lock-free atomic insertion and quarantine of corrupt entries
//! - A registry of repositories using the cache
//! - Two-phase garbage collection under a total size budget
//!
//! # Overview
//!
//! Callers ask [`BlobStore::get_missing`] which blobs they still need to
//! fetch, [`BlobStore::put`] what they fetched, and read entries back with
//! [`BlobStore::get_data`]. Periodically, tooling that knows which blobs the
//! registered working copies still need runs [`BlobStore::gc`] with that
//! keep-set.
//!
//! # Concurrency
//!
//! Unrelated processes share the cache directory without coordination.
//! Publishing relies on rename atomicity, and a file disappearing because
//! another process removed it is always treated as benign.

#![expect(
    clippy::missing_errors_doc,
    reason = "every fallible function returns the crate Error; variants are documented there"
)]

pub mod config;
pub mod entry;
mod error;
pub mod gc;
pub mod key;
pub mod perms;
pub mod registry;
pub mod store;
pub mod walk;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use config::{ByteSize, CacheConfig, DEFAULT_CACHE_LIMIT, ValidationMode, parse_byte_size};
pub use entry::{EntryDefect, EntryView, encode_entry, validate};
pub use gc::{
    CacheFs, DEFAULT_GRACE_PERIOD, EntryStat, GarbageCollector, GcPolicy, GcReport, KeepSet, OsFs,
};
pub use key::{Addressing, BlobKey, NODE_LEN, NodeHash};
pub use perms::CreateMode;
pub use registry::{REPOS_FILE, RepoRegistry};
pub use store::{BlobStore, CORRUPT_SUFFIX, OLD_SUFFIX, ValidationPhase};
pub use walk::{DataFile, ShallowWalker, StoreWalker, decode_dir};
