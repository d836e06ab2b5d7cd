//! Error types for the blob cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for blob cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed: {}", path.display())]
    #[diagnostic(
        code(blobcache::io),
        help("Check file permissions and available disk space for the cache directory")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error
        path: Box<Path>,
        /// Operation that failed (e.g., "read", "rename", "create_dir")
        operation: String,
    },

    /// Blob is not cached, or its cached copy failed validation
    #[error("Blob {key} not cached at {}: {detail}", path.display())]
    #[diagnostic(
        code(blobcache::not_found),
        help("Fetch the blob from the remote server and put it into the cache")
    )]
    NotFound {
        /// The requested key, as `name:hex`
        key: String,
        /// Path the entry was expected at
        path: Box<Path>,
        /// Why the lookup missed
        detail: String,
    },

    /// A freshly written entry did not pass validation
    #[error("Local cache write was corrupted: {}", path.display())]
    #[diagnostic(
        code(blobcache::corrupt_write),
        help("The entry was quarantined with a .corrupt suffix; check the payload and the underlying storage")
    )]
    CorruptWrite {
        /// Path of the entry that failed verification
        path: Box<Path>,
    },

    /// Malformed blob name, hash, or tenant id
    #[error("Invalid cache key: {message}")]
    #[diagnostic(code(blobcache::invalid_key))]
    InvalidKey {
        /// What was wrong with the key
        message: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(blobcache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an invalid key error
    #[must_use]
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: path.as_ref().into(),
            operation: operation.into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(
        key: impl Into<String>,
        path: impl AsRef<Path>,
        detail: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            key: key.into(),
            path: path.as_ref().into(),
            detail: detail.into(),
        }
    }

    /// Create a corruption-on-write error
    #[must_use]
    pub fn corrupt_write(path: impl AsRef<Path>) -> Self {
        Self::CorruptWrite {
            path: path.as_ref().into(),
        }
    }

    /// Whether callers should treat this error as a plain cache miss
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for blob cache operations
pub type Result<T> = std::result::Result<T, Error>;
