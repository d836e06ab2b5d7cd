//! On-disk entry format and validation
//!
//! An entry is a decimal length, a NUL byte, `length` bytes of payload, then
//! the 20-byte node the entry claims to hold. Anything after the node (such as
//! ancestry metadata) is opaque to the cache:
//!
//! ```text
//! <len>\0<payload: len bytes><node: 20 bytes><trailer...>
//! ```

use crate::key::{NODE_LEN, NodeHash};
use std::fmt;

/// Why raw bytes are not a well-formed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDefect {
    /// No NUL separator after the length prefix
    MissingSeparator,
    /// The length prefix is not a non-negative decimal integer
    BadLength,
    /// Fewer bytes follow the separator than the header promises
    Truncated,
}

impl fmt::Display for EntryDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSeparator => f.write_str("missing length separator"),
            Self::BadLength => f.write_str("unparsable length prefix"),
            Self::Truncated => f.write_str("truncated entry"),
        }
    }
}

/// Borrowed view over a parsed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryView<'a> {
    /// Opaque payload bytes
    pub payload: &'a [u8],
    /// Node embedded after the payload
    pub identity: &'a [u8; NODE_LEN],
    /// Bytes following the identity
    pub trailer: &'a [u8],
}

impl<'a> EntryView<'a> {
    /// Parse raw entry bytes
    ///
    /// # Errors
    ///
    /// Returns the defect if the bytes are not a complete entry
    pub fn parse(raw: &'a [u8]) -> Result<Self, EntryDefect> {
        let sep = raw
            .iter()
            .position(|&b| b == 0)
            .ok_or(EntryDefect::MissingSeparator)?;
        let (header, rest) = (&raw[..sep], &raw[sep + 1..]);

        if header.is_empty() || !header.iter().all(u8::is_ascii_digit) {
            return Err(EntryDefect::BadLength);
        }
        let length: usize = std::str::from_utf8(header)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(EntryDefect::BadLength)?;

        let identity_end = length
            .checked_add(NODE_LEN)
            .ok_or(EntryDefect::BadLength)?;
        if rest.len() < identity_end {
            return Err(EntryDefect::Truncated);
        }

        let identity = rest[length..identity_end]
            .try_into()
            .map_err(|_| EntryDefect::Truncated)?;
        Ok(Self {
            payload: &rest[..length],
            identity,
            trailer: &rest[identity_end..],
        })
    }

    /// Hex form of the embedded identity
    #[must_use]
    pub fn identity_hex(&self) -> String {
        hex::encode(self.identity)
    }
}

/// Check that `raw` is a complete entry whose embedded node hex-matches
/// `expected_hex` exactly.
#[must_use]
pub fn validate(raw: &[u8], expected_hex: &str) -> bool {
    EntryView::parse(raw).is_ok_and(|view| view.identity_hex() == expected_hex)
}

/// Build entry bytes for `payload` stored under `node`
#[must_use]
pub fn encode_entry(payload: &[u8], node: &NodeHash, trailer: &[u8]) -> Vec<u8> {
    let header = payload.len().to_string();
    let mut out = Vec::with_capacity(header.len() + 1 + payload.len() + NODE_LEN + trailer.len());
    out.extend_from_slice(header.as_bytes());
    out.push(0);
    out.extend_from_slice(payload);
    out.extend_from_slice(node.as_bytes());
    out.extend_from_slice(trailer);
    out
}
