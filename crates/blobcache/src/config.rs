//! Cache configuration
//!
//! The host tool owns how these values are loaded; this module only defines
//! their shape and how they are interpreted.

use crate::key::Addressing;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default total size budget: 1000 GiB, effectively unbounded
pub const DEFAULT_CACHE_LIMIT: u64 = 1000 * GIB;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// When cached entries are checked against their embedded node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ValidationMode {
    /// Never validate
    Off,
    /// Validate on read and after write
    #[default]
    On,
    /// Also validate during existence checks
    Strict,
}

impl ValidationMode {
    /// Parse a mode name, falling back to [`ValidationMode::On`] for unknown values
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Self::Off,
            "on" => Self::On,
            "strict" => Self::Strict,
            other => {
                tracing::warn!(value = other, "Unknown cache validation mode, using 'on'");
                Self::On
            }
        }
    }

    /// Whether reads and writes are verified
    #[must_use]
    pub const fn validates_data(self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Whether existence checks also read and verify entries
    #[must_use]
    pub const fn validates_existence(self) -> bool {
        matches!(self, Self::Strict)
    }
}

impl From<String> for ValidationMode {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ValidationMode> for String {
    fn from(mode: ValidationMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::On => "on",
            Self::Strict => "strict",
        })
    }
}

/// A byte budget given either as a plain number or as text like `"10 GB"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawByteSize", into = "u64")]
pub struct ByteSize(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawByteSize {
    Bytes(u64),
    Text(String),
}

impl TryFrom<RawByteSize> for ByteSize {
    type Error = Error;

    fn try_from(raw: RawByteSize) -> Result<Self> {
        match raw {
            RawByteSize::Bytes(n) => Ok(Self(n)),
            RawByteSize::Text(s) => parse_byte_size(&s).map(Self),
        }
    }
}

impl From<ByteSize> for u64 {
    fn from(size: ByteSize) -> Self {
        size.0
    }
}

/// Parse a human byte size such as `"512"`, `"64kb"`, `"1.5 GB"`.
///
/// Units are 1024-based and case-insensitive.
pub fn parse_byte_size(text: &str) -> Result<u64> {
    let trimmed = text.trim().to_ascii_lowercase();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let multiplier = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => KIB,
        "m" | "mb" => MIB,
        "g" | "gb" => GIB,
        "t" | "tb" => TIB,
        other => {
            return Err(Error::configuration(format!(
                "unknown size unit {other:?} in {text:?}"
            )));
        }
    };

    let invalid = || Error::configuration(format!("invalid byte size {text:?}"));
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    // Digits past this are below one byte even for terabytes
    let fraction = &fraction[..fraction.len().min(18)];
    let digits = |part: &str| -> Result<u128> {
        if part.is_empty() {
            Ok(0)
        } else {
            part.parse().map_err(|_| invalid())
        }
    };

    let multiplier = u128::from(multiplier);
    let whole_bytes = digits(whole)?.checked_mul(multiplier);
    // Fractional bytes are truncated
    let scale = fraction.bytes().fold(1u128, |scale, _| scale * 10);
    let fraction_bytes = digits(fraction)? * multiplier / scale;
    whole_bytes
        .and_then(|bytes| bytes.checked_add(fraction_bytes))
        .and_then(|bytes| u64::try_from(bytes).ok())
        .ok_or_else(|| Error::configuration(format!("byte size {text:?} is out of range")))
}

/// Settings for one blob store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Cache root directory
    pub path: PathBuf,

    /// Repository id partitioning a shared cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,

    /// Whether this store is pooled across repositories
    #[serde(default = "default_shared")]
    pub shared: bool,

    /// Entry validation mode
    #[serde(default)]
    pub validate_cache: ValidationMode,

    /// Append-only log of detected corruption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_cache_log: Option<PathBuf>,

    /// Total size budget enforced by garbage collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_limit: Option<ByteSize>,

    /// Group (name or numeric id) that owns a newly created shared root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_group: Option<String>,
}

fn default_shared() -> bool {
    true
}

impl CacheConfig {
    /// Shared cache at `path` with default settings
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            repo_name: None,
            shared: true,
            validate_cache: ValidationMode::default(),
            validate_cache_log: None,
            cache_limit: None,
            cache_group: None,
        }
    }

    /// Size budget, defaulting to [`DEFAULT_CACHE_LIMIT`]
    #[must_use]
    pub fn cache_limit_bytes(&self) -> u64 {
        self.cache_limit.map_or(DEFAULT_CACHE_LIMIT, u64::from)
    }

    /// Key layout implied by `shared` and `repo_name`
    ///
    /// # Errors
    ///
    /// Returns error if a shared store has no usable repository id
    pub fn addressing(&self) -> Result<Addressing> {
        if !self.shared {
            return Ok(Addressing::Local);
        }
        let repo = self
            .repo_name
            .as_deref()
            .ok_or_else(|| Error::configuration("a shared cache requires repoName"))?;
        Addressing::shared(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_mode_parse() {
        assert_eq!(ValidationMode::parse("off"), ValidationMode::Off);
        assert_eq!(ValidationMode::parse("ON"), ValidationMode::On);
        assert_eq!(ValidationMode::parse("strict"), ValidationMode::Strict);
    }

    #[test]
    fn test_unknown_validation_mode_falls_back_to_on() {
        assert_eq!(ValidationMode::parse("paranoid"), ValidationMode::On);
        assert_eq!(ValidationMode::parse(""), ValidationMode::On);
    }

    #[test]
    fn test_validation_mode_flags() {
        assert!(!ValidationMode::Off.validates_data());
        assert!(ValidationMode::On.validates_data());
        assert!(!ValidationMode::On.validates_existence());
        assert!(ValidationMode::Strict.validates_existence());
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("512").unwrap(), 512);
        assert_eq!(parse_byte_size("64kb").unwrap(), 64 * 1024);
        assert_eq!(parse_byte_size("10 GB").unwrap(), 10 * GIB);
        assert_eq!(parse_byte_size("1.5m").unwrap(), 3 * MIB / 2);
        assert_eq!(parse_byte_size("1000 GB").unwrap(), DEFAULT_CACHE_LIMIT);
    }

    #[test]
    fn test_parse_byte_size_rejects_garbage() {
        assert!(parse_byte_size("lots").is_err());
        assert!(parse_byte_size("5 parsecs").is_err());
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size(".").is_err());
        assert!(parse_byte_size("1.2.3 gb").is_err());
    }

    #[test]
    fn test_parse_byte_size_fractions_truncate() {
        assert_eq!(parse_byte_size("2.5kb").unwrap(), 2560);
        assert_eq!(parse_byte_size(".5k").unwrap(), 512);
        assert_eq!(parse_byte_size("0.5").unwrap(), 0);
        assert_eq!(parse_byte_size("1.0000000000000000000001 tb").unwrap(), TIB);
    }

    #[test]
    fn test_parse_byte_size_rejects_out_of_range() {
        assert_eq!(parse_byte_size("16777215tb").unwrap(), 16_777_215 * TIB);
        for text in [
            "16777216tb",
            "99999999999tb",
            "18446744073709551616",
            "99999999999999999999999999999999999999999999 b",
        ] {
            let err = parse_byte_size(text).unwrap_err();
            assert!(matches!(err, Error::Configuration { .. }), "{text}");
        }
    }

    #[test]
    fn test_addressing() {
        let mut config = CacheConfig::new("/tmp/cache");
        assert!(config.addressing().is_err());

        config.repo_name = Some("repo".into());
        assert!(config.addressing().unwrap().is_shared());

        config.shared = false;
        assert_eq!(config.addressing().unwrap(), Addressing::Local);
    }

    #[test]
    fn test_default_limit() {
        let config = CacheConfig::new("/tmp/cache");
        assert_eq!(config.cache_limit_bytes(), DEFAULT_CACHE_LIMIT);
    }
}
