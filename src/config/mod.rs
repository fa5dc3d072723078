//! Configuration module
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion, human-readable sizes and validation.
//!
//! # Example
//!
//! ```yaml
//! backend:
//!   bucket: my-bucket
//!   region: us-east-1
//!   endpoint: http://localhost:9000
//!   access_key: ${AWS_ACCESS_KEY_ID}
//!   secret_key: ${AWS_SECRET_ACCESS_KEY}
//! upload:
//!   partition_size: 8MB
//!   concurrency: 4
//! ```

use lazy_static::lazy_static;
use regex_lite::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

lazy_static! {
    static ref SIZE: Regex = Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*([A-Za-z]*)\s*$").unwrap();
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// ============================================================================
// Human-readable sizes
// ============================================================================

/// A size in bytes, parsed from strings like `8MB`, `512k` or `1.5GB`.
///
/// Units are 1024 multiples; a trailing `B` is optional and case is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn mib(n: u64) -> Self {
        ByteSize(n * 1024 * 1024)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::ValidationError(format!("Invalid size '{}'", s));

        let cap = SIZE.captures(s).ok_or_else(invalid)?;
        let number = cap.get(1).ok_or_else(invalid)?.as_str();
        let unit = cap.get(2).map_or("", |m| m.as_str()).to_ascii_lowercase();

        let multiplier: u64 = match unit.as_str() {
            "" | "b" => 1,
            "k" | "kb" => 1 << 10,
            "m" | "mb" => 1 << 20,
            "g" | "gb" => 1 << 30,
            "t" | "tb" => 1 << 40,
            "p" | "pb" => 1 << 50,
            _ => return Err(invalid()),
        };

        if let Ok(whole) = number.parse::<u64>() {
            return whole.checked_mul(multiplier).map(ByteSize).ok_or_else(invalid);
        }

        let value: f64 = number.parse().map_err(|_| invalid())?;
        let bytes = value * multiplier as f64;
        if !bytes.is_finite() || bytes > u64::MAX as f64 {
            return Err(invalid());
        }
        Ok(ByteSize(bytes as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(&str, u64); 4] = [("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10), ("B", 1)];
        for (unit, size) in UNITS {
            if self.0 >= size && self.0 % size == 0 {
                return write!(f, "{}{}", self.0 / size, unit);
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(n) => Ok(ByteSize(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

// ============================================================================
// Configuration structures
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub backend: S3Config,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.bucket.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Backend bucket cannot be empty".into(),
            ));
        }

        if self.backend.region.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Backend region cannot be empty".into(),
            ));
        }

        if let Some(ref endpoint) = self.backend.endpoint {
            if !is_valid_http_url(endpoint) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid endpoint '{}': must start with http:// or https://",
                    endpoint
                )));
            }
        }

        self.upload.validate()
    }
}

/// S3 backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
}

/// Upload stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Bytes buffered before they are promoted to a multipart part
    #[serde(default = "default_partition_size")]
    pub partition_size: ByteSize,
    /// Part uploads allowed in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Directory for scratch files; platform default when unset
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl UploadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_size.as_u64() == 0 {
            return Err(ConfigError::ValidationError(
                "partition_size must be positive".into(),
            ));
        }
        if usize::try_from(self.partition_size.as_u64()).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "partition_size {} does not fit in memory",
                self.partition_size
            )));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Partition size in bytes
    ///
    /// Only meaningful on a validated configuration.
    pub fn partition_bytes(&self) -> usize {
        usize::try_from(self.partition_size.as_u64()).unwrap_or(usize::MAX)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            partition_size: default_partition_size(),
            concurrency: default_concurrency(),
            scratch_dir: None,
        }
    }
}

fn default_partition_size() -> ByteSize {
    ByteSize::mib(64)
}

fn default_concurrency() -> usize {
    4
}
