//! Configuration for the transfer subsystem.
//!
//! Loaded from a TOML file; every section and field has a default so a
//! partial file (or none at all) is valid.

use crate::utils::errors::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Directory holding every archive. Nothing outside it is ever read.
    #[serde(default = "default_archive_root")]
    pub archive_root: PathBuf,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub unlock: UnlockConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Number of newest archives a purge keeps when no count is given
    #[serde(default = "default_keep")]
    pub keep: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockConfig {
    /// Lifetime of an issued restore unlock token
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,

    /// How far in the future a token's issue time may lie
    #[serde(default = "default_clock_skew_secs")]
    pub max_clock_skew_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Upper bound for the `manifest.json` entry
    #[serde(default = "default_max_manifest_bytes")]
    pub max_manifest_bytes: u64,

    /// Upper bound for a single JSON record line
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: u64,
}

fn default_archive_root() -> PathBuf {
    PathBuf::from("/var/lib/platform/backups")
}

fn default_keep() -> usize {
    7
}

fn default_ttl_secs() -> i64 {
    10 * 60
}

fn default_clock_skew_secs() -> i64 {
    5 * 60
}

fn default_max_manifest_bytes() -> u64 {
    1024 * 1024 // 1MB
}

fn default_max_record_bytes() -> u64 {
    4 * 1024 * 1024 // 4MB
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { keep: default_keep() }
    }
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_clock_skew_secs: default_clock_skew_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_manifest_bytes: default_max_manifest_bytes(),
            max_record_bytes: default_max_record_bytes(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            archive_root: default_archive_root(),
            retention: RetentionConfig::default(),
            unlock: UnlockConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TransferConfig = toml::from_str(&content)
            .map_err(|e| TransferError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at `archive_root`
    pub fn with_root(archive_root: impl Into<PathBuf>) -> Self {
        Self {
            archive_root: archive_root.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.retention.keep == 0 {
            return Err(TransferError::Config("retention.keep must be at least 1".into()));
        }
        if self.unlock.ttl_secs <= 0 {
            return Err(TransferError::Config("unlock.ttl_secs must be positive".into()));
        }
        if self.limits.max_manifest_bytes == 0 || self.limits.max_record_bytes == 0 {
            return Err(TransferError::Config("limits must be non-zero".into()));
        }
        Ok(())
    }
}
