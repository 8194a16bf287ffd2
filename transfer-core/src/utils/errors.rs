//! Error taxonomy for archive inspection, restore and retention.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid archive filename: {0}")]
    InvalidFilename(String),

    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("Archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("Archive checksum mismatch (declared {expected}, computed {actual})")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Archive schema version {found} is not supported (supported {min}..={max})")]
    SchemaVersionMismatch { found: u32, min: u32, max: u32 },

    /// Apply stopped inside `failed_kind`. Kinds listed in `committed`
    /// stay applied.
    #[error("Apply failed while restoring {failed_kind}: {reason}")]
    PartialApplyFailure {
        failed_kind: String,
        reason: String,
        committed: BTreeMap<String, u64>,
        warnings: Vec<String>,
    },

    #[error("Restore unlock token is missing, invalid or expired")]
    TokenInvalidOrExpired,

    #[error("Another restore is already in progress")]
    ApplyInProgress,

    #[error("{kind} record {id:?} is {size} bytes, limit is {max}")]
    RecordTooLarge {
        kind: String,
        id: String,
        size: u64,
        max: u64,
    },

    #[error("Invalid retention count: {0}")]
    InvalidRetention(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransferError {
    /// True when the caller can fix the request (bad name, bad archive,
    /// locked restore). False for server-side failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidFilename(_)
                | TransferError::ArchiveNotFound(_)
                | TransferError::ArchiveCorrupt(_)
                | TransferError::ChecksumMismatch { .. }
                | TransferError::SchemaVersionMismatch { .. }
                | TransferError::TokenInvalidOrExpired
                | TransferError::ApplyInProgress
                | TransferError::InvalidRetention(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
