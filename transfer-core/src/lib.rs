//! Transfer Core Library
//!
//! Snapshot archives of the platform's data: filename policy, inspection,
//! restore, retention and the restore unlock gate.

pub mod apply;
pub mod archive;
pub mod audit;
pub mod config;
pub mod retention;
pub mod service;
pub mod store;
pub mod unlock;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use apply::{ApplyOptions, TransferApplier, TransferApplyResult};
pub use archive::manifest::{EntityKind, TransferManifest};
pub use archive::policy::{ArchiveName, FilenamePolicy};
pub use archive::reader::{ArchiveInspection, ArchiveReader, InspectReport};
pub use archive::ArchiveInfo;
pub use audit::{AuditAction, AuditEntry, AuditOutcome, AuditSink};
pub use config::TransferConfig;
pub use retention::{RetentionPurger, RetentionResult};
pub use service::{TransferService, UnlockStatus};
pub use store::{EntityRecord, EntityStore, StoreError, StoreUnit, UpsertError, UpsertOutcome};
pub use unlock::{UnlockClaim, UnlockSecret, UnlockVerifier};
pub use utils::errors::TransferError;
pub type Result<T> = std::result::Result<T, TransferError>;
