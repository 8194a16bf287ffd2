//! Snapshot archives: naming policy, manifest, reading and writing.

pub mod manifest;
pub mod policy;
pub mod reader;
pub mod writer;

use crate::utils::errors::{Result, TransferError};
use chrono::{DateTime, Utc};
use policy::{ArchiveName, FilenamePolicy};
use serde::Serialize;

/// An archive present in the archive root.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveInfo {
    #[serde(rename = "filename")]
    pub name: ArchiveName,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Enumerates the archives of one root.
#[derive(Debug, Clone)]
pub struct ArchiveCatalog {
    policy: FilenamePolicy,
}

impl ArchiveCatalog {
    pub fn new(policy: FilenamePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FilenamePolicy {
        &self.policy
    }

    /// Metadata of a single validated archive.
    pub fn describe(name: &ArchiveName) -> Result<ArchiveInfo> {
        let meta = match std::fs::metadata(name.path()) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(TransferError::ArchiveNotFound(name.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::ArchiveNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let created_at: DateTime<Utc> = meta.modified()?.into();

        Ok(ArchiveInfo {
            name: name.clone(),
            size_bytes: meta.len(),
            created_at,
        })
    }

    /// All archives that pass the filename policy, newest first.
    ///
    /// Ties on creation time fall back to the filename, descending, so
    /// date-stamped names keep their order on coarse filesystems.
    pub fn list(&self) -> Result<Vec<ArchiveInfo>> {
        let mut archives = Vec::new();

        for entry in std::fs::read_dir(self.policy.root())? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };

            let name = match self.policy.validate(file_name) {
                Ok(name) => name,
                Err(TransferError::InvalidFilename(_)) => {
                    tracing::debug!(file = %file_name, "Ignoring non-archive entry");
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Entries can vanish between read_dir and stat.
            match Self::describe(&name) {
                Ok(info) => archives.push(info),
                Err(TransferError::ArchiveNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        archives.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.as_str().cmp(a.name.as_str()))
        });

        Ok(archives)
    }
}
