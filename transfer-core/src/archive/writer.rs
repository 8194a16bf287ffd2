//! Snapshot archive production.
//!
//! Archives are written to a hidden `.partial` file inside the archive
//! root and renamed into place once complete, so listings and purges never
//! see a half-written archive.

use super::manifest::{
    EntityKind, PayloadDigest, TransferManifest, MANIFEST_ENTRY, SCHEMA_VERSION,
};
use super::policy::{ArchiveName, FilenamePolicy};
use super::{ArchiveCatalog, ArchiveInfo};
use crate::config::LimitsConfig;
use crate::store::EntityStore;
use crate::utils::errors::{Result, TransferError};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use tar::{Builder, Header};

const MAX_NAME_ATTEMPTS: u32 = 100;

/// Result of an export.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedArchive {
    #[serde(flatten)]
    pub info: ArchiveInfo,
    pub entity_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    policy: FilenamePolicy,
    limits: LimitsConfig,
}

impl ArchiveWriter {
    pub fn new(policy: FilenamePolicy, limits: LimitsConfig) -> Self {
        Self { policy, limits }
    }

    /// Snapshot every known entity kind from `store` into a new archive.
    ///
    /// Fails without writing anything if a record serializes to more than
    /// `max_record_bytes`, since such an archive could never be applied.
    pub fn export(&self, store: &dyn EntityStore, now: DateTime<Utc>) -> Result<ExportedArchive> {
        let max = self.limits.max_record_bytes;
        let mut payloads = Vec::with_capacity(EntityKind::KNOWN.len());
        for kind in EntityKind::KNOWN {
            let records = store.export(&kind)?;
            let mut buf = Vec::new();
            for record in &records {
                let start = buf.len();
                serde_json::to_writer(&mut buf, &record.body)?;
                let size = (buf.len() - start) as u64;
                if size > max {
                    return Err(TransferError::RecordTooLarge {
                        kind: kind.to_string(),
                        id: record.id.clone(),
                        size,
                        max,
                    });
                }
                buf.push(b'\n');
            }
            payloads.push((kind, buf, records.len() as u64));
        }

        let name = self.next_name(now)?;
        let manifest = self.write_atomically(&name, now, &payloads)?;
        let info = ArchiveCatalog::describe(&name)?;

        tracing::info!(
            filename = %name,
            size_bytes = info.size_bytes,
            "[Export] Archive created"
        );

        Ok(ExportedArchive {
            info,
            entity_counts: manifest.counts_by_name(),
        })
    }

    fn next_name(&self, now: DateTime<Utc>) -> Result<ArchiveName> {
        let stamp = now.format("%Y-%m-%d-%H%M%S");
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let filename = if attempt == 0 {
                format!("backup-{}.tar.gz", stamp)
            } else {
                format!("backup-{}-{}.tar.gz", stamp, attempt)
            };
            let name = self.policy.validate(&filename)?;
            if !name.path().exists() {
                return Ok(name);
            }
        }
        Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free archive name for {}", stamp),
        )))
    }

    fn write_atomically(
        &self,
        name: &ArchiveName,
        now: DateTime<Utc>,
        payloads: &[(EntityKind, Vec<u8>, u64)],
    ) -> Result<TransferManifest> {
        let partial = self.policy.root().join(format!(".{}.partial", name));
        let result = File::create(&partial)
            .map_err(TransferError::from)
            .and_then(|file| write_archive(file, now, payloads))
            .and_then(|(file, manifest)| {
                file.sync_all()?;
                std::fs::rename(&partial, name.path())?;
                Ok(manifest)
            });

        if result.is_err() {
            let _ = std::fs::remove_file(&partial);
        }
        result
    }
}

/// Write a complete archive for `payloads` (kind, jsonl bytes, record count)
/// and return the writer with the manifest that was embedded.
pub fn write_archive<W: Write>(
    writer: W,
    created_at: DateTime<Utc>,
    payloads: &[(EntityKind, Vec<u8>, u64)],
) -> Result<(W, TransferManifest)> {
    let paths: Vec<String> = payloads.iter().map(|(kind, _, _)| kind.entry_path()).collect();
    let mut digest = PayloadDigest::new();
    let mut entity_counts = BTreeMap::new();
    for ((kind, bytes, count), path) in payloads.iter().zip(&paths) {
        digest.start_entry(path);
        digest.update(bytes);
        entity_counts.insert(kind.clone(), *count);
    }

    let manifest = TransferManifest {
        schema_version: SCHEMA_VERSION,
        created_at,
        entity_counts,
        checksum: digest.finish(),
    };
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

    let mut entries: Vec<(&str, &[u8])> = vec![(MANIFEST_ENTRY, manifest_bytes.as_slice())];
    for ((_, bytes, _), path) in payloads.iter().zip(&paths) {
        entries.push((path.as_str(), bytes.as_slice()));
    }

    let writer = write_entries_at(writer, &entries, created_at)?;
    Ok((writer, manifest))
}

/// Write raw `(path, bytes)` entries as a gzip-compressed tar stream.
pub(crate) fn write_entries<W: Write>(writer: W, entries: &[(&str, &[u8])]) -> Result<W> {
    write_entries_at(writer, entries, Utc::now())
}

fn write_entries_at<W: Write>(
    writer: W,
    entries: &[(&str, &[u8])],
    mtime: DateTime<Utc>,
) -> Result<W> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = Builder::new(encoder);

    for (path, data) in entries {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_mtime(mtime.timestamp().max(0) as u64);
        header.set_cksum();
        builder.append_data(&mut header, path, *data)?;
    }

    let mut writer = builder.into_inner()?.finish()?;
    writer.flush()?;
    Ok(writer)
}
