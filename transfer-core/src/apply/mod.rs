//! Restore of a snapshot archive into the entity store.
//!
//! Each entity kind is applied through a single store unit: either every
//! upsert of the kind commits or none does. Kinds are applied in
//! [`EntityKind`] order and a failure stops the restore without undoing
//! kinds that already committed. Upserts make a repeated restore converge,
//! so an interrupted restore is retried by applying the same archive again.

pub mod leases;

use crate::archive::manifest::EntityKind;
use crate::archive::policy::ArchiveName;
use crate::archive::reader::{ArchiveReader, RecordStreamError};
use crate::store::{EntityRecord, EntityStore, UpsertError, UpsertOutcome};
use crate::unlock::UnlockClaim;
use crate::utils::errors::{Result, TransferError};
use chrono::{DateTime, Utc};
use leases::ArchiveLeases;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::sync::{Arc, Mutex, TryLockError};

/// Caller-side facts the applier relies on without re-checking.
///
/// `claim` is the caller's evidence that a current unlock token was
/// presented; the applier trusts it and performs no authorization itself.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions<'a> {
    pub claim: &'a UnlockClaim,
    pub operator: &'a str,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindTally {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl KindTally {
    pub fn applied(&self) -> u64 {
        self.created + self.updated
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferApplyResult {
    pub filename: String,
    pub schema_version: u32,
    /// Records created or updated per kind
    pub entity_counts: BTreeMap<String, u64>,
    pub breakdown: BTreeMap<String, KindTally>,
    pub warnings: Vec<String>,
    pub applied_at: DateTime<Utc>,
}

pub struct TransferApplier {
    reader: ArchiveReader,
    store: Arc<dyn EntityStore>,
    leases: ArchiveLeases,
    gate: Mutex<()>,
}

impl TransferApplier {
    pub fn new(reader: ArchiveReader, store: Arc<dyn EntityStore>, leases: ArchiveLeases) -> Self {
        Self {
            reader,
            store,
            leases,
            gate: Mutex::new(()),
        }
    }

    /// Restore `name` into the store. Only one restore runs at a time;
    /// a second concurrent call fails with `ApplyInProgress`.
    pub fn apply(&self, name: &ArchiveName, options: ApplyOptions<'_>) -> Result<TransferApplyResult> {
        let _running = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(TransferError::ApplyInProgress),
        };

        // The lease keeps purges away; the open handle keeps the bytes
        // readable even if the file is unlinked anyway.
        let _lease = self.leases.acquire(name);
        let file = self.reader.open(name)?;

        let inspection = self.reader.inspect_file(&file)?;
        inspection.require_valid_checksum()?;
        inspection.manifest.check_schema()?;

        tracing::info!(
            filename = %name,
            operator = %options.operator,
            unlock_expires_at = %options.claim.expires_at(),
            "[Apply] Restore started"
        );

        let mut warnings = Vec::new();
        let mut entity_counts = BTreeMap::new();
        let mut breakdown = BTreeMap::new();

        for (kind, declared) in &inspection.manifest.entity_counts {
            if !kind.is_known() {
                warnings.push(format!(
                    "skipped {} records of unknown entity kind {}",
                    declared, kind
                ));
                continue;
            }

            match self.apply_kind(&file, kind, &mut warnings) {
                Ok(tally) => {
                    tracing::info!(
                        filename = %name,
                        kind = %kind,
                        created = tally.created,
                        updated = tally.updated,
                        skipped = tally.skipped,
                        "[Apply] Kind committed"
                    );
                    entity_counts.insert(kind.to_string(), tally.applied());
                    breakdown.insert(kind.to_string(), tally);
                }
                Err(reason) => {
                    tracing::error!(
                        filename = %name,
                        kind = %kind,
                        reason = %reason,
                        "[Apply] Kind rolled back, restore aborted"
                    );
                    return Err(TransferError::PartialApplyFailure {
                        failed_kind: kind.to_string(),
                        reason,
                        committed: entity_counts,
                        warnings,
                    });
                }
            }
        }

        for warning in &warnings {
            tracing::warn!(filename = %name, "[Apply] {}", warning);
        }

        Ok(TransferApplyResult {
            filename: name.to_string(),
            schema_version: inspection.manifest.schema_version,
            entity_counts,
            breakdown,
            warnings,
            applied_at: Utc::now(),
        })
    }

    /// Apply one kind inside one unit. `Err` carries the reason the unit
    /// was rolled back.
    fn apply_kind(
        &self,
        file: &File,
        kind: &EntityKind,
        warnings: &mut Vec<String>,
    ) -> std::result::Result<KindTally, String> {
        let mut unit = self
            .store
            .begin(kind)
            .map_err(|e| format!("could not open store unit: {}", e))?;
        let mut tally = KindTally::default();

        let streamed = self.reader.stream_records(file, kind, |line_no, bytes| {
            let record = match EntityRecord::from_json(bytes) {
                Ok(record) => record,
                Err(reason) => {
                    tally.skipped += 1;
                    warnings.push(format!("{} line {}: {}", kind, line_no, reason));
                    return Ok(());
                }
            };

            match unit.upsert(&record) {
                Ok(UpsertOutcome::Created) => tally.created += 1,
                Ok(UpsertOutcome::Updated) => tally.updated += 1,
                Err(UpsertError::Skippable(reason)) => {
                    tally.skipped += 1;
                    warnings.push(format!("{} {}: {}", kind, record.id, reason));
                }
                Err(UpsertError::Fatal(e)) => {
                    return Err(format!("{} {}: {}", kind, record.id, e));
                }
            }
            Ok(())
        });

        let reason = match streamed {
            Ok(_) => {
                return unit
                    .commit()
                    .map(|_| tally)
                    .map_err(|e| format!("commit failed: {}", e));
            }
            Err(RecordStreamError::Archive(e)) => e.to_string(),
            Err(RecordStreamError::Aborted(reason)) => reason,
        };

        if let Err(e) = unit.rollback() {
            tracing::warn!(kind = %kind, error = %e, "[Apply] Rollback reported an error");
        }
        Err(reason)
    }
}
