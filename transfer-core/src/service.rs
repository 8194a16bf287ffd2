//! Single entry point over the transfer subsystem.
//!
//! Every filename handed in from outside passes the [`FilenamePolicy`]
//! here before any other component sees it. Successful exports, restores
//! and purges are written to the audit sink.

use crate::apply::leases::ArchiveLeases;
use crate::apply::{ApplyOptions, TransferApplier, TransferApplyResult};
use crate::archive::policy::{ArchiveName, FilenamePolicy};
use crate::archive::reader::{ArchiveReader, InspectReport};
use crate::archive::writer::{ArchiveWriter, ExportedArchive};
use crate::archive::{ArchiveCatalog, ArchiveInfo};
use crate::audit::{self, AuditAction, AuditEntry, AuditSink};
use crate::config::TransferConfig;
use crate::retention::{RetentionPurger, RetentionResult};
use crate::store::EntityStore;
use crate::unlock::{IssuedToken, UnlockSecret, UnlockVerifier};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Whether the presented cookie currently unlocks restores.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockStatus {
    pub unlocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct TransferService {
    config: TransferConfig,
    catalog: ArchiveCatalog,
    reader: ArchiveReader,
    writer: ArchiveWriter,
    applier: TransferApplier,
    purger: RetentionPurger,
    unlock: UnlockVerifier,
    store: Arc<dyn EntityStore>,
    audit: Arc<dyn AuditSink>,
}

impl TransferService {
    /// Build the service, creating the archive root if needed.
    pub fn new(
        config: TransferConfig,
        secret: UnlockSecret,
        store: Arc<dyn EntityStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.archive_root)?;

        let policy = FilenamePolicy::new(&config.archive_root);
        let leases = ArchiveLeases::new();
        let reader = ArchiveReader::new(config.limits.clone());
        let catalog = ArchiveCatalog::new(policy.clone());

        tracing::info!(
            archive_root = %config.archive_root.display(),
            keep = config.retention.keep,
            "Transfer service ready"
        );

        Ok(Self {
            writer: ArchiveWriter::new(policy, config.limits.clone()),
            applier: TransferApplier::new(reader.clone(), store.clone(), leases.clone()),
            purger: RetentionPurger::new(catalog.clone(), leases, config.retention.keep),
            unlock: UnlockVerifier::new(secret, config.unlock.clone()),
            catalog,
            reader,
            store,
            audit,
            config,
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn resolve(&self, filename: &str) -> Result<ArchiveName> {
        self.catalog.policy().validate(filename)
    }

    pub fn list(&self) -> Result<Vec<ArchiveInfo>> {
        self.catalog.list()
    }

    /// Read-only inspection. A tampered payload is reported through
    /// `checksum_valid`, not as an error.
    pub fn inspect(&self, filename: &str) -> Result<InspectReport> {
        let name = self.resolve(filename)?;
        let inspection = self.reader.inspect(&name)?;
        Ok(InspectReport::new(&name, &inspection))
    }

    /// Validated path and metadata of an archive about to be streamed.
    pub fn resolve_download(&self, filename: &str) -> Result<ArchiveInfo> {
        let name = self.resolve(filename)?;
        ArchiveCatalog::describe(&name)
    }

    pub fn export(&self, operator: &str) -> Result<ExportedArchive> {
        let exported = self.writer.export(self.store.as_ref(), Utc::now())?;

        audit::record(
            self.audit.as_ref(),
            &AuditEntry::new(
                AuditAction::Export,
                operator,
                Some(exported.info.name.to_string()),
                json!({
                    "sizeBytes": exported.info.size_bytes,
                    "entityCounts": exported.entity_counts,
                }),
            ),
        );
        Ok(exported)
    }

    /// Restore `filename`. The unlock token is checked before the name is
    /// even looked at.
    pub fn apply(
        &self,
        filename: &str,
        operator: &str,
        token: Option<&str>,
    ) -> Result<TransferApplyResult> {
        let claim = self.unlock.require(token, Utc::now())?;
        let name = self.resolve(filename)?;

        let result = self.applier.apply(
            &name,
            ApplyOptions {
                claim: &claim,
                operator,
            },
        )?;

        audit::record(
            self.audit.as_ref(),
            &AuditEntry::new(
                AuditAction::Apply,
                operator,
                Some(result.filename.clone()),
                json!({
                    "schemaVersion": result.schema_version,
                    "entityCounts": result.entity_counts,
                    "warnings": result.warnings.len(),
                }),
            ),
        );
        Ok(result)
    }

    pub fn purge(&self, keep: Option<usize>, operator: &str) -> Result<RetentionResult> {
        let result = self.purger.purge(keep)?;

        audit::record(
            self.audit.as_ref(),
            &AuditEntry::new(
                AuditAction::Purge,
                operator,
                None,
                json!({
                    "keep": keep.unwrap_or(self.purger.default_keep()),
                    "deletedFilenames": result.deleted_filenames,
                    "skipped": result.skipped.len(),
                }),
            ),
        );
        Ok(result)
    }

    pub fn issue_unlock(&self) -> Result<IssuedToken> {
        let issued = self.unlock.issue(Utc::now())?;
        tracing::info!(expires_at = %issued.expires_at, "[Unlock] Restore unlock issued");
        Ok(issued)
    }

    pub fn unlock_status(&self, token: Option<&str>) -> UnlockStatus {
        match token.and_then(|t| self.unlock.verify(t, Utc::now())) {
            Some(claim) => UnlockStatus {
                unlocked: true,
                expires_at: Some(claim.expires_at()),
            },
            None => UnlockStatus {
                unlocked: false,
                expires_at: None,
            },
        }
    }

    /// Lifetime of issued tokens, for cookie expiry.
    pub fn unlock_ttl_secs(&self) -> i64 {
        self.unlock.ttl().num_seconds()
    }
}
