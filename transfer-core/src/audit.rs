//! Audit trail for destructive and data-producing operations.
//!
//! Recording is best-effort: a failing sink is logged and the operation
//! that triggered it still succeeds.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Apply,
    Purge,
    Export,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Apply => "apply",
            AuditAction::Purge => "purge",
            AuditAction::Export => "export",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub operator: String,
    /// `None` for operations that span the whole archive root
    pub filename: Option<String>,
    pub metadata: Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        action: AuditAction,
        operator: impl Into<String>,
        filename: Option<String>,
        metadata: Value,
    ) -> Self {
        Self {
            action,
            operator: operator.into(),
            filename,
            metadata,
            recorded_at: Utc::now(),
        }
    }
}

/// Append-only destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Recorded,
    Dropped,
}

/// Append `entry`, logging instead of failing when the sink refuses it.
pub fn record(sink: &dyn AuditSink, entry: &AuditEntry) -> AuditOutcome {
    match sink.append(entry) {
        Ok(()) => AuditOutcome::Recorded,
        Err(e) => {
            tracing::warn!(
                action = %entry.action,
                operator = %entry.operator,
                filename = ?entry.filename,
                error = %e,
                "[Audit] Failed to record entry"
            );
            AuditOutcome::Dropped
        }
    }
}
