use crate::db::connection::DbPool;
use rusqlite::params;
use transfer_core::audit::{AuditEntry, AuditSink};
use uuid::Uuid;

/// Appends audit entries to the `audit_log` table.
pub struct SqliteAuditSink {
    pool: DbPool,
}

impl SqliteAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl AuditSink for SqliteAuditSink {
    fn append(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO audit_log (id, action, operator, filename, metadata, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                entry.action.as_str(),
                entry.operator,
                entry.filename,
                entry.metadata.to_string(),
                entry.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}
