use crate::db::connection::DbPool;
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension};
use transfer_core::store::{
    EntityRecord, EntityStore, StoreError, StoreUnit, UpsertError, UpsertOutcome,
};
use transfer_core::EntityKind;

type Conn = PooledConnection<SqliteConnectionManager>;

fn table(kind: &EntityKind) -> Result<&'static str, StoreError> {
    match kind {
        EntityKind::Users => Ok("users"),
        EntityKind::Groups => Ok("groups"),
        EntityKind::Memberships => Ok("memberships"),
        EntityKind::Events => Ok("events"),
        EntityKind::Posts => Ok("posts"),
        EntityKind::Unknown(name) => Err(StoreError::Backend(format!(
            "no table for entity kind {}",
            name
        ))),
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_foreign_key_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

/// `INSERT ... ON CONFLICT(id) DO UPDATE` covering the id, every reference
/// column of the kind and the JSON body.
fn upsert_sql(table: &str, references: &[(&str, EntityKind)]) -> String {
    let mut columns = vec!["id"];
    columns.extend(references.iter().map(|(field, _)| *field));
    columns.push("body");

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = columns[1..]
        .iter()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();

    format!(
        "INSERT INTO \"{}\" ({}, updated_at) VALUES ({}, datetime('now')) \
         ON CONFLICT(id) DO UPDATE SET {}, updated_at = excluded.updated_at",
        table,
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
}

/// Relational [`EntityStore`]: one SQLite transaction per unit.
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<Conn, StoreError> {
        self.pool
            .get()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl EntityStore for SqliteStore {
    fn begin(&self, kind: &EntityKind) -> Result<Box<dyn StoreUnit + '_>, StoreError> {
        let table = table(kind)?;
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(backend)?;

        Ok(Box::new(SqliteUnit {
            conn,
            kind: kind.clone(),
            table,
            upsert_sql: upsert_sql(table, kind.references()),
            open: true,
        }))
    }

    fn count(&self, kind: &EntityKind) -> Result<u64, StoreError> {
        let table = table(kind)?;
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| {
                row.get(0)
            })
            .map_err(backend)?;
        Ok(n as u64)
    }

    fn export(&self, kind: &EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        let table = table(kind)?;
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT body FROM \"{}\" ORDER BY id", table))
            .map_err(backend)?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(backend)?;

        let mut records = Vec::new();
        for body in bodies {
            let body = body.map_err(backend)?;
            let record = EntityRecord::from_json(body.as_bytes())
                .map_err(|e| StoreError::Backend(format!("unreadable {} row: {}", table, e)))?;
            records.push(record);
        }
        Ok(records)
    }
}

struct SqliteUnit {
    conn: Conn,
    kind: EntityKind,
    table: &'static str,
    upsert_sql: String,
    open: bool,
}

impl SqliteUnit {
    fn exists(&self, table: &str, id: &str) -> Result<bool, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT 1 FROM \"{}\" WHERE id = ?1", table),
                params![id],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
            .map_err(backend)
    }

    /// Describe the reference that made an insert fail.
    fn dangling_reference(&self, record: &EntityRecord) -> String {
        for (field, target) in self.kind.references() {
            let Some(target_id) = record.reference(field) else {
                continue;
            };
            let Ok(target_table) = table(target) else {
                continue;
            };
            if !self.exists(target_table, target_id).unwrap_or(true) {
                return format!("{} references missing {} {}", field, target, target_id);
            }
        }
        "foreign key constraint failed".into()
    }

    fn finish(&mut self, sql: &str) -> Result<(), StoreError> {
        self.conn.execute_batch(sql).map_err(backend)?;
        self.open = false;
        Ok(())
    }
}

impl StoreUnit for SqliteUnit {
    fn upsert(&mut self, record: &EntityRecord) -> Result<UpsertOutcome, UpsertError> {
        let existed = self.exists(self.table, &record.id)?;

        let mut values = vec![SqlValue::Text(record.id.clone())];
        for (field, _) in self.kind.references() {
            values.push(match record.reference(field) {
                Some(id) => SqlValue::Text(id.to_string()),
                None => SqlValue::Null,
            });
        }
        values.push(SqlValue::Text(
            serde_json::Value::Object(record.body.clone()).to_string(),
        ));

        let result = self
            .conn
            .prepare_cached(&self.upsert_sql)
            .and_then(|mut stmt| stmt.execute(params_from_iter(values)));

        match result {
            Ok(_) if existed => Ok(UpsertOutcome::Updated),
            Ok(_) => Ok(UpsertOutcome::Created),
            Err(e) if is_foreign_key_violation(&e) => {
                Err(UpsertError::Skippable(self.dangling_reference(record)))
            }
            Err(e) => Err(UpsertError::Fatal(backend(e))),
        }
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT")
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK")
    }
}

impl Drop for SqliteUnit {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(kind = %self.kind, "Failed to roll back abandoned unit: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> anyhow::Result<(TempDir, SqliteStore)> {
        let dir = TempDir::new()?;
        let pool = create_pool(&dir.path().join("test.db").to_string_lossy())?;
        migrate(&pool)?;
        Ok((dir, SqliteStore::new(pool)))
    }

    fn record(value: serde_json::Value) -> EntityRecord {
        EntityRecord::from_json(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_upsert_sql_shape() {
        let sql = upsert_sql("memberships", EntityKind::Memberships.references());
        assert!(sql.starts_with(
            "INSERT INTO \"memberships\" (id, user_id, group_id, body, updated_at) VALUES (?1, ?2, ?3, ?4,"
        ));
        assert!(sql.contains("user_id = excluded.user_id"));
        assert!(sql.contains("ON CONFLICT(id) DO UPDATE"));
    }

    #[test]
    fn test_unit_commit_and_update() -> anyhow::Result<()> {
        let (_dir, store) = store()?;

        let mut unit = store.begin(&EntityKind::Users)?;
        assert_eq!(unit.upsert(&record(json!({"id": "u1", "name": "a"})))?, UpsertOutcome::Created);
        unit.commit()?;

        let mut unit = store.begin(&EntityKind::Users)?;
        assert_eq!(unit.upsert(&record(json!({"id": "u1", "name": "b"})))?, UpsertOutcome::Updated);
        unit.commit()?;

        assert_eq!(store.count(&EntityKind::Users)?, 1);
        let exported = store.export(&EntityKind::Users)?;
        assert_eq!(exported[0].body["name"], json!("b"));
        Ok(())
    }

    #[test]
    fn test_rollback_and_drop_discard_writes() -> anyhow::Result<()> {
        let (_dir, store) = store()?;

        let mut unit = store.begin(&EntityKind::Users)?;
        unit.upsert(&record(json!({"id": "u1"})))?;
        unit.rollback()?;

        {
            let mut unit = store.begin(&EntityKind::Users)?;
            unit.upsert(&record(json!({"id": "u2"})))?;
        }

        assert_eq!(store.count(&EntityKind::Users)?, 0);
        Ok(())
    }

    #[test]
    fn test_missing_reference_is_skippable() -> anyhow::Result<()> {
        let (_dir, store) = store()?;

        let mut unit = store.begin(&EntityKind::Users)?;
        unit.upsert(&record(json!({"id": "u1"})))?;
        unit.commit()?;

        let mut unit = store.begin(&EntityKind::Groups)?;
        unit.upsert(&record(json!({"id": "g1", "owner_id": "u1"})))?;
        match unit.upsert(&record(json!({"id": "g2", "owner_id": "ghost"}))) {
            Err(UpsertError::Skippable(reason)) => assert!(reason.contains("ghost")),
            other => panic!("expected skippable, got {other:?}"),
        }
        unit.commit()?;

        assert_eq!(store.count(&EntityKind::Groups)?, 1);
        Ok(())
    }

    #[test]
    fn test_unknown_kind_has_no_table() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        assert!(store.begin(&EntityKind::Unknown("badges".into())).is_err());
        Ok(())
    }
}
