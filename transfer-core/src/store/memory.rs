//! In-process [`EntityStore`] for unit tests.
//!
//! Enforces the same foreign keys as the relational schema through
//! [`EntityKind::references`].

use super::{EntityRecord, EntityStore, StoreError, StoreUnit, UpsertError, UpsertOutcome};
use crate::archive::manifest::EntityKind;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

type Table = BTreeMap<String, Map<String, Value>>;

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<EntityKind, Table>>,
    mutations: Mutex<u64>,
    fatal_ids: Mutex<HashSet<(EntityKind, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert records directly, bypassing units and foreign-key checks.
    pub fn seed(&self, kind: EntityKind, records: impl IntoIterator<Item = EntityRecord>) {
        let mut tables = self.tables();
        let table = tables.entry(kind).or_default();
        for record in records {
            table.insert(record.id, record.body);
        }
    }

    /// Make any upsert of `id` within `kind` fail fatally.
    pub fn fail_on(&self, kind: EntityKind, id: &str) {
        lock(&self.fatal_ids).insert((kind, id.to_string()));
    }

    /// Number of records written by committed units
    pub fn mutations(&self) -> u64 {
        *lock(&self.mutations)
    }

    pub fn get(&self, kind: &EntityKind, id: &str) -> Option<Map<String, Value>> {
        self.tables().get(kind).and_then(|t| t.get(id)).cloned()
    }

    fn tables(&self) -> MutexGuard<'_, BTreeMap<EntityKind, Table>> {
        lock(&self.tables)
    }

    fn contains(&self, kind: &EntityKind, id: &str) -> bool {
        self.tables().get(kind).is_some_and(|t| t.contains_key(id))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EntityStore for MemoryStore {
    fn begin(&self, kind: &EntityKind) -> Result<Box<dyn StoreUnit + '_>, StoreError> {
        Ok(Box::new(MemoryUnit {
            store: self,
            kind: kind.clone(),
            staged: Table::new(),
        }))
    }

    fn count(&self, kind: &EntityKind) -> Result<u64, StoreError> {
        Ok(self.tables().get(kind).map_or(0, |t| t.len() as u64))
    }

    fn export(&self, kind: &EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        let tables = self.tables();
        let Some(table) = tables.get(kind) else {
            return Ok(Vec::new());
        };
        Ok(table
            .iter()
            .map(|(id, body)| EntityRecord {
                id: id.clone(),
                body: body.clone(),
            })
            .collect())
    }
}

struct MemoryUnit<'a> {
    store: &'a MemoryStore,
    kind: EntityKind,
    staged: Table,
}

impl StoreUnit for MemoryUnit<'_> {
    fn upsert(&mut self, record: &EntityRecord) -> Result<UpsertOutcome, UpsertError> {
        if lock(&self.store.fatal_ids).contains(&(self.kind.clone(), record.id.clone())) {
            return Err(UpsertError::Fatal(StoreError::Backend(format!(
                "constraint violation on {} {}",
                self.kind, record.id
            ))));
        }

        for (field, target) in self.kind.references() {
            if let Some(target_id) = record.reference(field) {
                if !self.store.contains(target, target_id) {
                    return Err(UpsertError::Skippable(format!(
                        "{} references missing {} {}",
                        field, target, target_id
                    )));
                }
            }
        }

        let existed =
            self.staged.contains_key(&record.id) || self.store.contains(&self.kind, &record.id);
        self.staged.insert(record.id.clone(), record.body.clone());

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryUnit { store, kind, staged } = *self;
        let written = staged.len() as u64;
        store.tables().entry(kind).or_default().extend(staged);
        *lock(&store.mutations) += written;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> EntityRecord {
        match value {
            Value::Object(body) => EntityRecord::new(body).unwrap(),
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_unit_is_invisible_until_commit() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut unit = store.begin(&EntityKind::Users)?;
        unit.upsert(&record(json!({"id": "u1"}))).unwrap();
        assert_eq!(store.count(&EntityKind::Users)?, 0);

        unit.commit()?;
        assert_eq!(store.count(&EntityKind::Users)?, 1);
        assert_eq!(store.mutations(), 1);
        Ok(())
    }

    #[test]
    fn test_rollback_discards_staged_records() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut unit = store.begin(&EntityKind::Users)?;
        unit.upsert(&record(json!({"id": "u1"}))).unwrap();
        unit.rollback()?;

        assert_eq!(store.count(&EntityKind::Users)?, 0);
        assert_eq!(store.mutations(), 0);
        Ok(())
    }

    #[test]
    fn test_upsert_reports_created_then_updated() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        store.seed(EntityKind::Users, [record(json!({"id": "u1", "username": "old"}))]);

        let mut unit = store.begin(&EntityKind::Users)?;
        assert_eq!(
            unit.upsert(&record(json!({"id": "u1", "username": "new"}))).unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(
            unit.upsert(&record(json!({"id": "u2"}))).unwrap(),
            UpsertOutcome::Created
        );
        unit.commit()?;

        assert_eq!(
            store.get(&EntityKind::Users, "u1").unwrap()["username"],
            json!("new")
        );
        Ok(())
    }

    #[test]
    fn test_dangling_reference_is_skippable() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut unit = store.begin(&EntityKind::Memberships)?;
        let result = unit.upsert(&record(json!({"id": "m1", "user_id": "ghost", "group_id": null})));
        assert!(matches!(result, Err(UpsertError::Skippable(_))));
        Ok(())
    }
}
