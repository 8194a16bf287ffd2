//! Persistence seam used by restore and export.
//!
//! The core never talks to a database directly. A store hands out one
//! [`StoreUnit`] per entity kind; everything upserted through a unit becomes
//! visible on `commit` and disappears on `rollback` (or drop).

#[cfg(test)]
pub(crate) mod memory;

use crate::archive::manifest::EntityKind;
use crate::utils::errors::TransferError;
use serde_json::{Map, Value};
use thiserror::Error;

/// One record of an entity kind, keyed by its stable `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: String,
    /// Full JSON object, `id` included
    pub body: Map<String, Value>,
}

impl EntityRecord {
    pub fn new(body: Map<String, Value>) -> std::result::Result<Self, String> {
        let id = match body.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::String(_)) => return Err("record has an empty id".into()),
            Some(_) => return Err("record id is not a string".into()),
            None => return Err("record has no id".into()),
        };
        Ok(Self { id, body })
    }

    /// Parse one JSONL line.
    pub fn from_json(bytes: &[u8]) -> std::result::Result<Self, String> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(body)) => Self::new(body),
            Ok(_) => Err("record is not a JSON object".into()),
            Err(e) => Err(format!("malformed record: {}", e)),
        }
    }

    /// String value of a reference field; null or absent means no reference.
    pub fn reference(&self, field: &str) -> Option<&str> {
        self.body.get(field).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum UpsertError {
    /// The record cannot be stored but the rest of the kind can
    /// (e.g. it references a row that no longer exists).
    #[error("{0}")]
    Skippable(String),

    /// The unit is unusable and must be rolled back.
    #[error(transparent)]
    Fatal(#[from] StoreError),
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        TransferError::PersistenceFailure(e.to_string())
    }
}

pub trait EntityStore: Send + Sync {
    /// Open the recoverable unit for one kind.
    fn begin(&self, kind: &EntityKind) -> Result<Box<dyn StoreUnit + '_>, StoreError>;

    fn count(&self, kind: &EntityKind) -> Result<u64, StoreError>;

    /// Every record of `kind`, ordered by id.
    fn export(&self, kind: &EntityKind) -> Result<Vec<EntityRecord>, StoreError>;
}

pub trait StoreUnit {
    /// Create the record if its id is absent, replace it otherwise.
    fn upsert(&mut self, record: &EntityRecord) -> Result<UpsertOutcome, UpsertError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
