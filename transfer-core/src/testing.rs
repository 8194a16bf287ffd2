//! Shared fixtures for unit tests.

use crate::archive::manifest::{EntityKind, PayloadDigest};
use crate::archive::policy::{ArchiveName, FilenamePolicy};
use crate::archive::writer::write_archive;
use crate::audit::{AuditEntry, AuditSink};
use crate::store::memory::MemoryStore;
use crate::store::EntityRecord;
use crate::unlock::{self, UnlockClaim};
use crate::utils::errors::Result;
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration as StdDuration, UNIX_EPOCH};

/// A `manifest.json` body whose checksum covers the `(path, bytes)`
/// payload entries in order.
pub(crate) fn manifest_bytes(
    version: u32,
    counts: &[(&str, u64)],
    entries: &[(&str, &[u8])],
) -> Vec<u8> {
    let mut digest = PayloadDigest::new();
    for (path, bytes) in entries {
        digest.start_entry(path);
        digest.update(bytes);
    }
    let counts: Map<String, Value> = counts
        .iter()
        .map(|(kind, n)| (kind.to_string(), json!(n)))
        .collect();
    json!({
        "schema_version": version,
        "created_at": "2024-01-01T00:00:00Z",
        "entity_counts": counts,
        "checksum": digest.finish(),
    })
    .to_string()
    .into_bytes()
}

fn jsonl(records: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    for record in records {
        buf.extend_from_slice(record.to_string().as_bytes());
        buf.push(b'\n');
    }
    buf
}

fn scenario_users() -> Vec<Value> {
    vec![
        json!({"id": "u1", "username": "ada"}),
        json!({"id": "u2", "username": "grace"}),
        json!({"id": "u3", "username": "linus"}),
    ]
}

fn scenario_groups() -> Vec<Value> {
    vec![json!({"id": "g1", "name": "core", "owner_id": "u1"})]
}

/// Archive with 3 users and 1 group, as a fresh export would produce it.
pub(crate) fn scenario_archive(dir: &Path, filename: &str) -> Result<ArchiveName> {
    let name = FilenamePolicy::new(dir).validate(filename)?;
    let payloads = vec![
        (EntityKind::Users, jsonl(&scenario_users()), 3),
        (EntityKind::Groups, jsonl(&scenario_groups()), 1),
    ];
    let created_at = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("valid timestamp");
    write_archive(File::create(name.path())?, created_at, &payloads)?;
    Ok(name)
}

/// Wrap JSON object fixtures as store records.
pub(crate) fn records(values: Vec<Value>) -> Vec<EntityRecord> {
    values
        .into_iter()
        .map(|value| match value {
            Value::Object(body) => EntityRecord::new(body).expect("fixture record"),
            _ => panic!("fixture record is not an object"),
        })
        .collect()
}

/// Store holding the same 3 users and 1 group as [`scenario_archive`].
pub(crate) fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.seed(EntityKind::Users, records(scenario_users()));
    store.seed(EntityKind::Groups, records(scenario_groups()));
    store
}

/// Four-byte placeholder archive with a fixed modification time.
pub(crate) fn touch_archive(dir: &Path, filename: &str, mtime_secs: u64) -> Result<()> {
    let path = dir.join(filename);
    std::fs::write(&path, b"data")?;
    File::options()
        .write(true)
        .open(&path)?
        .set_modified(UNIX_EPOCH + StdDuration::from_secs(mtime_secs))?;
    Ok(())
}

/// A claim obtained the way a real caller would.
pub(crate) fn test_claim() -> UnlockClaim {
    let secret = b"fixture-secret-0123456789";
    let now = Utc::now();
    let issued = unlock::issue(secret, now, Duration::minutes(10)).expect("issue token");
    unlock::verify(secret, &issued.token, now).expect("fresh token verifies")
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingSink {
    pub(crate) fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl AuditSink for RecordingSink {
    fn append(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

pub(crate) struct FailingSink;

impl AuditSink for FailingSink {
    fn append(&self, _entry: &AuditEntry) -> anyhow::Result<()> {
        anyhow::bail!("audit log unavailable")
    }
}
