//! Manifest types for snapshot archives.
//!
//! The manifest is the first entry (`manifest.json`) of every archive and
//! records the schema version, per-kind record counts and the SHA-256 of
//! every payload entry that follows it.

use crate::utils::errors::{Result, TransferError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Schema version written by this build
pub const SCHEMA_VERSION: u32 = 1;

/// Oldest archive schema this build can restore
pub const MIN_SUPPORTED_SCHEMA_VERSION: u32 = 1;

/// Name of the manifest entry
pub const MANIFEST_ENTRY: &str = "manifest.json";

const DATA_PREFIX: &str = "data/";
const DATA_SUFFIX: &str = ".jsonl";

type References = &'static [(&'static str, EntityKind)];

const GROUP_REFERENCES: References = &[("owner_id", EntityKind::Users)];
const MEMBERSHIP_REFERENCES: References = &[
    ("user_id", EntityKind::Users),
    ("group_id", EntityKind::Groups),
];
const EVENT_REFERENCES: References = &[("group_id", EntityKind::Groups)];
const POST_REFERENCES: References = &[
    ("author_id", EntityKind::Users),
    ("group_id", EntityKind::Groups),
];

/// Entity kinds carried by an archive.
///
/// Variant order is restore order: a kind only references kinds declared
/// before it. Kinds this build does not know survive as `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityKind {
    Users,
    Groups,
    Memberships,
    Events,
    Posts,
    Unknown(String),
}

impl EntityKind {
    pub const KNOWN: [EntityKind; 5] = [
        EntityKind::Users,
        EntityKind::Groups,
        EntityKind::Memberships,
        EntityKind::Events,
        EntityKind::Posts,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EntityKind::Users => "users",
            EntityKind::Groups => "groups",
            EntityKind::Memberships => "memberships",
            EntityKind::Events => "events",
            EntityKind::Posts => "posts",
            EntityKind::Unknown(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EntityKind::Unknown(_))
    }

    /// Foreign keys of this kind: `(field, referenced kind)`. A null or
    /// absent field is not a reference.
    pub fn references(&self) -> &'static [(&'static str, EntityKind)] {
        match self {
            EntityKind::Groups => GROUP_REFERENCES,
            EntityKind::Memberships => MEMBERSHIP_REFERENCES,
            EntityKind::Events => EVENT_REFERENCES,
            EntityKind::Posts => POST_REFERENCES,
            EntityKind::Users | EntityKind::Unknown(_) => &[],
        }
    }

    /// Path of this kind's payload entry inside the archive
    pub fn entry_path(&self) -> String {
        format!("{}{}{}", DATA_PREFIX, self.as_str(), DATA_SUFFIX)
    }

    pub fn from_entry_path(path: &str) -> Option<EntityKind> {
        let name = path.strip_prefix(DATA_PREFIX)?.strip_suffix(DATA_SUFFIX)?;
        is_valid_kind_name(name).then(|| EntityKind::from(name))
    }
}

impl From<&str> for EntityKind {
    fn from(name: &str) -> Self {
        match name {
            "users" => EntityKind::Users,
            "groups" => EntityKind::Groups,
            "memberships" => EntityKind::Memberships,
            "events" => EntityKind::Events,
            "posts" => EntityKind::Posts,
            other => EntityKind::Unknown(other.to_string()),
        }
    }
}

impl From<String> for EntityKind {
    fn from(name: String) -> Self {
        EntityKind::from(name.as_str())
    }
}

impl From<EntityKind> for String {
    fn from(kind: EntityKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_valid_kind_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Archive manifest, serialized as `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferManifest {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub entity_counts: BTreeMap<EntityKind, u64>,
    /// Lowercase hex SHA-256 over the payload entries, in entry order
    pub checksum: String,
}

impl TransferManifest {
    /// Parse a manifest entry. Anything unparsable makes the archive corrupt.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let manifest: TransferManifest = serde_json::from_slice(bytes)
            .map_err(|e| TransferError::ArchiveCorrupt(format!("unreadable manifest: {}", e)))?;

        if let Some(kind) = manifest
            .entity_counts
            .keys()
            .find(|k| !is_valid_kind_name(k.as_str()))
        {
            return Err(TransferError::ArchiveCorrupt(format!(
                "manifest declares invalid entity kind {:?}",
                kind.as_str()
            )));
        }
        if manifest.checksum.len() != 64 || !manifest.checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TransferError::ArchiveCorrupt(
                "manifest checksum is not a SHA-256 hex digest".into(),
            ));
        }

        Ok(manifest)
    }

    pub fn is_schema_supported(&self) -> bool {
        (MIN_SUPPORTED_SCHEMA_VERSION..=SCHEMA_VERSION).contains(&self.schema_version)
    }

    pub fn check_schema(&self) -> Result<()> {
        if self.is_schema_supported() {
            Ok(())
        } else {
            Err(TransferError::SchemaVersionMismatch {
                found: self.schema_version,
                min: MIN_SUPPORTED_SCHEMA_VERSION,
                max: SCHEMA_VERSION,
            })
        }
    }

    /// Counts keyed by kind name, for reports
    pub fn counts_by_name(&self) -> BTreeMap<String, u64> {
        self.entity_counts
            .iter()
            .map(|(kind, count)| (kind.to_string(), *count))
            .collect()
    }
}

/// Running SHA-256 over the payload entries, in entry order. Each entry
/// contributes its path, a NUL byte, then its contents, so renaming or
/// reordering entries changes the digest.
#[derive(Default)]
pub(crate) struct PayloadDigest {
    hasher: Sha256,
}

impl PayloadDigest {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn start_entry(&mut self, path: &str) {
        self.hasher.update(path.as_bytes());
        self.hasher.update([0u8]);
    }

    pub(crate) fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Lowercase hex digest
    pub(crate) fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
