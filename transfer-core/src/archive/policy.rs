//! Archive filename policy.
//!
//! Every filename that reaches the subsystem from outside goes through
//! [`FilenamePolicy::validate`] before any path is built from it.

use crate::utils::errors::{Result, TransferError};
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};

/// Fixed extension of the snapshot format
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// Content type served for downloads
pub const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

const MAX_FILENAME_LEN: usize = 255;

/// A filename that passed the policy, paired with its path under the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveName {
    name: String,
    path: PathBuf,
}

impl ArchiveName {
    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ArchiveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Serialize for ArchiveName {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct FilenamePolicy {
    root: PathBuf,
}

impl FilenamePolicy {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate `name` and resolve it under the archive root.
    pub fn validate(&self, name: &str) -> Result<ArchiveName> {
        check_syntax(name)?;

        let root = self.root.canonicalize().map_err(|e| {
            TransferError::Config(format!(
                "archive root {} is unavailable: {}",
                self.root.display(),
                e
            ))
        })?;

        let candidate = root.join(name);
        if candidate.parent() != Some(root.as_path()) {
            return Err(invalid(name, "escapes the archive root"));
        }

        // An existing entry may be a symlink; it must still land in the root.
        if std::fs::symlink_metadata(&candidate).is_ok() {
            let resolved = candidate
                .canonicalize()
                .map_err(|_| invalid(name, "cannot be resolved"))?;
            if resolved.parent() != Some(root.as_path()) {
                return Err(invalid(name, "resolves outside the archive root"));
            }
        }

        Ok(ArchiveName {
            name: name.to_string(),
            path: candidate,
        })
    }
}

/// Purely lexical part of the policy.
fn check_syntax(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid(name, "is empty"));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(invalid(name, "is too long"));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(invalid(name, "contains a path separator"));
    }
    if name.contains("..") {
        return Err(invalid(name, "contains a parent-directory segment"));
    }

    let Some(stem) = name.strip_suffix(ARCHIVE_EXTENSION) else {
        return Err(invalid(name, "does not end in .tar.gz"));
    };
    if stem.is_empty() {
        return Err(invalid(name, "has no name before the extension"));
    }

    let mut chars = stem.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid(name, "must start with a letter or digit"));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(invalid(name, "contains characters outside [A-Za-z0-9._-]"));
    }

    Ok(())
}

fn invalid(name: &str, reason: &str) -> TransferError {
    TransferError::InvalidFilename(format!("{:?} {}", name, reason))
}
