//! Tracks archives that a running restore is reading.

use crate::archive::policy::ArchiveName;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Default)]
pub struct ArchiveLeases {
    held: Arc<Mutex<HashMap<String, usize>>>,
}

impl ArchiveLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `name` until the returned lease is dropped.
    pub fn acquire(&self, name: &ArchiveName) -> ArchiveLease {
        *self.held().entry(name.to_string()).or_insert(0) += 1;
        ArchiveLease {
            leases: self.clone(),
            name: name.to_string(),
        }
    }

    #[cfg(test)]
    pub fn is_leased(&self, filename: &str) -> bool {
        self.held().contains_key(filename)
    }

    /// Delete the archive unless a lease is held on it. Returns `Ok(false)`
    /// for a leased archive. The lease table stays locked until the file is
    /// gone, so a restore cannot start reading it in between.
    pub fn remove_unless_leased(&self, name: &ArchiveName) -> io::Result<bool> {
        let held = self.held();
        if held.contains_key(name.as_str()) {
            return Ok(false);
        }
        std::fs::remove_file(name.path())?;
        Ok(true)
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ArchiveLease {
    leases: ArchiveLeases,
    name: String,
}

impl Drop for ArchiveLease {
    fn drop(&mut self) {
        let mut held = self.leases.held();
        if let Some(count) = held.get_mut(&self.name) {
            *count -= 1;
            if *count == 0 {
                held.remove(&self.name);
            }
        }
    }
}
