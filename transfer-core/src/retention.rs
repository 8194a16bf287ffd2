//! Archive retention.
//!
//! Keeps the newest `keep` archives of the root and deletes the rest.
//! Archives being read by a restore are left alone and reported as skipped.

use crate::apply::leases::ArchiveLeases;
use crate::archive::{ArchiveCatalog, ArchiveInfo};
use crate::utils::errors::{Result, TransferError};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedArchive {
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionResult {
    pub deleted_filenames: Vec<String>,
    pub skipped: Vec<SkippedArchive>,
    /// Archives still present: the newest `keep` plus anything skipped
    /// because it was leased or could not be deleted. Archives that had
    /// already vanished are not counted.
    pub kept_count: usize,
}

pub struct RetentionPurger {
    catalog: ArchiveCatalog,
    leases: ArchiveLeases,
    default_keep: usize,
}

impl RetentionPurger {
    pub fn new(catalog: ArchiveCatalog, leases: ArchiveLeases, default_keep: usize) -> Self {
        Self {
            catalog,
            leases,
            default_keep,
        }
    }

    pub fn default_keep(&self) -> usize {
        self.default_keep
    }

    /// Delete everything but the newest `keep` archives (the configured
    /// default when `None`). Running it twice deletes nothing the second
    /// time.
    pub fn purge(&self, keep: Option<usize>) -> Result<RetentionResult> {
        let keep = keep.unwrap_or(self.default_keep);
        if keep == 0 {
            return Err(TransferError::InvalidRetention(
                "keep must be at least 1".into(),
            ));
        }

        let archives = self.catalog.list()?;
        Ok(self.purge_listed(archives, keep))
    }

    /// Purge from a listing taken earlier, newest first. Files may have
    /// changed since the listing was taken.
    fn purge_listed(&self, archives: Vec<ArchiveInfo>, keep: usize) -> RetentionResult {
        let total = archives.len();
        let mut vanished = 0;
        let mut result = RetentionResult::default();

        for info in archives.into_iter().skip(keep) {
            let filename = info.name.to_string();

            match self.leases.remove_unless_leased(&info.name) {
                Ok(true) => {
                    tracing::info!(filename = %filename, "[Retention] Deleted archive");
                    result.deleted_filenames.push(filename);
                }
                Ok(false) => {
                    tracing::warn!(filename = %filename, "[Retention] Archive in use by a restore, skipped");
                    result.skipped.push(SkippedArchive {
                        filename,
                        reason: "in use by a running restore".into(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(filename = %filename, "[Retention] Archive already gone");
                    vanished += 1;
                    result.skipped.push(SkippedArchive {
                        filename,
                        reason: "already removed".into(),
                    });
                }
                Err(e) => {
                    tracing::warn!(filename = %filename, error = %e, "[Retention] Failed to delete archive");
                    result.skipped.push(SkippedArchive {
                        filename,
                        reason: e.to_string(),
                    });
                }
            }
        }

        result.kept_count = total - result.deleted_filenames.len() - vanished;
        tracing::info!(
            keep = keep,
            deleted = result.deleted_filenames.len(),
            skipped = result.skipped.len(),
            "[Retention] Purge finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::policy::FilenamePolicy;
    use crate::testing::touch_archive;
    use std::path::Path;
    use tempfile::TempDir;

    fn purger(root: &Path, leases: ArchiveLeases) -> RetentionPurger {
        RetentionPurger::new(ArchiveCatalog::new(FilenamePolicy::new(root)), leases, 7)
    }

    fn seed(root: &Path, count: u64) -> Result<()> {
        for i in 1..=count {
            touch_archive(root, &format!("backup-{:02}.tar.gz", i), 1_000 + i * 60)?;
        }
        Ok(())
    }

    fn remaining(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_purge_deletes_oldest_beyond_keep() -> Result<()> {
        let dir = TempDir::new()?;
        seed(dir.path(), 10)?;
        let purger = purger(dir.path(), ArchiveLeases::new());

        let result = purger.purge(Some(3))?;
        let mut deleted = result.deleted_filenames.clone();
        deleted.sort();
        let expected: Vec<String> = (1..=7).map(|i| format!("backup-{:02}.tar.gz", i)).collect();
        assert_eq!(deleted, expected);
        assert_eq!(result.kept_count, 3);
        assert!(result.skipped.is_empty());
        assert_eq!(
            remaining(dir.path()),
            vec!["backup-08.tar.gz", "backup-09.tar.gz", "backup-10.tar.gz"]
        );

        let again = purger.purge(Some(3))?;
        assert!(again.deleted_filenames.is_empty());
        assert_eq!(again.kept_count, 3);
        Ok(())
    }

    #[test]
    fn test_keep_above_count_deletes_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        seed(dir.path(), 2)?;

        let result = purger(dir.path(), ArchiveLeases::new()).purge(Some(5))?;
        assert!(result.deleted_filenames.is_empty());
        assert_eq!(result.kept_count, 2);
        Ok(())
    }

    #[test]
    fn test_default_keep_applies() -> Result<()> {
        let dir = TempDir::new()?;
        seed(dir.path(), 9)?;

        let result = purger(dir.path(), ArchiveLeases::new()).purge(None)?;
        assert_eq!(result.deleted_filenames.len(), 2);
        assert_eq!(result.kept_count, 7);
        Ok(())
    }

    #[test]
    fn test_zero_keep_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        seed(dir.path(), 2)?;

        let result = purger(dir.path(), ArchiveLeases::new()).purge(Some(0));
        assert!(matches!(result, Err(TransferError::InvalidRetention(_))));
        assert_eq!(remaining(dir.path()).len(), 2);
        Ok(())
    }

    #[test]
    fn test_leased_archive_is_skipped() -> Result<()> {
        let dir = TempDir::new()?;
        seed(dir.path(), 3)?;
        let leases = ArchiveLeases::new();
        let oldest = FilenamePolicy::new(dir.path()).validate("backup-01.tar.gz")?;
        let _lease = leases.acquire(&oldest);

        let result = purger(dir.path(), leases.clone()).purge(Some(1))?;
        assert_eq!(result.deleted_filenames, vec!["backup-02.tar.gz".to_string()]);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].filename, "backup-01.tar.gz");
        assert_eq!(result.kept_count, 2);
        assert!(oldest.path().exists());
        Ok(())
    }

    #[test]
    fn test_vanished_archive_is_not_counted_as_kept() -> Result<()> {
        let dir = TempDir::new()?;
        seed(dir.path(), 3)?;
        let purger = purger(dir.path(), ArchiveLeases::new());

        let listing = purger.catalog.list()?;
        std::fs::remove_file(dir.path().join("backup-01.tar.gz"))?;

        let result = purger.purge_listed(listing, 1);
        assert_eq!(result.deleted_filenames, vec!["backup-02.tar.gz".to_string()]);
        assert_eq!(
            result.skipped,
            vec![SkippedArchive {
                filename: "backup-01.tar.gz".into(),
                reason: "already removed".into(),
            }]
        );
        assert_eq!(result.kept_count, 1);
        assert_eq!(remaining(dir.path()), vec!["backup-03.tar.gz"]);
        Ok(())
    }

    #[test]
    fn test_foreign_files_survive() -> Result<()> {
        let dir = TempDir::new()?;
        seed(dir.path(), 2)?;
        std::fs::write(dir.path().join("README"), b"keep me")?;

        purger(dir.path(), ArchiveLeases::new()).purge(Some(1))?;
        assert!(dir.path().join("README").exists());
        Ok(())
    }
}
