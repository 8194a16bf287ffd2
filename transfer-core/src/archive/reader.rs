//! Read-only access to snapshot archives.
//!
//! Archives are streamed straight out of the gzip decoder: payload bytes go
//! through the hasher in fixed-size chunks and records are read one line at
//! a time, so memory stays bounded whatever the archive size.
//!
//! Inspection is the gate for applying: it rejects repeated entry paths and
//! records longer than `max_record_bytes`, so an archive that passes can be
//! streamed kind by kind without surprises halfway through.

use super::manifest::{EntityKind, PayloadDigest, TransferManifest, MANIFEST_ENTRY};
use super::policy::ArchiveName;
use crate::config::LimitsConfig;
use crate::utils::errors::{Result, TransferError};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};

/// Outcome of inspecting an archive that could be opened and parsed.
#[derive(Debug, Clone)]
pub struct ArchiveInspection {
    pub manifest: TransferManifest,
    pub checksum_valid: bool,
    pub actual_checksum: String,
    pub size_bytes: u64,
}

impl ArchiveInspection {
    /// Fail unless the payload matches the declared checksum.
    pub fn require_valid_checksum(&self) -> Result<()> {
        if self.checksum_valid {
            Ok(())
        } else {
            Err(TransferError::ChecksumMismatch {
                expected: self.manifest.checksum.clone(),
                actual: self.actual_checksum.clone(),
            })
        }
    }
}

/// Inspection summary returned to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectReport {
    pub filename: String,
    pub size_bytes: u64,
    pub schema_version: u32,
    pub schema_supported: bool,
    pub entity_counts: BTreeMap<String, u64>,
    pub checksum_valid: bool,
}

impl InspectReport {
    pub fn new(name: &ArchiveName, inspection: &ArchiveInspection) -> Self {
        Self {
            filename: name.to_string(),
            size_bytes: inspection.size_bytes,
            schema_version: inspection.manifest.schema_version,
            schema_supported: inspection.manifest.is_schema_supported(),
            entity_counts: inspection.manifest.counts_by_name(),
            checksum_valid: inspection.checksum_valid,
        }
    }
}

/// Failure while streaming records: either the archive itself or the
/// per-record callback gave up.
#[derive(Debug)]
pub(crate) enum RecordStreamError<E> {
    Archive(TransferError),
    Aborted(E),
}

#[derive(Debug, Clone)]
pub struct ArchiveReader {
    limits: LimitsConfig,
}

impl ArchiveReader {
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    /// Open a validated archive for reading.
    pub fn open(&self, name: &ArchiveName) -> Result<File> {
        match File::open(name.path()) {
            Ok(file) => {
                if file.metadata()?.is_file() {
                    Ok(file)
                } else {
                    Err(TransferError::ArchiveNotFound(name.to_string()))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(TransferError::ArchiveNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Inspect an archive by name. Never touches the data store.
    pub fn inspect(&self, name: &ArchiveName) -> Result<ArchiveInspection> {
        let file = self.open(name)?;
        self.inspect_file(&file)
    }

    /// Inspect an already opened archive from its first byte.
    pub fn inspect_file(&self, file: &File) -> Result<ArchiveInspection> {
        let size_bytes = file.metadata()?.len();
        let mut handle = file;
        handle.seek(SeekFrom::Start(0))?;
        self.inspect_stream(BufReader::new(handle), size_bytes)
    }

    fn inspect_stream<R: Read>(&self, reader: R, size_bytes: u64) -> Result<ArchiveInspection> {
        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        let mut manifest = None;
        let mut digest = PayloadDigest::new();
        let mut found: BTreeMap<EntityKind, u64> = BTreeMap::new();
        let mut seen_paths = HashSet::new();

        {
            let entries = archive.entries().map_err(corrupt)?;
            for (index, entry) in entries.enumerate() {
                let mut entry = entry.map_err(corrupt)?;
                let path = entry.path().map_err(corrupt)?.to_string_lossy().into_owned();

                if index == 0 {
                    if path != MANIFEST_ENTRY {
                        return Err(TransferError::ArchiveCorrupt(format!(
                            "first entry is {:?}, expected {}",
                            path, MANIFEST_ENTRY
                        )));
                    }
                    manifest = Some(self.read_manifest(&mut entry)?);
                    seen_paths.insert(path);
                    continue;
                }

                if !seen_paths.insert(path.clone()) {
                    return Err(TransferError::ArchiveCorrupt(format!(
                        "entry {:?} appears more than once",
                        path
                    )));
                }

                let kind = EntityKind::from_entry_path(&path);
                let max_line = kind.as_ref().map(|_| self.limits.max_record_bytes);
                digest.start_entry(&path);
                let mut tally = PayloadTally::new(&mut digest, &path, max_line);
                io::copy(&mut entry, &mut tally).map_err(corrupt)?;
                let records = tally.records();

                if let Some(kind) = kind {
                    *found.entry(kind).or_default() += records;
                }
            }
        }

        // Run the decoder to the end so the gzip trailer (CRC, length) is checked.
        let mut decoder = archive.into_inner();
        io::copy(&mut decoder, &mut io::sink()).map_err(corrupt)?;

        let manifest = manifest
            .ok_or_else(|| TransferError::ArchiveCorrupt("archive has no manifest".into()))?;
        let actual_checksum = digest.finish();
        let checksum_valid = actual_checksum.eq_ignore_ascii_case(&manifest.checksum);

        // Counts are only meaningful for an intact payload; a tampered one is
        // reported through `checksum_valid` instead.
        if checksum_valid {
            for (kind, declared) in &manifest.entity_counts {
                let present = found.get(kind).copied().unwrap_or(0);
                if present != *declared {
                    return Err(TransferError::ArchiveCorrupt(format!(
                        "manifest declares {} {} records, archive holds {}",
                        declared, kind, present
                    )));
                }
            }
        }

        Ok(ArchiveInspection {
            manifest,
            checksum_valid,
            actual_checksum,
            size_bytes,
        })
    }

    fn read_manifest<R: Read>(&self, entry: &mut tar::Entry<'_, R>) -> Result<TransferManifest> {
        let max = self.limits.max_manifest_bytes;
        if entry.size() > max {
            return Err(TransferError::ArchiveCorrupt(format!(
                "manifest is {} bytes, limit is {}",
                entry.size(),
                max
            )));
        }
        let mut buf = Vec::new();
        entry.take(max + 1).read_to_end(&mut buf).map_err(corrupt)?;
        TransferManifest::from_slice(&buf)
    }

    /// Stream the records of `kind` from an opened archive, calling
    /// `on_record(line_number, bytes)` for every non-empty line.
    ///
    /// Returns the number of records seen. A kind without a payload entry
    /// yields zero records. Only the first entry for `kind` is read; run
    /// [`ArchiveReader::inspect_file`] first to rule out repeated entries.
    pub(crate) fn stream_records<E, F>(
        &self,
        file: &File,
        kind: &EntityKind,
        mut on_record: F,
    ) -> std::result::Result<u64, RecordStreamError<E>>
    where
        F: FnMut(u64, &[u8]) -> std::result::Result<(), E>,
    {
        let archive_err = |e: io::Error| -> RecordStreamError<E> { RecordStreamError::Archive(corrupt(e)) };
        let max = self.limits.max_record_bytes;

        let mut handle = file;
        handle
            .seek(SeekFrom::Start(0))
            .map_err(|e| RecordStreamError::<E>::Archive(e.into()))?;

        let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(handle)));
        let target = kind.entry_path();

        for entry in archive.entries().map_err(archive_err)? {
            let entry = entry.map_err(archive_err)?;
            let is_target = entry
                .path()
                .map(|p| p.to_string_lossy() == target.as_str())
                .map_err(archive_err)?;
            if !is_target {
                continue;
            }

            let mut reader = BufReader::new(entry);
            let mut line = Vec::new();
            let mut line_no = 0u64;
            let mut records = 0u64;

            loop {
                line.clear();
                let n = (&mut reader)
                    .take(max + 1)
                    .read_until(b'\n', &mut line)
                    .map_err(archive_err)?;
                if n == 0 {
                    break;
                }
                line_no += 1;

                if line.last() == Some(&b'\n') {
                    line.pop();
                } else if n as u64 > max {
                    return Err(RecordStreamError::Archive(TransferError::ArchiveCorrupt(
                        format!("{} record {} exceeds {} bytes", kind, line_no, max),
                    )));
                }
                if line.is_empty() {
                    continue;
                }

                records += 1;
                on_record(line_no, &line).map_err(RecordStreamError::Aborted)?;
            }

            return Ok(records);
        }

        Ok(0)
    }
}

fn corrupt(e: io::Error) -> TransferError {
    TransferError::ArchiveCorrupt(e.to_string())
}

/// Hashes payload bytes and counts the non-empty lines passing through.
/// With `max_line` set, a line longer than that many bytes (newline
/// excluded) fails the write.
struct PayloadTally<'a> {
    digest: &'a mut PayloadDigest,
    path: &'a str,
    max_line: Option<u64>,
    records: u64,
    line_no: u64,
    line_len: u64,
    line_open: bool,
}

impl<'a> PayloadTally<'a> {
    fn new(digest: &'a mut PayloadDigest, path: &'a str, max_line: Option<u64>) -> Self {
        Self {
            digest,
            path,
            max_line,
            records: 0,
            line_no: 1,
            line_len: 0,
            line_open: false,
        }
    }

    fn records(&self) -> u64 {
        self.records + u64::from(self.line_open)
    }
}

impl Write for PayloadTally<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.digest.update(buf);
        for byte in buf {
            if *byte == b'\n' {
                if self.line_open {
                    self.records += 1;
                }
                self.line_open = false;
                self.line_no += 1;
                self.line_len = 0;
                continue;
            }

            self.line_open = true;
            self.line_len += 1;
            if let Some(max) = self.max_line {
                if self.line_len > max {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{} record {} exceeds {} bytes", self.path, self.line_no, max),
                    ));
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
