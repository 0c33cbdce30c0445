//! Active WAL file
//!
//! A `WalFile` is the single append handle the writer owns. It tracks the
//! size and entry count of what has been durably written so rotation can be
//! decided without a `stat` per flush.

use crate::codec::{DecodeError, WalDecoder};
use crate::format::{FileHeaderError, WalFileHeader};
use crate::rotation::{next_file_path, FileState};
use scribe_core::Timestamp;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Why an existing file cannot be resumed
#[derive(Debug, Error)]
pub enum ResumeError {
    /// Reading the file failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// File header is missing or invalid
    #[error("Invalid file header: {0}")]
    Header(#[from] FileHeaderError),

    /// Entry chain does not reach end of file cleanly
    #[error("Entry chain breaks at offset {offset}: {reason}")]
    DirtyTail {
        /// Offset of the first bad entry
        offset: u64,
        /// Header validation error
        reason: DecodeError,
    },
}

/// Summary of a header-only walk over a file's entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryScan {
    /// Entries whose headers validated
    pub entries: u64,
    /// Offset just past the last valid entry
    pub valid_len: u64,
    /// First failure, if the walk did not reach the end
    pub first_error: Option<(u64, DecodeError)>,
}

impl EntryScan {
    /// Walk entry headers starting at `offset` without verifying payloads.
    pub fn run(bytes: &[u8], offset: usize) -> Self {
        let mut pos = offset;
        let mut entries = 0;
        while pos < bytes.len() {
            match WalDecoder::validate_entry(&bytes[pos..]) {
                Ok(header) => {
                    pos += header.entry_len();
                    entries += 1;
                }
                Err(e) => {
                    return EntryScan {
                        entries,
                        valid_len: pos as u64,
                        first_error: Some((pos as u64, e)),
                    }
                }
            }
        }
        EntryScan {
            entries,
            valid_len: pos as u64,
            first_error: None,
        }
    }

    /// Whether the walk reached end of file
    pub fn is_clean(&self) -> bool {
        self.first_error.is_none()
    }
}

/// Append handle to the active WAL file
#[derive(Debug)]
pub struct WalFile {
    file: File,
    path: PathBuf,
    header: WalFileHeader,
    size: u64,
    entries: u64,
    closed: bool,
}

impl WalFile {
    /// Create a new file in `dir` stamped `now` (bumped if the name is taken)
    /// and durably write its header.
    pub fn create(
        dir: &Path,
        now: Timestamp,
        node_id: Uuid,
        session_id: Option<&str>,
    ) -> io::Result<Self> {
        let (path, stamp) = next_file_path(dir, now);
        let mut header = WalFileHeader::new(stamp, node_id);
        if let Some(session) = session_id {
            header = header.with_session(session);
        }

        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let bytes = header.to_bytes();
        file.write_all(&bytes)?;
        file.sync_all()?;

        Ok(WalFile {
            file,
            path,
            header,
            size: bytes.len() as u64,
            entries: 0,
            closed: false,
        })
    }

    /// Reopen an existing file for appending.
    ///
    /// Succeeds only if the header is valid and a header-only walk of the
    /// entries reaches end of file.
    pub fn open_append(path: &Path) -> Result<Self, ResumeError> {
        let bytes = fs::read(path)?;
        let (header, header_len) = WalFileHeader::from_bytes(&bytes)?;
        let scan = EntryScan::run(&bytes, header_len);
        if let Some((offset, reason)) = scan.first_error {
            return Err(ResumeError::DirtyTail { offset, reason });
        }

        let file = OpenOptions::new().append(true).read(true).open(path)?;
        Ok(WalFile {
            file,
            path: path.to_path_buf(),
            header,
            size: bytes.len() as u64,
            entries: scan.entries,
            closed: false,
        })
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Parsed file header
    pub fn header(&self) -> &WalFileHeader {
        &self.header
    }

    /// Durably written size, header included
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Entries written
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Rotation view of the file
    pub fn state(&self) -> FileState {
        FileState {
            size: self.size,
            entries: self.entries,
            created_at: self.header.created_at,
        }
    }

    /// Independent handle to the same open file, for a write thread.
    pub fn try_clone_handle(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    /// Account for bytes written and synced through a cloned handle.
    pub fn record_append(&mut self, bytes: u64, entries: u64) {
        self.size += bytes;
        self.entries += entries;
    }

    /// Write and fsync directly on the owned handle.
    pub fn append_synced(&mut self, bytes: &[u8], entries: u64) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.file.sync_data()?;
        self.record_append(bytes.len() as u64, entries);
        Ok(())
    }

    /// Cut any partially written bytes back to the last durable size.
    pub fn truncate_to_durable(&mut self) -> io::Result<()> {
        if self.file.metadata()?.len() != self.size {
            self.file.set_len(self.size)?;
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Sync and mark closed. Further appends are the caller's bug.
    pub fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.file.sync_all()?;
            self.closed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WalEncoder;
    use crate::format::WalEntry;
    use scribe_core::TranscriptUtterance;
    use tempfile::tempdir;

    fn node() -> Uuid {
        Uuid::from_bytes([1; 16])
    }

    fn encoded(id: &str) -> Vec<u8> {
        WalEncoder::encode(&WalEntry::insert(TranscriptUtterance::new(id, "s1", "hi")))
    }

    #[test]
    fn test_create_writes_header() {
        let dir = tempdir().unwrap();
        let file = WalFile::create(dir.path(), Timestamp::from_millis(42), node(), Some("s1")).unwrap();
        assert_eq!(file.file_name(), "wal_42.log");
        assert_eq!(file.entries(), 0);
        assert_eq!(file.size(), fs::metadata(file.path()).unwrap().len());
        assert_eq!(file.header().session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_create_avoids_collision() {
        let dir = tempdir().unwrap();
        let a = WalFile::create(dir.path(), Timestamp::from_millis(42), node(), None).unwrap();
        let b = WalFile::create(dir.path(), Timestamp::from_millis(42), node(), None).unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(b.header().created_at.as_millis(), 43);
    }

    #[test]
    fn test_reopen_clean_file() {
        let dir = tempdir().unwrap();
        let mut file = WalFile::create(dir.path(), Timestamp::from_millis(1), node(), None).unwrap();
        file.append_synced(&encoded("u1"), 1).unwrap();
        file.append_synced(&encoded("u2"), 1).unwrap();
        let size = file.size();
        let path = file.path().to_path_buf();
        drop(file);

        let reopened = WalFile::open_append(&path).unwrap();
        assert_eq!(reopened.entries(), 2);
        assert_eq!(reopened.size(), size);
    }

    #[test]
    fn test_reopen_rejects_torn_tail() {
        let dir = tempdir().unwrap();
        let mut file = WalFile::create(dir.path(), Timestamp::from_millis(1), node(), None).unwrap();
        file.append_synced(&encoded("u1"), 1).unwrap();
        let torn = encoded("u2");
        file.append_synced(&torn[..10], 0).unwrap();
        let path = file.path().to_path_buf();
        drop(file);

        assert!(matches!(
            WalFile::open_append(&path),
            Err(ResumeError::DirtyTail { .. })
        ));
    }

    #[test]
    fn test_reopen_rejects_bad_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal_1.log");
        fs::write(&path, b"not a wal file at all, not even close....").unwrap();
        assert!(matches!(
            WalFile::open_append(&path),
            Err(ResumeError::Header(_))
        ));
    }

    #[test]
    fn test_truncate_to_durable() {
        let dir = tempdir().unwrap();
        let mut file = WalFile::create(dir.path(), Timestamp::from_millis(1), node(), None).unwrap();
        let durable = file.size();
        let mut raw = file.try_clone_handle().unwrap();
        raw.write_all(b"partial").unwrap();
        file.truncate_to_durable().unwrap();
        assert_eq!(fs::metadata(file.path()).unwrap().len(), durable);
    }

    #[test]
    fn test_entry_scan_reports_break() {
        let mut bytes = encoded("u1");
        bytes.extend_from_slice(&[0u8; 5]);
        let scan = EntryScan::run(&bytes, 0);
        assert_eq!(scan.entries, 1);
        assert!(!scan.is_clean());
        assert_eq!(scan.first_error.unwrap().0, encoded("u1").len() as u64);
    }

    #[test]
    fn test_entry_scan_keeps_decode_reason() {
        let mut bytes = encoded("u1");
        let second = encoded("u2");
        bytes.extend_from_slice(&second[..second.len() - 3]);

        let scan = EntryScan::run(&bytes, 0);
        let snapshot = scan.clone();
        assert_eq!(scan, snapshot);
        assert_eq!(scan.valid_len, encoded("u1").len() as u64);
        match scan.first_error {
            Some((offset, reason)) => {
                assert_eq!(offset, scan.valid_len);
                assert!(reason.is_truncation());
            }
            None => panic!("torn entry must stop the walk"),
        }
    }
}
