//! WAL file naming and directory listing
//!
//! Files are named `wal_<creationEpochMillis>.log`. The stamp in the name is
//! the ordering key; it is also written into the file header.

use super::RotationError;
use scribe_core::Timestamp;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const FILE_PREFIX: &str = "wal_";
const FILE_SUFFIX: &str = ".log";

/// File name for a WAL file created at `created_at`
pub fn wal_file_name(created_at: Timestamp) -> String {
    format!("{}{}{}", FILE_PREFIX, created_at.as_millis(), FILE_SUFFIX)
}

/// Parse the creation stamp out of a WAL file name
pub fn parse_wal_file_name(name: &str) -> Option<Timestamp> {
    let stamp = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    if stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stamp.parse::<u64>().ok().map(Timestamp::from_millis)
}

/// Pick a path for a new file at `now`.
///
/// The stamp is raised past the newest existing file so name order stays
/// creation order even when rotations land in the same millisecond or the
/// clock steps back. Returns the path and the stamp actually used.
pub fn next_file_path(dir: &Path, now: Timestamp) -> (PathBuf, Timestamp) {
    let newest = list_files(dir)
        .ok()
        .and_then(|files| files.last().map(|f| f.created_at.as_millis() + 1))
        .unwrap_or(0);
    let mut stamp = Timestamp::from_millis(now.as_millis().max(newest));
    loop {
        let path = dir.join(wal_file_name(stamp));
        if !path.exists() {
            return (path, stamp);
        }
        stamp = Timestamp::from_millis(stamp.as_millis() + 1);
    }
}

/// A WAL file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFileInfo {
    /// Full path
    pub path: PathBuf,
    /// Creation stamp from the file name
    pub created_at: Timestamp,
    /// Size in bytes
    pub size: u64,
}

impl WalFileInfo {
    /// File name component
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// List WAL files in `dir`, oldest first.
///
/// A missing directory yields an empty list. Files that do not match the
/// naming scheme are ignored.
pub fn list_files(dir: &Path) -> Result<Vec<WalFileInfo>, RotationError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RotationError::io(dir, e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RotationError::io(dir, e))?;
        let name = entry.file_name();
        let Some(created_at) = name.to_str().and_then(parse_wal_file_name) else {
            continue;
        };
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            // Removed between read_dir and stat
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(RotationError::io(&path, e)),
        };
        files.push(WalFileInfo {
            path,
            created_at,
            size: metadata.len(),
        });
    }

    files.sort_by_key(|f| f.created_at);
    Ok(files)
}

/// Total size of all WAL files in `dir`
pub fn total_size(dir: &Path) -> Result<u64, RotationError> {
    Ok(list_files(dir)?.iter().map(|f| f.size).sum())
}
