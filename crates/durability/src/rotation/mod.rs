//! File rotation and retention
//!
//! `WalRotationManager` answers two questions:
//!
//! - should the active file be closed before the next write
//!   (`check_rotation`), and
//! - which closed files should be retired (`enforce_retention`,
//!   `emergency_cleanup`).
//!
//! It never touches the active file. Retiring a file deletes it, or, when
//! archiving is enabled, gzips it into the archive directory first.

pub mod config;
pub mod files;

pub use config::{RotationConfig, RotationConfigError};
pub use files::{
    list_files, next_file_path, parse_wal_file_name, total_size, wal_file_name, WalFileInfo,
};

use flate2::write::GzEncoder;
use flate2::Compression;
use scribe_core::Timestamp;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Filesystem failure during rotation or retention
#[derive(Debug, Error)]
pub enum RotationError {
    /// I/O error with the path involved
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl RotationError {
    /// Wrap an I/O error with its path
    pub fn io(path: &Path, source: io::Error) -> Self {
        RotationError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Why the active file was rotated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RotationReason {
    /// Next write would exceed `max_file_size`
    Size,
    /// File reached `max_file_age`
    Age,
    /// Emergency size cap crossed
    EmergencySize,
    /// Emergency age cap crossed
    EmergencyAge,
    /// Explicit request
    Manual,
    /// Startup could not resume the newest file
    Startup,
    /// A write outlived its timeout; the old handle's state is unknown
    WriteTimeout,
}

impl RotationReason {
    /// Short stable name, written into rotation markers
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationReason::Size => "size",
            RotationReason::Age => "age",
            RotationReason::EmergencySize => "emergency_size",
            RotationReason::EmergencyAge => "emergency_age",
            RotationReason::Manual => "manual",
            RotationReason::Startup => "startup",
            RotationReason::WriteTimeout => "write_timeout",
        }
    }

    /// Whether an emergency threshold forced the rotation
    pub fn is_emergency(&self) -> bool {
        matches!(
            self,
            RotationReason::EmergencySize | RotationReason::EmergencyAge
        )
    }
}

impl std::fmt::Display for RotationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What rotation needs to know about the active file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    /// Current size including the file header
    pub size: u64,
    /// Entries written to the file
    pub entries: u64,
    /// Creation stamp
    pub created_at: Timestamp,
}

/// How a file was retired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Deleted
    Deleted,
    /// Gzipped to the given path, then deleted
    Archived(PathBuf),
}

/// A retired file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredFile {
    /// The file as it was before retirement
    pub file: WalFileInfo,
    /// What happened to it
    pub disposition: Disposition,
}

/// Result of a retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Files retired, oldest first
    pub retired: Vec<RetiredFile>,
    /// Closed files remaining
    pub remaining_files: usize,
    /// Bytes remaining in the directory, active file included
    pub remaining_bytes: u64,
}

impl RetentionReport {
    /// Bytes freed from the WAL directory
    pub fn bytes_freed(&self) -> u64 {
        self.retired.iter().map(|r| r.file.size).sum()
    }
}

/// Result of an emergency cleanup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Files deleted, oldest first
    pub removed: Vec<WalFileInfo>,
    /// Bytes freed
    pub bytes_freed: u64,
    /// Bytes requested
    pub target_bytes: u64,
}

impl CleanupReport {
    /// Whether the target was met
    pub fn target_met(&self) -> bool {
        self.bytes_freed >= self.target_bytes
    }
}

/// Rotation decisions and retention enforcement for one WAL directory
#[derive(Debug, Clone)]
pub struct WalRotationManager {
    config: RotationConfig,
}

impl WalRotationManager {
    /// Create a manager
    pub fn new(config: RotationConfig) -> Self {
        WalRotationManager { config }
    }

    /// Get configuration
    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Decide whether the active file must be rotated before writing
    /// `incoming` more bytes.
    ///
    /// Emergency caps are checked first. Size caps apply only once the file
    /// holds an entry, so a single batch larger than the cap still lands
    /// somewhere; the emergency age cap applies even to an empty file.
    pub fn check_rotation(
        &self,
        file: &FileState,
        incoming: u64,
        now: Timestamp,
    ) -> Option<RotationReason> {
        let projected = file.size.saturating_add(incoming);
        let age = now.saturating_duration_since(file.created_at);

        if file.entries > 0 && projected > self.config.emergency_file_size {
            return Some(RotationReason::EmergencySize);
        }
        if age >= self.config.emergency_file_age() {
            return Some(RotationReason::EmergencyAge);
        }
        if file.entries > 0 && projected > self.config.max_file_size {
            return Some(RotationReason::Size);
        }
        if file.entries > 0 && age >= self.config.max_file_age() {
            return Some(RotationReason::Age);
        }
        None
    }

    /// Whether a file on disk can be resumed at startup instead of
    /// starting a fresh one.
    pub fn can_resume(&self, file: &FileState, now: Timestamp) -> bool {
        file.size < self.config.max_file_size
            && now.saturating_duration_since(file.created_at) < self.config.max_file_age()
    }

    /// Retire oldest closed files while any cap is violated.
    ///
    /// The count, age and total-size caps are evaluated together; `active`
    /// is excluded from retirement but counted toward total size.
    pub fn enforce_retention(
        &self,
        dir: &Path,
        active: Option<&Path>,
        now: Timestamp,
    ) -> Result<RetentionReport, RotationError> {
        let files = list_files(dir)?;
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        let closed: Vec<WalFileInfo> = files
            .into_iter()
            .filter(|f| Some(f.path.as_path()) != active)
            .collect();

        let mut remaining = closed.len();
        let mut report = RetentionReport::default();

        for file in closed {
            let over_count = remaining > self.config.max_files;
            let over_age =
                now.saturating_duration_since(file.created_at) > self.config.max_retention_age();
            let over_size = total > self.config.max_total_size;
            if !(over_count || over_age || over_size) {
                // Files are oldest-first: nothing newer can violate the age cap,
                // and count/size only shrink from here.
                break;
            }

            let disposition = self.retire(dir, &file)?;
            debug!(
                path = %file.path.display(),
                over_count,
                over_age,
                over_size,
                "Retired WAL file"
            );
            total = total.saturating_sub(file.size);
            remaining -= 1;
            report.retired.push(RetiredFile { file, disposition });
        }

        report.remaining_files = remaining;
        report.remaining_bytes = total;
        if !report.retired.is_empty() {
            info!(
                retired = report.retired.len(),
                bytes_freed = report.bytes_freed(),
                remaining = remaining,
                "Retention pass complete"
            );
        }
        Ok(report)
    }

    /// Delete oldest closed files until `target_bytes` have been freed or no
    /// closed file is left. Archiving is skipped: the point is to free space.
    pub fn emergency_cleanup(
        &self,
        dir: &Path,
        target_bytes: u64,
        active: Option<&Path>,
    ) -> Result<CleanupReport, RotationError> {
        let mut report = CleanupReport {
            target_bytes,
            ..Default::default()
        };

        for file in list_files(dir)? {
            if report.bytes_freed >= target_bytes {
                break;
            }
            if Some(file.path.as_path()) == active {
                continue;
            }
            fs::remove_file(&file.path).map_err(|e| RotationError::io(&file.path, e))?;
            report.bytes_freed += file.size;
            report.removed.push(file);
        }

        if report.target_met() {
            warn!(
                removed = report.removed.len(),
                bytes_freed = report.bytes_freed,
                "Emergency WAL cleanup complete"
            );
        } else {
            warn!(
                removed = report.removed.len(),
                bytes_freed = report.bytes_freed,
                target_bytes,
                "Emergency WAL cleanup could not reach its target"
            );
        }
        Ok(report)
    }

    /// Directory archives are written to
    pub fn archive_dir(&self, wal_dir: &Path) -> PathBuf {
        self.config
            .archive_dir
            .clone()
            .unwrap_or_else(|| wal_dir.join("archive"))
    }

    fn retire(&self, dir: &Path, file: &WalFileInfo) -> Result<Disposition, RotationError> {
        let disposition = if self.config.archive {
            let archive_dir = self.archive_dir(dir);
            fs::create_dir_all(&archive_dir).map_err(|e| RotationError::io(&archive_dir, e))?;
            let target = archive_dir.join(format!("{}.gz", file.file_name()));
            gzip_file(&file.path, &target)?;
            Disposition::Archived(target)
        } else {
            Disposition::Deleted
        };
        fs::remove_file(&file.path).map_err(|e| RotationError::io(&file.path, e))?;
        Ok(disposition)
    }
}

fn gzip_file(source: &Path, target: &Path) -> Result<(), RotationError> {
    let input = File::open(source).map_err(|e| RotationError::io(source, e))?;
    let output = File::create(target).map_err(|e| RotationError::io(target, e))?;

    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    io::copy(&mut BufReader::new(input), &mut encoder).map_err(|e| RotationError::io(target, e))?;
    let mut writer = encoder.finish().map_err(|e| RotationError::io(target, e))?;
    writer.flush().map_err(|e| RotationError::io(target, e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| RotationError::io(target, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::time::Duration;
    use tempfile::tempdir;

    const HOUR_MS: u64 = 60 * 60 * 1000;

    fn state(size: u64, entries: u64, created_ms: u64) -> FileState {
        FileState {
            size,
            entries,
            created_at: Timestamp::from_millis(created_ms),
        }
    }

    fn manager() -> WalRotationManager {
        WalRotationManager::new(RotationConfig::new().with_max_file_size(1_000))
    }

    fn write_files(dir: &Path, stamps: &[u64], size: usize) {
        for stamp in stamps {
            fs::write(
                dir.join(wal_file_name(Timestamp::from_millis(*stamp))),
                vec![b'x'; size],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_size_rotation_only_when_exceeding() {
        let m = manager();
        let now = Timestamp::from_millis(10);
        assert_eq!(m.check_rotation(&state(900, 3, 0), 100, now), None);
        assert_eq!(
            m.check_rotation(&state(900, 3, 0), 101, now),
            Some(RotationReason::Size)
        );
    }

    #[test]
    fn test_empty_file_ignores_normal_size_cap() {
        let m = manager();
        let now = Timestamp::from_millis(10);
        assert_eq!(m.check_rotation(&state(40, 0, 0), 1_500, now), None);
    }

    #[test]
    fn test_emergency_checked_first() {
        let m = manager();
        let now = Timestamp::from_millis(10);
        assert_eq!(
            m.check_rotation(&state(900, 3, 0), 1_200, now),
            Some(RotationReason::EmergencySize)
        );
        assert_eq!(
            m.check_rotation(&state(10, 0, 0), 0, Timestamp::from_millis(4 * HOUR_MS)),
            Some(RotationReason::EmergencyAge)
        );
    }

    #[test]
    fn test_age_rotation() {
        let m = manager();
        assert_eq!(
            m.check_rotation(&state(10, 1, 0), 0, Timestamp::from_millis(HOUR_MS)),
            Some(RotationReason::Age)
        );
        assert_eq!(
            m.check_rotation(&state(10, 0, 0), 0, Timestamp::from_millis(HOUR_MS)),
            None
        );
    }

    #[test]
    fn test_can_resume() {
        let m = manager();
        let now = Timestamp::from_millis(1_000);
        assert!(m.can_resume(&state(500, 2, 0), now));
        assert!(!m.can_resume(&state(1_000, 2, 0), now));
        assert!(!m.can_resume(&state(10, 2, 0), Timestamp::from_millis(HOUR_MS)));
    }

    #[test]
    fn test_retention_by_count_spares_active() {
        let dir = tempdir().unwrap();
        let stamps: Vec<u64> = (1..=8).collect();
        write_files(dir.path(), &stamps, 10);
        let active = dir.path().join(wal_file_name(Timestamp::from_millis(8)));

        let m = WalRotationManager::new(RotationConfig::new().with_max_files(3));
        let report = m
            .enforce_retention(dir.path(), Some(&active), Timestamp::from_millis(100))
            .unwrap();

        assert_eq!(report.retired.len(), 4);
        assert_eq!(report.remaining_files, 3);
        let left: Vec<u64> = list_files(dir.path())
            .unwrap()
            .iter()
            .map(|f| f.created_at.as_millis())
            .collect();
        assert_eq!(left, vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_retention_by_age() {
        let dir = tempdir().unwrap();
        let day = 24 * HOUR_MS;
        write_files(dir.path(), &[day, 5 * day, 9 * day], 10);

        let m = WalRotationManager::new(
            RotationConfig::new().with_max_retention_age(Duration::from_millis(7 * day)),
        );
        let report = m
            .enforce_retention(dir.path(), None, Timestamp::from_millis(10 * day))
            .unwrap();
        assert_eq!(report.retired.len(), 1);
        assert_eq!(report.retired[0].file.created_at.as_millis(), day);
    }

    #[test]
    fn test_retention_by_total_size() {
        let dir = tempdir().unwrap();
        write_files(dir.path(), &[1, 2, 3, 4], 100);
        let m = WalRotationManager::new(RotationConfig::new().with_max_total_size(250));
        let report = m
            .enforce_retention(dir.path(), None, Timestamp::from_millis(10))
            .unwrap();
        assert_eq!(report.retired.len(), 2);
        assert_eq!(report.bytes_freed(), 200);
        assert_eq!(report.remaining_bytes, 200);
    }

    #[test]
    fn test_retention_archives_with_gzip() {
        let dir = tempdir().unwrap();
        write_files(dir.path(), &[1, 2, 3], 64);
        let m = WalRotationManager::new(RotationConfig::new().with_max_files(1).with_archive(None));
        let report = m
            .enforce_retention(dir.path(), None, Timestamp::from_millis(10))
            .unwrap();
        assert_eq!(report.retired.len(), 2);

        let Disposition::Archived(archive) = &report.retired[0].disposition else {
            panic!("expected archive");
        };
        assert_eq!(archive, &dir.path().join("archive").join("wal_1.log.gz"));
        let mut decoded = Vec::new();
        GzDecoder::new(File::open(archive).unwrap())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, vec![b'x'; 64]);
        assert!(!report.retired[0].file.path.exists());
    }

    #[test]
    fn test_emergency_cleanup_frees_target() {
        let dir = tempdir().unwrap();
        write_files(dir.path(), &[1, 2, 3, 4], 100);
        let active = dir.path().join(wal_file_name(Timestamp::from_millis(1)));

        let report = manager()
            .emergency_cleanup(dir.path(), 150, Some(&active))
            .unwrap();
        assert!(report.target_met());
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.bytes_freed, 200);
        assert!(active.exists());
    }

    #[test]
    fn test_emergency_cleanup_stops_when_out_of_files() {
        let dir = tempdir().unwrap();
        write_files(dir.path(), &[1, 2], 10);
        let report = manager().emergency_cleanup(dir.path(), 1_000, None).unwrap();
        assert!(!report.target_met());
        assert_eq!(report.removed.len(), 2);
    }
}
