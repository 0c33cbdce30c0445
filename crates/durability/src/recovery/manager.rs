//! WAL recovery manager
//!
//! Recovery runs once at startup, before the writer opens a file:
//!
//! 1. DISCOVER: list WAL files, keep the newest `max_files`, replay them
//!    oldest-first.
//! 2. PROCESS: read each file, check its header, stream-decode entries.
//!    Corrupt regions are skipped by the decoder; an unreadable file is
//!    skipped or fatal depending on `continue_on_error`.
//! 3. RECONSTRUCT: fold entries into sessions (see [`SessionReconstructor`]).
//! 4. RESOLVE/VALIDATE: completeness per session.
//! 5. RESULT: status plus counters.
//!
//! Recovery only reads. Running it twice over the same directory yields the
//! same sessions.

use super::config::{RecoveryConfig, RecoveryConfigError};
use super::session::{RecoveredSession, SessionReconstructor};
use crate::codec::{StreamItem, WalDecoder};
use crate::format::{FileHeaderError, WalFileHeader};
use crate::rotation::{list_files, RotationError, WalFileInfo};
use scribe_core::{SessionId, Timestamp, TranscriptUtterance};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Recovery errors
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// I/O error with the path involved
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// File cannot be replayed at all
    #[error("Corrupt WAL file {}: {reason}", path.display())]
    CorruptFile {
        /// Offending file
        path: PathBuf,
        /// Why
        reason: FileHeaderError,
    },

    /// Wall-clock budget ran out
    #[error("Recovery budget of {budget:?} exceeded after {files_done} files")]
    Budget {
        /// Configured budget
        budget: Duration,
        /// Files fully processed
        files_done: usize,
    },

    /// Invalid configuration
    #[error("Invalid recovery configuration: {0}")]
    Config(#[from] RecoveryConfigError),
}

impl From<RotationError> for RecoveryError {
    fn from(e: RotationError) -> Self {
        match e {
            RotationError::Io { path, source } => RecoveryError::Io { path, source },
        }
    }
}

/// Outcome class of a recovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryStatus {
    /// Every discovered file was replayed
    Success,
    /// Some files were skipped or the budget ran out
    PartialSuccess,
    /// Files existed but none could be replayed
    Failed,
    /// Recovery disabled or nothing to recover
    Skipped,
}

impl RecoveryStatus {
    /// Uppercase name used in logs and recovery markers
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStatus::Success => "SUCCESS",
            RecoveryStatus::PartialSuccess => "PARTIAL_SUCCESS",
            RecoveryStatus::Failed => "FAILED",
            RecoveryStatus::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// WAL files found in the directory
    pub files_discovered: usize,
    /// Files left out by the `max_files` cap
    pub files_capped: usize,
    /// Files fully replayed
    pub files_processed: usize,
    /// Files that could not be replayed
    pub files_failed: usize,
    /// Entries decoded
    pub entries_read: u64,
    /// Entries that changed session state
    pub entries_applied: u64,
    /// Entries dropped by delete tombstones
    pub entries_tombstoned: u64,
    /// Identical replays ignored
    pub duplicates: u64,
    /// Deletes for unknown utterances
    pub unknown_deletes: u64,
    /// Control and recovery entries seen
    pub control_entries: u64,
    /// Corrupt regions skipped by the decoder
    pub corrupted_regions: u64,
    /// Bytes in skipped regions
    pub skipped_bytes: u64,
    /// Conflicts resolved by policy
    pub conflicts: u64,
    /// Utterances flagged uncertain
    pub uncertain_entries: u64,
    /// Sessions removed by session deletes
    pub sessions_deleted: u64,
    /// Sessions in the result
    pub sessions_recovered: usize,
    /// Utterances in the result
    pub utterances_recovered: usize,
}

/// Result of a recovery run
#[derive(Debug)]
pub struct RecoveryReport {
    /// Outcome class
    pub status: RecoveryStatus,
    /// Reconstructed sessions by id
    pub sessions: BTreeMap<SessionId, RecoveredSession>,
    /// Counters
    pub stats: RecoveryStats,
    /// Contained problems (skipped regions, capped files)
    pub warnings: Vec<String>,
    /// File-level failures
    pub errors: Vec<RecoveryError>,
    /// Wall time spent
    pub duration: Duration,
}

impl RecoveryReport {
    fn skipped(duration: Duration) -> Self {
        RecoveryReport {
            status: RecoveryStatus::Skipped,
            sessions: BTreeMap::new(),
            stats: RecoveryStats::default(),
            warnings: Vec::new(),
            errors: Vec::new(),
            duration,
        }
    }

    /// Look up a session
    pub fn session(&self, session_id: &str) -> Option<&RecoveredSession> {
        self.sessions.get(session_id)
    }

    /// Utterances across all sessions, ordered by creation time for
    /// replay into the in-memory index.
    pub fn utterances(&self) -> Vec<TranscriptUtterance> {
        let mut all: Vec<TranscriptUtterance> = self
            .sessions
            .values()
            .flat_map(|s| s.utterances.iter().cloned())
            .collect();
        all.sort_by_key(|u| u.created_at);
        all
    }

    /// Whether any data was recovered
    pub fn has_data(&self) -> bool {
        !self.sessions.is_empty()
    }
}

/// Replays a WAL directory into recovered sessions.
#[derive(Debug, Clone)]
pub struct WalRecoveryManager {
    config: RecoveryConfig,
}

impl WalRecoveryManager {
    /// Create a manager
    pub fn new(config: RecoveryConfig) -> Self {
        WalRecoveryManager { config }
    }

    /// Get configuration
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Recover `dir`. `now` drives the completeness heuristic.
    ///
    /// Returns an error only for configuration problems, an unreadable
    /// directory, or a bad file when `continue_on_error` is off.
    pub fn recover(&self, dir: &Path, now: Timestamp) -> Result<RecoveryReport, RecoveryError> {
        let started = Instant::now();
        self.config.validate()?;

        if !self.config.enabled {
            info!("WAL recovery disabled");
            return Ok(RecoveryReport::skipped(started.elapsed()));
        }

        // DISCOVER
        let mut files = list_files(dir)?;
        if files.is_empty() {
            debug!(dir = %dir.display(), "No WAL files to recover");
            return Ok(RecoveryReport::skipped(started.elapsed()));
        }

        let mut stats = RecoveryStats {
            files_discovered: files.len(),
            ..Default::default()
        };
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if files.len() > self.config.max_files {
            let capped = files.len() - self.config.max_files;
            files.drain(..capped);
            stats.files_capped = capped;
            warnings.push(format!(
                "{} oldest WAL files left out by the max_files cap of {}",
                capped, self.config.max_files
            ));
            warn!(capped, max_files = self.config.max_files, "Recovery file cap reached");
        }

        info!(
            dir = %dir.display(),
            files = files.len(),
            policy = %self.config.conflict_policy,
            "Starting WAL recovery"
        );

        // PROCESS + RECONSTRUCT
        let budget = self.config.max_duration();
        let mut budget_exceeded = false;
        let mut reconstructor = SessionReconstructor::new(self.config.conflict_policy);

        for file in &files {
            if started.elapsed() >= budget {
                budget_exceeded = true;
                break;
            }
            match self.replay_file(file, &mut reconstructor, &mut stats, &mut warnings, started) {
                Ok(true) => stats.files_processed += 1,
                Ok(false) => {
                    budget_exceeded = true;
                    break;
                }
                Err(e) => {
                    stats.files_failed += 1;
                    if !self.config.continue_on_error {
                        error!(path = %file.path.display(), error = %e, "Recovery aborted");
                        return Err(e);
                    }
                    warn!(path = %file.path.display(), error = %e, "Skipping unreadable WAL file");
                    errors.push(e);
                }
            }
        }

        if budget_exceeded {
            let e = RecoveryError::Budget {
                budget,
                files_done: stats.files_processed,
            };
            warn!(error = %e, "Recovery truncated");
            errors.push(e);
        }

        // RESOLVE/VALIDATE
        let (sessions, applied) = reconstructor.finish(now, self.config.completion_idle());
        stats.entries_applied = applied.applied + applied.conflicts;
        stats.entries_tombstoned = applied.tombstoned;
        stats.duplicates = applied.duplicates;
        stats.unknown_deletes = applied.unknown_deletes;
        stats.control_entries = applied.control;
        stats.conflicts = applied.conflicts;
        stats.uncertain_entries = applied.uncertain;
        stats.sessions_deleted = applied.sessions_deleted;
        stats.sessions_recovered = sessions.len();
        stats.utterances_recovered = sessions.values().map(|s| s.utterances.len()).sum();

        // RESULT
        let status = if stats.files_processed == 0 && stats.files_failed > 0 {
            RecoveryStatus::Failed
        } else if budget_exceeded || stats.files_failed > 0 {
            RecoveryStatus::PartialSuccess
        } else {
            RecoveryStatus::Success
        };

        let duration = started.elapsed();
        info!(
            status = %status,
            sessions = stats.sessions_recovered,
            utterances = stats.utterances_recovered,
            entries = stats.entries_read,
            conflicts = stats.conflicts,
            uncertain = stats.uncertain_entries,
            skipped_regions = stats.corrupted_regions,
            duration_ms = duration.as_millis() as u64,
            "WAL recovery complete"
        );

        Ok(RecoveryReport {
            status,
            sessions,
            stats,
            warnings,
            errors,
            duration,
        })
    }

    /// Replay one file. Returns `Ok(false)` if the budget ran out mid-file.
    fn replay_file(
        &self,
        file: &WalFileInfo,
        reconstructor: &mut SessionReconstructor,
        stats: &mut RecoveryStats,
        warnings: &mut Vec<String>,
        started: Instant,
    ) -> Result<bool, RecoveryError> {
        let bytes = fs::read(&file.path).map_err(|source| RecoveryError::Io {
            path: file.path.clone(),
            source,
        })?;
        let (header, header_len) =
            WalFileHeader::from_bytes(&bytes).map_err(|reason| RecoveryError::CorruptFile {
                path: file.path.clone(),
                reason,
            })?;
        debug!(
            path = %file.path.display(),
            created_at = %header.created_at,
            session = header.session_id.as_deref().unwrap_or("-"),
            "Replaying WAL file"
        );

        let budget = self.config.max_duration();
        for item in WalDecoder::stream_from(&bytes, header_len) {
            match item {
                StreamItem::Entry(decoded) => {
                    stats.entries_read += 1;
                    reconstructor.apply(&decoded.entry);
                }
                StreamItem::Skipped(skip) => {
                    stats.corrupted_regions += 1;
                    stats.skipped_bytes += skip.skipped_bytes as u64;
                    warnings.push(format!(
                        "{}: skipped {} bytes at offset {} ({})",
                        file.file_name(),
                        skip.skipped_bytes,
                        skip.offset,
                        skip.reason
                    ));
                }
            }
            if started.elapsed() >= budget {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
