//! WAL writer.
//!
//! The writer owns the active file, an append buffer and a priority queue.
//! Entries move queue → buffer → disk:
//!
//! - `write_entries` admits a batch to the queue (subject to backpressure),
//!   then drains the queue into the buffer while the buffer has room.
//! - A flush runs when the buffer reaches `batch_size` or an urgent write
//!   arrives. Buffered entries are encoded individually, concatenated,
//!   written with one `write_all` and then fsynced.
//! - Before each write the rotation manager decides whether the active file
//!   must be closed first.
//!
//! Entries reach disk in buffer order. Priority only decides which queued
//! batch enters the buffer next.
//!
//! # Failure handling
//!
//! A failed write is retried up to `max_retries` times with a linear
//! backoff; partial bytes are truncated away between attempts. If every
//! attempt fails the batch stays buffered for the next flush. Each attempt
//! runs on a helper thread and is abandoned after `write_timeout`; since the
//! abandoned write may still land, the next flush rotates to a fresh file.

use crate::codec::WalEncoder;
use crate::format::{EntryPayload, WalEntry};
use crate::rotation::{list_files, RetentionReport, RotationError, RotationReason, WalRotationManager};
use crate::wal::config::{WalConfig, WalConfigError};
use crate::wal::file::WalFile;
use crate::wal::queue::{WritePriority, WriteQueue};
use scribe_core::Timestamp;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WAL write errors
#[derive(Debug, Error)]
pub enum WalWriteError {
    /// I/O error outside the retried write path
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Every write attempt failed; the batch is still buffered
    #[error("WAL write failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        #[source]
        last: io::Error,
    },

    /// A write + fsync did not complete in time; the batch is still buffered
    #[error("WAL write did not complete within {0:?}")]
    Timeout(Duration),

    /// Queue and buffer are at `max_queue_size`
    #[error("WAL write queue is full ({limit} entries)")]
    QueueFull {
        /// Configured limit
        limit: usize,
    },

    /// Writer has been closed
    #[error("WAL writer is closed")]
    Closed,

    /// Rotation failed; buffered entries are kept
    #[error("WAL rotation failed: {0}")]
    Rotation(#[from] RotationError),

    /// Invalid configuration
    #[error("Invalid WAL configuration: {0}")]
    Config(#[from] WalConfigError),
}

impl WalWriteError {
    /// Whether the batch was refused outright. Any other error means the
    /// batch was admitted and is still queued or buffered for a later flush.
    pub fn is_rejection(&self) -> bool {
        matches!(self, WalWriteError::QueueFull { .. } | WalWriteError::Closed)
    }
}

/// A completed rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationRecord {
    /// Why it happened
    pub reason: RotationReason,
    /// File that was closed
    pub previous: PathBuf,
    /// File now active
    pub current: PathBuf,
    /// Files retired by the retention pass that followed
    pub retired: usize,
}

/// Result of a flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries written
    pub entries: usize,
    /// Bytes written
    pub bytes: u64,
    /// Batches written (one write + fsync each)
    pub batches: usize,
    /// Rotations performed before writing
    pub rotations: Vec<RotationRecord>,
    /// Active file after the flush
    pub file: PathBuf,
    /// Wall time spent
    pub duration: Duration,
}

impl FlushReport {
    /// Whether nothing needed writing
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

/// What `write_entries` did with the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Admitted and waiting for the next flush
    Buffered {
        /// Entries queued or buffered, this batch included
        pending: usize,
    },
    /// Admitted and flushed
    Flushed(FlushReport),
}

/// Cumulative writer counters.
///
/// Counters accumulate over the lifetime of the writer and are never reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Entries durably written
    pub entries_written: u64,
    /// Bytes durably written (entries only)
    pub bytes_written: u64,
    /// Batches written
    pub flushes: u64,
    /// fsync calls that completed
    pub fsyncs: u64,
    /// Extra attempts after a failed write
    pub retries: u64,
    /// Flushes that gave up
    pub failures: u64,
    /// Attempts abandoned on timeout
    pub timeouts: u64,
    /// Rotations performed
    pub rotations: u64,
    /// Closed files retired by retention
    pub files_retired: u64,
    /// Writes refused by backpressure
    pub rejected_writes: u64,
    /// Entries currently queued
    pub queue_depth: usize,
    /// Entries currently buffered
    pub buffered: usize,
    /// Highest queue + buffer depth seen
    pub peak_queue_depth: usize,
    /// Active file
    pub current_file: Option<PathBuf>,
    /// Active file size
    pub current_file_size: u64,
}

enum AttemptError {
    Io(io::Error),
    Timeout,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct Faults {
    fail_writes: u32,
    stall: Option<Duration>,
}

/// Append-only writer for one WAL directory.
pub struct WalWriter {
    dir: PathBuf,
    node_id: Uuid,
    config: WalConfig,
    rotation: WalRotationManager,
    /// Active file; `None` once closed
    file: Option<WalFile>,
    buffer: Vec<WalEntry>,
    queue: WriteQueue,
    /// Rotation forced on the next flush
    pending_rotation: Option<RotationReason>,
    resumed: bool,
    last_retention: Option<RetentionReport>,
    stats: WriterStats,
    #[cfg(test)]
    faults: Faults,
}

impl WalWriter {
    /// Open a writer on `dir`.
    ///
    /// The newest file is resumed if its header is valid, its entry chain
    /// reaches end of file, and it is under the rotation thresholds.
    /// Otherwise a fresh file is started, beginning with a rotation marker
    /// that names the file it replaces.
    pub fn open(
        dir: impl Into<PathBuf>,
        config: WalConfig,
        rotation: WalRotationManager,
        node_id: Uuid,
    ) -> Result<Self, WalWriteError> {
        config.validate()?;
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| WalWriteError::Io {
            path: dir.clone(),
            source,
        })?;

        let now = Timestamp::now();
        let mut writer = WalWriter {
            dir,
            node_id,
            config,
            rotation,
            file: None,
            buffer: Vec::new(),
            queue: WriteQueue::new(),
            pending_rotation: None,
            resumed: false,
            last_retention: None,
            stats: WriterStats::default(),
            #[cfg(test)]
            faults: Faults::default(),
        };

        let newest = list_files(&writer.dir)?.pop();
        let file = match newest {
            Some(info) => match WalFile::open_append(&info.path) {
                Ok(file) if writer.rotation.can_resume(&file.state(), now) => {
                    info!(
                        path = %file.path().display(),
                        entries = file.entries(),
                        size = file.size(),
                        "Resuming WAL file"
                    );
                    writer.resumed = true;
                    file
                }
                Ok(file) => {
                    debug!(
                        path = %file.path().display(),
                        "Newest WAL file is past rotation thresholds, starting a new one"
                    );
                    writer.create_file(now, Some((file.file_name(), RotationReason::Startup)))?
                }
                Err(e) => {
                    warn!(
                        path = %info.path.display(),
                        error = %e,
                        "Newest WAL file cannot be resumed, starting a new one"
                    );
                    writer.create_file(now, Some((info.file_name(), RotationReason::Startup)))?
                }
            },
            None => writer.create_file(now, None)?,
        };
        writer.file = Some(file);
        Ok(writer)
    }

    /// Admit `entries` at `priority`.
    ///
    /// Flushes when the buffer reaches `batch_size` or `priority` is
    /// `Urgent`. A flush error is returned, but the admitted entries stay
    /// buffered and are retried by the next flush.
    pub fn write_entries(
        &mut self,
        entries: Vec<WalEntry>,
        priority: WritePriority,
    ) -> Result<WriteOutcome, WalWriteError> {
        if self.file.is_none() {
            return Err(WalWriteError::Closed);
        }

        let pending = self.pending();
        if priority != WritePriority::Urgent
            && pending + entries.len() > self.config.max_queue_size
        {
            self.stats.rejected_writes += 1;
            warn!(
                pending,
                incoming = entries.len(),
                limit = self.config.max_queue_size,
                "WAL write queue full, rejecting write"
            );
            return Err(WalWriteError::QueueFull {
                limit: self.config.max_queue_size,
            });
        }

        self.queue.push(priority, entries);
        self.stats.peak_queue_depth = self.stats.peak_queue_depth.max(self.pending());
        self.drain_queue();

        if priority == WritePriority::Urgent || self.buffer.len() >= self.config.batch_size {
            return self.flush().map(WriteOutcome::Flushed);
        }
        Ok(WriteOutcome::Buffered {
            pending: self.pending(),
        })
    }

    /// Admit a single entry.
    pub fn write_entry(
        &mut self,
        entry: WalEntry,
        priority: WritePriority,
    ) -> Result<WriteOutcome, WalWriteError> {
        self.write_entries(vec![entry], priority)
    }

    /// Write everything queued or buffered, rotating first when needed.
    pub fn flush(&mut self) -> Result<FlushReport, WalWriteError> {
        if self.file.is_none() {
            return Err(WalWriteError::Closed);
        }

        let started = Instant::now();
        let mut report = FlushReport::default();
        loop {
            self.drain_queue();
            if self.buffer.is_empty() {
                break;
            }
            self.flush_buffer(&mut report)?;
        }

        report.file = self.current_path().map(Path::to_path_buf).unwrap_or_default();
        report.duration = started.elapsed();
        Ok(report)
    }

    /// Close the active file and start a new one.
    ///
    /// Buffered entries are not flushed first; they go to the new file.
    pub fn rotate(&mut self, reason: RotationReason) -> Result<RotationRecord, WalWriteError> {
        let now = Timestamp::now();
        let previous_name = self.file.as_ref().ok_or(WalWriteError::Closed)?.file_name();
        let new_file = self.create_file(now, Some((previous_name, reason)))?;
        let current = new_file.path().to_path_buf();

        let mut old = match self.file.replace(new_file) {
            Some(old) => old,
            None => return Err(WalWriteError::Closed),
        };
        if let Err(e) = old.close() {
            warn!(path = %old.path().display(), error = %e, "Failed to sync rotated WAL file");
        }
        self.stats.rotations += 1;
        info!(
            reason = %reason,
            previous = %old.path().display(),
            current = %current.display(),
            "Rotated WAL file"
        );

        let retired = match self
            .rotation
            .enforce_retention(&self.dir, Some(&current), now)
        {
            Ok(report) => {
                let retired = report.retired.len();
                self.stats.files_retired += retired as u64;
                self.last_retention = Some(report);
                retired
            }
            Err(e) => {
                warn!(error = %e, "Retention pass failed after rotation");
                0
            }
        };

        Ok(RotationRecord {
            reason,
            previous: old.path().to_path_buf(),
            current,
            retired,
        })
    }

    /// Flush everything and close the active file.
    ///
    /// Closing an already closed writer is a no-op.
    pub fn close(&mut self) -> Result<FlushReport, WalWriteError> {
        if self.file.is_none() {
            return Ok(FlushReport::default());
        }
        let report = self.flush()?;
        if let Some(mut file) = self.file.take() {
            file.close().map_err(|source| WalWriteError::Io {
                path: file.path().to_path_buf(),
                source,
            })?;
            info!(path = %file.path().display(), entries = file.entries(), "Closed WAL file");
        }
        Ok(report)
    }

    /// Snapshot of counters
    pub fn stats(&self) -> WriterStats {
        let mut stats = self.stats.clone();
        stats.queue_depth = self.queue.len();
        stats.buffered = self.buffer.len();
        stats.current_file = self.current_path().map(Path::to_path_buf);
        stats.current_file_size = self.file.as_ref().map(|f| f.size()).unwrap_or(0);
        stats
    }

    /// Entries queued or buffered
    pub fn pending(&self) -> usize {
        self.queue.len() + self.buffer.len()
    }

    /// Active file, if open
    pub fn current_path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path())
    }

    /// WAL directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Node id written into new file headers
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Rotation manager
    pub fn rotation(&self) -> &WalRotationManager {
        &self.rotation
    }

    /// Whether `open` resumed an existing file
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Whether the writer has been closed
    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Report of the most recent retention pass
    pub fn last_retention(&self) -> Option<&RetentionReport> {
        self.last_retention.as_ref()
    }

    /// Move queued batches into the buffer while it has room.
    fn drain_queue(&mut self) {
        while self.buffer.len() < self.config.batch_size {
            match self.queue.pop() {
                Some((_, entries)) => self.buffer.extend(entries),
                None => break,
            }
        }
    }

    fn flush_buffer(&mut self, report: &mut FlushReport) -> Result<(), WalWriteError> {
        let now = Timestamp::now();
        let batch = WalEncoder::encode_batch(&self.buffer);
        let state = self.file.as_ref().ok_or(WalWriteError::Closed)?.state();

        let reason = self.pending_rotation.take().or_else(|| {
            self.rotation
                .check_rotation(&state, batch.byte_len() as u64, now)
        });
        if let Some(reason) = reason {
            match self.rotate(reason) {
                Ok(record) => report.rotations.push(record),
                Err(e) => {
                    if reason == RotationReason::WriteTimeout {
                        self.pending_rotation = Some(reason);
                    }
                    self.stats.failures += 1;
                    error!(reason = %reason, error = %e, "WAL rotation failed, batch kept in buffer");
                    return Err(e);
                }
            }
        }

        self.write_with_retry(&batch.bytes)?;

        let entries = batch.len();
        let bytes = batch.byte_len() as u64;
        if let Some(file) = self.file.as_mut() {
            file.record_append(bytes, entries as u64);
        }
        self.buffer.clear();

        self.stats.entries_written += entries as u64;
        self.stats.bytes_written += bytes;
        self.stats.flushes += 1;
        self.stats.fsyncs += 1;
        report.entries += entries;
        report.bytes += bytes;
        report.batches += 1;
        debug!(entries, bytes, "WAL batch flushed");
        Ok(())
    }

    fn write_with_retry(&mut self, bytes: &[u8]) -> Result<(), WalWriteError> {
        let max_attempts = self.config.max_retries;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.write_once(bytes) {
                Ok(()) => {
                    if attempt > 1 {
                        info!(attempt, "WAL write succeeded after retry");
                    }
                    return Ok(());
                }
                Err(AttemptError::Timeout) => {
                    self.stats.timeouts += 1;
                    self.stats.failures += 1;
                    self.pending_rotation = Some(RotationReason::WriteTimeout);
                    error!(
                        timeout_ms = self.config.write_timeout_ms,
                        "WAL write timed out, batch kept in buffer"
                    );
                    return Err(WalWriteError::Timeout(self.config.write_timeout()));
                }
                Err(AttemptError::Io(e)) => {
                    warn!(attempt, max_attempts, error = %e, "WAL write failed");
                    if let Some(file) = self.file.as_mut() {
                        if let Err(te) = file.truncate_to_durable() {
                            warn!(error = %te, "Failed to truncate partial WAL write");
                        }
                    }
                    last_error = Some(e);
                    if attempt < max_attempts {
                        self.stats.retries += 1;
                        let backoff = self.config.retry_backoff() * attempt;
                        if !backoff.is_zero() {
                            thread::sleep(backoff);
                        }
                    }
                }
            }
        }

        self.stats.failures += 1;
        error!(attempts = max_attempts, "WAL write retries exhausted, batch kept in buffer");
        Err(WalWriteError::RetriesExhausted {
            attempts: max_attempts,
            last: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no write attempted")),
        })
    }

    /// One write + fsync raced against `write_timeout`.
    fn write_once(&mut self, bytes: &[u8]) -> Result<(), AttemptError> {
        if self.take_injected_failure() {
            return Err(AttemptError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        let stall = self.take_injected_stall();

        let file = self
            .file
            .as_ref()
            .ok_or_else(|| AttemptError::Io(io::Error::new(io::ErrorKind::Other, "writer closed")))?;
        let mut handle = file.try_clone_handle().map_err(AttemptError::Io)?;
        let data = bytes.to_vec();

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("scribe-wal-write".to_string())
            .spawn(move || {
                if let Some(delay) = stall {
                    thread::sleep(delay);
                }
                let result = handle.write_all(&data).and_then(|()| handle.sync_data());
                let _ = tx.send(result);
            })
            .map_err(AttemptError::Io)?;

        match rx.recv_timeout(self.config.write_timeout()) {
            Ok(result) => result.map_err(AttemptError::Io),
            Err(RecvTimeoutError::Timeout) => Err(AttemptError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(AttemptError::Io(io::Error::new(
                io::ErrorKind::Other,
                "write thread exited without reporting",
            ))),
        }
    }

    /// Create a new file; when it replaces another, write a rotation marker
    /// naming it as the first entry.
    fn create_file(
        &self,
        now: Timestamp,
        replaces: Option<(String, RotationReason)>,
    ) -> Result<WalFile, RotationError> {
        let mut file = WalFile::create(
            &self.dir,
            now,
            self.node_id,
            self.config.session_id.as_deref(),
        )
        .map_err(|e| RotationError::io(&self.dir, e))?;

        if let Some((previous_file, reason)) = replaces {
            let marker = WalEntry::new(
                now,
                EntryPayload::RotationMarker {
                    previous_file,
                    reason: reason.as_str().to_string(),
                },
            );
            file.append_synced(&WalEncoder::encode(&marker), 1)
                .map_err(|e| RotationError::io(file.path(), e))?;
        }
        debug!(path = %file.path().display(), "Created WAL file");
        Ok(file)
    }

    #[cfg(test)]
    fn take_injected_failure(&mut self) -> bool {
        if self.faults.fail_writes > 0 {
            self.faults.fail_writes -= 1;
            return true;
        }
        false
    }

    #[cfg(not(test))]
    fn take_injected_failure(&mut self) -> bool {
        false
    }

    #[cfg(test)]
    fn take_injected_stall(&mut self) -> Option<Duration> {
        self.faults.stall.take()
    }

    #[cfg(not(test))]
    fn take_injected_stall(&mut self) -> Option<Duration> {
        None
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let pending = self.pending();
        if pending > 0 && self.file.is_some() {
            warn!(pending, "WAL writer dropped with unflushed entries");
        }
    }
}
