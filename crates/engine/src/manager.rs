//! Transcript persistence manager
//!
//! Wires the in-memory index, the WAL writer, the flush policy, the storage
//! monitor and startup recovery together behind one handle.
//!
//! # Threads
//!
//! - Callers: `persist_utterance` updates the index, queues a job for the
//!   writer thread and returns. It never takes the WAL lock or touches disk.
//! - `scribe-wal-writer`: applies queued jobs in order. Every WAL mutation
//!   (appends, flushes, rotation, storage sampling, emergency cleanup) runs
//!   here, so retries, backoff and fsync only ever stall this thread.
//! - `scribe-maintenance` (optional): queues a `tick` every
//!   `maintenance_interval`.
//!
//! Blocking calls (`flush`, `delete_session`, `tick`, `wait_idle`,
//! `shutdown`) queue a job and wait for its reply.
//!
//! # Locking
//!
//! - `index` (RwLock): the fast path. A persist updates the index and queues
//!   its WAL job under one write lock, so the log sees revisions in the same
//!   order as the index.
//! - `wal` (Mutex): writer, flush policy, storage monitor. Only the writer
//!   thread holds it across I/O.
//!
//! Lock order is `index`, `lifecycle`, `sessions`, `queue`. None is held
//! while observers run.

use crate::config::PersistenceConfig;
use crate::error::{PersistenceError, PersistenceResult};
use crate::events::{ChannelObserver, PersistenceEvent, PersistenceObserver};
use crate::ring_buffer::RingBuffer;
use parking_lot::{Mutex, RwLock};
use scribe_core::{
    AppendOutcome, IndexMetrics, SessionId, Timestamp, TranscriptUtterance, UtteranceIndex,
    UtteranceState,
};
use scribe_durability::{
    CleanupReport, EntryPayload, FlushPolicyManager, FlushPolicyStats, FlushReport,
    RecoveryReport, RecoveryStatus, StorageMonitor, StorageReport, StorageStatus, WalEntry,
    WalRecoveryManager, WalRotationManager, WalWriteError, WalWriter, WriteOutcome,
    WritePriority, WriterStats,
};
use std::collections::HashSet;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Lock file held in the WAL directory while a manager is running
pub const LOCK_FILE_NAME: &str = "scribe.lock";

/// Reason recorded in session delete entries
const SESSION_DELETE_REASON: &str = "user_request";

/// Where the manager is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed; `initialize` not yet run
    Created,
    /// Recovered and accepting writes
    Running,
    /// `shutdown` has been called
    ShutDown,
}

/// Snapshot of the manager's state
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceStats {
    /// Lifecycle phase
    pub lifecycle: Lifecycle,
    /// Index metrics
    pub index: IndexMetrics,
    /// Writer counters, once the writer is open
    pub writer: Option<WriterStats>,
    /// Flush requests per trigger
    pub policy: FlushPolicyStats,
    /// Partials written since the last flush
    pub pending_partials: usize,
    /// Sessions with at least one persisted utterance
    pub sessions: usize,
    /// Outcome of the startup recovery
    pub last_recovery: Option<RecoveryStatus>,
    /// Status from the latest storage evaluation
    pub storage: Option<StorageStatus>,
}

/// What one maintenance tick did
#[derive(Debug, Default)]
pub struct TickReport {
    /// Flush released by the flush policy
    pub flush: Option<FlushReport>,
    /// Storage evaluation, when a sample was due
    pub storage: Option<StorageReport>,
    /// Emergency cleanup, when storage reached emergency
    pub cleanup: Option<CleanupReport>,
}

/// Work for the writer thread, applied in queue order
enum WalJob {
    Append {
        utterance: TranscriptUtterance,
        previous: Option<TranscriptUtterance>,
    },
    DeleteSession {
        session_id: SessionId,
        removed: usize,
        reply: Sender<Result<(), WalWriteError>>,
    },
    Flush {
        reply: Sender<Result<FlushReport, WalWriteError>>,
    },
    MemoryPressure {
        ratio: f64,
        at: Instant,
    },
    Visibility {
        visible: bool,
        at: Instant,
    },
    Activity {
        active: bool,
    },
    Tick {
        reply: Sender<TickReport>,
    },
    Sync {
        reply: Sender<()>,
    },
    Close {
        reply: Sender<Result<FlushReport, WalWriteError>>,
    },
}

struct WalState {
    writer: Option<WalWriter>,
    policy: FlushPolicyManager,
    monitor: StorageMonitor,
    /// Sessions whose `SessionCreate` entry the writer has admitted
    logged_sessions: HashSet<SessionId>,
    last_recovery: Option<RecoveryStatus>,
    last_storage: Option<StorageStatus>,
    /// Held for as long as the writer may append
    lock_file: Option<File>,
}

impl WalState {
    fn flush(
        &mut self,
        now: Instant,
        events: &mut Vec<PersistenceEvent>,
    ) -> Result<FlushReport, WalWriteError> {
        let writer = self.writer.as_mut().ok_or(WalWriteError::Closed)?;
        let report = writer.flush()?;
        self.policy.mark_flushed(now);
        push_flush_events(&report, events);
        Ok(report)
    }
}

struct Shared {
    config: PersistenceConfig,
    node_id: Uuid,
    lifecycle: RwLock<Lifecycle>,
    index: RwLock<Box<dyn UtteranceIndex>>,
    /// Sessions with at least one utterance in the index
    sessions: RwLock<HashSet<SessionId>>,
    /// Sending half of the writer thread's job queue; `None` when stopped
    queue: Mutex<Option<Sender<WalJob>>>,
    writer_thread: Mutex<Option<ThreadId>>,
    wal: Mutex<WalState>,
    observers: RwLock<Vec<Arc<dyn PersistenceObserver>>>,
}

struct Maintenance {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Persistence front end used by the transcription pipeline.
///
/// Writes land in the index synchronously; the WAL copy is queued for the
/// writer thread and never blocks or fails `persist_utterance`. Session
/// deletes are the exception: they are only reported done once the delete
/// entry is on disk.
///
/// # Example
///
/// ```no_run
/// use scribe_engine::{PersistenceConfig, TranscriptPersistenceManager};
/// use scribe_core::TranscriptUtterance;
///
/// let manager = TranscriptPersistenceManager::with_ring_buffer(PersistenceConfig::default())?;
/// manager.initialize()?;
/// manager.persist_utterance(TranscriptUtterance::new("u1", "s1", "hello"))?;
/// manager.shutdown()?;
/// # Ok::<(), scribe_engine::PersistenceError>(())
/// ```
pub struct TranscriptPersistenceManager {
    shared: Arc<Shared>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    maintenance: Mutex<Option<Maintenance>>,
}

impl TranscriptPersistenceManager {
    /// Create a manager over `index`. Nothing touches disk until
    /// `initialize`.
    pub fn new(
        config: PersistenceConfig,
        index: Box<dyn UtteranceIndex>,
    ) -> PersistenceResult<Self> {
        config.validate()?;
        let now = Instant::now();
        let wal = WalState {
            writer: None,
            policy: FlushPolicyManager::new(config.flush.clone(), now),
            monitor: StorageMonitor::new(config.monitor.clone()),
            logged_sessions: HashSet::new(),
            last_recovery: None,
            last_storage: None,
            lock_file: None,
        };
        Ok(TranscriptPersistenceManager {
            shared: Arc::new(Shared {
                config,
                node_id: Uuid::new_v4(),
                lifecycle: RwLock::new(Lifecycle::Created),
                index: RwLock::new(index),
                sessions: RwLock::new(HashSet::new()),
                queue: Mutex::new(None),
                writer_thread: Mutex::new(None),
                wal: Mutex::new(wal),
                observers: RwLock::new(Vec::new()),
            }),
            writer_handle: Mutex::new(None),
            maintenance: Mutex::new(None),
        })
    }

    /// Create a manager over a [`RingBuffer`] of `config.ring_capacity`.
    pub fn with_ring_buffer(config: PersistenceConfig) -> PersistenceResult<Self> {
        let ring = RingBuffer::new(config.ring_capacity);
        Self::new(config, Box::new(ring))
    }

    /// Get configuration
    pub fn config(&self) -> &PersistenceConfig {
        &self.shared.config
    }

    /// Node id written into WAL file headers and recovery markers
    pub fn node_id(&self) -> Uuid {
        self.shared.node_id
    }

    /// Current lifecycle phase
    pub fn lifecycle(&self) -> Lifecycle {
        *self.shared.lifecycle.read()
    }

    /// Register an observer for every future event
    pub fn subscribe(&self, observer: Arc<dyn PersistenceObserver>) {
        self.shared.observers.write().push(observer);
    }

    /// Register a channel observer and return its receiving end
    pub fn event_channel(&self) -> Receiver<PersistenceEvent> {
        let (observer, receiver) = ChannelObserver::new();
        self.subscribe(Arc::new(observer));
        receiver
    }

    /// Recover the WAL directory, replay it into the index, open the writer
    /// and start the writer thread.
    ///
    /// Writes are rejected with `NotInitialized` until recovery has been
    /// replayed, so recovered and live data never interleave.
    ///
    /// # Errors
    ///
    /// Fails if the directory is locked by another manager, recovery fails
    /// (only possible with `continue_on_error` off), the writer cannot open a
    /// file, or a thread cannot be spawned.
    pub fn initialize(&self) -> PersistenceResult<RecoveryReport> {
        let (report, jobs) = self.shared.initialize()?;
        self.start_writer(jobs)?;
        self.start_maintenance()?;
        Ok(report)
    }

    /// Store or revise an utterance.
    ///
    /// The index is updated before this returns. The WAL write is queued for
    /// the writer thread: failures there are logged and published as
    /// [`PersistenceEvent::Error`], never returned, and never delay the
    /// caller.
    ///
    /// # Errors
    ///
    /// Only lifecycle errors and utterance validation errors.
    pub fn persist_utterance(&self, utterance: TranscriptUtterance) -> PersistenceResult<()> {
        self.shared.ensure_running()?;
        utterance.validate()?;
        self.shared.persist(utterance)
    }

    /// Look up one utterance
    pub fn get_utterance(&self, id: &str) -> Option<TranscriptUtterance> {
        self.shared.index.read().get(id)
    }

    /// Utterances of a session in insertion order
    pub fn get_session_utterances(&self, session_id: &str) -> Vec<TranscriptUtterance> {
        self.shared.index.read().get_by_session(session_id)
    }

    /// Utterances in `state`
    pub fn get_utterances_by_state(&self, state: UtteranceState) -> Vec<TranscriptUtterance> {
        self.shared.index.read().get_by_state(state)
    }

    /// The `n` most recent utterances, newest first
    pub fn get_recent_utterances(&self, n: usize) -> Vec<TranscriptUtterance> {
        self.shared.index.read().get_recent(n)
    }

    /// Sessions with at least one persisted utterance, sorted
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self.shared.sessions.read().iter().cloned().collect();
        sessions.sort();
        sessions
    }

    /// Delete a session from memory and record the deletion durably.
    ///
    /// Returns the number of utterances purged from the index. The delete
    /// entry is queued behind every earlier write and written at urgent
    /// priority, so it is flushed and fsynced before this returns.
    ///
    /// # Errors
    ///
    /// Returns the WAL error if the delete entry could not be made durable.
    /// The index is already purged at that point; the entry stays buffered
    /// and is retried by the next flush.
    pub fn delete_session(&self, session_id: &str) -> PersistenceResult<usize> {
        self.shared.ensure_running()?;
        self.shared.delete_session(session_id)
    }

    /// Flush everything queued or buffered.
    pub fn flush(&self) -> PersistenceResult<FlushReport> {
        self.shared.ensure_running()?;
        let report = self.shared.call("flush", |reply| WalJob::Flush { reply })??;
        Ok(report)
    }

    /// Block until every WAL job queued so far has been applied.
    ///
    /// Returns immediately when the writer thread is not running.
    pub fn wait_idle(&self) -> PersistenceResult<()> {
        if self.lifecycle() != Lifecycle::Running {
            return Ok(());
        }
        self.shared.call("wait_idle", |reply| WalJob::Sync { reply })
    }

    /// Drop terminal utterances last revised more than `max_age` ago from
    /// the index. The WAL is not touched; retention ages its files out.
    pub fn cleanup_old_utterances(&self, max_age: Duration) -> usize {
        let removed = self
            .shared
            .index
            .write()
            .clear_old_terminal(max_age, Timestamp::now());
        if removed.is_empty() {
            return 0;
        }
        debug!(removed = removed.len(), "Cleaned up old utterances");
        let count = removed.len();
        let events = removed
            .into_iter()
            .map(|u| PersistenceEvent::UtteranceRemoved {
                utterance_id: u.id,
                session_id: u.session_id,
            })
            .collect();
        self.shared.publish(events);
        count
    }

    /// Report host visibility. Hiding starts the hidden-flush delay; the
    /// flush itself is released by `tick`.
    pub fn set_visibility(&self, visible: bool) {
        self.shared.notify(WalJob::Visibility {
            visible,
            at: Instant::now(),
        });
    }

    /// Report user activity. An idle user gets the background flush
    /// interval even while the host is visible.
    pub fn set_user_active(&self, active: bool) {
        self.shared.notify(WalJob::Activity { active });
    }

    /// Report memory pressure as a ratio in `[0, 1]`; at or above the
    /// configured threshold, pending entries are flushed by the writer
    /// thread.
    pub fn report_memory_pressure(&self, ratio: f64) {
        if self.shared.ensure_running().is_err() {
            return;
        }
        let job = WalJob::MemoryPressure {
            ratio,
            at: Instant::now(),
        };
        if self.shared.submit(job).is_err() {
            debug!(ratio, "Writer thread stopped, memory pressure report dropped");
        }
    }

    /// Run time-driven work: flush-policy timers, storage sampling, alerts
    /// and emergency cleanup. Called by the maintenance thread when one is
    /// configured.
    pub fn tick(&self) -> TickReport {
        self.shared.tick()
    }

    /// Snapshot of counters and state.
    ///
    /// Writer counters cover the jobs applied so far; call `wait_idle` first
    /// to include everything already queued.
    pub fn stats(&self) -> PersistenceStats {
        let lifecycle = self.lifecycle();
        let index = self.shared.index.read().metrics();
        let sessions = self.shared.sessions.read().len();
        let wal = self.shared.wal.lock();
        PersistenceStats {
            lifecycle,
            index,
            writer: wal.writer.as_ref().map(WalWriter::stats),
            policy: wal.policy.stats().clone(),
            pending_partials: wal.policy.pending_partials(),
            sessions,
            last_recovery: wal.last_recovery,
            storage: wal.last_storage,
        }
    }

    /// Stop maintenance, drain the job queue, flush, and close the writer.
    ///
    /// Shutting down twice (or before `initialize`) is a no-op.
    pub fn shutdown(&self) -> PersistenceResult<FlushReport> {
        self.stop_maintenance();
        let result = self.shared.shutdown();
        self.join_writer();
        result
    }

    fn start_writer(&self, jobs: Receiver<WalJob>) -> PersistenceResult<()> {
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("scribe-wal-writer".to_string())
            .spawn(move || {
                *shared.writer_thread.lock() = Some(std::thread::current().id());
                for job in jobs {
                    shared.apply(job);
                }
                debug!("WAL writer thread stopped");
            });
        match spawned {
            Ok(handle) => {
                *self.writer_handle.lock() = Some(handle);
                Ok(())
            }
            Err(source) => {
                error!(error = %source, "Failed to spawn WAL writer thread");
                self.shared.abandon();
                Err(PersistenceError::Io {
                    path: self.shared.config.wal_dir.clone(),
                    source,
                })
            }
        }
    }

    fn join_writer(&self) {
        let Some(handle) = self.writer_handle.lock().take() else {
            return;
        };
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("WAL writer thread panicked");
        }
    }

    fn start_maintenance(&self) -> PersistenceResult<()> {
        let Some(interval) = self.shared.config.maintenance_interval() else {
            return Ok(());
        };
        let (stop, stopped) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("scribe-maintenance".to_string())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    shared.tick();
                }
                debug!("Maintenance thread stopped");
            })
            .map_err(|source| PersistenceError::Io {
                path: self.shared.config.wal_dir.clone(),
                source,
            })?;
        debug!(interval_ms = interval.as_millis() as u64, "Maintenance thread started");
        *self.maintenance.lock() = Some(Maintenance { stop, handle });
        Ok(())
    }

    fn stop_maintenance(&self) {
        let Some(maintenance) = self.maintenance.lock().take() else {
            return;
        };
        drop(maintenance.stop);
        if maintenance.handle.thread().id() == std::thread::current().id() {
            return;
        }
        if maintenance.handle.join().is_err() {
            warn!("Maintenance thread panicked");
        }
    }
}

impl Drop for TranscriptPersistenceManager {
    fn drop(&mut self) {
        self.stop_maintenance();
        // Queued jobs are still applied; the final flush is not
        drop(self.shared.queue.lock().take());
        self.join_writer();
        if self.lifecycle() == Lifecycle::Running {
            let pending = self
                .shared
                .wal
                .lock()
                .writer
                .as_ref()
                .map_or(0, WalWriter::pending);
            warn!(
                pending,
                "Persistence manager dropped without shutdown; unflushed entries are lost"
            );
        }
    }
}

impl Shared {
    fn ensure_running(&self) -> PersistenceResult<()> {
        match *self.lifecycle.read() {
            Lifecycle::Running => Ok(()),
            Lifecycle::Created => Err(PersistenceError::NotInitialized),
            Lifecycle::ShutDown => Err(PersistenceError::ShutDown),
        }
    }

    fn publish(&self, events: Vec<PersistenceEvent>) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.read().clone();
        for event in &events {
            trace!(event = event.name(), "Publishing persistence event");
            for observer in &observers {
                observer.on_event(event);
            }
        }
    }

    fn on_writer_thread(&self) -> bool {
        *self.writer_thread.lock() == Some(std::thread::current().id())
    }

    /// Queue a job; hands it back when the writer thread is not running.
    fn submit(&self, job: WalJob) -> Result<(), WalJob> {
        match self.queue.lock().as_ref() {
            Some(sender) => sender.send(job).map_err(|rejected| rejected.0),
            None => Err(job),
        }
    }

    /// Queue a job, or apply it here when no writer thread is running.
    /// Only for jobs that do no I/O.
    fn notify(&self, job: WalJob) {
        if let Err(job) = self.submit(job) {
            self.apply(job);
        }
    }

    /// Queue a job and wait for its reply.
    fn call<T>(
        &self,
        operation: &'static str,
        job: impl FnOnce(Sender<T>) -> WalJob,
    ) -> PersistenceResult<T> {
        if self.on_writer_thread() {
            return Err(PersistenceError::WriterThread(operation));
        }
        let (reply, done) = mpsc::channel();
        if self.submit(job(reply)).is_err() {
            return Err(PersistenceError::ShutDown);
        }
        done.recv().map_err(|_| PersistenceError::ShutDown)
    }

    fn initialize(&self) -> PersistenceResult<(RecoveryReport, Receiver<WalJob>)> {
        match *self.lifecycle.read() {
            Lifecycle::Created => {}
            Lifecycle::Running => {
                return Err(PersistenceError::config("manager is already initialized"))
            }
            Lifecycle::ShutDown => return Err(PersistenceError::ShutDown),
        }

        let dir = &self.config.wal_dir;
        std::fs::create_dir_all(dir).map_err(|source| PersistenceError::Io {
            path: dir.clone(),
            source,
        })?;
        let lock_file = acquire_lock(dir)?;

        self.publish(vec![PersistenceEvent::RecoveryStarted { dir: dir.clone() }]);
        let recovery =
            WalRecoveryManager::new(self.config.recovery.clone()).recover(dir, Timestamp::now());
        let report = match recovery {
            Ok(report) => report,
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "WAL recovery failed");
                self.publish(vec![PersistenceEvent::error(&e, "initialize")]);
                return Err(e.into());
            }
        };

        // Replay before the writer opens: the index holds recovered data
        // before any live write can reach it
        let utterances = report.utterances();
        let replayed = utterances.len();
        let mut evicted = 0usize;
        {
            let mut index = self.index.write();
            for utterance in utterances {
                if let AppendOutcome::Evicted(_) = index.append(utterance) {
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            warn!(
                evicted,
                capacity = self.config.ring_capacity,
                "Recovered utterances exceed index capacity, oldest kept on disk only"
            );
        }

        let mut writer = WalWriter::open(
            dir.clone(),
            self.config.wal.clone(),
            WalRotationManager::new(self.config.rotation.clone()),
            self.node_id,
        )?;

        let mut events = Vec::new();
        if report.status != RecoveryStatus::Skipped {
            let now = Timestamp::now();
            let markers = vec![
                WalEntry::new(
                    now,
                    EntryPayload::RecoveryStart {
                        node_id: self.node_id,
                    },
                ),
                WalEntry::new(
                    now,
                    EntryPayload::RecoveryEnd {
                        status: report.status.as_str().to_string(),
                        sessions_recovered: report.sessions.len() as u32,
                        utterances_recovered: replayed as u32,
                    },
                ),
            ];
            match writer.write_entries(markers, WritePriority::Urgent) {
                Ok(WriteOutcome::Flushed(flush)) => push_flush_events(&flush, &mut events),
                Ok(WriteOutcome::Buffered { .. }) => {}
                Err(e) => record_failure(&e, "initialize", &mut events),
            }
        }

        let recovered_sessions: HashSet<SessionId> = report.sessions.keys().cloned().collect();
        {
            let mut wal = self.wal.lock();
            wal.writer = Some(writer);
            wal.logged_sessions = recovered_sessions.clone();
            wal.last_recovery = Some(report.status);
            wal.lock_file = Some(lock_file);
            wal.policy.mark_flushed(Instant::now());
        }
        *self.sessions.write() = recovered_sessions;

        let (sender, jobs) = mpsc::channel();
        *self.queue.lock() = Some(sender);
        *self.lifecycle.write() = Lifecycle::Running;

        info!(
            dir = %dir.display(),
            status = %report.status,
            sessions = report.sessions.len(),
            utterances = replayed,
            duration_ms = report.duration.as_millis() as u64,
            "Persistence initialized"
        );
        events.push(PersistenceEvent::RecoveryCompleted {
            status: report.status,
            sessions: report.sessions.len(),
            utterances: replayed,
            duration: report.duration,
        });
        self.publish(events);
        Ok((report, jobs))
    }

    /// Undo a half-finished `initialize`.
    fn abandon(&self) {
        {
            let _index = self.index.write();
            *self.lifecycle.write() = Lifecycle::ShutDown;
            self.queue.lock().take();
        }
        self.wal.lock().lock_file = None;
    }

    fn persist(&self, utterance: TranscriptUtterance) -> PersistenceResult<()> {
        let mut events = Vec::new();
        {
            let mut index = self.index.write();
            // Checked again under the index lock so no job is queued after
            // shutdown has closed the queue
            self.ensure_running()?;

            let previous = match index.get(&utterance.id) {
                Some(previous) if previous == utterance => return Ok(()),
                Some(previous) => {
                    index.update(&utterance.id, utterance.clone());
                    Some(previous)
                }
                None => {
                    if let AppendOutcome::Evicted(evicted) = index.append(utterance.clone()) {
                        events.push(PersistenceEvent::BufferOverflow { evicted });
                    }
                    None
                }
            };
            self.sessions.write().insert(utterance.session_id.clone());

            events.push(match &previous {
                Some(previous) => PersistenceEvent::UtteranceUpdated {
                    utterance: utterance.clone(),
                    previous: previous.clone(),
                },
                None => PersistenceEvent::UtteranceAdded {
                    utterance: utterance.clone(),
                },
            });

            let utterance_id = utterance.id.clone();
            if self.submit(WalJob::Append { utterance, previous }).is_err() {
                warn!(
                    utterance_id = %utterance_id,
                    "WAL writer thread stopped, utterance kept in memory only"
                );
            }
        }
        self.publish(events);
        Ok(())
    }

    fn delete_session(&self, session_id: &str) -> PersistenceResult<usize> {
        if self.on_writer_thread() {
            return Err(PersistenceError::WriterThread("delete_session"));
        }
        let (reply, done) = mpsc::channel();
        let removed = {
            let mut index = self.index.write();
            self.ensure_running()?;
            let removed = index.clear_session(session_id).len();
            self.sessions.write().remove(session_id);
            let job = WalJob::DeleteSession {
                session_id: session_id.to_string(),
                removed,
                reply,
            };
            if self.submit(job).is_err() {
                return Err(PersistenceError::ShutDown);
            }
            removed
        };
        done.recv().map_err(|_| PersistenceError::ShutDown)??;
        Ok(removed)
    }

    fn tick(&self) -> TickReport {
        if self.ensure_running().is_err() {
            return TickReport::default();
        }
        self.call("tick", |reply| WalJob::Tick { reply })
            .unwrap_or_default()
    }

    fn shutdown(&self) -> PersistenceResult<FlushReport> {
        if self.on_writer_thread() {
            return Err(PersistenceError::WriterThread("shutdown"));
        }
        {
            let _index = self.index.write();
            let mut lifecycle = self.lifecycle.write();
            let previous = std::mem::replace(&mut *lifecycle, Lifecycle::ShutDown);
            if previous != Lifecycle::Running {
                return Ok(FlushReport::default());
            }
        }

        // Close runs after every job already queued; dropping the sender
        // then lets the writer thread exit
        let (reply, done) = mpsc::channel();
        let Some(sender) = self.queue.lock().take() else {
            return Ok(FlushReport::default());
        };
        if sender.send(WalJob::Close { reply }).is_err() {
            return Err(PersistenceError::ShutDown);
        }
        drop(sender);
        let report = done.recv().map_err(|_| PersistenceError::ShutDown)??;
        Ok(report)
    }

    /// Writer thread: apply one job.
    fn apply(&self, job: WalJob) {
        let mut events = Vec::new();
        match job {
            WalJob::Append {
                utterance,
                previous,
            } => {
                self.log_utterance(&utterance, previous.as_ref(), &mut events);
                self.publish(events);
            }
            WalJob::DeleteSession {
                session_id,
                removed,
                reply,
            } => {
                let result = self.log_session_delete(&session_id, removed, &mut events);
                self.publish(events);
                let _ = reply.send(result);
            }
            WalJob::Flush { reply } => {
                let result = {
                    let mut wal = self.wal.lock();
                    let now = Instant::now();
                    let _ = wal.policy.manual(now);
                    wal.flush(now, &mut events)
                };
                if let Err(e) = &result {
                    record_failure(e, "flush", &mut events);
                }
                self.publish(events);
                let _ = reply.send(result);
            }
            WalJob::MemoryPressure { ratio, at } => {
                {
                    let mut wal = self.wal.lock();
                    if wal.policy.report_memory_pressure(ratio, at).is_some() {
                        info!(ratio, "Memory pressure, flushing WAL");
                        if let Err(e) = wal.flush(Instant::now(), &mut events) {
                            record_failure(&e, "memory_pressure", &mut events);
                        }
                    }
                }
                self.publish(events);
            }
            WalJob::Visibility { visible, at } => {
                self.wal.lock().policy.set_visible(visible, at);
            }
            WalJob::Activity { active } => {
                self.wal.lock().policy.set_active(active);
            }
            WalJob::Tick { reply } => {
                let report = self.run_tick(&mut events);
                self.publish(events);
                let _ = reply.send(report);
            }
            WalJob::Sync { reply } => {
                let _ = reply.send(());
            }
            WalJob::Close { reply } => {
                let result = self.close_wal(&mut events);
                self.publish(events);
                let _ = reply.send(result);
            }
        }
    }

    /// Append the WAL entries for one persisted utterance. Best-effort.
    fn log_utterance(
        &self,
        utterance: &TranscriptUtterance,
        previous: Option<&TranscriptUtterance>,
        events: &mut Vec<PersistenceEvent>,
    ) {
        let now = Instant::now();
        let mut guard = self.wal.lock();
        let wal = &mut *guard;

        let opens_session = !wal.logged_sessions.contains(&utterance.session_id);
        let mut entries = Vec::with_capacity(2);
        if opens_session {
            entries.push(WalEntry::session_create(
                utterance.session_id.clone(),
                Timestamp::now(),
            ));
        }
        entries.push(match previous {
            Some(previous) => WalEntry::update(
                utterance.id.clone(),
                utterance.session_id.clone(),
                previous.diff(utterance),
                Some(previous.snapshot()),
            ),
            None => WalEntry::insert(utterance.clone()),
        });

        let newly_terminal = utterance.is_terminal() && !previous.is_some_and(|p| p.is_terminal());
        let (request, priority) = if newly_terminal {
            (wal.policy.utterance_finalized(now), WritePriority::High)
        } else if utterance.state == UtteranceState::Partial {
            (wal.policy.record_partial(now), WritePriority::Normal)
        } else {
            wal.policy.record_write();
            (None, WritePriority::Normal)
        };

        let Some(writer) = wal.writer.as_mut() else {
            return;
        };
        let outcome = writer.write_entries(entries, priority);

        // A rejected batch left nothing behind, so the session marker must
        // be written again with the next utterance
        let admitted = match &outcome {
            Ok(_) => true,
            Err(e) => !e.is_rejection(),
        };
        if opens_session && admitted {
            wal.logged_sessions.insert(utterance.session_id.clone());
            events.push(PersistenceEvent::SessionCreated {
                session_id: utterance.session_id.clone(),
            });
        }

        match outcome {
            Ok(WriteOutcome::Flushed(report)) => {
                wal.policy.mark_flushed(now);
                push_flush_events(&report, events);
            }
            Ok(WriteOutcome::Buffered { pending }) => {
                if let Some(request) = request {
                    trace!(reason = %request.reason, pending, "Flush policy fired");
                    if let Err(e) = wal.flush(now, events) {
                        record_failure(&e, "persist_utterance", events);
                    }
                }
            }
            Err(e) if e.is_rejection() => {
                warn!(
                    utterance_id = %utterance.id,
                    error = %e,
                    "WAL write rejected, utterance kept in memory only"
                );
                events.push(PersistenceEvent::error(&e, "persist_utterance"));
            }
            Err(e) => {
                warn!(
                    utterance_id = %utterance.id,
                    error = %e,
                    "WAL flush failed, entries stay buffered for retry"
                );
                events.push(PersistenceEvent::error(&e, "persist_utterance"));
            }
        }
    }

    fn log_session_delete(
        &self,
        session_id: &str,
        removed: usize,
        events: &mut Vec<PersistenceEvent>,
    ) -> Result<(), WalWriteError> {
        let result = {
            let mut guard = self.wal.lock();
            let wal = &mut *guard;
            let now = Instant::now();
            wal.logged_sessions.remove(session_id);
            let _ = wal.policy.session_ended(now);
            let entry =
                WalEntry::session_delete(session_id, SESSION_DELETE_REASON, Timestamp::now());
            match wal.writer.as_mut() {
                Some(writer) => writer.write_entry(entry, WritePriority::Urgent),
                None => Err(WalWriteError::Closed),
            }
            .map(|outcome| {
                if let WriteOutcome::Flushed(report) = outcome {
                    wal.policy.mark_flushed(now);
                    push_flush_events(&report, events);
                }
            })
        };

        match &result {
            Ok(()) => {
                info!(session_id, removed, "Session deleted");
                events.push(PersistenceEvent::SessionDeleted {
                    session_id: session_id.to_string(),
                    utterances_removed: removed,
                });
            }
            Err(e) => {
                error!(session_id, error = %e, "Session delete entry not durable");
                events.push(PersistenceEvent::error(e, "delete_session"));
            }
        }
        result
    }

    fn run_tick(&self, events: &mut Vec<PersistenceEvent>) -> TickReport {
        let mut report = TickReport::default();
        let mut guard = self.wal.lock();
        let wal = &mut *guard;
        let now = Instant::now();

        if let Some(request) = wal.policy.poll(now) {
            debug!(reason = %request.reason, "Flush policy timer fired");
            match wal.flush(now, events) {
                Ok(flush) => report.flush = Some(flush),
                Err(e) => record_failure(&e, "tick", events),
            }
        }

        let sampled_at = Timestamp::now();
        if wal.monitor.should_sample(sampled_at) {
            self.sample_storage(wal, sampled_at, &mut report, events);
        }
        report
    }

    fn sample_storage(
        &self,
        wal: &mut WalState,
        now: Timestamp,
        report: &mut TickReport,
        events: &mut Vec<PersistenceEvent>,
    ) {
        if let Err(e) = wal.monitor.sample(&self.config.wal_dir, now) {
            record_failure(&e, "storage_sample", events);
            return;
        }
        let storage = wal.monitor.evaluate();
        if wal.last_storage != Some(storage.status) {
            info!(status = %storage.status, "WAL storage status changed");
        }
        wal.last_storage = Some(storage.status);
        events.extend(storage.alerts.iter().cloned().map(PersistenceEvent::StorageAlert));

        if storage.status == StorageStatus::Emergency {
            if let Some(writer) = wal.writer.as_ref() {
                match wal.monitor.trigger_emergency_cleanup_if_needed(
                    writer.rotation(),
                    writer.dir(),
                    writer.current_path(),
                ) {
                    Ok(cleanup) => report.cleanup = cleanup,
                    Err(e) => record_failure(&e, "emergency_cleanup", events),
                }
            }
        }
        report.storage = Some(storage);
    }

    fn close_wal(&self, events: &mut Vec<PersistenceEvent>) -> Result<FlushReport, WalWriteError> {
        let result = {
            let mut guard = self.wal.lock();
            let wal = &mut *guard;
            let now = Instant::now();
            let _ = wal.policy.app_close(now);
            let result = match wal.writer.as_mut() {
                Some(writer) => writer.close(),
                None => Ok(FlushReport::default()),
            };
            if let Ok(report) = &result {
                wal.policy.mark_flushed(now);
                push_flush_events(report, events);
            }
            wal.lock_file = None;
            result
        };

        match &result {
            Ok(report) => info!(entries = report.entries, "Persistence shut down"),
            Err(e) => record_failure(e, "shutdown", events),
        }
        result
    }
}

fn push_flush_events(report: &FlushReport, events: &mut Vec<PersistenceEvent>) {
    for rotation in &report.rotations {
        events.push(PersistenceEvent::WalRotated {
            reason: rotation.reason,
            previous: rotation.previous.clone(),
            current: rotation.current.clone(),
        });
    }
    if !report.is_empty() {
        events.push(PersistenceEvent::WalFlushed {
            entries: report.entries,
            bytes: report.bytes,
            file: report.file.clone(),
        });
    }
}

fn record_failure(error: &dyn Display, context: &str, events: &mut Vec<PersistenceEvent>) {
    warn!(context, error = %error, "Persistence operation failed");
    events.push(PersistenceEvent::error(error, context));
}

fn acquire_lock(dir: &Path) -> PersistenceResult<File> {
    let path = dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|source| PersistenceError::Io {
            path: path.clone(),
            source,
        })?;
    fs2::FileExt::try_lock_exclusive(&file).map_err(|_| PersistenceError::Locked { path })?;
    Ok(file)
}
