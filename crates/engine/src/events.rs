//! Outward persistence events
//!
//! The manager publishes what happened to the rest of the application
//! through [`PersistenceObserver`]. Observers are called after the manager
//! has released its locks. Index events arrive on the caller's thread; WAL
//! events (flushes, rotations, session markers, write errors) arrive on the
//! WAL writer thread, where blocking manager calls return
//! `PersistenceError::WriterThread`.

use parking_lot::Mutex;
use scribe_core::{SessionId, TranscriptUtterance, UtteranceId};
use scribe_durability::{RecoveryStatus, RotationReason, StorageAlert};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

/// Something observable happened in the persistence layer
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceEvent {
    /// A new utterance entered the index
    UtteranceAdded {
        /// The stored utterance
        utterance: TranscriptUtterance,
    },
    /// An indexed utterance was revised
    UtteranceUpdated {
        /// The new revision
        utterance: TranscriptUtterance,
        /// The revision it replaced
        previous: TranscriptUtterance,
    },
    /// An utterance left the index through age-based cleanup
    UtteranceRemoved {
        /// Removed utterance
        utterance_id: UtteranceId,
        /// Its session
        session_id: SessionId,
    },
    /// First utterance of a session was persisted
    SessionCreated {
        /// New session
        session_id: SessionId,
    },
    /// A session was deleted and its delete marker is durable
    SessionDeleted {
        /// Deleted session
        session_id: SessionId,
        /// Utterances purged from the index
        utterances_removed: usize,
    },
    /// A batch reached disk
    WalFlushed {
        /// Entries written
        entries: usize,
        /// Bytes written
        bytes: u64,
        /// File written to
        file: PathBuf,
    },
    /// The active WAL file changed
    WalRotated {
        /// Why
        reason: RotationReason,
        /// File that was closed
        previous: PathBuf,
        /// File now active
        current: PathBuf,
    },
    /// The index was full and evicted its oldest utterance
    BufferOverflow {
        /// The evicted utterance
        evicted: TranscriptUtterance,
    },
    /// Startup recovery began
    RecoveryStarted {
        /// Directory being recovered
        dir: PathBuf,
    },
    /// Startup recovery finished
    RecoveryCompleted {
        /// Outcome class
        status: RecoveryStatus,
        /// Sessions reconstructed
        sessions: usize,
        /// Utterances replayed into the index
        utterances: usize,
        /// Wall time spent
        duration: Duration,
    },
    /// The storage monitor raised an alert
    StorageAlert(StorageAlert),
    /// A best-effort operation failed
    Error {
        /// Error text
        message: String,
        /// Operation that failed
        context: String,
    },
}

impl PersistenceEvent {
    /// Short event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            PersistenceEvent::UtteranceAdded { .. } => "utterance_added",
            PersistenceEvent::UtteranceUpdated { .. } => "utterance_updated",
            PersistenceEvent::UtteranceRemoved { .. } => "utterance_removed",
            PersistenceEvent::SessionCreated { .. } => "session_created",
            PersistenceEvent::SessionDeleted { .. } => "session_deleted",
            PersistenceEvent::WalFlushed { .. } => "wal_flushed",
            PersistenceEvent::WalRotated { .. } => "wal_rotated",
            PersistenceEvent::BufferOverflow { .. } => "buffer_overflow",
            PersistenceEvent::RecoveryStarted { .. } => "recovery_started",
            PersistenceEvent::RecoveryCompleted { .. } => "recovery_completed",
            PersistenceEvent::StorageAlert(_) => "storage_alert",
            PersistenceEvent::Error { .. } => "error",
        }
    }

    pub(crate) fn error(message: impl ToString, context: &str) -> Self {
        PersistenceEvent::Error {
            message: message.to_string(),
            context: context.to_string(),
        }
    }
}

/// Receiver of persistence events.
///
/// Called synchronously on the thread that produced the event; keep it
/// cheap. A slow observer on the writer thread delays every queued WAL write.
pub trait PersistenceObserver: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &PersistenceEvent);
}

/// Forwards events into an `mpsc` channel.
///
/// Events sent after the receiver is dropped are discarded.
pub struct ChannelObserver {
    sender: Mutex<Sender<PersistenceEvent>>,
}

impl ChannelObserver {
    /// Create an observer and the receiving end of its channel
    pub fn new() -> (Self, Receiver<PersistenceEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            ChannelObserver {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl PersistenceObserver for ChannelObserver {
    fn on_event(&self, event: &PersistenceEvent) {
        let _ = self.sender.lock().send(event.clone());
    }
}

impl<F> PersistenceObserver for F
where
    F: Fn(&PersistenceEvent) + Send + Sync,
{
    fn on_event(&self, event: &PersistenceEvent) {
        self(event)
    }
}
