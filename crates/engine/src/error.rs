//! Persistence error umbrella
//!
//! Every durability-layer error converts into `PersistenceError` with `?`.
//! Only `initialize`, `delete_session`, `flush` and `shutdown` return WAL
//! errors to the caller; `persist_utterance` never fails because of disk I/O.

use scribe_durability::{MonitorError, RecoveryError, RotationError, WalWriteError};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for persistence operations
pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

/// Errors surfaced by the persistence manager
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// WAL write, flush or close failed
    #[error("WAL write failed: {0}")]
    Write(#[from] WalWriteError),

    /// Startup recovery failed
    #[error("WAL recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    /// Rotation or cleanup failed
    #[error("WAL rotation failed: {0}")]
    Rotation(#[from] RotationError),

    /// Storage sampling failed
    #[error("Storage monitor failed: {0}")]
    Monitor(#[from] MonitorError),

    /// Utterance rejected by validation
    #[error(transparent)]
    InvalidUtterance(#[from] scribe_core::Error),

    /// Invalid or unreadable configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The WAL directory is held by another manager
    #[error("WAL directory '{}' is already in use", path.display())]
    Locked {
        /// Lock file that could not be acquired
        path: PathBuf,
    },

    /// I/O outside the writer (lock file, directory creation)
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// `initialize` has not completed
    #[error("Persistence manager is not initialized")]
    NotInitialized,

    /// `shutdown` has been called
    #[error("Persistence manager is shut down")]
    ShutDown,

    /// A blocking call was made from an observer on the WAL writer thread
    #[error("'{0}' cannot be called from the WAL writer thread")]
    WriterThread(&'static str),
}

impl PersistenceError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        PersistenceError::Config(message.into())
    }

    /// Whether the error comes from the manager's lifecycle rather than I/O
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            PersistenceError::NotInitialized | PersistenceError::ShutDown
        )
    }
}
