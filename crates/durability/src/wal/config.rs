//! WAL writer configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// WAL writer parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Buffered entries that trigger a flush (default: 50).
    pub batch_size: usize,

    /// Write attempts per flush before giving up (default: 3).
    ///
    /// Attempt `n` is followed by a `retry_backoff × n` pause.
    pub max_retries: u32,

    /// Base backoff between attempts in milliseconds (default: 1000).
    pub retry_backoff_ms: u64,

    /// Upper bound on one write + fsync in milliseconds (default: 5000).
    pub write_timeout_ms: u64,

    /// Entries allowed in the queue and buffer together (default: 10000).
    ///
    /// Non-urgent writes beyond this are rejected; urgent writes are
    /// always admitted.
    pub max_queue_size: usize,

    /// Session written into new file headers, for session-dedicated logs.
    pub session_id: Option<String>,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            batch_size: 50,
            max_retries: 3,
            retry_backoff_ms: 1_000,
            write_timeout_ms: 5_000,
            max_queue_size: 10_000,
            session_id: None,
        }
    }
}

impl WalConfig {
    /// Create a new WAL configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set batch size (builder pattern).
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set retry policy (builder pattern).
    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set write timeout (builder pattern).
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set queue limit (builder pattern).
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Dedicate new files to a session (builder pattern).
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Base retry backoff
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Write timeout
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), WalConfigError> {
        if self.batch_size == 0 {
            return Err(WalConfigError::ZeroBatchSize);
        }
        if self.max_retries == 0 {
            return Err(WalConfigError::ZeroRetries);
        }
        if self.write_timeout_ms == 0 {
            return Err(WalConfigError::ZeroTimeout);
        }
        if self.max_queue_size < self.batch_size {
            return Err(WalConfigError::QueueSmallerThanBatch);
        }
        Ok(())
    }

    /// Create a configuration for tests: small batches, no backoff.
    pub fn for_testing() -> Self {
        WalConfig {
            batch_size: 4,
            max_retries: 3,
            retry_backoff_ms: 0,
            write_timeout_ms: 2_000,
            max_queue_size: 64,
            session_id: None,
        }
    }
}

/// WAL configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalConfigError {
    /// Batch size must be positive.
    #[error("Batch size must be at least 1")]
    ZeroBatchSize,

    /// At least one write attempt is needed.
    #[error("Max retries must be at least 1")]
    ZeroRetries,

    /// Timeout must be positive.
    #[error("Write timeout must be non-zero")]
    ZeroTimeout,

    /// Queue must hold at least one batch.
    #[error("Max queue size cannot be smaller than the batch size")]
    QueueSmallerThanBatch,
}
