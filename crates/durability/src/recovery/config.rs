//! Recovery configuration.

use super::session::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Recovery parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Run recovery at startup (default: true).
    pub enabled: bool,

    /// Newest files replayed at most (default: 100).
    pub max_files: usize,

    /// Skip unreadable files instead of failing (default: true).
    pub continue_on_error: bool,

    /// Conflict resolution between revisions (default: newest).
    pub conflict_policy: ConflictPolicy,

    /// Wall-clock budget in milliseconds (default: 30000).
    ///
    /// Work left when the budget runs out is skipped and the result is
    /// downgraded to partial success.
    pub max_duration_ms: u64,

    /// Idle time after which a session ending in a terminal utterance is
    /// considered complete, in milliseconds (default: 60000).
    pub completion_idle_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            enabled: true,
            max_files: 100,
            continue_on_error: true,
            conflict_policy: ConflictPolicy::Newest,
            max_duration_ms: 30_000,
            completion_idle_ms: 60_000,
        }
    }
}

impl RecoveryConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable recovery (builder pattern).
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the file cap (builder pattern).
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    /// Set file-level error handling (builder pattern).
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Set the conflict policy (builder pattern).
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Set the wall-clock budget (builder pattern).
    pub fn with_max_duration(mut self, budget: Duration) -> Self {
        self.max_duration_ms = budget.as_millis() as u64;
        self
    }

    /// Set the completeness idle time (builder pattern).
    pub fn with_completion_idle(mut self, idle: Duration) -> Self {
        self.completion_idle_ms = idle.as_millis() as u64;
        self
    }

    /// Wall-clock budget
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    /// Completeness idle time
    pub fn completion_idle(&self) -> Duration {
        Duration::from_millis(self.completion_idle_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), RecoveryConfigError> {
        if self.max_files == 0 {
            return Err(RecoveryConfigError::ZeroMaxFiles);
        }
        Ok(())
    }

    /// Create a configuration for tests: fail fast on bad files.
    pub fn for_testing() -> Self {
        RecoveryConfig {
            continue_on_error: false,
            max_duration_ms: 10_000,
            ..Self::default()
        }
    }
}

/// Recovery configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryConfigError {
    /// At least one file must be replayable.
    #[error("Recovery max_files must be at least 1")]
    ZeroMaxFiles,
}
