//! Persistence configuration via `scribe.toml`
//!
//! One file aggregates the settings of every component. Missing keys and
//! sections fall back to their defaults, so a config file only needs to
//! name what it changes.

use crate::error::{PersistenceError, PersistenceResult};
use crate::ring_buffer::DEFAULT_RING_CAPACITY;
use scribe_durability::{
    FlushPolicyConfig, MonitorConfig, RecoveryConfig, RotationConfig, WalConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name
pub const CONFIG_FILE_NAME: &str = "scribe.toml";

/// Default WAL directory, relative to the working directory
pub const DEFAULT_WAL_DIR: &str = "./.wal";

/// Persistence configuration loaded from `scribe.toml`.
///
/// # Example
///
/// ```toml
/// wal_dir = "./.wal"
/// ring_capacity = 1000
///
/// [wal]
/// batch_size = 50
///
/// [recovery]
/// conflict_policy = "newest"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// WAL directory (default: `./.wal`)
    pub wal_dir: PathBuf,

    /// Utterances held by the default ring buffer (default: 1000)
    pub ring_capacity: usize,

    /// Period of the background maintenance thread in milliseconds
    /// (default: 1000). Zero disables the thread; call `tick` instead.
    pub maintenance_interval_ms: u64,

    /// Writer settings
    pub wal: WalConfig,

    /// Rotation and retention settings
    pub rotation: RotationConfig,

    /// Flush triggers
    pub flush: FlushPolicyConfig,

    /// Storage monitor thresholds
    pub monitor: MonitorConfig,

    /// Startup recovery settings
    pub recovery: RecoveryConfig,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            wal_dir: PathBuf::from(DEFAULT_WAL_DIR),
            ring_capacity: DEFAULT_RING_CAPACITY,
            maintenance_interval_ms: 1_000,
            wal: WalConfig::default(),
            rotation: RotationConfig::default(),
            flush: FlushPolicyConfig::default(),
            monitor: MonitorConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl PersistenceConfig {
    /// Default configuration rooted at `wal_dir`
    pub fn new(wal_dir: impl Into<PathBuf>) -> Self {
        PersistenceConfig {
            wal_dir: wal_dir.into(),
            ..Self::default()
        }
    }

    /// Set the ring buffer capacity (builder pattern).
    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    /// Set the maintenance period; zero disables the thread (builder pattern).
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set writer settings (builder pattern).
    pub fn with_wal(mut self, wal: WalConfig) -> Self {
        self.wal = wal;
        self
    }

    /// Set rotation settings (builder pattern).
    pub fn with_rotation(mut self, rotation: RotationConfig) -> Self {
        self.rotation = rotation;
        self
    }

    /// Set flush triggers (builder pattern).
    pub fn with_flush(mut self, flush: FlushPolicyConfig) -> Self {
        self.flush = flush;
        self
    }

    /// Set monitor thresholds (builder pattern).
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Set recovery settings (builder pattern).
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    /// Maintenance period, `None` when the thread is disabled
    pub fn maintenance_interval(&self) -> Option<Duration> {
        (self.maintenance_interval_ms > 0)
            .then(|| Duration::from_millis(self.maintenance_interval_ms))
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Config` naming the first invalid section.
    pub fn validate(&self) -> PersistenceResult<()> {
        if self.ring_capacity == 0 {
            return Err(PersistenceError::config("ring_capacity must be at least 1"));
        }
        self.wal
            .validate()
            .map_err(|e| PersistenceError::config(format!("[wal] {}", e)))?;
        self.rotation
            .validate()
            .map_err(|e| PersistenceError::config(format!("[rotation] {}", e)))?;
        self.flush
            .validate()
            .map_err(|e| PersistenceError::config(format!("[flush] {}", e)))?;
        self.monitor
            .validate()
            .map_err(|e| PersistenceError::config(format!("[monitor] {}", e)))?;
        self.recovery
            .validate()
            .map_err(|e| PersistenceError::config(format!("[recovery] {}", e)))?;
        Ok(())
    }

    /// Configuration for tests: small sizes, no backoff, no maintenance
    /// thread, fail-fast recovery.
    pub fn for_testing(wal_dir: impl Into<PathBuf>) -> Self {
        PersistenceConfig {
            wal_dir: wal_dir.into(),
            ring_capacity: 100,
            maintenance_interval_ms: 0,
            wal: WalConfig::for_testing(),
            rotation: RotationConfig::for_testing(),
            flush: FlushPolicyConfig::for_testing(),
            monitor: MonitorConfig::for_testing(),
            recovery: RecoveryConfig::for_testing(),
        }
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Transcript persistence configuration
#
# Every key is optional; missing keys take the values shown here.

# Directory holding the WAL files
wal_dir = "./.wal"

# Utterances kept in the in-memory ring buffer
ring_capacity = 1000

# Background maintenance period in milliseconds (0 = disabled)
maintenance_interval_ms = 1000

[wal]
batch_size = 50
max_retries = 3
retry_backoff_ms = 1000
write_timeout_ms = 5000
# Non-urgent writes beyond this many pending entries are rejected
max_queue_size = 10000

[rotation]
max_file_size = 10485760            # 10 MiB
max_file_age_ms = 3600000           # 1 h
emergency_file_size = 20971520      # 20 MiB
emergency_file_age_ms = 14400000    # 4 h
max_files = 10
max_retention_age_ms = 604800000    # 7 days
max_total_size = 104857600          # 100 MiB
# Gzip retired files into archive_dir (default: <wal_dir>/archive)
archive = false
# archive_dir = "./.wal/archive"

[flush]
visible_interval_ms = 5000
background_interval_ms = 30000
partial_threshold = 10
hidden_flush_delay_ms = 2000
memory_pressure_threshold = 0.85
max_coalesce_delay_ms = 1000

[monitor]
sample_interval_ms = 30000
max_wal_size = 104857600            # 100 MiB
warning_ratio = 0.8
emergency_ratio = 1.2
disk_warning_percent = 80.0
disk_critical_percent = 90.0
disk_emergency_percent = 95.0
max_growth_rate = 52428800.0        # bytes/hour
max_file_count = 50
growth_window = 10
cleanup_target_ratio = 0.5

[recovery]
enabled = true
max_files = 100
continue_on_error = true
# "newest", "oldest" or "merge"
conflict_policy = "newest"
max_duration_ms = 30000
completion_idle_ms = 60000
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> PersistenceResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PersistenceConfig = toml::from_str(&content).map_err(|e| {
            PersistenceError::config(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> PersistenceResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|source| {
                PersistenceError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> PersistenceResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PersistenceError::config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
