//! Rotation and retention configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Rotation and retention parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Rotate before a write would push the file past this size (default: 10MB)
    pub max_file_size: u64,

    /// Rotate once the file is this old (default: 1h)
    pub max_file_age_ms: u64,

    /// Hard size cap that overrides the normal check (default: 2x max_file_size)
    pub emergency_file_size: u64,

    /// Hard age cap that overrides the normal check (default: 4h)
    pub emergency_file_age_ms: u64,

    /// Closed files kept before the oldest are retired (default: 10)
    pub max_files: usize,

    /// Closed files older than this are retired (default: 7 days)
    pub max_retention_age_ms: u64,

    /// Directory size above which the oldest closed files are retired (default: 100MB)
    pub max_total_size: u64,

    /// Gzip retired files instead of deleting them outright
    pub archive: bool,

    /// Where archives go; defaults to `<wal_dir>/archive`
    pub archive_dir: Option<PathBuf>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            max_file_size: 10 * 1024 * 1024,
            max_file_age_ms: 60 * 60 * 1000,
            emergency_file_size: 20 * 1024 * 1024,
            emergency_file_age_ms: 4 * 60 * 60 * 1000,
            max_files: 10,
            max_retention_age_ms: 7 * 24 * 60 * 60 * 1000,
            max_total_size: 100 * 1024 * 1024,
            archive: false,
            archive_dir: None,
        }
    }
}

impl RotationConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the normal size threshold; the emergency threshold follows at 2x
    /// (builder pattern).
    pub fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self.emergency_file_size = size.saturating_mul(2);
        self
    }

    /// Set the normal age threshold (builder pattern).
    pub fn with_max_file_age(mut self, age: Duration) -> Self {
        self.max_file_age_ms = age.as_millis() as u64;
        self
    }

    /// Set the emergency thresholds (builder pattern).
    pub fn with_emergency_limits(mut self, size: u64, age: Duration) -> Self {
        self.emergency_file_size = size;
        self.emergency_file_age_ms = age.as_millis() as u64;
        self
    }

    /// Set the retained file count (builder pattern).
    pub fn with_max_files(mut self, count: usize) -> Self {
        self.max_files = count;
        self
    }

    /// Set the retention age (builder pattern).
    pub fn with_max_retention_age(mut self, age: Duration) -> Self {
        self.max_retention_age_ms = age.as_millis() as u64;
        self
    }

    /// Set the total size cap (builder pattern).
    pub fn with_max_total_size(mut self, size: u64) -> Self {
        self.max_total_size = size;
        self
    }

    /// Archive retired files (builder pattern).
    pub fn with_archive(mut self, dir: Option<PathBuf>) -> Self {
        self.archive = true;
        self.archive_dir = dir;
        self
    }

    /// Normal age threshold
    pub fn max_file_age(&self) -> Duration {
        Duration::from_millis(self.max_file_age_ms)
    }

    /// Emergency age threshold
    pub fn emergency_file_age(&self) -> Duration {
        Duration::from_millis(self.emergency_file_age_ms)
    }

    /// Retention age
    pub fn max_retention_age(&self) -> Duration {
        Duration::from_millis(self.max_retention_age_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), RotationConfigError> {
        if self.max_file_size < 1024 {
            return Err(RotationConfigError::FileSizeTooSmall);
        }
        if self.emergency_file_size < self.max_file_size {
            return Err(RotationConfigError::EmergencyBelowNormal);
        }
        if self.emergency_file_age_ms < self.max_file_age_ms {
            return Err(RotationConfigError::EmergencyBelowNormal);
        }
        if self.max_files == 0 {
            return Err(RotationConfigError::ZeroRetainedFiles);
        }
        Ok(())
    }

    /// Create a configuration for tests (4KB files).
    pub fn for_testing() -> Self {
        RotationConfig {
            max_file_size: 4 * 1024,
            emergency_file_size: 8 * 1024,
            ..Self::default()
        }
    }
}

/// Rotation configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RotationConfigError {
    /// File size is too small (minimum 1KB).
    #[error("Max file size must be at least 1KB")]
    FileSizeTooSmall,

    /// An emergency threshold is below its normal counterpart.
    #[error("Emergency thresholds cannot be below the normal thresholds")]
    EmergencyBelowNormal,

    /// At least one closed file must be retained.
    #[error("Max retained files must be at least 1")]
    ZeroRetainedFiles,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RotationConfig::default();
        assert_eq!(config.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.emergency_file_size, 2 * config.max_file_size);
        assert_eq!(config.max_file_age(), Duration::from_secs(3600));
        assert_eq!(config.emergency_file_age(), Duration::from_secs(4 * 3600));
        assert_eq!(config.max_files, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_keeps_emergency_ratio() {
        let config = RotationConfig::new().with_max_file_size(64 * 1024);
        assert_eq!(config.emergency_file_size, 128 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        assert_eq!(
            RotationConfig::new().with_max_file_size(100).validate(),
            Err(RotationConfigError::FileSizeTooSmall)
        );
        assert_eq!(
            RotationConfig::new()
                .with_emergency_limits(1024, Duration::from_secs(10))
                .validate(),
            Err(RotationConfigError::EmergencyBelowNormal)
        );
        assert_eq!(
            RotationConfig::new().with_max_files(0).validate(),
            Err(RotationConfigError::ZeroRetainedFiles)
        );
    }

    #[test]
    fn test_testing_config() {
        let config = RotationConfig::for_testing();
        assert!(config.validate().is_ok());
        assert!(config.max_file_size < RotationConfig::default().max_file_size);
    }
}
