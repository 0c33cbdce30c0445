//! Storage monitor
//!
//! Samples the WAL directory (size, file count) and the disk it lives on,
//! keeps a short window of samples for a growth-rate estimate, and grades
//! storage health with four independent checks:
//!
//! | Check | Warning | Critical | Emergency |
//! |-------|---------|----------|-----------|
//! | WAL size / max | ≥ warning_ratio | ≥ 1.0 | ≥ emergency_ratio |
//! | Disk used % | ≥ disk_warning | ≥ disk_critical | ≥ disk_emergency |
//! | Growth rate | | > max | > 2 × max |
//! | File count | > max | > 2 × max | |
//!
//! The overall status is the most severe of the four.

use crate::rotation::{list_files, CleanupReport, RotationError, WalRotationManager};
use scribe_core::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const MS_PER_HOUR: f64 = 60.0 * 60.0 * 1000.0;

/// Storage sampling errors
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Listing the WAL directory failed
    #[error("Failed to sample WAL directory: {0}")]
    Sample(#[from] RotationError),
}

/// Storage health, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStatus {
    /// All checks pass
    Healthy,
    /// Approaching a limit
    Warning,
    /// A limit is reached
    Critical,
    /// Past a limit; emergency cleanup is warranted
    Emergency,
}

impl StorageStatus {
    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageStatus::Healthy => "healthy",
            StorageStatus::Warning => "warning",
            StorageStatus::Critical => "critical",
            StorageStatus::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which check raised an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// WAL directory size relative to `max_wal_size`
    WalSize,
    /// Disk usage percentage
    DiskUsage,
    /// Growth rate relative to `max_growth_rate`
    GrowthRate,
    /// Number of WAL files
    FileCount,
}

/// A monitoring signal; not an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageAlert {
    /// Check that raised it
    pub kind: AlertKind,
    /// Severity (never `Healthy`)
    pub severity: StorageStatus,
    /// Human-readable description
    pub message: String,
    /// Observed value
    pub value: f64,
    /// Threshold that was crossed
    pub threshold: f64,
}

/// Monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Minimum time between samples (default: 30s)
    pub sample_interval_ms: u64,
    /// Reference size for the WAL size check (default: 100MB)
    pub max_wal_size: u64,
    /// Fraction of `max_wal_size` that raises a warning (default: 0.8)
    pub warning_ratio: f64,
    /// Fraction of `max_wal_size` that raises an emergency (default: 1.2)
    pub emergency_ratio: f64,
    /// Disk used % for a warning (default: 80)
    pub disk_warning_percent: f64,
    /// Disk used % for critical (default: 90)
    pub disk_critical_percent: f64,
    /// Disk used % for an emergency (default: 95)
    pub disk_emergency_percent: f64,
    /// Growth in bytes/hour above which status is critical (default: 50MB/h)
    pub max_growth_rate: f64,
    /// File count above which a warning is raised (default: 50)
    pub max_file_count: usize,
    /// Samples kept for the growth estimate (default: 10)
    pub growth_window: usize,
    /// Emergency cleanup shrinks the WAL to this fraction of `max_wal_size` (default: 0.5)
    pub cleanup_target_ratio: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            sample_interval_ms: 30_000,
            max_wal_size: 100 * 1024 * 1024,
            warning_ratio: 0.8,
            emergency_ratio: 1.2,
            disk_warning_percent: 80.0,
            disk_critical_percent: 90.0,
            disk_emergency_percent: 95.0,
            max_growth_rate: 50.0 * 1024.0 * 1024.0,
            max_file_count: 50,
            growth_window: 10,
            cleanup_target_ratio: 0.5,
        }
    }
}

impl MonitorConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sampling interval (builder pattern).
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the reference WAL size (builder pattern).
    pub fn with_max_wal_size(mut self, size: u64) -> Self {
        self.max_wal_size = size;
        self
    }

    /// Set the growth-rate limit in bytes/hour (builder pattern).
    pub fn with_max_growth_rate(mut self, bytes_per_hour: f64) -> Self {
        self.max_growth_rate = bytes_per_hour;
        self
    }

    /// Set the file count limit (builder pattern).
    pub fn with_max_file_count(mut self, count: usize) -> Self {
        self.max_file_count = count;
        self
    }

    /// Sampling interval
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), MonitorConfigError> {
        if self.max_wal_size == 0 {
            return Err(MonitorConfigError::ZeroWalSize);
        }
        if self.growth_window < 2 {
            return Err(MonitorConfigError::WindowTooSmall);
        }
        if !(self.warning_ratio < 1.0 && self.emergency_ratio > 1.0) {
            return Err(MonitorConfigError::InvalidRatios);
        }
        if !(self.disk_warning_percent <= self.disk_critical_percent
            && self.disk_critical_percent <= self.disk_emergency_percent)
        {
            return Err(MonitorConfigError::InvalidDiskThresholds);
        }
        Ok(())
    }

    /// Create a configuration for tests (1MB reference size, no interval).
    pub fn for_testing() -> Self {
        MonitorConfig {
            sample_interval_ms: 0,
            max_wal_size: 1024 * 1024,
            max_growth_rate: 1024.0 * 1024.0,
            ..Self::default()
        }
    }
}

/// Monitor configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorConfigError {
    /// Reference size must be positive
    #[error("Max WAL size must be non-zero")]
    ZeroWalSize,
    /// Growth estimate needs two samples
    #[error("Growth window must hold at least 2 samples")]
    WindowTooSmall,
    /// Ratios must straddle 1.0
    #[error("Warning ratio must be below 1.0 and emergency ratio above it")]
    InvalidRatios,
    /// Disk thresholds must be ascending
    #[error("Disk thresholds must be ascending")]
    InvalidDiskThresholds,
}

/// One observation of the WAL directory and its disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSample {
    /// When the sample was taken
    pub taken_at: Timestamp,
    /// Total size of WAL files
    pub wal_size: u64,
    /// Number of WAL files
    pub file_count: usize,
    /// Disk capacity, if it could be read
    pub disk_total: Option<u64>,
    /// Disk space available, if it could be read
    pub disk_available: Option<u64>,
}

impl StorageSample {
    /// Take a sample of `dir`.
    ///
    /// Disk figures come from `fs2`; when the filesystem cannot be queried
    /// they are left as `None` and the disk check is skipped.
    pub fn take(dir: &Path, now: Timestamp) -> Result<Self, MonitorError> {
        let files = list_files(dir)?;
        let stat_dir = if dir.exists() { dir } else { Path::new(".") };
        Ok(StorageSample {
            taken_at: now,
            wal_size: files.iter().map(|f| f.size).sum(),
            file_count: files.len(),
            disk_total: fs2::total_space(stat_dir).ok(),
            disk_available: fs2::available_space(stat_dir).ok(),
        })
    }

    /// Disk used, in percent
    pub fn disk_used_percent(&self) -> Option<f64> {
        match (self.disk_total, self.disk_available) {
            (Some(total), Some(available)) if total > 0 => {
                Some((total.saturating_sub(available)) as f64 * 100.0 / total as f64)
            }
            _ => None,
        }
    }
}

/// Result of an evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageReport {
    /// Most severe status across the checks
    pub status: StorageStatus,
    /// Alerts raised, one per failing check
    pub alerts: Vec<StorageAlert>,
    /// Growth estimate in bytes/hour
    pub growth_rate: Option<f64>,
    /// Projected time until `max_wal_size` is reached
    pub time_to_full: Option<Duration>,
    /// Most recent sample
    pub latest: Option<StorageSample>,
}

impl StorageReport {
    /// First alert raised by a check, if any
    pub fn alert(&self, kind: AlertKind) -> Option<&StorageAlert> {
        self.alerts.iter().find(|a| a.kind == kind)
    }
}

/// Rolling storage monitor for one WAL directory
#[derive(Debug)]
pub struct StorageMonitor {
    config: MonitorConfig,
    samples: VecDeque<StorageSample>,
}

impl StorageMonitor {
    /// Create a monitor with no samples
    pub fn new(config: MonitorConfig) -> Self {
        StorageMonitor {
            samples: VecDeque::with_capacity(config.growth_window),
            config,
        }
    }

    /// Get configuration
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Whether `sample_interval` has passed since the last sample
    pub fn should_sample(&self, now: Timestamp) -> bool {
        match self.samples.back() {
            Some(last) => {
                now.saturating_duration_since(last.taken_at) >= self.config.sample_interval()
            }
            None => true,
        }
    }

    /// Take and record a sample of `dir`.
    pub fn sample(&mut self, dir: &Path, now: Timestamp) -> Result<StorageSample, MonitorError> {
        let sample = StorageSample::take(dir, now)?;
        self.record_sample(sample);
        Ok(sample)
    }

    /// Record an externally produced sample; keeps the last `growth_window`.
    pub fn record_sample(&mut self, sample: StorageSample) {
        while self.samples.len() >= self.config.growth_window.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Samples in the window, oldest first
    pub fn samples(&self) -> impl Iterator<Item = &StorageSample> {
        self.samples.iter()
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<&StorageSample> {
        self.samples.back()
    }

    /// Growth in bytes/hour between the first and last sample in the window.
    ///
    /// Shrinking reports a negative rate. `None` until two samples with
    /// distinct times exist.
    pub fn growth_rate(&self) -> Option<f64> {
        let first = self.samples.front()?;
        let last = self.samples.back()?;
        let elapsed_ms = last.taken_at.as_millis().checked_sub(first.taken_at.as_millis())?;
        if elapsed_ms == 0 {
            return None;
        }
        let delta = last.wal_size as f64 - first.wal_size as f64;
        Some(delta * MS_PER_HOUR / elapsed_ms as f64)
    }

    /// Linear projection of when the WAL reaches `max_wal_size`.
    ///
    /// `Some(ZERO)` if it already has; `None` if it is not growing.
    pub fn time_to_full(&self) -> Option<Duration> {
        let latest = self.latest()?;
        if latest.wal_size >= self.config.max_wal_size {
            return Some(Duration::ZERO);
        }
        let rate = self.growth_rate()?;
        if rate <= 0.0 {
            return None;
        }
        let remaining = (self.config.max_wal_size - latest.wal_size) as f64;
        let hours = remaining / rate;
        Some(Duration::from_secs_f64(hours * 3600.0))
    }

    /// Grade the latest sample.
    pub fn evaluate(&self) -> StorageReport {
        let mut alerts = Vec::new();
        let growth_rate = self.growth_rate();

        if let Some(sample) = self.latest() {
            self.check_wal_size(sample, &mut alerts);
            self.check_disk(sample, &mut alerts);
            self.check_file_count(sample, &mut alerts);
        }
        if let Some(rate) = growth_rate {
            self.check_growth(rate, &mut alerts);
        }

        let status = alerts
            .iter()
            .map(|a| a.severity)
            .max()
            .unwrap_or(StorageStatus::Healthy);

        StorageReport {
            status,
            alerts,
            growth_rate,
            time_to_full: self.time_to_full(),
            latest: self.latest().copied(),
        }
    }

    /// Run the rotation manager's emergency cleanup if, and only if, the
    /// current status is `Emergency`.
    ///
    /// The target shrinks the WAL to `max_wal_size × cleanup_target_ratio`.
    pub fn trigger_emergency_cleanup_if_needed(
        &self,
        rotation: &WalRotationManager,
        dir: &Path,
        active: Option<&Path>,
    ) -> Result<Option<CleanupReport>, RotationError> {
        let report = self.evaluate();
        if report.status != StorageStatus::Emergency {
            return Ok(None);
        }
        let Some(latest) = report.latest else {
            return Ok(None);
        };

        let keep = (self.config.max_wal_size as f64 * self.config.cleanup_target_ratio) as u64;
        let target = latest.wal_size.saturating_sub(keep);
        if target == 0 {
            debug!("Emergency status without WAL bytes to free");
            return Ok(None);
        }

        warn!(
            wal_size = latest.wal_size,
            target_bytes = target,
            "Storage emergency, running WAL cleanup"
        );
        rotation.emergency_cleanup(dir, target, active).map(Some)
    }

    fn check_wal_size(&self, sample: &StorageSample, alerts: &mut Vec<StorageAlert>) {
        let max = self.config.max_wal_size as f64;
        let ratio = sample.wal_size as f64 / max;
        let (severity, threshold) = if ratio >= self.config.emergency_ratio {
            (StorageStatus::Emergency, self.config.emergency_ratio)
        } else if ratio >= 1.0 {
            (StorageStatus::Critical, 1.0)
        } else if ratio >= self.config.warning_ratio {
            (StorageStatus::Warning, self.config.warning_ratio)
        } else {
            return;
        };
        alerts.push(StorageAlert {
            kind: AlertKind::WalSize,
            severity,
            message: format!(
                "WAL size {} bytes is {:.0}% of the {} byte limit",
                sample.wal_size,
                ratio * 100.0,
                self.config.max_wal_size
            ),
            value: sample.wal_size as f64,
            threshold: threshold * max,
        });
    }

    fn check_disk(&self, sample: &StorageSample, alerts: &mut Vec<StorageAlert>) {
        let Some(used) = sample.disk_used_percent() else {
            return;
        };
        let (severity, threshold) = if used >= self.config.disk_emergency_percent {
            (StorageStatus::Emergency, self.config.disk_emergency_percent)
        } else if used >= self.config.disk_critical_percent {
            (StorageStatus::Critical, self.config.disk_critical_percent)
        } else if used >= self.config.disk_warning_percent {
            (StorageStatus::Warning, self.config.disk_warning_percent)
        } else {
            return;
        };
        alerts.push(StorageAlert {
            kind: AlertKind::DiskUsage,
            severity,
            message: format!("Disk is {:.1}% full", used),
            value: used,
            threshold,
        });
    }

    fn check_growth(&self, rate: f64, alerts: &mut Vec<StorageAlert>) {
        let max = self.config.max_growth_rate;
        let (severity, threshold) = if rate > 2.0 * max {
            (StorageStatus::Emergency, 2.0 * max)
        } else if rate > max {
            (StorageStatus::Critical, max)
        } else {
            return;
        };
        alerts.push(StorageAlert {
            kind: AlertKind::GrowthRate,
            severity,
            message: format!(
                "WAL growing at {:.0} bytes/hour (limit {:.0})",
                rate, max
            ),
            value: rate,
            threshold,
        });
    }

    fn check_file_count(&self, sample: &StorageSample, alerts: &mut Vec<StorageAlert>) {
        let max = self.config.max_file_count;
        let (severity, threshold) = if sample.file_count > 2 * max {
            (StorageStatus::Critical, 2 * max)
        } else if sample.file_count > max {
            (StorageStatus::Warning, max)
        } else {
            return;
        };
        alerts.push(StorageAlert {
            kind: AlertKind::FileCount,
            severity,
            message: format!("{} WAL files (limit {})", sample.file_count, max),
            value: sample.file_count as f64,
            threshold: threshold as f64,
        });
    }
}
