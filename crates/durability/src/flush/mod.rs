//! Flush policy
//!
//! `FlushPolicyManager` turns host signals (new partials, finalized
//! utterances, visibility changes, memory pressure, timers) into flush
//! requests. It performs no I/O and never fails; acting on a request and
//! retrying failed writes is the writer's job.
//!
//! Time is passed in explicitly as `Instant` so callers decide what "now"
//! means and tests can step the clock.
//!
//! # Urgency
//!
//! | Reason | Urgency |
//! |--------|---------|
//! | Interval, PartialThreshold | normal (coalesced) |
//! | UtteranceFinalized, SessionEnded, AppClose, TabHidden, MemoryPressure, Manual | urgent |
//!
//! Urgent requests are returned immediately. Normal requests open (or join)
//! a coalescing window that `poll` releases as a single request once
//! `max_coalesce_delay` has elapsed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Why a flush was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlushReason {
    /// Periodic timer (short while visible, long in background)
    Interval,
    /// Pending partial count reached the threshold
    PartialThreshold,
    /// An utterance reached a terminal state
    UtteranceFinalized,
    /// A session ended
    SessionEnded,
    /// The host application is closing
    AppClose,
    /// The app has been hidden for longer than the hidden delay
    TabHidden,
    /// Memory pressure crossed the threshold
    MemoryPressure,
    /// Explicit request
    Manual,
}

impl FlushReason {
    /// Urgency this reason carries
    pub fn urgency(&self) -> Urgency {
        match self {
            FlushReason::Interval | FlushReason::PartialThreshold => Urgency::Normal,
            _ => Urgency::Urgent,
        }
    }

    /// Short stable name, used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Interval => "interval",
            FlushReason::PartialThreshold => "partial_threshold",
            FlushReason::UtteranceFinalized => "utterance_finalized",
            FlushReason::SessionEnded => "session_ended",
            FlushReason::AppClose => "app_close",
            FlushReason::TabHidden => "tab_hidden",
            FlushReason::MemoryPressure => "memory_pressure",
            FlushReason::Manual => "manual",
        }
    }
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flush urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Urgency {
    /// May be coalesced up to `max_coalesce_delay`
    Normal,
    /// Flush now
    Urgent,
}

/// A signal that buffered entries should be flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRequest {
    /// The trigger that produced (or opened the window for) this request
    pub reason: FlushReason,
    /// Urgency
    pub urgency: Urgency,
    /// Number of normal signals merged into this request
    pub coalesced: u32,
}

impl FlushRequest {
    fn new(reason: FlushReason) -> Self {
        FlushRequest {
            reason,
            urgency: reason.urgency(),
            coalesced: 1,
        }
    }

    /// Whether the request must be served immediately
    pub fn is_urgent(&self) -> bool {
        self.urgency == Urgency::Urgent
    }
}

/// Coarse host application state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppState {
    /// Window/tab is visible
    pub visible: bool,
    /// User is active
    pub active: bool,
    /// Last reported memory pressure ratio (0.0 - 1.0)
    pub memory_pressure: f64,
}

impl Default for AppState {
    fn default() -> Self {
        AppState {
            visible: true,
            active: true,
            memory_pressure: 0.0,
        }
    }
}

/// Flush policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushPolicyConfig {
    /// Periodic flush interval while visible (default: 5s)
    pub visible_interval_ms: u64,
    /// Periodic flush interval while hidden (default: 30s)
    pub background_interval_ms: u64,
    /// Pending partials that trigger a flush (default: 10)
    pub partial_threshold: usize,
    /// Time hidden before a flush is forced (default: 2s)
    pub hidden_flush_delay_ms: u64,
    /// Memory pressure ratio that forces a flush (default: 0.85)
    pub memory_pressure_threshold: f64,
    /// Longest a normal request may be held for coalescing (default: 1s)
    pub max_coalesce_delay_ms: u64,
}

impl Default for FlushPolicyConfig {
    fn default() -> Self {
        FlushPolicyConfig {
            visible_interval_ms: 5_000,
            background_interval_ms: 30_000,
            partial_threshold: 10,
            hidden_flush_delay_ms: 2_000,
            memory_pressure_threshold: 0.85,
            max_coalesce_delay_ms: 1_000,
        }
    }
}

impl FlushPolicyConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the visible interval (builder pattern).
    pub fn with_visible_interval(mut self, interval: Duration) -> Self {
        self.visible_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the background interval (builder pattern).
    pub fn with_background_interval(mut self, interval: Duration) -> Self {
        self.background_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the partial threshold (builder pattern).
    pub fn with_partial_threshold(mut self, threshold: usize) -> Self {
        self.partial_threshold = threshold;
        self
    }

    /// Set the hidden flush delay (builder pattern).
    pub fn with_hidden_flush_delay(mut self, delay: Duration) -> Self {
        self.hidden_flush_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the memory pressure threshold (builder pattern).
    pub fn with_memory_pressure_threshold(mut self, ratio: f64) -> Self {
        self.memory_pressure_threshold = ratio;
        self
    }

    /// Set the coalescing window (builder pattern).
    pub fn with_max_coalesce_delay(mut self, delay: Duration) -> Self {
        self.max_coalesce_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Periodic interval while visible
    pub fn visible_interval(&self) -> Duration {
        Duration::from_millis(self.visible_interval_ms)
    }

    /// Periodic interval while hidden
    pub fn background_interval(&self) -> Duration {
        Duration::from_millis(self.background_interval_ms)
    }

    /// Hidden delay before a forced flush
    pub fn hidden_flush_delay(&self) -> Duration {
        Duration::from_millis(self.hidden_flush_delay_ms)
    }

    /// Coalescing window
    pub fn max_coalesce_delay(&self) -> Duration {
        Duration::from_millis(self.max_coalesce_delay_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), FlushPolicyConfigError> {
        if self.partial_threshold == 0 {
            return Err(FlushPolicyConfigError::ZeroPartialThreshold);
        }
        if self.visible_interval_ms == 0 || self.background_interval_ms == 0 {
            return Err(FlushPolicyConfigError::ZeroInterval);
        }
        if !(0.0..=1.0).contains(&self.memory_pressure_threshold) {
            return Err(FlushPolicyConfigError::InvalidPressureThreshold(
                self.memory_pressure_threshold,
            ));
        }
        Ok(())
    }

    /// Create a configuration for tests: small threshold, no coalescing delay.
    pub fn for_testing() -> Self {
        FlushPolicyConfig {
            visible_interval_ms: 100,
            background_interval_ms: 500,
            partial_threshold: 3,
            hidden_flush_delay_ms: 50,
            memory_pressure_threshold: 0.85,
            max_coalesce_delay_ms: 0,
        }
    }
}

/// Flush policy configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlushPolicyConfigError {
    /// Partial threshold must be positive
    #[error("Partial threshold must be at least 1")]
    ZeroPartialThreshold,

    /// Intervals must be positive
    #[error("Flush intervals must be non-zero")]
    ZeroInterval,

    /// Pressure threshold outside 0.0 - 1.0
    #[error("Memory pressure threshold must be within 0.0..=1.0, got {0}")]
    InvalidPressureThreshold(f64),
}

/// Counters for emitted requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushPolicyStats {
    /// Requests emitted, per reason
    pub requests: BTreeMap<FlushReason, u64>,
    /// Urgent requests emitted
    pub urgent_requests: u64,
    /// Normal signals merged into an already-open window
    pub coalesced_signals: u64,
    /// Flushes acknowledged via `mark_flushed`
    pub flushes: u64,
}

impl FlushPolicyStats {
    /// Total requests emitted
    pub fn total_requests(&self) -> u64 {
        self.requests.values().sum()
    }

    /// Requests emitted for one reason
    pub fn count(&self, reason: FlushReason) -> u64 {
        self.requests.get(&reason).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
struct CoalesceWindow {
    opened_at: Instant,
    reason: FlushReason,
    signals: u32,
}

/// Event-trigger aggregator deciding when buffered entries must be flushed
#[derive(Debug)]
pub struct FlushPolicyManager {
    config: FlushPolicyConfig,
    state: AppState,
    pending_partials: usize,
    /// Anything written since the last flush
    dirty: bool,
    last_flush: Instant,
    hidden_since: Option<Instant>,
    hidden_flush_sent: bool,
    window: Option<CoalesceWindow>,
    stats: FlushPolicyStats,
}

impl FlushPolicyManager {
    /// Create a policy; `now` starts the first interval.
    pub fn new(config: FlushPolicyConfig, now: Instant) -> Self {
        FlushPolicyManager {
            config,
            state: AppState::default(),
            pending_partials: 0,
            dirty: false,
            last_flush: now,
            hidden_since: None,
            hidden_flush_sent: false,
            window: None,
            stats: FlushPolicyStats::default(),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &FlushPolicyConfig {
        &self.config
    }

    /// Current host state
    pub fn app_state(&self) -> AppState {
        self.state
    }

    /// Partials recorded since the last flush
    pub fn pending_partials(&self) -> usize {
        self.pending_partials
    }

    /// Whether anything was recorded since the last flush
    pub fn has_pending(&self) -> bool {
        self.dirty
    }

    /// Counters
    pub fn stats(&self) -> &FlushPolicyStats {
        &self.stats
    }

    /// Record a write that is neither a partial nor a finalization, such as
    /// a stable revision. Only arms the interval timer.
    pub fn record_write(&mut self) {
        self.dirty = true;
    }

    /// Record one more pending partial.
    pub fn record_partial(&mut self, now: Instant) -> Option<FlushRequest> {
        self.dirty = true;
        self.pending_partials += 1;
        if self.pending_partials >= self.config.partial_threshold {
            return self.signal(FlushReason::PartialThreshold, now);
        }
        None
    }

    /// An utterance reached a terminal state.
    pub fn utterance_finalized(&mut self, now: Instant) -> Option<FlushRequest> {
        self.dirty = true;
        self.signal(FlushReason::UtteranceFinalized, now)
    }

    /// A session ended.
    pub fn session_ended(&mut self, now: Instant) -> Option<FlushRequest> {
        self.signal(FlushReason::SessionEnded, now)
    }

    /// The host is closing.
    pub fn app_close(&mut self, now: Instant) -> Option<FlushRequest> {
        self.signal(FlushReason::AppClose, now)
    }

    /// Explicit flush request.
    pub fn manual(&mut self, now: Instant) -> Option<FlushRequest> {
        self.signal(FlushReason::Manual, now)
    }

    /// Update visibility. Hiding starts the hidden-delay timer; the forced
    /// flush itself is released by `poll`.
    pub fn set_visible(&mut self, visible: bool, now: Instant) {
        if visible == self.state.visible {
            return;
        }
        self.state.visible = visible;
        if visible {
            self.hidden_since = None;
        } else {
            self.hidden_since = Some(now);
        }
        self.hidden_flush_sent = false;
    }

    /// Update user activity. An idle user gets the background interval
    /// even while visible.
    pub fn set_active(&mut self, active: bool) {
        self.state.active = active;
    }

    /// Report the current memory pressure ratio.
    pub fn report_memory_pressure(&mut self, ratio: f64, now: Instant) -> Option<FlushRequest> {
        self.state.memory_pressure = ratio;
        if ratio >= self.config.memory_pressure_threshold && self.dirty {
            return self.signal(FlushReason::MemoryPressure, now);
        }
        None
    }

    /// Evaluate timers: hidden delay, coalescing window, periodic interval.
    pub fn poll(&mut self, now: Instant) -> Option<FlushRequest> {
        if let Some(since) = self.hidden_since {
            if !self.hidden_flush_sent
                && self.dirty
                && now.saturating_duration_since(since) >= self.config.hidden_flush_delay()
            {
                self.hidden_flush_sent = true;
                return self.signal(FlushReason::TabHidden, now);
            }
        }

        if let Some(window) = self.window {
            if now.saturating_duration_since(window.opened_at) >= self.config.max_coalesce_delay()
            {
                self.window = None;
                return Some(self.emit(FlushRequest {
                    reason: window.reason,
                    urgency: Urgency::Normal,
                    coalesced: window.signals,
                }));
            }
            return None;
        }

        let interval = if self.state.visible && self.state.active {
            self.config.visible_interval()
        } else {
            self.config.background_interval()
        };
        if self.dirty && now.saturating_duration_since(self.last_flush) >= interval {
            return Some(self.emit(FlushRequest::new(FlushReason::Interval)));
        }
        None
    }

    /// Acknowledge a completed flush; resets counters and timers.
    pub fn mark_flushed(&mut self, now: Instant) {
        self.pending_partials = 0;
        self.dirty = false;
        self.last_flush = now;
        self.window = None;
        self.stats.flushes += 1;
    }

    fn signal(&mut self, reason: FlushReason, now: Instant) -> Option<FlushRequest> {
        if reason.urgency() == Urgency::Urgent {
            self.window = None;
            return Some(self.emit(FlushRequest::new(reason)));
        }

        match self.window.as_mut() {
            Some(window) => {
                window.signals += 1;
                self.stats.coalesced_signals += 1;
                None
            }
            None if self.config.max_coalesce_delay_ms == 0 => {
                Some(self.emit(FlushRequest::new(reason)))
            }
            None => {
                self.window = Some(CoalesceWindow {
                    opened_at: now,
                    reason,
                    signals: 1,
                });
                None
            }
        }
    }

    fn emit(&mut self, request: FlushRequest) -> FlushRequest {
        *self.stats.requests.entry(request.reason).or_insert(0) += 1;
        if request.is_urgent() {
            self.stats.urgent_requests += 1;
        }
        tracing::trace!(
            reason = %request.reason,
            urgent = request.is_urgent(),
            coalesced = request.coalesced,
            "Flush requested"
        );
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn policy() -> (FlushPolicyManager, Instant) {
        let t0 = Instant::now();
        (FlushPolicyManager::new(FlushPolicyConfig::default(), t0), t0)
    }

    #[test]
    fn test_default_config() {
        let config = FlushPolicyConfig::default();
        assert_eq!(config.visible_interval(), ms(5_000));
        assert_eq!(config.background_interval(), ms(30_000));
        assert_eq!(config.partial_threshold, 10);
        assert!(config.validate().is_ok());
        assert!(FlushPolicyConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            FlushPolicyConfig::new().with_partial_threshold(0).validate(),
            Err(FlushPolicyConfigError::ZeroPartialThreshold)
        );
        assert!(FlushPolicyConfig::new()
            .with_memory_pressure_threshold(1.5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_partial_threshold_is_coalesced() {
        let (mut p, t0) = policy();
        for _ in 0..9 {
            assert!(p.record_partial(t0).is_none());
        }
        // Threshold reached: opens a window instead of flushing
        assert!(p.record_partial(t0).is_none());
        assert!(p.record_partial(t0 + ms(200)).is_none());
        assert!(p.poll(t0 + ms(500)).is_none());

        let req = p.poll(t0 + ms(1_000)).unwrap();
        assert_eq!(req.reason, FlushReason::PartialThreshold);
        assert_eq!(req.urgency, Urgency::Normal);
        assert_eq!(req.coalesced, 2);
        assert_eq!(p.stats().coalesced_signals, 1);
    }

    #[test]
    fn test_urgent_requests_are_immediate() {
        let (mut p, t0) = policy();
        let req = p.utterance_finalized(t0).unwrap();
        assert!(req.is_urgent());
        assert_eq!(req.reason, FlushReason::UtteranceFinalized);

        assert_eq!(p.session_ended(t0).unwrap().reason, FlushReason::SessionEnded);
        assert_eq!(p.app_close(t0).unwrap().reason, FlushReason::AppClose);
        assert_eq!(p.manual(t0).unwrap().reason, FlushReason::Manual);
        assert_eq!(p.stats().urgent_requests, 4);
    }

    #[test]
    fn test_urgent_request_clears_window() {
        let (mut p, t0) = policy();
        for _ in 0..10 {
            p.record_partial(t0);
        }
        assert!(p.manual(t0 + ms(10)).is_some());
        p.mark_flushed(t0 + ms(10));
        assert!(p.poll(t0 + ms(2_000)).is_none());
    }

    #[test]
    fn test_interval_visible_and_background() {
        let (mut p, t0) = policy();
        p.record_write();
        assert!(p.poll(t0 + ms(4_999)).is_none());
        assert_eq!(
            p.poll(t0 + ms(5_000)).unwrap().reason,
            FlushReason::Interval
        );
        p.mark_flushed(t0 + ms(5_000));

        // Nothing pending: no interval flush
        assert!(p.poll(t0 + ms(20_000)).is_none());

        p.set_visible(false, t0 + ms(20_000));
        p.set_visible(true, t0 + ms(20_001));
        p.set_visible(false, t0 + ms(20_002));
        // Hidden flush delay fires only when something is pending
        assert!(p.poll(t0 + ms(25_000)).is_none());
        p.record_write();
        assert_eq!(
            p.poll(t0 + ms(25_000)).unwrap().reason,
            FlushReason::TabHidden
        );
        p.mark_flushed(t0 + ms(25_000));

        p.record_write();
        assert!(p.poll(t0 + ms(45_000)).is_none());
        assert_eq!(
            p.poll(t0 + ms(55_000)).unwrap().reason,
            FlushReason::Interval
        );
    }

    #[test]
    fn test_idle_user_uses_background_interval() {
        let (mut p, t0) = policy();
        p.set_active(false);
        p.record_write();
        assert!(p.poll(t0 + ms(5_000)).is_none());
        assert_eq!(
            p.poll(t0 + ms(30_000)).unwrap().reason,
            FlushReason::Interval
        );
        p.mark_flushed(t0 + ms(30_000));

        p.set_active(true);
        p.record_write();
        assert!(p.app_state().active);
        assert_eq!(
            p.poll(t0 + ms(35_000)).unwrap().reason,
            FlushReason::Interval
        );
    }

    #[test]
    fn test_tab_hidden_fires_once_per_hide() {
        let (mut p, t0) = policy();
        p.record_write();
        p.set_visible(false, t0);
        assert!(p.poll(t0 + ms(1_999)).is_none());
        let req = p.poll(t0 + ms(2_000)).unwrap();
        assert_eq!(req.reason, FlushReason::TabHidden);
        assert!(req.is_urgent());
        assert!(p.poll(t0 + ms(2_500)).is_none());
    }

    #[test]
    fn test_memory_pressure() {
        let (mut p, t0) = policy();
        assert!(p.report_memory_pressure(0.95, t0).is_none());
        p.record_write();
        assert!(p.report_memory_pressure(0.5, t0).is_none());
        let req = p.report_memory_pressure(0.9, t0).unwrap();
        assert_eq!(req.reason, FlushReason::MemoryPressure);
        assert_eq!(p.app_state().memory_pressure, 0.9);
    }

    #[test]
    fn test_mark_flushed_resets() {
        let (mut p, t0) = policy();
        p.record_partial(t0);
        p.record_partial(t0);
        assert_eq!(p.pending_partials(), 2);
        p.mark_flushed(t0);
        assert_eq!(p.pending_partials(), 0);
        assert!(!p.has_pending());
        assert_eq!(p.stats().flushes, 1);
    }

    #[test]
    fn test_zero_coalesce_delay_emits_immediately() {
        let t0 = Instant::now();
        let mut p = FlushPolicyManager::new(FlushPolicyConfig::for_testing(), t0);
        assert!(p.record_partial(t0).is_none());
        assert!(p.record_partial(t0).is_none());
        let req = p.record_partial(t0).unwrap();
        assert_eq!(req.reason, FlushReason::PartialThreshold);
        assert_eq!(p.stats().count(FlushReason::PartialThreshold), 1);
    }
}
