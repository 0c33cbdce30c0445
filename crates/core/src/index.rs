//! Fast-path utterance index contract
//!
//! The persistence layer treats an in-memory index (a bounded ring buffer in
//! the default build) as the authoritative low-latency read path. The WAL
//! exists only for durability; reads never touch disk.

use crate::timestamp::Timestamp;
use crate::utterance::{TranscriptUtterance, UtteranceState};
use std::time::Duration;

/// Point-in-time metrics of an utterance index.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndexMetrics {
    /// Utterances currently held
    pub size: usize,
    /// Maximum number of utterances held
    pub capacity: usize,
    /// `size / capacity` in `[0.0, 1.0]`
    pub utilization: f64,
    /// Number of evictions caused by appends into a full index
    pub overflows: u64,
    /// Number of cleanup passes that removed at least one entry
    pub compactions: u64,
}

/// Result of appending into the index.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The utterance was stored without evicting anything
    Stored,
    /// The index was full; the returned utterance was evicted to make room
    Evicted(TranscriptUtterance),
}

/// In-memory utterance index.
///
/// Implementations must be cheap; they are called on the live transcription
/// path while holding the index lock.
pub trait UtteranceIndex: Send + Sync {
    /// Store a new utterance (or replace one with the same id).
    fn append(&mut self, utterance: TranscriptUtterance) -> AppendOutcome;

    /// Replace an existing utterance. Returns the previous value, or `None`
    /// if the id is unknown (in which case nothing is stored).
    fn update(&mut self, id: &str, utterance: TranscriptUtterance) -> Option<TranscriptUtterance>;

    /// Look up one utterance.
    fn get(&self, id: &str) -> Option<TranscriptUtterance>;

    /// All utterances of a session in insertion order.
    fn get_by_session(&self, session_id: &str) -> Vec<TranscriptUtterance>;

    /// All utterances currently in the given state, in insertion order.
    fn get_by_state(&self, state: UtteranceState) -> Vec<TranscriptUtterance>;

    /// The `n` most recently inserted utterances, newest first.
    fn get_recent(&self, n: usize) -> Vec<TranscriptUtterance>;

    /// Drop every utterance of a session. Returns the removed utterances.
    fn clear_session(&mut self, session_id: &str) -> Vec<TranscriptUtterance>;

    /// Drop terminal utterances last updated more than `max_age` before
    /// `now`. Returns the removed utterances.
    fn clear_old_terminal(&mut self, max_age: Duration, now: Timestamp)
        -> Vec<TranscriptUtterance>;

    /// Metrics snapshot.
    fn metrics(&self) -> IndexMetrics;
}
