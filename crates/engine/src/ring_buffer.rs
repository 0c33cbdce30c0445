//! Bounded in-memory utterance index
//!
//! Insertion order lives in a `VecDeque` of ids, the utterances themselves in
//! a `HashMap` keyed by id. A full buffer evicts its oldest utterance.

use scribe_core::{
    AppendOutcome, IndexMetrics, Timestamp, TranscriptUtterance, UtteranceId, UtteranceIndex,
    UtteranceState,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Default number of utterances held
pub const DEFAULT_RING_CAPACITY: usize = 1_000;

/// Fixed-capacity utterance index
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    order: VecDeque<UtteranceId>,
    entries: HashMap<UtteranceId, TranscriptUtterance>,
    overflows: u64,
    compactions: u64,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` utterances (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RingBuffer {
            capacity,
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
            overflows: 0,
            compactions: 0,
        }
    }

    /// Utterances held
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of utterances held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn iter(&self) -> impl DoubleEndedIterator<Item = &TranscriptUtterance> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    fn remove_where(
        &mut self,
        mut remove: impl FnMut(&TranscriptUtterance) -> bool,
    ) -> Vec<TranscriptUtterance> {
        let mut removed = Vec::new();
        let entries = &mut self.entries;
        self.order.retain(|id| {
            let drop = entries.get(id).map_or(true, &mut remove);
            if drop {
                if let Some(utterance) = entries.remove(id) {
                    removed.push(utterance);
                }
            }
            !drop
        });
        removed
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl UtteranceIndex for RingBuffer {
    fn append(&mut self, utterance: TranscriptUtterance) -> AppendOutcome {
        if let Some(existing) = self.entries.get_mut(&utterance.id) {
            *existing = utterance;
            return AppendOutcome::Stored;
        }

        let mut outcome = AppendOutcome::Stored;
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                if let Some(evicted) = self.entries.remove(&oldest) {
                    self.overflows += 1;
                    outcome = AppendOutcome::Evicted(evicted);
                }
            }
        }
        self.order.push_back(utterance.id.clone());
        self.entries.insert(utterance.id.clone(), utterance);
        outcome
    }

    fn update(&mut self, id: &str, utterance: TranscriptUtterance) -> Option<TranscriptUtterance> {
        let slot = self.entries.get_mut(id)?;
        Some(std::mem::replace(slot, utterance))
    }

    fn get(&self, id: &str) -> Option<TranscriptUtterance> {
        self.entries.get(id).cloned()
    }

    fn get_by_session(&self, session_id: &str) -> Vec<TranscriptUtterance> {
        self.iter()
            .filter(|u| u.session_id == session_id)
            .cloned()
            .collect()
    }

    fn get_by_state(&self, state: UtteranceState) -> Vec<TranscriptUtterance> {
        self.iter().filter(|u| u.state == state).cloned().collect()
    }

    fn get_recent(&self, n: usize) -> Vec<TranscriptUtterance> {
        self.iter().rev().take(n).cloned().collect()
    }

    fn clear_session(&mut self, session_id: &str) -> Vec<TranscriptUtterance> {
        self.remove_where(|u| u.session_id == session_id)
    }

    fn clear_old_terminal(
        &mut self,
        max_age: Duration,
        now: Timestamp,
    ) -> Vec<TranscriptUtterance> {
        let removed = self.remove_where(|u| {
            u.is_terminal() && now.saturating_duration_since(u.updated_at) > max_age
        });
        if !removed.is_empty() {
            self.compactions += 1;
        }
        removed
    }

    fn metrics(&self) -> IndexMetrics {
        IndexMetrics {
            size: self.order.len(),
            capacity: self.capacity,
            utilization: self.order.len() as f64 / self.capacity as f64,
            overflows: self.overflows,
            compactions: self.compactions,
        }
    }
}
