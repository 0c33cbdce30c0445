//! Priority write queue
//!
//! Each `write_entries` call becomes one queued batch so a caller's entries
//! stay contiguous. Batches are served highest priority first and FIFO
//! within a priority class.

use crate::format::WalEntry;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Scheduling class of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WritePriority {
    /// Background bookkeeping
    Low,
    /// Regular transcript traffic
    Normal,
    /// Finalized utterances and session boundaries
    High,
    /// Flushed immediately and never refused (deletes, shutdown)
    Urgent,
}

#[derive(Debug)]
struct QueuedBatch {
    priority: WritePriority,
    seq: u64,
    entries: Vec<WalEntry>,
}

impl PartialEq for QueuedBatch {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedBatch {}

impl PartialOrd for QueuedBatch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedBatch {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Admitted writes waiting for buffer space
#[derive(Debug, Default)]
pub struct WriteQueue {
    heap: BinaryHeap<QueuedBatch>,
    next_seq: u64,
    entries: usize,
}

impl WriteQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a batch
    pub fn push(&mut self, priority: WritePriority, entries: Vec<WalEntry>) {
        if entries.is_empty() {
            return;
        }
        self.entries += entries.len();
        self.heap.push(QueuedBatch {
            priority,
            seq: self.next_seq,
            entries,
        });
        self.next_seq += 1;
    }

    /// Take the next batch to serve
    pub fn pop(&mut self) -> Option<(WritePriority, Vec<WalEntry>)> {
        let batch = self.heap.pop()?;
        self.entries -= batch.entries.len();
        Some((batch.priority, batch.entries))
    }

    /// Queued entries across all batches
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queued batches
    pub fn batches(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::Timestamp;

    fn batch(tag: &str, n: usize) -> Vec<WalEntry> {
        (0..n)
            .map(|i| WalEntry::delete(format!("{}{}", tag, i), "s", Timestamp::EPOCH))
            .collect()
    }

    fn first_id(entries: &[WalEntry]) -> String {
        entries[0].utterance_id().unwrap_or_default().to_string()
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut q = WriteQueue::new();
        q.push(WritePriority::Normal, batch("n1-", 1));
        q.push(WritePriority::Low, batch("l1-", 1));
        q.push(WritePriority::Urgent, batch("u1-", 1));
        q.push(WritePriority::Normal, batch("n2-", 1));
        q.push(WritePriority::High, batch("h1-", 1));

        let order: Vec<String> = std::iter::from_fn(|| q.pop())
            .map(|(_, e)| first_id(&e))
            .collect();
        assert_eq!(order, vec!["u1-0", "h1-0", "n1-0", "n2-0", "l1-0"]);
    }

    #[test]
    fn test_len_counts_entries() {
        let mut q = WriteQueue::new();
        q.push(WritePriority::Normal, batch("a", 3));
        q.push(WritePriority::High, batch("b", 2));
        q.push(WritePriority::High, Vec::new());
        assert_eq!(q.len(), 5);
        assert_eq!(q.batches(), 2);

        let (priority, entries) = q.pop().unwrap();
        assert_eq!(priority, WritePriority::High);
        assert_eq!(entries.len(), 2);
        assert_eq!(q.len(), 3);
        q.pop();
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }
}
