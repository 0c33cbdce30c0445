//! Scribe - crash-safe persistence for live transcripts
//!
//! Utterances from a speech pipeline are kept in a bounded in-memory index
//! for immediate reads and appended to a checksummed write-ahead log, so a
//! crash or reload loses at most the entries not yet flushed.
//!
//! # Quick Start
//!
//! ```ignore
//! use scribe::{PersistenceConfig, TranscriptPersistenceManager, TranscriptUtterance};
//!
//! let manager = TranscriptPersistenceManager::with_ring_buffer(PersistenceConfig::new(".wal"))?;
//! let report = manager.initialize()?;
//! manager.persist_utterance(TranscriptUtterance::new("u1", "s1", "hello"))?;
//! manager.shutdown()?;
//! ```
//!
//! # Architecture
//!
//! - `scribe_core`: utterance model, timestamps, the index trait
//! - `scribe_durability`: WAL format, writer, rotation, monitor, recovery
//! - `scribe_engine`: the persistence manager tying them together
//!
//! The engine API is re-exported at the root; the lower layers are reachable
//! through [`scribe_core`] and [`scribe_durability`].

pub use scribe_engine::*;

pub use scribe_core;
pub use scribe_durability;

pub use scribe_core::{
    SessionId, Timestamp, TranscriptUtterance, UtteranceId, UtteranceIndex, UtteranceState,
};
