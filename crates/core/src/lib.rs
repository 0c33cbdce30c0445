//! Core types for scribe
//!
//! This crate defines the foundational types shared by the durability layer
//! and the persistence engine:
//! - TranscriptUtterance: one speech segment and its lifecycle state
//! - UtterancePatch / UtteranceSnapshot: update payloads and prior-state proofs
//! - UtteranceIndex: contract of the in-memory fast-path index
//! - Timestamp: millisecond wall-clock time
//! - Error: validation error hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod index;
pub mod timestamp;
pub mod utterance;

pub use error::{Error, Result};
pub use index::{AppendOutcome, IndexMetrics, UtteranceIndex};
pub use timestamp::Timestamp;
pub use utterance::{
    SessionId, TranscriptUtterance, UtteranceId, UtterancePatch, UtteranceSnapshot,
    UtteranceState,
};
