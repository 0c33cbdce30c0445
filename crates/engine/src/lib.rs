//! Persistence engine for scribe
//!
//! This crate orchestrates the durability layer:
//! - TranscriptPersistenceManager: persist/query/delete front end
//! - RingBuffer: the default in-memory utterance index
//! - Events: observer trait and channel adapter for outward notifications
//! - Configuration: `scribe.toml` loading
//!
//! The engine is the only component that knows about:
//! - Lifecycle (recovery before the first write, orderly shutdown)
//! - Cross-component coordination (index + writer + policy + monitor)
//! - Background maintenance

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod ring_buffer;

pub use config::{PersistenceConfig, CONFIG_FILE_NAME, DEFAULT_WAL_DIR};
pub use error::{PersistenceError, PersistenceResult};
pub use events::{ChannelObserver, PersistenceEvent, PersistenceObserver};
pub use manager::{
    Lifecycle, PersistenceStats, TickReport, TranscriptPersistenceManager, LOCK_FILE_NAME,
};
pub use ring_buffer::{RingBuffer, DEFAULT_RING_CAPACITY};
