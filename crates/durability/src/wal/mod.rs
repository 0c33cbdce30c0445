//! WAL writer side
//!
//! - `config`: writer parameters (WalConfig, WalConfigError)
//! - `file`: the active file handle (WalFile)
//! - `queue`: priority queue of admitted writes (WriteQueue, WritePriority)
//! - `writer`: batching, retry, rotation (WalWriter)

pub mod config;
pub mod file;
pub mod queue;
pub mod writer;

pub use config::{WalConfig, WalConfigError};
pub use file::{EntryScan, ResumeError, WalFile};
pub use queue::{WritePriority, WriteQueue};
pub use writer::{
    FlushReport, RotationRecord, WalWriteError, WalWriter, WriteOutcome, WriterStats,
};
