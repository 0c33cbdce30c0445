//! Durability layer for scribe
//!
//! This crate handles everything that touches disk:
//!
//! - Binary formats: WAL entries (24-byte header + typed payload) and the
//!   per-file header
//! - Codec: deterministic encoder, resynchronizing stream decoder
//! - Flush policy: host signals → flush requests
//! - Writer: batched, fsynced appends with retry, timeout and backpressure
//! - Rotation and retention: size/age caps, count/age/size retention,
//!   gzip archiving, emergency cleanup
//! - Storage monitor: WAL size, disk usage, growth rate, alerts
//! - Recovery: replay of WAL files into per-session state

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod flush;
pub mod format;
pub mod monitor;
pub mod recovery;
pub mod rotation;
pub mod wal;

// Formats
pub use format::{
    EntryCategory, EntryHeader, EntryPayload, FileHeaderError, WalEntry, WalEntryType,
    WalFileHeader, ENTRY_HEADER_SIZE, ENTRY_MAGIC, FILE_MAGIC,
};

// Codec
pub use codec::{
    DecodeError, DecodedEntry, EncodedBatch, EntryStream, SkipWarning, StreamItem, WalDecoder,
    WalEncoder,
};

// Flush policy
pub use flush::{
    AppState, FlushPolicyConfig, FlushPolicyConfigError, FlushPolicyManager, FlushPolicyStats,
    FlushReason, FlushRequest, Urgency,
};

// Rotation and retention
pub use rotation::{
    list_files, CleanupReport, RetentionReport, RotationConfig, RotationConfigError,
    RotationError, RotationReason, WalFileInfo, WalRotationManager,
};

// Storage monitor
pub use monitor::{
    AlertKind, MonitorConfig, MonitorConfigError, MonitorError, StorageAlert, StorageMonitor,
    StorageReport, StorageSample, StorageStatus,
};

// Writer
pub use wal::{
    FlushReport, RotationRecord, WalConfig, WalConfigError, WalWriteError, WalWriter,
    WriteOutcome, WritePriority, WriterStats,
};

// Recovery
pub use recovery::{
    ConflictPolicy, RecoveredSession, RecoveryConfig, RecoveryConfigError, RecoveryError,
    RecoveryReport, RecoveryStats, RecoveryStatus, WalRecoveryManager,
};
