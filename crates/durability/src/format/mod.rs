//! Binary on-disk formats
//!
//! - `entry`: WAL entry model, entry type registry, fixed 24-byte header
//! - `file_header`: WAL file header ("TWAL")
//! - `payload`: length-prefixed payload field primitives

pub mod entry;
pub mod file_header;
pub mod payload;

pub use entry::{
    EntryCategory, EntryHeader, EntryPayload, WalEntry, WalEntryType, WalEntryTypeError,
    ENTRY_FORMAT_VERSION, ENTRY_HEADER_SIZE, ENTRY_MAGIC, MAX_PAYLOAD_SIZE,
};
pub use file_header::{
    FileHeaderError, WalFileHeader, FILE_FORMAT_VERSION, FILE_HEADER_FIXED_SIZE, FILE_MAGIC,
};
pub use payload::{PayloadError, PayloadReader, PayloadWriter};
