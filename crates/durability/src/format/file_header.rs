//! WAL file header
//!
//! Every WAL file starts with a self-describing header:
//!
//! ```text
//! ┌───────────┬─────────┬───────────┬────────────────┬────────────────┬─────────────┐
//! │ "TWAL" (4)│ Ver (1) │ Flags (1) │ HeaderLen (2)  │ CreatedAt (8)  │ NodeId (16) │
//! ├───────────┴─────────┴───────────┴────────────────┴────────────────┴─────────────┤
//! │ SessionLen (2) │ Session id bytes (SessionLen) │ CRC32 of all preceding (4)     │
//! └────────────────┴───────────────────────────────┴────────────────────────────────┘
//! ```
//!
//! `HeaderLen` covers the whole header including the trailing CRC, so the
//! first entry starts at byte `HeaderLen`.

use crc32fast::Hasher;
use scribe_core::{SessionId, Timestamp};
use std::io::Read;
use thiserror::Error;
use uuid::Uuid;

/// Magic bytes identifying a WAL file: "TWAL"
pub const FILE_MAGIC: [u8; 4] = *b"TWAL";

/// Current file format version
pub const FILE_FORMAT_VERSION: u8 = 1;

/// Size of the header without the session id
pub const FILE_HEADER_FIXED_SIZE: usize = 4 + 1 + 1 + 2 + 8 + 16 + 2 + 4;

/// Longest session id a file header can carry
pub const MAX_HEADER_SESSION_LEN: usize = 1024;

const FLAG_HAS_SESSION: u8 = 0b0000_0001;

/// Errors reading a WAL file header
#[derive(Debug, Error)]
pub enum FileHeaderError {
    /// I/O error while reading the header
    #[error("I/O error reading file header: {0}")]
    Io(#[from] std::io::Error),

    /// File does not start with "TWAL"
    #[error("Invalid file magic: {0:02X?}")]
    BadMagic([u8; 4]),

    /// Unsupported format version
    #[error("Unsupported file format version: {0}")]
    UnsupportedVersion(u8),

    /// Header length field is inconsistent with its contents
    #[error("Invalid file header length: {0}")]
    InvalidLength(usize),

    /// Header CRC mismatch
    #[error("File header checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Stored CRC
        expected: u32,
        /// Computed CRC
        computed: u32,
    },

    /// Session id is not UTF-8
    #[error("File header session id is not valid UTF-8")]
    InvalidSession,
}

/// Parsed WAL file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFileHeader {
    /// Format version
    pub version: u8,
    /// File creation time; also the stamp in the file name
    pub created_at: Timestamp,
    /// Node that created the file
    pub node_id: Uuid,
    /// Session the file is dedicated to, if any
    pub session_id: Option<SessionId>,
}

impl WalFileHeader {
    /// Create a header for a new file
    pub fn new(created_at: Timestamp, node_id: Uuid) -> Self {
        WalFileHeader {
            version: FILE_FORMAT_VERSION,
            created_at,
            node_id,
            session_id: None,
        }
    }

    /// Dedicate the file to a session (builder pattern)
    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Encoded length of this header
    pub fn encoded_len(&self) -> usize {
        FILE_HEADER_FIXED_SIZE + self.session_bytes().len()
    }

    fn session_bytes(&self) -> &[u8] {
        let bytes = self.session_id.as_deref().unwrap_or("").as_bytes();
        // Truncation keeps the header bounded; session ids are short in practice.
        &bytes[..bytes.len().min(MAX_HEADER_SESSION_LEN)]
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let session = self.session_bytes();
        let len = self.encoded_len();
        let flags = if self.session_id.is_some() {
            FLAG_HAS_SESSION
        } else {
            0
        };

        let mut bytes = Vec::with_capacity(len);
        bytes.extend_from_slice(&FILE_MAGIC);
        bytes.push(self.version);
        bytes.push(flags);
        bytes.extend_from_slice(&(len as u16).to_le_bytes());
        bytes.extend_from_slice(&self.created_at.as_millis().to_le_bytes());
        bytes.extend_from_slice(self.node_id.as_bytes());
        bytes.extend_from_slice(&(session.len() as u16).to_le_bytes());
        bytes.extend_from_slice(session);

        let mut hasher = Hasher::new();
        hasher.update(&bytes);
        bytes.extend_from_slice(&hasher.finalize().to_le_bytes());
        bytes
    }

    /// Parse a header from the start of `bytes`.
    ///
    /// Returns the header and its encoded length.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), FileHeaderError> {
        if bytes.len() < 8 {
            return Err(FileHeaderError::InvalidLength(bytes.len()));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != FILE_MAGIC {
            return Err(FileHeaderError::BadMagic(magic));
        }
        let version = bytes[4];
        if version != FILE_FORMAT_VERSION {
            return Err(FileHeaderError::UnsupportedVersion(version));
        }
        let flags = bytes[5];
        let len = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
        if len < FILE_HEADER_FIXED_SIZE
            || len > FILE_HEADER_FIXED_SIZE + MAX_HEADER_SESSION_LEN
            || bytes.len() < len
        {
            return Err(FileHeaderError::InvalidLength(len));
        }

        let stored_crc = u32::from_le_bytes([
            bytes[len - 4],
            bytes[len - 3],
            bytes[len - 2],
            bytes[len - 1],
        ]);
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..len - 4]);
        let computed = hasher.finalize();
        if computed != stored_crc {
            return Err(FileHeaderError::ChecksumMismatch {
                expected: stored_crc,
                computed,
            });
        }

        let mut created = [0u8; 8];
        created.copy_from_slice(&bytes[8..16]);
        let mut node = [0u8; 16];
        node.copy_from_slice(&bytes[16..32]);
        let session_len = u16::from_le_bytes([bytes[32], bytes[33]]) as usize;
        if FILE_HEADER_FIXED_SIZE + session_len != len {
            return Err(FileHeaderError::InvalidLength(len));
        }
        let session_id = if flags & FLAG_HAS_SESSION != 0 {
            let raw = &bytes[34..34 + session_len];
            Some(
                std::str::from_utf8(raw)
                    .map_err(|_| FileHeaderError::InvalidSession)?
                    .to_owned(),
            )
        } else {
            None
        };

        Ok((
            WalFileHeader {
                version,
                created_at: Timestamp::from_millis(u64::from_le_bytes(created)),
                node_id: Uuid::from_bytes(node),
                session_id,
            },
            len,
        ))
    }

    /// Read a header from the start of a reader.
    ///
    /// Returns the header and its encoded length; the reader is left
    /// positioned at the first entry.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<(Self, usize), FileHeaderError> {
        let mut prefix = [0u8; 8];
        reader.read_exact(&mut prefix)?;
        let len = u16::from_le_bytes([prefix[6], prefix[7]]) as usize;
        if !(FILE_HEADER_FIXED_SIZE..=FILE_HEADER_FIXED_SIZE + MAX_HEADER_SESSION_LEN)
            .contains(&len)
        {
            if prefix[0..4] != FILE_MAGIC {
                let mut magic = [0u8; 4];
                magic.copy_from_slice(&prefix[0..4]);
                return Err(FileHeaderError::BadMagic(magic));
            }
            return Err(FileHeaderError::InvalidLength(len));
        }
        let mut bytes = vec![0u8; len];
        bytes[..8].copy_from_slice(&prefix);
        reader.read_exact(&mut bytes[8..])?;
        Self::from_bytes(&bytes)
    }
}
