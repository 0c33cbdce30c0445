//! WAL entry model and entry type registry
//!
//! Entry types are organized by ranges so a reader can categorize an entry
//! from its header byte alone:
//!
//! | Range | Category | Description |
//! |-------|----------|-------------|
//! | 0x10-0x1F | Utterance | Utterance insert/update/delete |
//! | 0x20-0x2F | Session | Session create/delete |
//! | 0x30-0x3F | Control | Checkpoint, flush and rotation markers |
//! | 0x40-0x4F | Recovery | Recovery start/end markers |
//! | others | Reserved | Rejected by the decoder |
//!
//! # Entry Layout
//!
//! ```text
//! ┌───────────┬─────────┬──────┬──────────┬───────────────┬─────────────┬───────────┐
//! │ Magic (4) │ Ver (1) │ Type │ Rsvd (2) │ Timestamp (8) │ PayloadSize │ CRC32 (4) │
//! │           │         │ (1)  │          │ LE millis     │ (4)         │ payload   │
//! └───────────┴─────────┴──────┴──────────┴───────────────┴─────────────┴───────────┘
//! followed by `PayloadSize` bytes of payload
//! ```

use scribe_core::{
    SessionId, Timestamp, TranscriptUtterance, UtteranceId, UtterancePatch, UtteranceSnapshot,
};
use thiserror::Error;
use uuid::Uuid;

/// Magic bytes opening every entry. The `0xFF` lead byte never occurs in
/// UTF-8 text, which keeps false positives rare during resync scans.
pub const ENTRY_MAGIC: [u8; 4] = [0xFF, b'T', b'W', b'E'];

/// Current entry format version
pub const ENTRY_FORMAT_VERSION: u8 = 1;

/// Size of the fixed entry header in bytes
pub const ENTRY_HEADER_SIZE: usize = 24;

/// Largest payload the decoder accepts (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Coarse entry category, derived from the type's numeric range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryCategory {
    /// Utterance mutations
    Utterance,
    /// Session lifecycle
    Session,
    /// Checkpoint/flush/rotation markers
    Control,
    /// Recovery bracketing markers
    Recovery,
}

/// WAL entry types with explicit byte values
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalEntryType {
    // ========================================================================
    // Utterance (0x10-0x1F)
    // ========================================================================
    /// New utterance
    UtteranceInsert = 0x10,

    /// Field-level revision of an utterance
    UtteranceUpdate = 0x11,

    /// Utterance removal
    UtteranceDelete = 0x12,

    // ========================================================================
    // Session (0x20-0x2F)
    // ========================================================================
    /// First reference to a session
    SessionCreate = 0x20,

    /// Explicit session deletion (authoritative during recovery)
    SessionDelete = 0x21,

    // ========================================================================
    // Control (0x30-0x3F)
    // ========================================================================
    /// Checkpoint of aggregate counts
    Checkpoint = 0x30,

    /// Flush boundary marker
    FlushMarker = 0x31,

    /// First entry of a file created by rotation
    RotationMarker = 0x32,

    // ========================================================================
    // Recovery (0x40-0x4F)
    // ========================================================================
    /// Recovery began on this node
    RecoveryStart = 0x40,

    /// Recovery finished on this node
    RecoveryEnd = 0x41,
}

impl WalEntryType {
    /// Category of this entry type
    pub fn category(&self) -> EntryCategory {
        match *self as u8 {
            0x10..=0x1F => EntryCategory::Utterance,
            0x20..=0x2F => EntryCategory::Session,
            0x30..=0x3F => EntryCategory::Control,
            _ => EntryCategory::Recovery,
        }
    }

    /// Category for a raw type byte, `None` outside the allocated ranges
    pub fn category_of(value: u8) -> Option<EntryCategory> {
        match value {
            0x10..=0x1F => Some(EntryCategory::Utterance),
            0x20..=0x2F => Some(EntryCategory::Session),
            0x30..=0x3F => Some(EntryCategory::Control),
            0x40..=0x4F => Some(EntryCategory::Recovery),
            _ => None,
        }
    }

    /// Human-readable range name for a raw type byte
    pub fn range_name(value: u8) -> &'static str {
        match Self::category_of(value) {
            Some(EntryCategory::Utterance) => "Utterance",
            Some(EntryCategory::Session) => "Session",
            Some(EntryCategory::Control) => "Control",
            Some(EntryCategory::Recovery) => "Recovery",
            None => "Reserved",
        }
    }

    /// Whether replay changes session state for this type
    pub fn is_data(&self) -> bool {
        matches!(
            self.category(),
            EntryCategory::Utterance | EntryCategory::Session
        )
    }

    /// Get human-readable description of this entry type
    pub fn description(&self) -> &'static str {
        match self {
            WalEntryType::UtteranceInsert => "Utterance insert",
            WalEntryType::UtteranceUpdate => "Utterance update",
            WalEntryType::UtteranceDelete => "Utterance delete",
            WalEntryType::SessionCreate => "Session create",
            WalEntryType::SessionDelete => "Session delete",
            WalEntryType::Checkpoint => "Checkpoint",
            WalEntryType::FlushMarker => "Flush marker",
            WalEntryType::RotationMarker => "Rotation marker",
            WalEntryType::RecoveryStart => "Recovery start",
            WalEntryType::RecoveryEnd => "Recovery end",
        }
    }
}

/// Error when parsing a WAL entry type byte
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalEntryTypeError {
    /// Unallocated value inside a known range
    #[error("Unknown WAL entry type: 0x{value:02X} (range: {range})")]
    UnknownEntryType {
        /// The unknown byte value
        value: u8,
        /// The range this value belongs to
        range: &'static str,
    },

    /// Value outside every allocated range
    #[error("WAL entry type 0x{value:02X} is in a reserved range")]
    ReservedEntryType {
        /// The reserved byte value
        value: u8,
    },
}

impl TryFrom<u8> for WalEntryType {
    type Error = WalEntryTypeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(WalEntryType::UtteranceInsert),
            0x11 => Ok(WalEntryType::UtteranceUpdate),
            0x12 => Ok(WalEntryType::UtteranceDelete),

            0x20 => Ok(WalEntryType::SessionCreate),
            0x21 => Ok(WalEntryType::SessionDelete),

            0x30 => Ok(WalEntryType::Checkpoint),
            0x31 => Ok(WalEntryType::FlushMarker),
            0x32 => Ok(WalEntryType::RotationMarker),

            0x40 => Ok(WalEntryType::RecoveryStart),
            0x41 => Ok(WalEntryType::RecoveryEnd),

            0x10..=0x4F => Err(WalEntryTypeError::UnknownEntryType {
                value,
                range: WalEntryType::range_name(value),
            }),
            _ => Err(WalEntryTypeError::ReservedEntryType { value }),
        }
    }
}

impl From<WalEntryType> for u8 {
    fn from(entry_type: WalEntryType) -> Self {
        entry_type as u8
    }
}

/// Decoded fixed-size entry header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Format version byte
    pub version: u8,
    /// Entry type
    pub entry_type: WalEntryType,
    /// Entry timestamp
    pub timestamp: Timestamp,
    /// Payload length in bytes
    pub payload_size: u32,
    /// CRC32 of the payload
    pub checksum: u32,
}

impl EntryHeader {
    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut bytes = [0u8; ENTRY_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&ENTRY_MAGIC);
        bytes[4] = self.version;
        bytes[5] = self.entry_type.into();
        // bytes[6..8] reserved, zero
        bytes[8..16].copy_from_slice(&self.timestamp.as_millis().to_le_bytes());
        bytes[16..20].copy_from_slice(&self.payload_size.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Total encoded length of the entry this header describes
    pub fn entry_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.payload_size as usize
    }
}

/// Typed entry payload
#[derive(Debug, Clone, PartialEq)]
pub enum EntryPayload {
    /// New utterance, full state
    UtteranceInsert {
        /// The utterance as first persisted
        utterance: TranscriptUtterance,
    },
    /// Revision of an utterance
    UtteranceUpdate {
        /// Target utterance
        utterance_id: UtteranceId,
        /// Owning session
        session_id: SessionId,
        /// Fields that changed
        patch: UtterancePatch,
        /// State the writer saw before the revision, if known
        previous: Option<UtteranceSnapshot>,
    },
    /// Utterance removal
    UtteranceDelete {
        /// Target utterance
        utterance_id: UtteranceId,
        /// Owning session
        session_id: SessionId,
    },
    /// First reference to a session
    SessionCreate {
        /// New session
        session_id: SessionId,
        /// Free-form metadata supplied by the pipeline
        metadata: serde_json::Value,
    },
    /// Explicit session deletion
    SessionDelete {
        /// Deleted session
        session_id: SessionId,
        /// Why the session was deleted (e.g. "privacy")
        reason: String,
    },
    /// Aggregate counts at a point in the log
    Checkpoint {
        /// Monotonic checkpoint number
        sequence: u64,
        /// Live sessions at checkpoint time
        session_count: u32,
        /// Live utterances at checkpoint time
        utterance_count: u32,
    },
    /// Flush boundary
    FlushMarker {
        /// Flush sequence number
        sequence: u64,
        /// Entries in the flush
        entry_count: u32,
    },
    /// First entry of a rotated-in file
    RotationMarker {
        /// File name of the file this one replaced
        previous_file: String,
        /// Rotation reason
        reason: String,
    },
    /// Recovery began
    RecoveryStart {
        /// Node running the recovery
        node_id: Uuid,
    },
    /// Recovery finished
    RecoveryEnd {
        /// Recovery status name
        status: String,
        /// Sessions reconstructed
        sessions_recovered: u32,
        /// Utterances reconstructed
        utterances_recovered: u32,
    },
}

impl EntryPayload {
    /// Entry type for this payload
    pub fn entry_type(&self) -> WalEntryType {
        match self {
            EntryPayload::UtteranceInsert { .. } => WalEntryType::UtteranceInsert,
            EntryPayload::UtteranceUpdate { .. } => WalEntryType::UtteranceUpdate,
            EntryPayload::UtteranceDelete { .. } => WalEntryType::UtteranceDelete,
            EntryPayload::SessionCreate { .. } => WalEntryType::SessionCreate,
            EntryPayload::SessionDelete { .. } => WalEntryType::SessionDelete,
            EntryPayload::Checkpoint { .. } => WalEntryType::Checkpoint,
            EntryPayload::FlushMarker { .. } => WalEntryType::FlushMarker,
            EntryPayload::RotationMarker { .. } => WalEntryType::RotationMarker,
            EntryPayload::RecoveryStart { .. } => WalEntryType::RecoveryStart,
            EntryPayload::RecoveryEnd { .. } => WalEntryType::RecoveryEnd,
        }
    }
}

/// One WAL entry: timestamp plus typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    /// Time the entry was created (milliseconds since epoch)
    pub timestamp: Timestamp,
    /// Typed payload
    pub payload: EntryPayload,
}

impl WalEntry {
    /// Create an entry with an explicit timestamp
    pub fn new(timestamp: Timestamp, payload: EntryPayload) -> Self {
        WalEntry { timestamp, payload }
    }

    /// Insert entry stamped with the utterance's revision time
    pub fn insert(utterance: TranscriptUtterance) -> Self {
        WalEntry {
            timestamp: utterance.updated_at,
            payload: EntryPayload::UtteranceInsert { utterance },
        }
    }

    /// Update entry stamped with the patch's revision time
    pub fn update(
        utterance_id: impl Into<UtteranceId>,
        session_id: impl Into<SessionId>,
        patch: UtterancePatch,
        previous: Option<UtteranceSnapshot>,
    ) -> Self {
        WalEntry {
            timestamp: patch.updated_at,
            payload: EntryPayload::UtteranceUpdate {
                utterance_id: utterance_id.into(),
                session_id: session_id.into(),
                patch,
                previous,
            },
        }
    }

    /// Utterance delete entry
    pub fn delete(
        utterance_id: impl Into<UtteranceId>,
        session_id: impl Into<SessionId>,
        timestamp: Timestamp,
    ) -> Self {
        WalEntry {
            timestamp,
            payload: EntryPayload::UtteranceDelete {
                utterance_id: utterance_id.into(),
                session_id: session_id.into(),
            },
        }
    }

    /// Session create entry with empty metadata
    pub fn session_create(session_id: impl Into<SessionId>, timestamp: Timestamp) -> Self {
        WalEntry {
            timestamp,
            payload: EntryPayload::SessionCreate {
                session_id: session_id.into(),
                metadata: serde_json::Value::Null,
            },
        }
    }

    /// Session delete entry
    pub fn session_delete(
        session_id: impl Into<SessionId>,
        reason: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        WalEntry {
            timestamp,
            payload: EntryPayload::SessionDelete {
                session_id: session_id.into(),
                reason: reason.into(),
            },
        }
    }

    /// Entry type of the payload
    pub fn entry_type(&self) -> WalEntryType {
        self.payload.entry_type()
    }

    /// Category of the payload
    pub fn category(&self) -> EntryCategory {
        self.entry_type().category()
    }

    /// Session the entry belongs to, if any
    pub fn session_id(&self) -> Option<&str> {
        match &self.payload {
            EntryPayload::UtteranceInsert { utterance } => Some(&utterance.session_id),
            EntryPayload::UtteranceUpdate { session_id, .. }
            | EntryPayload::UtteranceDelete { session_id, .. }
            | EntryPayload::SessionCreate { session_id, .. }
            | EntryPayload::SessionDelete { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Utterance the entry targets, if any
    pub fn utterance_id(&self) -> Option<&str> {
        match &self.payload {
            EntryPayload::UtteranceInsert { utterance } => Some(&utterance.id),
            EntryPayload::UtteranceUpdate { utterance_id, .. }
            | EntryPayload::UtteranceDelete { utterance_id, .. } => Some(utterance_id),
            _ => None,
        }
    }
}
