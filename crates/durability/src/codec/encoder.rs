//! WAL entry encoder
//!
//! Encoding is pure and deterministic: the same entry always produces the
//! same bytes. The CRC32 covers the payload only; the header is protected by
//! its magic and by the decoder's structural checks.

use crate::format::{
    EntryHeader, EntryPayload, PayloadWriter, WalEntry, ENTRY_FORMAT_VERSION, ENTRY_HEADER_SIZE,
};
use crc32fast::Hasher;

/// Compute CRC32 checksum of data.
pub fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Entries encoded for a single write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedBatch {
    /// Concatenated entry encodings, in input order
    pub bytes: Vec<u8>,
    /// Encoded length of each entry, in input order
    pub lengths: Vec<usize>,
}

impl EncodedBatch {
    /// Number of entries in the batch
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    /// Whether the batch holds no entries
    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Total encoded size in bytes
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Stateless WAL entry encoder
pub struct WalEncoder;

impl WalEncoder {
    /// Encode one entry: 24-byte header followed by the payload.
    pub fn encode(entry: &WalEntry) -> Vec<u8> {
        let payload = Self::encode_payload(&entry.payload);
        let header = EntryHeader {
            version: ENTRY_FORMAT_VERSION,
            entry_type: entry.entry_type(),
            timestamp: entry.timestamp,
            payload_size: payload.len() as u32,
            checksum: compute_crc(&payload),
        };

        let mut bytes = Vec::with_capacity(ENTRY_HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&payload);
        bytes
    }

    /// Encode a payload body without the header.
    pub fn encode_payload(payload: &EntryPayload) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        match payload {
            EntryPayload::UtteranceInsert { utterance } => {
                w.put_json(utterance);
            }
            EntryPayload::UtteranceUpdate {
                utterance_id,
                session_id,
                patch,
                previous,
            } => {
                w.put_str(utterance_id)
                    .put_str(session_id)
                    .put_json(patch)
                    .put_opt_json(previous.as_ref());
            }
            EntryPayload::UtteranceDelete {
                utterance_id,
                session_id,
            } => {
                w.put_str(utterance_id).put_str(session_id);
            }
            EntryPayload::SessionCreate {
                session_id,
                metadata,
            } => {
                w.put_str(session_id).put_json(metadata);
            }
            EntryPayload::SessionDelete { session_id, reason } => {
                w.put_str(session_id).put_str(reason);
            }
            EntryPayload::Checkpoint {
                sequence,
                session_count,
                utterance_count,
            } => {
                w.put_u64(*sequence)
                    .put_u32(*session_count)
                    .put_u32(*utterance_count);
            }
            EntryPayload::FlushMarker {
                sequence,
                entry_count,
            } => {
                w.put_u64(*sequence).put_u32(*entry_count);
            }
            EntryPayload::RotationMarker {
                previous_file,
                reason,
            } => {
                w.put_str(previous_file).put_str(reason);
            }
            EntryPayload::RecoveryStart { node_id } => {
                w.put_fixed(node_id.as_bytes());
            }
            EntryPayload::RecoveryEnd {
                status,
                sessions_recovered,
                utterances_recovered,
            } => {
                w.put_str(status)
                    .put_u32(*sessions_recovered)
                    .put_u32(*utterances_recovered);
            }
        }
        w.finish()
    }

    /// Encode entries individually and concatenate them for one write.
    pub fn encode_batch(entries: &[WalEntry]) -> EncodedBatch {
        let mut batch = EncodedBatch::default();
        for entry in entries {
            let encoded = Self::encode(entry);
            batch.lengths.push(encoded.len());
            batch.bytes.extend_from_slice(&encoded);
        }
        batch
    }
}
