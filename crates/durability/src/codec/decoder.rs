//! WAL entry decoder
//!
//! - `decode`: strict single-entry decode with CRC verification
//! - `validate_entry`: header-only structural check, no payload work
//! - `stream`: lazy decode of a whole file buffer that resynchronizes on
//!   corruption by scanning for the next entry magic
//!
//! The stream is what makes recovery tolerant of a torn tail: an entry cut
//! short by an unclean shutdown shows up as one skip warning instead of an
//! error for the whole file.

use super::encoder::compute_crc;
use crate::format::{
    EntryHeader, EntryPayload, PayloadError, PayloadReader, WalEntry, WalEntryType,
    WalEntryTypeError, ENTRY_FORMAT_VERSION, ENTRY_HEADER_SIZE, ENTRY_MAGIC, MAX_PAYLOAD_SIZE,
};
use scribe_core::Timestamp;
use thiserror::Error;
use uuid::Uuid;

/// Entry decode errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Bytes do not start with the entry magic
    #[error("Invalid entry magic: {0:02X?}")]
    BadMagic([u8; 4]),

    /// Unsupported entry format version
    #[error("Unsupported entry format version: {0}")]
    UnsupportedVersion(u8),

    /// Type byte is not an allocated entry type
    #[error("Invalid entry type: {0}")]
    UnknownEntryType(#[from] WalEntryTypeError),

    /// Not enough bytes for the header or the declared payload
    #[error("Truncated entry: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Declared payload size exceeds the limit
    #[error("Entry payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge {
        /// Declared size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// CRC32 of the payload does not match the header
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the header
        expected: u32,
        /// Checksum computed over the payload
        computed: u32,
    },

    /// CRC was valid but the payload fields could not be parsed
    #[error("Malformed {entry_type:?} payload: {source}")]
    MalformedPayload {
        /// Entry type from the header
        entry_type: WalEntryType,
        /// Field-level error
        source: PayloadError,
    },
}

impl DecodeError {
    /// Whether the error only means "more bytes are needed"
    pub fn is_truncation(&self) -> bool {
        matches!(self, DecodeError::Truncated { .. })
    }
}

/// An entry decoded from a stream, with its position in the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEntry {
    /// The entry
    pub entry: WalEntry,
    /// Byte offset of the entry in the buffer
    pub offset: usize,
    /// Encoded length of the entry
    pub len: usize,
}

/// A region of the buffer skipped during resynchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipWarning {
    /// Offset where decoding failed
    pub offset: usize,
    /// Bytes skipped before the next valid entry (or end of buffer)
    pub skipped_bytes: usize,
    /// Decode error at `offset`
    pub reason: DecodeError,
}

/// Item produced by [`EntryStream`]
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A valid entry
    Entry(DecodedEntry),
    /// A skipped corrupt region
    Skipped(SkipWarning),
}

/// Counters for one stream pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Entries decoded
    pub entries: usize,
    /// Corrupt regions skipped
    pub skipped_regions: usize,
    /// Total bytes skipped
    pub skipped_bytes: usize,
}

/// Stateless WAL entry decoder
pub struct WalDecoder;

impl WalDecoder {
    /// Parse and structurally check the 24-byte header.
    fn parse_header(bytes: &[u8]) -> Result<EntryHeader, DecodeError> {
        if bytes.len() < ENTRY_HEADER_SIZE {
            // A buffer that is too short to hold a header still has to start
            // with (a prefix of) the magic to count as a truncated entry.
            let prefix = bytes.len().min(4);
            if bytes[..prefix] != ENTRY_MAGIC[..prefix] {
                let mut magic = [0u8; 4];
                magic[..prefix].copy_from_slice(&bytes[..prefix]);
                return Err(DecodeError::BadMagic(magic));
            }
            return Err(DecodeError::Truncated {
                needed: ENTRY_HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != ENTRY_MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }

        let version = bytes[4];
        if version != ENTRY_FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let entry_type = WalEntryType::try_from(bytes[5])?;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[8..16]);
        let mut size = [0u8; 4];
        size.copy_from_slice(&bytes[16..20]);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&bytes[20..24]);

        let payload_size = u32::from_le_bytes(size);
        if payload_size as usize > MAX_PAYLOAD_SIZE {
            return Err(DecodeError::PayloadTooLarge {
                size: payload_size as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(EntryHeader {
            version,
            entry_type,
            timestamp: Timestamp::from_millis(u64::from_le_bytes(ts)),
            payload_size,
            checksum: u32::from_le_bytes(crc),
        })
    }

    /// Header-only validation.
    ///
    /// Checks magic, version, entry type, payload bound and that the buffer
    /// holds the whole declared payload. Does not verify the CRC and does
    /// not parse the payload, so it is cheap enough for file scans.
    pub fn validate_entry(bytes: &[u8]) -> Result<EntryHeader, DecodeError> {
        let header = Self::parse_header(bytes)?;
        let needed = header.entry_len();
        if bytes.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                available: bytes.len(),
            });
        }
        Ok(header)
    }

    /// Decode one entry from the start of `bytes`.
    ///
    /// Returns the entry and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(WalEntry, usize), DecodeError> {
        let header = Self::validate_entry(bytes)?;
        let len = header.entry_len();
        let payload = &bytes[ENTRY_HEADER_SIZE..len];

        let computed = compute_crc(payload);
        if computed != header.checksum {
            return Err(DecodeError::ChecksumMismatch {
                expected: header.checksum,
                computed,
            });
        }

        let payload = Self::decode_payload(header.entry_type, payload)?;
        Ok((WalEntry::new(header.timestamp, payload), len))
    }

    /// Decode a payload body for a known entry type.
    pub fn decode_payload(
        entry_type: WalEntryType,
        bytes: &[u8],
    ) -> Result<EntryPayload, DecodeError> {
        Self::read_payload(entry_type, bytes).map_err(|source| DecodeError::MalformedPayload {
            entry_type,
            source,
        })
    }

    fn read_payload(entry_type: WalEntryType, bytes: &[u8]) -> Result<EntryPayload, PayloadError> {
        let mut r = PayloadReader::new(bytes);
        let payload = match entry_type {
            WalEntryType::UtteranceInsert => EntryPayload::UtteranceInsert {
                utterance: r.json("utterance")?,
            },
            WalEntryType::UtteranceUpdate => EntryPayload::UtteranceUpdate {
                utterance_id: r.string("utterance_id")?,
                session_id: r.string("session_id")?,
                patch: r.json("patch")?,
                previous: r.opt_json("previous")?,
            },
            WalEntryType::UtteranceDelete => EntryPayload::UtteranceDelete {
                utterance_id: r.string("utterance_id")?,
                session_id: r.string("session_id")?,
            },
            WalEntryType::SessionCreate => EntryPayload::SessionCreate {
                session_id: r.string("session_id")?,
                metadata: r.json("metadata")?,
            },
            WalEntryType::SessionDelete => EntryPayload::SessionDelete {
                session_id: r.string("session_id")?,
                reason: r.string("reason")?,
            },
            WalEntryType::Checkpoint => EntryPayload::Checkpoint {
                sequence: r.u64("sequence")?,
                session_count: r.u32("session_count")?,
                utterance_count: r.u32("utterance_count")?,
            },
            WalEntryType::FlushMarker => EntryPayload::FlushMarker {
                sequence: r.u64("sequence")?,
                entry_count: r.u32("entry_count")?,
            },
            WalEntryType::RotationMarker => EntryPayload::RotationMarker {
                previous_file: r.string("previous_file")?,
                reason: r.string("reason")?,
            },
            WalEntryType::RecoveryStart => EntryPayload::RecoveryStart {
                node_id: Uuid::from_bytes(r.fixed::<16>("node_id")?),
            },
            WalEntryType::RecoveryEnd => EntryPayload::RecoveryEnd {
                status: r.string("status")?,
                sessions_recovered: r.u32("sessions_recovered")?,
                utterances_recovered: r.u32("utterances_recovered")?,
            },
        };
        r.finish()?;
        Ok(payload)
    }

    /// Lazily decode every entry in a file buffer.
    pub fn stream(buf: &[u8]) -> EntryStream<'_> {
        EntryStream::new(buf, 0)
    }

    /// Lazily decode starting at `offset` (e.g. past a file header, or where
    /// a previous pass stopped).
    pub fn stream_from(buf: &[u8], offset: usize) -> EntryStream<'_> {
        EntryStream::new(buf, offset)
    }
}

/// Lazy, restartable decoder over a whole file buffer.
///
/// On a malformed entry the stream scans forward for the next position where
/// the entry magic starts a fully valid entry, yields exactly one
/// [`StreamItem::Skipped`] for the region in between, and continues.
pub struct EntryStream<'a> {
    buf: &'a [u8],
    pos: usize,
    stats: StreamStats,
}

impl<'a> EntryStream<'a> {
    fn new(buf: &'a [u8], offset: usize) -> Self {
        EntryStream {
            buf,
            pos: offset.min(buf.len()),
            stats: StreamStats::default(),
        }
    }

    /// Offset of the next byte to decode; pass to `stream_from` to resume.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Counters for this pass so far
    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Drain the stream into entries, discarding skip warnings.
    pub fn entries(self) -> Vec<WalEntry> {
        self.filter_map(|item| match item {
            StreamItem::Entry(decoded) => Some(decoded.entry),
            StreamItem::Skipped(_) => None,
        })
        .collect()
    }

    fn find_next_valid(&self, from: usize) -> usize {
        let mut i = from;
        while i + ENTRY_MAGIC.len() <= self.buf.len() {
            if self.buf[i..i + ENTRY_MAGIC.len()] == ENTRY_MAGIC
                && WalDecoder::decode(&self.buf[i..]).is_ok()
            {
                return i;
            }
            i += 1;
        }
        self.buf.len()
    }
}

impl Iterator for EntryStream<'_> {
    type Item = StreamItem;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }

        match WalDecoder::decode(&self.buf[self.pos..]) {
            Ok((entry, len)) => {
                let decoded = DecodedEntry {
                    entry,
                    offset: self.pos,
                    len,
                };
                self.pos += len;
                self.stats.entries += 1;
                Some(StreamItem::Entry(decoded))
            }
            Err(reason) => {
                let offset = self.pos;
                let next = self.find_next_valid(offset + 1);
                let skipped_bytes = next - offset;
                self.pos = next;
                self.stats.skipped_regions += 1;
                self.stats.skipped_bytes += skipped_bytes;

                tracing::warn!(
                    offset,
                    skipped_bytes,
                    error = %reason,
                    "Skipping malformed WAL region"
                );

                Some(StreamItem::Skipped(SkipWarning {
                    offset,
                    skipped_bytes,
                    reason,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WalEncoder;
    use scribe_core::{TranscriptUtterance, UtterancePatch};

    fn utterance(id: &str) -> TranscriptUtterance {
        TranscriptUtterance::new(id, "s1", format!("text of {}", id)).at(Timestamp::from_millis(10))
    }

    fn all_payload_kinds() -> Vec<WalEntry> {
        let ts = Timestamp::from_millis(77);
        vec![
            WalEntry::insert(utterance("u1")),
            WalEntry::update(
                "u1",
                "s1",
                UtterancePatch::text("new", ts),
                Some(utterance("u1").snapshot()),
            ),
            WalEntry::update("u1", "s1", UtterancePatch::text("blind", ts), None),
            WalEntry::delete("u1", "s1", ts),
            WalEntry::new(
                ts,
                EntryPayload::SessionCreate {
                    session_id: "s1".into(),
                    metadata: serde_json::json!({"lang": "en"}),
                },
            ),
            WalEntry::session_delete("s1", "privacy", ts),
            WalEntry::new(
                ts,
                EntryPayload::Checkpoint {
                    sequence: 3,
                    session_count: 2,
                    utterance_count: 9,
                },
            ),
            WalEntry::new(
                ts,
                EntryPayload::FlushMarker {
                    sequence: 4,
                    entry_count: 12,
                },
            ),
            WalEntry::new(
                ts,
                EntryPayload::RotationMarker {
                    previous_file: "wal_1.log".into(),
                    reason: "size".into(),
                },
            ),
            WalEntry::new(
                ts,
                EntryPayload::RecoveryStart {
                    node_id: Uuid::from_bytes([3; 16]),
                },
            ),
            WalEntry::new(
                ts,
                EntryPayload::RecoveryEnd {
                    status: "success".into(),
                    sessions_recovered: 1,
                    utterances_recovered: 5,
                },
            ),
        ]
    }

    #[test]
    fn test_roundtrip_every_payload_kind() {
        for entry in all_payload_kinds() {
            let bytes = WalEncoder::encode(&entry);
            let (decoded, consumed) = WalDecoder::decode(&bytes).unwrap();
            assert_eq!(decoded, entry);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_checksum_mismatch_on_payload_flip() {
        let mut bytes = WalEncoder::encode(&WalEntry::insert(utterance("u1")));
        bytes[ENTRY_HEADER_SIZE + 3] ^= 0x01;
        assert!(matches!(
            WalDecoder::decode(&bytes),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = WalEncoder::encode(&WalEntry::insert(utterance("u1")));
        bytes[1] = b'X';
        assert!(matches!(
            WalDecoder::decode(&bytes),
            Err(DecodeError::BadMagic(_))
        ));
    }

    #[test]
    fn test_unknown_type() {
        let mut bytes = WalEncoder::encode(&WalEntry::insert(utterance("u1")));
        bytes[5] = 0x1F;
        assert!(matches!(
            WalDecoder::decode(&bytes),
            Err(DecodeError::UnknownEntryType(_))
        ));
    }

    #[test]
    fn test_truncation() {
        let bytes = WalEncoder::encode(&WalEntry::insert(utterance("u1")));
        let err = WalDecoder::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(err.is_truncation());

        let err = WalDecoder::decode(&bytes[..10]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                needed: ENTRY_HEADER_SIZE,
                available: 10
            }
        );
    }

    #[test]
    fn test_validate_entry_skips_crc() {
        let mut bytes = WalEncoder::encode(&WalEntry::insert(utterance("u1")));
        bytes[ENTRY_HEADER_SIZE] ^= 0xFF;
        let header = WalDecoder::validate_entry(&bytes).unwrap();
        assert_eq!(header.entry_type, WalEntryType::UtteranceInsert);
        assert_eq!(header.entry_len(), bytes.len());
        assert!(WalDecoder::decode(&bytes).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut bytes = WalEncoder::encode(&WalEntry::insert(utterance("u1")));
        bytes[16..20].copy_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_le_bytes());
        assert!(matches!(
            WalDecoder::validate_entry(&bytes),
            Err(DecodeError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_malformed_payload_with_valid_crc() {
        let payload = b"garbage".to_vec();
        let header = EntryHeader {
            version: ENTRY_FORMAT_VERSION,
            entry_type: WalEntryType::Checkpoint,
            timestamp: Timestamp::EPOCH,
            payload_size: payload.len() as u32,
            checksum: compute_crc(&payload),
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        assert!(matches!(
            WalDecoder::decode(&bytes),
            Err(DecodeError::MalformedPayload {
                entry_type: WalEntryType::Checkpoint,
                ..
            })
        ));
    }

    #[test]
    fn test_stream_clean_buffer() {
        let entries = all_payload_kinds();
        let batch = WalEncoder::encode_batch(&entries);
        let mut stream = WalDecoder::stream(&batch.bytes);
        let decoded: Vec<_> = stream.by_ref().collect();
        assert_eq!(decoded.len(), entries.len());
        assert_eq!(stream.stats().skipped_regions, 0);
        assert_eq!(stream.position(), batch.byte_len());
    }

    #[test]
    fn test_stream_resyncs_after_corrupt_entry() {
        let mut bytes = WalEncoder::encode(&WalEntry::insert(utterance("bad")));
        bytes[ENTRY_HEADER_SIZE + 2] ^= 0xFF;
        let corrupt_len = bytes.len();
        for i in 0..4 {
            bytes.extend(WalEncoder::encode(&WalEntry::insert(utterance(&format!("u{}", i)))));
        }

        let items: Vec<_> = WalDecoder::stream(&bytes).collect();
        let skipped: Vec<_> = items
            .iter()
            .filter_map(|i| match i {
                StreamItem::Skipped(w) => Some(w),
                _ => None,
            })
            .collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].offset, 0);
        assert_eq!(skipped[0].skipped_bytes, corrupt_len);
        assert_eq!(items.len(), 5);
    }

    #[test]
    fn test_stream_torn_tail() {
        let mut bytes = Vec::new();
        for i in 0..3 {
            bytes.extend(WalEncoder::encode(&WalEntry::insert(utterance(&format!("u{}", i)))));
        }
        let torn = WalEncoder::encode(&WalEntry::insert(utterance("torn")));
        bytes.extend_from_slice(&torn[..torn.len() / 2]);

        let mut stream = WalDecoder::stream(&bytes);
        let entries: Vec<_> = stream.by_ref().collect();
        assert_eq!(entries.len(), 4);
        assert!(matches!(
            &entries[3],
            StreamItem::Skipped(SkipWarning {
                reason: DecodeError::Truncated { .. },
                ..
            })
        ));
        assert_eq!(stream.stats().entries, 3);
        assert_eq!(stream.position(), bytes.len());
    }

    #[test]
    fn test_stream_is_restartable() {
        let entries = all_payload_kinds();
        let batch = WalEncoder::encode_batch(&entries);

        let mut first = WalDecoder::stream(&batch.bytes);
        first.next();
        first.next();
        let resume_at = first.position();

        let rest = WalDecoder::stream_from(&batch.bytes, resume_at).entries();
        assert_eq!(rest, entries[2..].to_vec());
    }

    #[test]
    fn test_batch_lengths_delimit_entries() {
        let entries = all_payload_kinds();
        let batch = WalEncoder::encode_batch(&entries);

        let mut offset = 0;
        let mut decoded = Vec::new();
        for len in &batch.lengths {
            let (entry, consumed) = WalDecoder::decode(&batch.bytes[offset..offset + len]).unwrap();
            assert_eq!(consumed, *len);
            decoded.push(entry);
            offset += len;
        }
        assert_eq!(offset, batch.byte_len());
        assert_eq!(decoded, entries);
        assert_eq!(WalDecoder::stream(&batch.bytes).entries(), entries);
    }
}
