//! Entry codec
//!
//! `WalEncoder` turns entries into bytes, `WalDecoder` turns bytes back into
//! entries. Both are stateless; the only state lives in [`EntryStream`],
//! which tracks its position so a scan can be resumed.

pub mod decoder;
pub mod encoder;

pub use decoder::{
    DecodeError, DecodedEntry, EntryStream, SkipWarning, StreamItem, StreamStats, WalDecoder,
};
pub use encoder::{compute_crc, EncodedBatch, WalEncoder};

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::format::{EntryPayload, WalEntry, ENTRY_HEADER_SIZE};
    use proptest::prelude::*;
    use scribe_core::{Timestamp, TranscriptUtterance, UtterancePatch, UtteranceState};

    fn state() -> impl Strategy<Value = UtteranceState> {
        prop_oneof![
            Just(UtteranceState::Partial),
            Just(UtteranceState::Stable),
            Just(UtteranceState::Finalized),
            Just(UtteranceState::Cancelled),
        ]
    }

    fn utterance() -> impl Strategy<Value = TranscriptUtterance> {
        (
            "[a-z0-9-]{1,16}",
            "[a-z0-9-]{1,16}",
            state(),
            "\\PC{0,64}",
            proptest::option::of("\\PC{0,64}"),
            0u32..=1000,
            0u64..=u64::MAX / 2,
        )
            .prop_map(|(id, session, state, text, final_text, conf, ts)| {
                TranscriptUtterance {
                    id,
                    session_id: session,
                    state,
                    text,
                    final_text,
                    confidence: conf as f32 / 1000.0,
                    created_at: Timestamp::from_millis(ts),
                    updated_at: Timestamp::from_millis(ts),
                    finalized_at: None,
                }
            })
    }

    fn entry() -> impl Strategy<Value = WalEntry> {
        prop_oneof![
            utterance().prop_map(WalEntry::insert),
            (utterance(), "\\PC{0,64}", any::<bool>()).prop_map(|(u, text, with_prev)| {
                let patch = UtterancePatch::text(text, u.updated_at);
                let previous = with_prev.then(|| u.snapshot());
                WalEntry::update(u.id, u.session_id, patch, previous)
            }),
            ("[a-z0-9]{1,8}", "[a-z0-9]{1,8}", any::<u64>())
                .prop_map(|(u, s, ts)| WalEntry::delete(u, s, Timestamp::from_millis(ts))),
            ("[a-z0-9]{1,8}", "\\PC{0,32}", any::<u64>()).prop_map(|(s, r, ts)| {
                WalEntry::session_delete(s, r, Timestamp::from_millis(ts))
            }),
            (any::<u64>(), any::<u32>(), any::<u32>(), any::<u64>()).prop_map(|(seq, s, u, ts)| {
                WalEntry::new(
                    Timestamp::from_millis(ts),
                    EntryPayload::Checkpoint {
                        sequence: seq,
                        session_count: s,
                        utterance_count: u,
                    },
                )
            }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn roundtrip_reproduces_entry(e in entry()) {
            let bytes = WalEncoder::encode(&e);
            let (decoded, consumed) = WalDecoder::decode(&bytes).unwrap();
            prop_assert_eq!(consumed, bytes.len());
            prop_assert_eq!(decoded.entry_type(), e.entry_type());
            prop_assert_eq!(decoded.timestamp, e.timestamp);
            prop_assert_eq!(WalEncoder::encode(&decoded), bytes);
            prop_assert_eq!(decoded, e);
        }

        #[test]
        fn flipping_a_payload_byte_fails_checksum(e in entry(), pick in any::<prop::sample::Index>(), bit in 0u8..8) {
            let mut bytes = WalEncoder::encode(&e);
            let payload_len = bytes.len() - ENTRY_HEADER_SIZE;
            prop_assume!(payload_len > 0);
            let at = ENTRY_HEADER_SIZE + pick.index(payload_len);
            bytes[at] ^= 1 << bit;
            let is_checksum_mismatch = matches!(
                WalDecoder::decode(&bytes),
                Err(DecodeError::ChecksumMismatch { .. })
            );
            prop_assert!(is_checksum_mismatch);
        }

        #[test]
        fn stream_recovers_every_entry_after_one_corruption(
            bad in entry(),
            good in prop::collection::vec(entry(), 1..12),
        ) {
            let mut buf = WalEncoder::encode(&bad);
            let last = buf.len() - 1;
            buf[last] ^= 0xFF;
            let batch = WalEncoder::encode_batch(&good);
            buf.extend_from_slice(&batch.bytes);

            let items: Vec<_> = WalDecoder::stream(&buf).collect();
            let skipped = items.iter().filter(|i| matches!(i, StreamItem::Skipped(_))).count();
            let decoded: Vec<_> = items
                .into_iter()
                .filter_map(|i| match i {
                    StreamItem::Entry(d) => Some(d.entry),
                    StreamItem::Skipped(_) => None,
                })
                .collect();
            prop_assert_eq!(skipped, 1);
            prop_assert_eq!(decoded, good);
        }
    }
}
