//! Recovery invariant tests
//!
//! - Deterministic and idempotent: recovering the same directory twice
//!   yields identical sessions
//! - Conflicts between revisions resolve by policy (newest by default)
//! - Blind updates are flagged uncertain
//! - Flushed deletes are authoritative and never resurrected
//! - Unflushed entries are lost on a crash, flushed ones survive

use proptest::prelude::*;
use scribe_core::{Timestamp, TranscriptUtterance, UtterancePatch, UtteranceState};
use scribe_durability::format::WalEntry;
use scribe_durability::recovery::{
    ConflictPolicy, RecoveryConfig, RecoveryReport, RecoveryStatus, WalRecoveryManager,
};
use scribe_durability::rotation::{RotationConfig, RotationReason, WalRotationManager};
use scribe_durability::wal::{WalConfig, WalWriter, WritePriority};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn open(dir: &Path) -> WalWriter {
    WalWriter::open(
        dir,
        WalConfig::for_testing(),
        WalRotationManager::new(RotationConfig::default()),
        Uuid::new_v4(),
    )
    .unwrap()
}

fn recover(dir: &Path) -> RecoveryReport {
    WalRecoveryManager::new(RecoveryConfig::for_testing())
        .recover(dir, Timestamp::now())
        .unwrap()
}

fn utt(id: &str, session: &str, text: &str, at: u64) -> TranscriptUtterance {
    TranscriptUtterance::new(id, session, text).at(Timestamp::from_millis(at))
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

/// Insert, flush, crash, recover: the utterance is back.
#[test]
fn test_insert_survives_crash() {
    let temp_dir = TempDir::new().unwrap();
    {
        let mut writer = open(temp_dir.path());
        writer
            .write_entry(WalEntry::insert(utt("u1", "s1", "hello", 1_000)), WritePriority::Normal)
            .unwrap();
        writer.flush().unwrap();
        // Dropped without close: crash
    }

    let report = recover(temp_dir.path());
    assert_eq!(report.status, RecoveryStatus::Success);
    let s1 = report.session("s1").unwrap();
    assert_eq!(s1.get("u1").unwrap().text, "hello");
}

/// Update without prior-state info: applied but uncertain.
#[test]
fn test_blind_update_recovers_as_uncertain() {
    let temp_dir = TempDir::new().unwrap();
    {
        let mut writer = open(temp_dir.path());
        writer
            .write_entry(WalEntry::insert(utt("u1", "s1", "hello", 1_000)), WritePriority::Normal)
            .unwrap();
        writer
            .write_entry(
                WalEntry::update(
                    "u1",
                    "s1",
                    UtterancePatch::text("hello world", Timestamp::from_millis(2_000)),
                    None,
                ),
                WritePriority::Normal,
            )
            .unwrap();
        writer.flush().unwrap();
    }

    let report = recover(temp_dir.path());
    let s1 = report.session("s1").unwrap();
    assert_eq!(s1.get("u1").unwrap().text, "hello world");
    assert!(s1.uncertain_entries.contains(&"u1".to_string()));
}

/// A deleted session stays deleted.
#[test]
fn test_deleted_session_absent_after_recovery() {
    let temp_dir = TempDir::new().unwrap();
    {
        let mut writer = open(temp_dir.path());
        for i in 0..5 {
            let id = format!("u{}", i);
            writer
                .write_entry(
                    WalEntry::insert(utt(&id, "s1", "private", 1_000 + i)),
                    WritePriority::Normal,
                )
                .unwrap();
        }
        writer
            .write_entry(WalEntry::insert(utt("k1", "s2", "keep", 1_000)), WritePriority::Normal)
            .unwrap();
        writer
            .write_entry(
                WalEntry::session_delete("s1", "privacy", Timestamp::from_millis(5_000)),
                WritePriority::Urgent,
            )
            .unwrap();
    }

    let report = recover(temp_dir.path());
    assert!(report.session("s1").is_none());
    assert!(report.session("s2").is_some());
    assert_eq!(report.stats.sessions_deleted, 1);
}

/// Entries still buffered at crash time are lost; flushed ones are not.
#[test]
fn test_unflushed_entries_lost_on_crash() {
    let temp_dir = TempDir::new().unwrap();
    {
        let mut writer = open(temp_dir.path());
        writer
            .write_entry(WalEntry::insert(utt("u1", "s1", "flushed", 1)), WritePriority::Urgent)
            .unwrap();
        writer
            .write_entry(WalEntry::insert(utt("u2", "s1", "buffered", 2)), WritePriority::Low)
            .unwrap();
        assert_eq!(writer.pending(), 1);
    }

    let report = recover(temp_dir.path());
    let s1 = report.session("s1").unwrap();
    assert!(s1.get("u1").is_some());
    assert!(s1.get("u2").is_none());
}

// ============================================================================
// Conflicts and tombstones across files
// ============================================================================

#[test]
fn test_newest_insert_wins_across_files() {
    let temp_dir = TempDir::new().unwrap();
    {
        let mut writer = open(temp_dir.path());
        writer
            .write_entry(WalEntry::insert(utt("u1", "s1", "newer text", 2_000)), WritePriority::Urgent)
            .unwrap();
        writer.rotate(RotationReason::Manual).unwrap();
        writer
            .write_entry(WalEntry::insert(utt("u1", "s1", "older text", 1_000)), WritePriority::Urgent)
            .unwrap();
    }

    let report = recover(temp_dir.path());
    let s1 = report.session("s1").unwrap();
    assert_eq!(s1.get("u1").unwrap().text, "newer text");
    assert_eq!(s1.conflicts, 1);

    let oldest = WalRecoveryManager::new(
        RecoveryConfig::for_testing().with_conflict_policy(ConflictPolicy::Oldest),
    )
    .recover(temp_dir.path(), Timestamp::now())
    .unwrap();
    assert_eq!(
        oldest.session("s1").unwrap().get("u1").unwrap().text,
        "older text"
    );
}

#[test]
fn test_delete_not_resurrected_by_duplicate_in_later_file() {
    let temp_dir = TempDir::new().unwrap();
    let original = utt("u1", "s1", "secret", 1_000);
    {
        let mut writer = open(temp_dir.path());
        writer
            .write_entry(WalEntry::insert(original.clone()), WritePriority::Urgent)
            .unwrap();
        writer
            .write_entry(
                WalEntry::delete("u1", "s1", Timestamp::from_millis(2_000)),
                WritePriority::Urgent,
            )
            .unwrap();
        // A retried batch after a timeout lands in the next file
        writer.rotate(RotationReason::WriteTimeout).unwrap();
        writer
            .write_entry(WalEntry::insert(original), WritePriority::Urgent)
            .unwrap();
    }

    let report = recover(temp_dir.path());
    assert!(report.session("s1").unwrap().get("u1").is_none());
    assert_eq!(report.stats.entries_tombstoned, 1);
}

#[test]
fn test_completeness_reported() {
    let temp_dir = TempDir::new().unwrap();
    let finished = utt("u1", "done", "bye", 1_000).finalize("Bye.", Timestamp::from_millis(1_500));
    let live = utt("u2", "live", "still", 1_000);
    {
        let mut writer = open(temp_dir.path());
        writer
            .write_entries(
                vec![WalEntry::insert(finished), WalEntry::insert(live)],
                WritePriority::Urgent,
            )
            .unwrap();
    }

    let report = WalRecoveryManager::new(
        RecoveryConfig::for_testing().with_completion_idle(Duration::from_secs(60)),
    )
    .recover(temp_dir.path(), Timestamp::from_millis(1_500 + 60_000))
    .unwrap();
    assert!(report.session("done").unwrap().complete);
    assert!(!report.session("live").unwrap().complete);
    assert_eq!(
        report.session("done").unwrap().utterances[0].state,
        UtteranceState::Finalized
    );
}

// ============================================================================
// Idempotence
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Insert(u8, u8, u64),
    Update(u8, u8, u64, bool),
    Delete(u8, u8, u64),
    DeleteSession(u8, u64),
    Rotate,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..6, 0u8..3, 1u64..10_000).prop_map(|(u, s, t)| Op::Insert(u, s, t)),
        3 => (0u8..6, 0u8..3, 1u64..10_000, any::<bool>())
            .prop_map(|(u, s, t, v)| Op::Update(u, s, t, v)),
        1 => (0u8..6, 0u8..3, 1u64..10_000).prop_map(|(u, s, t)| Op::Delete(u, s, t)),
        1 => (0u8..3, 1u64..10_000).prop_map(|(s, t)| Op::DeleteSession(s, t)),
        1 => Just(Op::Rotate),
    ]
}

fn apply(writer: &mut WalWriter, op: &Op) {
    let ts = Timestamp::from_millis;
    match op {
        Op::Insert(u, s, t) => {
            let utterance = utt(&format!("u{}", u), &format!("s{}", s), "text", *t);
            writer
                .write_entry(WalEntry::insert(utterance), WritePriority::Normal)
                .unwrap();
        }
        Op::Update(u, s, t, finalize) => {
            let mut patch = UtterancePatch::text(format!("rev {}", t), ts(*t));
            if *finalize {
                patch.state = Some(UtteranceState::Finalized);
            }
            writer
                .write_entry(
                    WalEntry::update(format!("u{}", u), format!("s{}", s), patch, None),
                    WritePriority::Normal,
                )
                .unwrap();
        }
        Op::Delete(u, s, t) => {
            writer
                .write_entry(
                    WalEntry::delete(format!("u{}", u), format!("s{}", s), ts(*t)),
                    WritePriority::Normal,
                )
                .unwrap();
        }
        Op::DeleteSession(s, t) => {
            writer
                .write_entry(
                    WalEntry::session_delete(format!("s{}", s), "privacy", ts(*t)),
                    WritePriority::Urgent,
                )
                .unwrap();
        }
        Op::Rotate => {
            writer.flush().unwrap();
            writer.rotate(RotationReason::Manual).unwrap();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn recovery_twice_yields_identical_sessions(ops in prop::collection::vec(op(), 1..40)) {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut writer = open(temp_dir.path());
            for op in &ops {
                apply(&mut writer, op);
            }
            writer.close().unwrap();
        }

        let now = Timestamp::now();
        let manager = WalRecoveryManager::new(RecoveryConfig::for_testing());
        let first = manager.recover(temp_dir.path(), now).unwrap();
        let second = manager.recover(temp_dir.path(), now).unwrap();

        prop_assert_eq!(first.status, second.status);
        prop_assert_eq!(&first.sessions, &second.sessions);
        prop_assert_eq!(first.stats, second.stats);
    }
}
