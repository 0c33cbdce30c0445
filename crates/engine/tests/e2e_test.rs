//! End-to-end persistence scenarios
//!
//! A crash is simulated by dropping the manager without `shutdown`: the
//! writer's buffer is lost, everything already flushed must come back.
//!
//! - A: an inserted, flushed utterance survives a crash
//! - B: an update without prior-state info recovers as uncertain
//! - C: a deleted session is absent after recovery
//! - D: growth above the limit is reported as critical

use scribe_core::{Timestamp, TranscriptUtterance, UtterancePatch};
use scribe_durability::{
    AlertKind, MonitorConfig, RecoveryStatus, RotationConfig, StorageMonitor, StorageSample,
    StorageStatus, WalConfig, WalEntry, WalRotationManager, WalWriter, WritePriority,
};
use scribe_engine::{PersistenceConfig, TranscriptPersistenceManager};
use std::path::Path;
use tempfile::TempDir;
use uuid::Uuid;

fn open(dir: &Path) -> TranscriptPersistenceManager {
    TranscriptPersistenceManager::with_ring_buffer(PersistenceConfig::for_testing(dir)).unwrap()
}

fn utt(id: &str, session: &str, text: &str, at: u64) -> TranscriptUtterance {
    TranscriptUtterance::new(id, session, text).at(Timestamp::from_millis(at))
}

#[test]
fn test_e2e_a_insert_survives_crash() {
    let temp_dir = TempDir::new().unwrap();
    {
        let manager = open(temp_dir.path());
        manager.initialize().unwrap();
        manager.persist_utterance(utt("u1", "s1", "hello", 1_000)).unwrap();
        manager.flush().unwrap();
        // Crash: dropped without shutdown
    }

    let manager = open(temp_dir.path());
    let report = manager.initialize().unwrap();
    assert_eq!(report.status, RecoveryStatus::Success);
    assert_eq!(report.session("s1").unwrap().get("u1").unwrap().text, "hello");
    assert_eq!(manager.get_utterance("u1").unwrap().text, "hello");
    assert_eq!(manager.sessions(), vec!["s1".to_string()]);
}

#[test]
fn test_e2e_b_blind_update_is_uncertain() {
    let temp_dir = TempDir::new().unwrap();
    {
        // A pipeline that logged an update without knowing the prior state
        let mut writer = WalWriter::open(
            temp_dir.path(),
            WalConfig::for_testing(),
            WalRotationManager::new(RotationConfig::default()),
            Uuid::new_v4(),
        )
        .unwrap();
        writer
            .write_entries(
                vec![
                    WalEntry::insert(utt("u1", "s1", "hello", 1_000)),
                    WalEntry::update(
                        "u1",
                        "s1",
                        UtterancePatch::text("hello world", Timestamp::from_millis(2_000)),
                        None,
                    ),
                ],
                WritePriority::Urgent,
            )
            .unwrap();
    }

    let manager = open(temp_dir.path());
    let report = manager.initialize().unwrap();
    let s1 = report.session("s1").unwrap();
    assert!(s1.is_uncertain("u1"));
    assert_eq!(manager.get_utterance("u1").unwrap().text, "hello world");
}

#[test]
fn test_e2e_b_update_through_manager_is_certain() {
    let temp_dir = TempDir::new().unwrap();
    {
        let manager = open(temp_dir.path());
        manager.initialize().unwrap();
        let first = utt("u1", "s1", "hello", 1_000);
        let mut revised = first.clone();
        revised.text = "hello world".to_string();
        revised.updated_at = Timestamp::from_millis(2_000);
        manager.persist_utterance(first).unwrap();
        manager.persist_utterance(revised).unwrap();
        manager.flush().unwrap();
    }

    let manager = open(temp_dir.path());
    let report = manager.initialize().unwrap();
    let s1 = report.session("s1").unwrap();
    assert!(!s1.is_uncertain("u1"));
    assert_eq!(s1.get("u1").unwrap().text, "hello world");
    assert_eq!(report.stats.conflicts, 0);
}

#[test]
fn test_e2e_c_deleted_session_absent() {
    let temp_dir = TempDir::new().unwrap();
    {
        let manager = open(temp_dir.path());
        manager.initialize().unwrap();
        for i in 0..5 {
            manager
                .persist_utterance(utt(&format!("u{}", i), "s1", "private", 1_000 + i))
                .unwrap();
        }
        manager.persist_utterance(utt("k1", "s2", "keep", 1_000)).unwrap();
        manager.flush().unwrap();

        assert_eq!(manager.delete_session("s1").unwrap(), 5);
        assert!(manager.get_session_utterances("s1").is_empty());
        // Crash right after the delete returned
    }

    let manager = open(temp_dir.path());
    let report = manager.initialize().unwrap();
    assert!(report.session("s1").is_none());
    assert!(manager.get_session_utterances("s1").is_empty());
    assert_eq!(manager.get_session_utterances("s2").len(), 1);
    assert_eq!(manager.sessions(), vec!["s2".to_string()]);
}

#[test]
fn test_e2e_d_growth_above_limit_is_critical() {
    const MIB: u64 = 1024 * 1024;
    let mut monitor = StorageMonitor::new(MonitorConfig::default());
    let sample = |at_ms: u64, wal_size: u64| StorageSample {
        taken_at: Timestamp::from_millis(at_ms),
        wal_size,
        file_count: 3,
        disk_total: None,
        disk_available: None,
    };

    // 75 MiB in one hour against a 50 MiB/h limit
    monitor.record_sample(sample(0, 0));
    monitor.record_sample(sample(60 * 60 * 1000, 75 * MIB));

    let report = monitor.evaluate();
    assert_eq!(report.status, StorageStatus::Critical);
    let alert = report.alert(AlertKind::GrowthRate).unwrap();
    assert_eq!(alert.severity, StorageStatus::Critical);
    assert!(alert.value > alert.threshold);
}
