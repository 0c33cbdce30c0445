//! The root crate's re-exports are enough to run a full session.

use scribe::scribe_durability::RecoveryStatus;
use scribe::{PersistenceConfig, Timestamp, TranscriptPersistenceManager, TranscriptUtterance};
use tempfile::TempDir;

#[test]
fn test_session_through_facade() {
    let temp_dir = TempDir::new().unwrap();
    let config = PersistenceConfig::for_testing(temp_dir.path());
    {
        let manager = TranscriptPersistenceManager::with_ring_buffer(config.clone()).unwrap();
        assert_eq!(manager.initialize().unwrap().status, RecoveryStatus::Skipped);
        let utterance = TranscriptUtterance::new("u1", "s1", "hello")
            .at(Timestamp::from_millis(1_000))
            .finalize("Hello.", Timestamp::from_millis(1_500));
        manager.persist_utterance(utterance).unwrap();
        manager.shutdown().unwrap();
    }

    let manager = TranscriptPersistenceManager::with_ring_buffer(config).unwrap();
    assert_eq!(manager.initialize().unwrap().status, RecoveryStatus::Success);
    assert_eq!(manager.get_utterance("u1").unwrap().display_text(), "Hello.");
}
