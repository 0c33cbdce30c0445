//! Corruption containment tests
//!
//! A WAL file damaged in the middle or at the tail must still yield every
//! intact entry:
//! - CRC32 detects bit flips in a payload
//! - The stream decoder resynchronizes on the next valid entry
//! - A torn tail from a crash loses only the torn entry
//! - Recovery treats both as warnings, not failures

use scribe_core::{Timestamp, TranscriptUtterance};
use scribe_durability::codec::{DecodeError, StreamItem, WalDecoder, WalEncoder};
use scribe_durability::format::{WalEntry, WalFileHeader, ENTRY_HEADER_SIZE};
use scribe_durability::recovery::{RecoveryConfig, RecoveryStatus, WalRecoveryManager};
use scribe_durability::rotation::{RotationConfig, WalRotationManager};
use scribe_durability::wal::{WalConfig, WalWriter, WritePriority};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

fn utterance(i: usize) -> TranscriptUtterance {
    TranscriptUtterance::new(format!("u{}", i), "s1", format!("utterance number {}", i))
        .at(Timestamp::from_millis(10_000 + i as u64))
}

/// Write `n` inserts through the writer and return the file path.
fn write_entries(dir: &Path, n: usize) -> PathBuf {
    let mut writer = WalWriter::open(
        dir,
        WalConfig::for_testing(),
        WalRotationManager::new(RotationConfig::default()),
        Uuid::new_v4(),
    )
    .unwrap();
    for i in 0..n {
        writer
            .write_entry(WalEntry::insert(utterance(i)), WritePriority::Normal)
            .unwrap();
    }
    writer.flush().unwrap();
    let path = writer.current_path().unwrap().to_path_buf();
    writer.close().unwrap();
    path
}

fn entry_offsets(bytes: &[u8]) -> Vec<usize> {
    let (_, header_len) = WalFileHeader::from_bytes(bytes).unwrap();
    WalDecoder::stream_from(bytes, header_len)
        .filter_map(|item| match item {
            StreamItem::Entry(decoded) => Some(decoded.offset),
            StreamItem::Skipped(_) => None,
        })
        .collect()
}

fn recover(dir: &Path) -> scribe_durability::recovery::RecoveryReport {
    WalRecoveryManager::new(RecoveryConfig::for_testing())
        .recover(dir, Timestamp::now())
        .unwrap()
}

#[test]
fn test_crc_detects_bit_flip() {
    let entry = WalEntry::insert(utterance(0));
    let mut bytes = WalEncoder::encode(&entry);
    bytes[ENTRY_HEADER_SIZE + 3] ^= 0x01;

    assert!(matches!(
        WalDecoder::decode(&bytes),
        Err(DecodeError::ChecksumMismatch { .. })
    ));
    // Header-only validation does not look at the payload
    assert!(WalDecoder::validate_entry(&bytes).is_ok());
}

#[test]
fn test_middle_corruption_is_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_entries(temp_dir.path(), 8);

    let bytes = fs::read(&path).unwrap();
    let offsets = entry_offsets(&bytes);
    assert_eq!(offsets.len(), 8);

    // Flip a payload byte of entry 3
    {
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let target = (offsets[3] + ENTRY_HEADER_SIZE + 2) as u64;
        file.seek(SeekFrom::Start(target)).unwrap();
        let mut buf = [0u8; 1];
        file.read_exact(&mut buf).unwrap();
        buf[0] ^= 0xFF;
        file.seek(SeekFrom::Start(target)).unwrap();
        file.write_all(&buf).unwrap();
        file.sync_all().unwrap();
    }

    let bytes = fs::read(&path).unwrap();
    let (_, header_len) = WalFileHeader::from_bytes(&bytes).unwrap();
    let mut stream = WalDecoder::stream_from(&bytes, header_len);
    let items: Vec<StreamItem> = stream.by_ref().collect();

    let skips: Vec<_> = items
        .iter()
        .filter_map(|i| match i {
            StreamItem::Skipped(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(skips.len(), 1, "exactly one warning per corrupt region");
    assert_eq!(skips[0].offset, offsets[3]);
    assert_eq!(skips[0].offset + skips[0].skipped_bytes, offsets[4]);
    assert_eq!(stream.stats().entries, 7);

    let report = recover(temp_dir.path());
    assert_eq!(report.status, RecoveryStatus::Success);
    assert_eq!(report.stats.corrupted_regions, 1);
    let session = report.session("s1").unwrap();
    assert_eq!(session.utterances.len(), 7);
    assert!(session.get("u3").is_none());
    assert!(session.get("u4").is_some());
}

#[test]
fn test_torn_tail_loses_only_last_entry() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_entries(temp_dir.path(), 5);

    let size = fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(size - 7).unwrap();
    drop(file);

    let report = recover(temp_dir.path());
    assert_eq!(report.status, RecoveryStatus::Success);
    let session = report.session("s1").unwrap();
    let ids: Vec<&str> = session.utterances.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(ids, vec!["u0", "u1", "u2", "u3"]);
    assert_eq!(report.warnings.len(), 1);
}

#[test]
fn test_garbage_appended_after_valid_entries() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_entries(temp_dir.path(), 3);
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xAB; 64]).unwrap();
    }
    let report = recover(temp_dir.path());
    assert_eq!(report.session("s1").unwrap().utterances.len(), 3);
    assert_eq!(report.stats.skipped_bytes, 64);
}

#[test]
fn test_writer_starts_fresh_file_after_torn_tail() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_entries(temp_dir.path(), 2);
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        let torn = WalEncoder::encode(&WalEntry::insert(utterance(2)));
        file.write_all(&torn[..ENTRY_HEADER_SIZE + 1]).unwrap();
    }

    let mut writer = WalWriter::open(
        temp_dir.path(),
        WalConfig::for_testing(),
        WalRotationManager::new(RotationConfig::default()),
        Uuid::new_v4(),
    )
    .unwrap();
    assert!(!writer.resumed());
    writer
        .write_entry(WalEntry::insert(utterance(3)), WritePriority::Urgent)
        .unwrap();
    drop(writer);

    // The torn bytes stay in the old file; both files replay
    let report = recover(temp_dir.path());
    let session = report.session("s1").unwrap();
    let ids: Vec<&str> = session.utterances.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(ids, vec!["u0", "u1", "u3"]);
    assert_eq!(report.stats.files_processed, 2);
}
