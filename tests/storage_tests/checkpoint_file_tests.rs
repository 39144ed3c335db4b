//! Tests for checkpoint file pairs
//!
//! These tests verify:
//! - Writing and reading back key records and values
//! - Deletion markers and header counts
//! - Checksum validation of values and whole files
//! - Corruption detection on open (bad magic, truncation)
//! - Damaged record lengths are reported, not allocated

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

use tempfile::TempDir;
use tessera::state::{RecordKind, ValueLocation};
use tessera::storage::{CheckpointFile, CheckpointFileWriter};
use tessera::TesseraError;

// =============================================================================
// Helper Functions
// =============================================================================

/// Write a file with `count` live keys "key_000".. and one deletion marker
fn write_sample(dir: &TempDir, name: &str, count: usize) -> Vec<ValueLocation> {
    let mut writer = CheckpointFileWriter::create(dir.path(), name, 7).unwrap();
    let mut locations = Vec::new();
    for i in 0..count {
        let key = format!("key_{:03}", i);
        let value = format!("value_{}", i);
        let written = writer
            .add_value(key.as_bytes(), RecordKind::Inserted, i as i64 + 1, value.as_bytes())
            .unwrap();
        locations.push(ValueLocation {
            file_id: 1,
            offset: written.offset,
            length: written.length,
            crc: written.crc,
        });
    }
    writer.add_deleted(b"zzz_deleted", 100).unwrap();
    writer.finish().unwrap();
    locations
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_write_and_read_values() {
    let dir = TempDir::new().unwrap();
    let locations = write_sample(&dir, "ckpt_a", 10);

    let file = CheckpointFile::open(dir.path(), "ckpt_a").unwrap();
    assert_eq!(file.entry_count(), 11);
    assert_eq!(file.deleted_count(), 1);
    assert_eq!(file.logical_timestamp(), 7);

    for (i, location) in locations.iter().enumerate() {
        let value = file.read_value(location).unwrap();
        assert_eq!(value, format!("value_{}", i).into_bytes());
    }
}

#[test]
fn test_key_records_in_order_with_locations() {
    let dir = TempDir::new().unwrap();
    write_sample(&dir, "ckpt_b", 5);

    let file = CheckpointFile::open(dir.path(), "ckpt_b").unwrap();
    let records: Vec<_> = file.key_records().unwrap().map(|r| r.unwrap()).collect();

    assert_eq!(records.len(), 6);
    assert_eq!(records[0].key, b"key_000".to_vec());
    assert_eq!(records[0].lsn, 1);
    assert!(records[0].location(3).is_some());
    assert_eq!(records[0].location(3).unwrap().file_id, 3);

    let last = records.last().unwrap();
    assert!(last.is_deleted());
    assert_eq!(last.lsn, 100);
    assert!(last.location(3).is_none());
}

#[test]
fn test_deleted_record_rejects_value() {
    let dir = TempDir::new().unwrap();
    let mut writer = CheckpointFileWriter::create(dir.path(), "ckpt_c", 1).unwrap();

    let err = writer
        .add_value(b"k", RecordKind::Deleted, 1, b"v")
        .unwrap_err();
    assert!(matches!(err, TesseraError::InvalidArgument(_)));
    writer.abandon();
}

#[test]
fn test_abandon_removes_files() {
    let dir = TempDir::new().unwrap();
    let mut writer = CheckpointFileWriter::create(dir.path(), "ckpt_d", 1).unwrap();
    writer
        .add_value(b"k", RecordKind::Inserted, 1, b"v")
        .unwrap();
    writer.abandon();

    assert!(!dir.path().join("ckpt_d.key").exists());
    assert!(!dir.path().join("ckpt_d.val").exists());
}

#[test]
fn test_verify_clean_file() {
    let dir = TempDir::new().unwrap();
    write_sample(&dir, "ckpt_e", 20);

    let file = CheckpointFile::open(dir.path(), "ckpt_e").unwrap();
    file.verify().unwrap();
}

#[test]
fn test_empty_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let writer = CheckpointFileWriter::create(dir.path(), "ckpt_empty", 2).unwrap();
    let info = writer.finish().unwrap();
    assert_eq!(info.entry_count, 0);

    let file = CheckpointFile::open(dir.path(), "ckpt_empty").unwrap();
    assert_eq!(file.key_records().unwrap().count(), 0);
    file.verify().unwrap();
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_bad_key_magic_is_corruption() {
    let dir = TempDir::new().unwrap();
    write_sample(&dir, "ckpt_f", 3);

    let path = dir.path().join("ckpt_f.key");
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all(b"XXXX").unwrap();
    drop(file);

    let result = CheckpointFile::open(dir.path(), "ckpt_f");
    assert!(matches!(result, Err(TesseraError::Corruption(_))));
}

#[test]
fn test_truncated_value_file_is_corruption() {
    let dir = TempDir::new().unwrap();
    write_sample(&dir, "ckpt_g", 3);

    let path = dir.path().join("ckpt_g.val");
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(4).unwrap();
    drop(file);

    let result = CheckpointFile::open(dir.path(), "ckpt_g");
    assert!(matches!(result, Err(TesseraError::Corruption(_))));
}

#[test]
fn test_flipped_value_byte_fails_checksum() {
    let dir = TempDir::new().unwrap();
    let locations = write_sample(&dir, "ckpt_h", 3);

    let path = dir.path().join("ckpt_h.val");
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(locations[1].offset)).unwrap();
    file.write_all(b"#").unwrap();
    drop(file);

    let checkpoint = CheckpointFile::open(dir.path(), "ckpt_h").unwrap();
    assert!(checkpoint.read_value(&locations[0]).is_ok());
    assert!(matches!(
        checkpoint.read_value(&locations[1]),
        Err(TesseraError::Corruption(_))
    ));
    assert!(matches!(checkpoint.verify(), Err(TesseraError::Corruption(_))));
}

#[test]
fn test_missing_value_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    write_sample(&dir, "ckpt_i", 1);
    fs::remove_file(dir.path().join("ckpt_i.val")).unwrap();

    let result = CheckpointFile::open(dir.path(), "ckpt_i");
    assert!(matches!(result, Err(TesseraError::Io(_))));
}

#[test]
fn test_oversized_key_length_is_corruption() {
    let dir = TempDir::new().unwrap();
    write_sample(&dir, "ckpt_j", 3);

    // First record starts right after the 30-byte header
    let path = dir.path().join("ckpt_j.key");
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(30)).unwrap();
    file.write_all(&u32::MAX.to_le_bytes()).unwrap();
    drop(file);

    let checkpoint = CheckpointFile::open(dir.path(), "ckpt_j").unwrap();
    let mut records = checkpoint.key_records().unwrap();
    assert!(matches!(records.next(), Some(Err(TesseraError::Corruption(_)))));
    assert!(records.next().is_none());
    assert!(matches!(checkpoint.verify(), Err(TesseraError::Corruption(_))));
}
