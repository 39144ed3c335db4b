//! Tests for merge file selection
//!
//! These tests verify:
//! - The file count policy walks the size ladder smallest class first
//! - The oldest files of a class are picked
//! - Invalid and deleted entry ratios select candidate files
//! - Size on disk selects every file
//! - An empty policy never merges

use std::sync::Arc;

use tempfile::TempDir;
use tessera::config::{FileCountMergeConfig, MergeConfig};
use tessera::merge::{MergeHelper, MergePolicy, MergeReason, SizeClass};
use tessera::state::RecordKind;
use tessera::storage::{CheckpointFile, CheckpointFileWriter, FileMetadata, MetadataManager, MetadataTable};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_manager() -> (TempDir, MetadataManager) {
    let temp_dir = TempDir::new().unwrap();
    let manager = MetadataManager::open(temp_dir.path()).unwrap();
    (temp_dir, manager)
}

/// Create a file with `live` values and `deleted` markers, of which only
/// `valid` live values still count as current
fn create_file(
    manager: &MetadataManager,
    live: usize,
    deleted: usize,
    valid: u64,
) -> Arc<FileMetadata> {
    let file_id = manager.allocate_file_id();
    let name = manager.new_file_name(file_id);
    let timestamp = manager.allocate_timestamp();
    let mut writer = CheckpointFileWriter::create(manager.checkpoint_dir(), &name, timestamp).unwrap();
    for i in 0..live {
        let key = format!("live_{:05}", i);
        writer
            .add_value(key.as_bytes(), RecordKind::Inserted, i as i64 + 1, b"payload")
            .unwrap();
    }
    for i in 0..deleted {
        let key = format!("tomb_{:05}", i);
        writer.add_deleted(key.as_bytes(), i as i64 + 1).unwrap();
    }
    writer.finish().unwrap();
    let checkpoint = CheckpointFile::open(manager.checkpoint_dir(), &name).unwrap();
    Arc::new(FileMetadata::new(file_id, checkpoint, valid))
}

fn config_with(policy: MergePolicy) -> MergeConfig {
    MergeConfig {
        policy,
        merge_files_count_threshold: 2,
        number_of_invalid_entries: 5,
        ..MergeConfig::default()
    }
}

// =============================================================================
// File Count Tests
// =============================================================================

#[test]
fn test_file_count_below_threshold_does_nothing() {
    let (_temp, manager) = setup_manager();
    let mut table = MetadataTable::new(1);
    table.insert(create_file(&manager, 4, 0, 4));
    table.insert(create_file(&manager, 4, 0, 4));

    let config = config_with(MergePolicy::FILE_COUNT);
    assert!(MergeHelper::new(&config).select(&table).is_none());
}

#[test]
fn test_file_count_picks_oldest_files() {
    let (_temp, manager) = setup_manager();
    let mut table = MetadataTable::new(1);
    let mut ids = Vec::new();
    for _ in 0..5 {
        let file = create_file(&manager, 4, 0, 4);
        ids.push(file.file_id());
        table.insert(file);
    }

    let config = config_with(MergePolicy::FILE_COUNT);
    let selection = MergeHelper::new(&config).select(&table).unwrap();

    assert_eq!(selection.reason, MergeReason::FileCount(SizeClass::VerySmall));
    assert_eq!(selection.file_ids, ids[..3].to_vec());
}

#[test]
fn test_file_count_climbs_the_ladder() {
    let (_temp, manager) = setup_manager();
    let tiny = create_file(&manager, 1, 0, 1);
    let big: Vec<_> = (0..3).map(|_| create_file(&manager, 200, 0, 200)).collect();

    let mut config = config_with(MergePolicy::FILE_COUNT);
    config.file_count = FileCountMergeConfig {
        very_small_file_size_threshold: tiny.size_bytes() + 1,
        ..FileCountMergeConfig::with_threshold(3)
    };

    let mut table = MetadataTable::new(1);
    table.insert(tiny);
    for file in &big {
        table.insert(Arc::clone(file));
    }

    let selection = MergeHelper::new(&config).select(&table).unwrap();
    assert_eq!(selection.reason, MergeReason::FileCount(SizeClass::Small));
    let expected: Vec<u32> = big.iter().map(|f| f.file_id()).collect();
    assert_eq!(selection.file_ids, expected);
}

#[test]
fn test_size_class_boundaries() {
    let ladder = FileCountMergeConfig::default();
    assert_eq!(SizeClass::of(0, &ladder), SizeClass::VerySmall);
    assert_eq!(
        SizeClass::of(FileCountMergeConfig::DEFAULT_VERY_SMALL_FILE_SIZE_THRESHOLD, &ladder),
        SizeClass::Small
    );
    assert_eq!(
        SizeClass::of(FileCountMergeConfig::DEFAULT_SMALL_FILE_SIZE_THRESHOLD, &ladder),
        SizeClass::Medium
    );
    assert_eq!(
        SizeClass::of(FileCountMergeConfig::DEFAULT_MEDIUM_FILE_SIZE_THRESHOLD, &ladder),
        SizeClass::Large
    );
}

// =============================================================================
// Ratio Policy Tests
// =============================================================================

#[test]
fn test_invalid_entries_selects_candidates() {
    let (_temp, manager) = setup_manager();
    let stale_a = create_file(&manager, 10, 0, 2);
    let stale_b = create_file(&manager, 10, 0, 4);
    let fresh = create_file(&manager, 10, 0, 10);

    let mut table = MetadataTable::new(1);
    table.insert(Arc::clone(&stale_a));
    table.insert(Arc::clone(&stale_b));
    table.insert(fresh);

    let config = config_with(MergePolicy::INVALID_ENTRIES);
    let selection = MergeHelper::new(&config).select(&table).unwrap();

    assert_eq!(selection.reason, MergeReason::InvalidEntries);
    assert_eq!(selection.file_ids, vec![stale_a.file_id(), stale_b.file_id()]);
}

#[test]
fn test_invalid_entries_needs_enough_candidates() {
    let (_temp, manager) = setup_manager();
    let mut table = MetadataTable::new(1);
    table.insert(create_file(&manager, 10, 0, 0));
    table.insert(create_file(&manager, 10, 0, 10));

    let config = config_with(MergePolicy::INVALID_ENTRIES);
    assert!(MergeHelper::new(&config).select(&table).is_none());
}

#[test]
fn test_invalid_entries_respects_absolute_minimum() {
    let (_temp, manager) = setup_manager();
    let mut table = MetadataTable::new(1);
    // 3 of 4 invalid: high ratio but under the absolute count
    table.insert(create_file(&manager, 4, 0, 1));
    table.insert(create_file(&manager, 4, 0, 1));

    let config = config_with(MergePolicy::INVALID_ENTRIES);
    assert!(MergeHelper::new(&config).select(&table).is_none());
}

#[test]
fn test_deleted_entries_selects_tombstone_heavy_files() {
    let (_temp, manager) = setup_manager();
    let tomb_a = create_file(&manager, 2, 6, 2);
    let tomb_b = create_file(&manager, 3, 3, 3);
    let clean = create_file(&manager, 10, 1, 10);

    let mut table = MetadataTable::new(1);
    table.insert(Arc::clone(&tomb_a));
    table.insert(Arc::clone(&tomb_b));
    table.insert(clean);

    let config = config_with(MergePolicy::DELETED_ENTRIES);
    let selection = MergeHelper::new(&config).select(&table).unwrap();

    assert_eq!(selection.reason, MergeReason::DeletedEntries);
    assert_eq!(selection.file_ids, vec![tomb_a.file_id(), tomb_b.file_id()]);
}

// =============================================================================
// Size On Disk And Combination Tests
// =============================================================================

#[test]
fn test_size_on_disk_selects_every_file() {
    let (_temp, manager) = setup_manager();
    let mut table = MetadataTable::new(1);
    table.insert(create_file(&manager, 20, 0, 20));
    table.insert(create_file(&manager, 20, 0, 20));

    let mut config = config_with(MergePolicy::SIZE_ON_DISK);
    config.size_on_disk_threshold = table.total_size() - 1;

    let selection = MergeHelper::new(&config).select(&table).unwrap();
    assert_eq!(selection.reason, MergeReason::SizeOnDisk);
    assert_eq!(selection.file_ids, table.file_ids());

    config.size_on_disk_threshold = table.total_size();
    assert!(MergeHelper::new(&config).select(&table).is_none());
}

#[test]
fn test_size_on_disk_ignores_single_file() {
    let (_temp, manager) = setup_manager();
    let mut table = MetadataTable::new(1);
    table.insert(create_file(&manager, 20, 0, 20));

    let mut config = config_with(MergePolicy::SIZE_ON_DISK);
    config.size_on_disk_threshold = 1;
    assert!(MergeHelper::new(&config).select(&table).is_none());
}

#[test]
fn test_invalid_entries_evaluated_before_file_count() {
    let (_temp, manager) = setup_manager();
    let mut table = MetadataTable::new(1);
    for _ in 0..2 {
        table.insert(create_file(&manager, 10, 0, 0));
    }
    for _ in 0..2 {
        table.insert(create_file(&manager, 10, 0, 10));
    }

    let config = config_with(MergePolicy::default());
    let selection = MergeHelper::new(&config).select(&table).unwrap();
    assert_eq!(selection.reason, MergeReason::InvalidEntries);
    assert_eq!(selection.file_ids.len(), 2);
}

#[test]
fn test_none_policy_never_merges() {
    let (_temp, manager) = setup_manager();
    let mut table = MetadataTable::new(1);
    for _ in 0..6 {
        table.insert(create_file(&manager, 10, 5, 0));
    }

    let config = config_with(MergePolicy::NONE);
    assert!(MergeHelper::new(&config).select(&table).is_none());
}

#[test]
fn test_empty_table_never_merges() {
    let config = config_with(MergePolicy::ALL);
    assert!(MergeHelper::new(&config).select(&MetadataTable::new(0)).is_none());
}
