//! Tests for merges driven by checkpoints
//!
//! These tests verify:
//! - The file count policy folds small files into one
//! - Files dominated by superseded entries are rewritten
//! - Deletion markers disappear once nothing older remains
//! - Merged state reads correctly and survives reopen

use std::time::Duration;

use tempfile::TempDir;
use tessera::{FileCountMergeConfig, MergePolicy, Role, Store, StoreConfig};

const TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Helper Functions
// =============================================================================

fn open_primary(config: StoreConfig) -> Store<u64, String> {
    let store = Store::open(config).unwrap();
    store.change_role(Role::Primary).unwrap();
    store
}

fn file_count_config(dir: &TempDir) -> StoreConfig {
    StoreConfig::builder()
        .data_dir(dir.path())
        .number_of_deltas_to_be_consolidated(1)
        .merge_policy(MergePolicy::FILE_COUNT)
        .file_count_merge(FileCountMergeConfig::with_threshold(3))
        .build()
}

fn invalid_entries_config(dir: &TempDir) -> StoreConfig {
    StoreConfig::builder()
        .data_dir(dir.path())
        .number_of_deltas_to_be_consolidated(1)
        .merge_policy(MergePolicy::INVALID_ENTRIES)
        .merge_files_count_threshold(1)
        .number_of_invalid_entries(5)
        .build()
}

fn put_range(store: &Store<u64, String>, keys: std::ops::Range<u64>, tag: &str) {
    let txn = store.begin_transaction().unwrap();
    for key in keys {
        let value = format!("{}{}", tag, key);
        let outcome = store
            .conditional_update(&txn, key, value.clone(), None, TIMEOUT)
            .unwrap();
        if !outcome.is_applied() {
            store.add(&txn, key, value, TIMEOUT).unwrap();
        }
    }
    store.commit(&txn).unwrap();
}

fn remove_range(store: &Store<u64, String>, keys: std::ops::Range<u64>) {
    let txn = store.begin_transaction().unwrap();
    for key in keys {
        store.conditional_remove(&txn, key, None, TIMEOUT).unwrap();
    }
    store.commit(&txn).unwrap();
}

fn read(store: &Store<u64, String>, key: u64) -> Option<String> {
    let txn = store.begin_transaction().unwrap();
    store.get(&txn, &key, TIMEOUT).unwrap()
}

fn checkpoint_now(store: &Store<u64, String>) {
    store.checkpoint(store.last_committed_lsn()).unwrap();
}

// =============================================================================
// File Count Tests
// =============================================================================

#[test]
fn test_three_small_files_merge_into_one() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = open_primary(file_count_config(&temp_dir));
        put_range(&store, 0..5, "a");
        checkpoint_now(&store);
        put_range(&store, 5..10, "b");
        checkpoint_now(&store);
        assert_eq!(store.current_table().file_count(), 2);

        put_range(&store, 10..15, "c");
        checkpoint_now(&store);

        let table = store.current_table();
        assert_eq!(table.file_count(), 1);
        let merged = table.files().next().unwrap();
        assert_eq!(merged.total_entries(), 15);
        assert_eq!(merged.valid_entries(), 15);

        assert_eq!(read(&store, 2), Some("a2".to_string()));
        assert_eq!(read(&store, 14), Some("c14".to_string()));
    }

    let store = open_primary(file_count_config(&temp_dir));
    assert_eq!(store.count(), 15);
    assert_eq!(store.current_table().file_count(), 1);
    for key in 0..15u64 {
        assert!(read(&store, key).is_some(), "key {} lost", key);
    }
}

#[test]
fn test_merged_inputs_removed_from_disk() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_primary(file_count_config(&temp_dir));
    for round in 0..3u64 {
        put_range(&store, round * 10..round * 10 + 10, "v");
        checkpoint_now(&store);
    }

    let checkpoint_dir = temp_dir.path().join("checkpoints");
    let key_files = std::fs::read_dir(&checkpoint_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().map_or(false, |ext| ext == "key"))
        .count();
    assert_eq!(key_files, 1);
}

// =============================================================================
// Invalid Entry Tests
// =============================================================================

#[test]
fn test_superseded_file_is_rewritten() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = open_primary(invalid_entries_config(&temp_dir));
        put_range(&store, 0..10, "old");
        checkpoint_now(&store);
        let first_file = store.current_table().file_ids()[0];

        put_range(&store, 0..8, "new");
        checkpoint_now(&store);

        let table = store.current_table();
        assert!(!table.contains(first_file));
        assert_eq!(table.file_count(), 2);
        let survivors: u64 = table.files().map(|f| f.valid_entries()).sum();
        assert_eq!(survivors, 10);

        assert_eq!(read(&store, 3), Some("new3".to_string()));
        assert_eq!(read(&store, 9), Some("old9".to_string()));
    }

    let store = open_primary(invalid_entries_config(&temp_dir));
    assert_eq!(store.count(), 10);
    assert_eq!(read(&store, 3), Some("new3".to_string()));
    assert_eq!(read(&store, 8), Some("old8".to_string()));
}

#[test]
fn test_fully_deleted_state_merges_to_nothing() {
    let temp_dir = TempDir::new().unwrap();
    {
        let config = StoreConfig::builder()
            .data_dir(temp_dir.path())
            .number_of_deltas_to_be_consolidated(1)
            .merge_policy(MergePolicy::INVALID_ENTRIES | MergePolicy::DELETED_ENTRIES)
            .merge_files_count_threshold(1)
            .number_of_invalid_entries(1)
            .build();
        let store = open_primary(config);
        put_range(&store, 0..4, "v");
        checkpoint_now(&store);
        remove_range(&store, 0..4);
        checkpoint_now(&store);

        assert_eq!(store.count(), 0);
        assert!(store.current_table().is_empty());
    }

    let store = open_primary(StoreConfig::builder().data_dir(temp_dir.path()).build());
    assert_eq!(store.count(), 0);
    assert_eq!(read(&store, 1), None);
}

#[test]
fn test_merge_with_background_consolidation() {
    let temp_dir = TempDir::new().unwrap();
    let make_config = || {
        StoreConfig::builder()
            .data_dir(temp_dir.path())
            .number_of_deltas_to_be_consolidated(1)
            .enable_background_consolidation(true)
            .merge_policy(MergePolicy::FILE_COUNT)
            .file_count_merge(FileCountMergeConfig::with_threshold(2))
            .build()
    };

    {
        let store = open_primary(make_config());
        for round in 0..5u64 {
            put_range(&store, round * 4..round * 4 + 4, &format!("r{}_", round));
            checkpoint_now(&store);
        }
        assert!(store.current_table().file_count() < 5);
        for key in 0..20u64 {
            assert_eq!(read(&store, key), Some(format!("r{}_{}", key / 4, key)));
        }
    }

    let store = open_primary(make_config());
    assert_eq!(store.count(), 20);
    for key in 0..20u64 {
        assert_eq!(read(&store, key), Some(format!("r{}_{}", key / 4, key)));
    }
}
