//! Tests for snapshot isolation
//!
//! These tests verify:
//! - Snapshot readers keep seeing the state as of their first read
//! - Old versions stay readable across checkpoint, consolidation and merge
//! - Swept values of pinned versions load from retired files
//! - Snapshot enumeration is stable
//! - Read-repeatable readers block writers

use std::time::Duration;

use tempfile::TempDir;
use tessera::{
    FileCountMergeConfig, IsolationLevel, MergePolicy, ReadMode, Role, Store, StoreConfig,
    TesseraError,
};

const TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_store(config: StoreConfig) -> Store<u64, String> {
    let store = Store::open(config).unwrap();
    store.change_role(Role::Primary).unwrap();
    store
}

fn write(store: &Store<u64, String>, key: u64, value: &str) -> i64 {
    let txn = store.begin_transaction().unwrap();
    let outcome = store
        .conditional_update(&txn, key, value.to_string(), None, TIMEOUT)
        .unwrap();
    if !outcome.is_applied() {
        store.add(&txn, key, value.to_string(), TIMEOUT).unwrap();
    }
    store.commit(&txn).unwrap()
}

fn read(store: &Store<u64, String>, key: u64) -> Option<String> {
    let txn = store.begin_transaction().unwrap();
    store.get(&txn, &key, TIMEOUT).unwrap()
}

fn checkpoint_now(store: &Store<u64, String>) {
    store.checkpoint(store.last_committed_lsn()).unwrap();
}

// =============================================================================
// Isolation Tests
// =============================================================================

#[test]
fn test_snapshot_ignores_later_commits() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup_store(StoreConfig::builder().data_dir(temp_dir.path()).build());
    write(&store, 1, "old");

    let reader = store.begin_transaction().unwrap();
    assert_eq!(store.get(&reader, &1, TIMEOUT).unwrap(), Some("old".to_string()));
    assert_eq!(store.snapshot_reader_count(), 1);

    write(&store, 1, "new");
    write(&store, 2, "added");
    let remover = store.begin_transaction().unwrap();
    store.conditional_remove(&remover, 1, None, TIMEOUT).unwrap();
    store.commit(&remover).unwrap();

    assert_eq!(store.get(&reader, &1, TIMEOUT).unwrap(), Some("old".to_string()));
    assert_eq!(store.get(&reader, &2, TIMEOUT).unwrap(), None);
    assert_eq!(read(&store, 1), None);

    drop(reader);
    assert_eq!(store.snapshot_reader_count(), 0);
}

#[test]
fn test_snapshot_survives_checkpoint() {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::builder()
        .data_dir(temp_dir.path())
        .number_of_deltas_to_be_consolidated(1)
        .merge_policy(MergePolicy::NONE)
        .build();
    let store = setup_store(config);
    for key in 0..5u64 {
        write(&store, key, &format!("v1_{}", key));
    }
    checkpoint_now(&store);

    let reader = store.begin_transaction().unwrap();
    let before = store
        .conditional_get(&reader, &3, TIMEOUT, ReadMode::CacheResult)
        .unwrap()
        .unwrap();

    for key in 0..5u64 {
        write(&store, key, &format!("v2_{}", key));
    }
    checkpoint_now(&store);
    checkpoint_now(&store);

    for key in 0..5u64 {
        let versioned = store
            .conditional_get(&reader, &key, TIMEOUT, ReadMode::CacheResult)
            .unwrap()
            .unwrap();
        assert_eq!(versioned.value, Some(format!("v1_{}", key)));
        if key == 3 {
            assert_eq!(versioned.version, before.version);
        }
    }
    assert_eq!(read(&store, 3), Some("v2_3".to_string()));
}

#[test]
fn test_swept_version_readable_after_merge() {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::builder()
        .data_dir(temp_dir.path())
        .number_of_deltas_to_be_consolidated(1)
        .merge_policy(MergePolicy::FILE_COUNT)
        .file_count_merge(FileCountMergeConfig::with_threshold(2))
        .build();
    let store = setup_store(config);
    for key in 0..10u64 {
        write(&store, key, &format!("first_{}", key));
    }
    checkpoint_now(&store);
    let first_file = store.current_table().file_ids()[0];

    // Push the first generation out of memory
    let report = store.sweep_until_below(0).unwrap();
    assert!(report.evicted_items > 0);

    let reader = store.begin_transaction().unwrap();
    assert_eq!(
        store.get(&reader, &0, TIMEOUT).unwrap(),
        Some("first_0".to_string())
    );

    for key in 0..10u64 {
        write(&store, key, &format!("second_{}", key));
    }
    checkpoint_now(&store);
    assert!(!store.current_table().contains(first_file));

    for key in 0..10u64 {
        assert_eq!(
            store.get(&reader, &key, TIMEOUT).unwrap(),
            Some(format!("first_{}", key))
        );
    }
    assert_eq!(read(&store, 7), Some("second_7".to_string()));
}

#[test]
fn test_snapshot_enumeration_is_stable() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup_store(StoreConfig::builder().data_dir(temp_dir.path()).build());
    for key in 0..4u64 {
        write(&store, key, "v");
    }

    let reader = store.begin_transaction().unwrap();
    assert!(store.contains_key(&reader, &0, TIMEOUT).unwrap());

    let txn = store.begin_transaction().unwrap();
    store.conditional_remove(&txn, 1, None, TIMEOUT).unwrap();
    store.add(&txn, 10, "late".to_string(), TIMEOUT).unwrap();
    store.commit(&txn).unwrap();
    checkpoint_now(&store);

    let keys: Vec<u64> = store
        .create_enumerator(&reader, ..)
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(keys, vec![0, 1, 2, 3]);
}

#[test]
fn test_first_read_fixes_visibility() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup_store(StoreConfig::builder().data_dir(temp_dir.path()).build());
    write(&store, 1, "a");

    // Visibility is taken at the first read, not at begin
    let reader = store.begin_transaction().unwrap();
    write(&store, 1, "b");
    assert_eq!(store.get(&reader, &1, TIMEOUT).unwrap(), Some("b".to_string()));

    write(&store, 1, "c");
    assert_eq!(store.get(&reader, &1, TIMEOUT).unwrap(), Some("b".to_string()));
}

// =============================================================================
// Read Repeatable Tests
// =============================================================================

#[test]
fn test_read_repeatable_sees_latest_and_blocks_writers() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup_store(StoreConfig::builder().data_dir(temp_dir.path()).build());
    write(&store, 1, "a");

    let reader = store
        .begin_transaction_with(IsolationLevel::ReadRepeatable)
        .unwrap();
    assert_eq!(store.get(&reader, &1, TIMEOUT).unwrap(), Some("a".to_string()));
    assert_eq!(store.snapshot_reader_count(), 0);

    let writer = store.begin_transaction().unwrap();
    let result = store.conditional_update(
        &writer,
        1,
        "b".to_string(),
        None,
        Duration::from_millis(50),
    );
    assert!(matches!(result, Err(TesseraError::Timeout(_))));
    assert!(!writer.is_active());

    store.commit(&reader).unwrap();
    let writer = store.begin_transaction().unwrap();
    let outcome = store
        .conditional_update(&writer, 1, "b".to_string(), None, TIMEOUT)
        .unwrap();
    assert!(outcome.is_applied());
    store.commit(&writer).unwrap();
    assert_eq!(read(&store, 1), Some("b".to_string()));
}
