//! Tests for value sweeping
//!
//! These tests verify:
//! - Footprint thresholds decide whether a sweep runs
//! - Only values with a durable copy are evicted
//! - Evicted values fault back in from checkpoint files
//! - Read modes decide whether a faulted value is cached
//! - The background sweep task starts and stops

use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tessera::{MergePolicy, ReadMode, Role, Store, StoreConfig};

const TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_store(dir: &TempDir, memory_buffer_size: u64) -> Store<u64, String> {
    let config = StoreConfig::builder()
        .data_dir(dir.path())
        .number_of_deltas_to_be_consolidated(1)
        .merge_policy(MergePolicy::NONE)
        .memory_buffer_size(memory_buffer_size)
        .build();
    let store = Store::open(config).unwrap();
    store.change_role(Role::Primary).unwrap();
    store
}

fn add_range(store: &Store<u64, String>, keys: std::ops::Range<u64>) {
    let txn = store.begin_transaction().unwrap();
    for key in keys {
        store.add(&txn, key, format!("value_{:06}", key), TIMEOUT).unwrap();
    }
    store.commit(&txn).unwrap();
}

fn checkpoint_now(store: &Store<u64, String>) {
    store.checkpoint(store.last_committed_lsn()).unwrap();
}

// =============================================================================
// Sweep Tests
// =============================================================================

#[test]
fn test_sweep_below_threshold_does_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup_store(&temp_dir, 1024 * 1024 * 1024);
    add_range(&store, 0..50);
    checkpoint_now(&store);

    let report = store.sweep().unwrap();
    assert_eq!(report.evicted_items, 0);
    assert_eq!(report.cycles, 0);
    assert_eq!(report.memory_before, report.memory_after);
}

#[test]
fn test_sweep_evicts_checkpointed_values() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup_store(&temp_dir, 1);
    add_range(&store, 0..50);
    checkpoint_now(&store);
    let before = store.memory_footprint();
    assert!(before > 0);

    let report = store.sweep().unwrap();
    assert_eq!(report.evicted_items, 50);
    assert_eq!(store.memory_footprint(), 0);
    assert_eq!(report.memory_after, 0);
}

#[test]
fn test_uncheckpointed_values_never_evicted() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup_store(&temp_dir, 1);
    add_range(&store, 0..10);
    let before = store.memory_footprint();

    let report = store.sweep_until_below(0).unwrap();
    assert_eq!(report.evicted_items, 0);
    assert_eq!(store.memory_footprint(), before);
}

#[test]
fn test_swept_values_fault_back_in() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup_store(&temp_dir, 1);
    add_range(&store, 0..20);
    checkpoint_now(&store);
    store.sweep_until_below(0).unwrap();
    assert_eq!(store.memory_footprint(), 0);

    let txn = store.begin_transaction().unwrap();
    let uncached = store
        .conditional_get(&txn, &3, TIMEOUT, ReadMode::ReadValue)
        .unwrap()
        .unwrap();
    assert_eq!(uncached.value, Some("value_000003".to_string()));
    assert_eq!(store.memory_footprint(), 0);

    let cached = store.get(&txn, &4, TIMEOUT).unwrap();
    assert_eq!(cached, Some("value_000004".to_string()));
    assert!(store.memory_footprint() > 0);

    let entries: Vec<(u64, String)> = store
        .create_enumerator(&txn, ..)
        .unwrap()
        .map(|entry| {
            let (key, versioned) = entry.unwrap();
            (key, versioned.value.unwrap())
        })
        .collect();
    assert_eq!(entries.len(), 20);
    assert_eq!(entries[19], (19, "value_000019".to_string()));
}

#[test]
fn test_swept_values_survive_later_checkpoints() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup_store(&temp_dir, 1);
    add_range(&store, 0..10);
    checkpoint_now(&store);
    store.sweep_until_below(0).unwrap();

    add_range(&store, 10..20);
    checkpoint_now(&store);

    let txn = store.begin_transaction().unwrap();
    for key in 0..20u64 {
        assert_eq!(
            store.get(&txn, &key, TIMEOUT).unwrap(),
            Some(format!("value_{:06}", key))
        );
    }
}

#[test]
fn test_recovered_store_loads_values_lazily() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = setup_store(&temp_dir, 1024 * 1024);
        add_range(&store, 0..10);
        checkpoint_now(&store);
    }

    let store = setup_store(&temp_dir, 1024 * 1024);
    assert_eq!(store.memory_footprint(), 0);
    let txn = store.begin_transaction().unwrap();
    assert_eq!(
        store.get(&txn, &5, TIMEOUT).unwrap(),
        Some("value_000005".to_string())
    );
}

// =============================================================================
// Background Task Tests
// =============================================================================

#[test]
fn test_background_sweep_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::builder()
        .data_dir(temp_dir.path())
        .number_of_deltas_to_be_consolidated(1)
        .merge_policy(MergePolicy::NONE)
        .memory_buffer_size(1)
        .enable_sweep(true)
        .sweep_interval(Duration::from_millis(10))
        .build();
    let store: Store<u64, String> = Store::open(config).unwrap();
    store.change_role(Role::Primary).unwrap();
    assert!(!store.is_sweep_running());

    add_range(&store, 0..30);
    checkpoint_now(&store);
    assert!(store.is_sweep_running());

    let mut waited = 0;
    while store.memory_footprint() > 0 && waited < 200 {
        thread::sleep(Duration::from_millis(10));
        waited += 1;
    }
    assert_eq!(store.memory_footprint(), 0);

    store.cancel_sweep_task();
    assert!(!store.is_sweep_running());
}

#[test]
fn test_close_stops_background_sweep() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup_store(&temp_dir, 1);
    store.start_background_sweep().unwrap();
    assert!(store.is_sweep_running());

    store.close().unwrap();
    assert!(!store.is_sweep_running());
}
