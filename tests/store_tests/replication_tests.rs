//! Tests for commit ordering and replicated apply
//!
//! These tests verify:
//! - Secondaries converge by applying the primary's operation records
//! - Apply is idempotent and tolerates out of order redelivery
//! - Records covered by a checkpoint are skipped
//! - Conflicting writers wait on key locks and time out
//! - A promoted secondary continues the sequence

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tessera::{
    ApplyContext, ApplyOutcome, InMemoryReplicator, OperationRecord, Role, Store, StoreConfig,
    StoreOperation, TesseraError,
};

const TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_primary(dir: &TempDir) -> (Store<u64, String>, Arc<InMemoryReplicator<u64, String>>) {
    let replicator = Arc::new(InMemoryReplicator::new());
    let config = StoreConfig::builder().data_dir(dir.path()).build();
    let store: Store<u64, String> =
        Store::open_with_replicator(config, replicator.clone()).unwrap();
    store.change_role(Role::Primary).unwrap();
    (store, replicator)
}

fn setup_secondary(dir: &TempDir) -> Store<u64, String> {
    let config = StoreConfig::builder().data_dir(dir.path()).build();
    let store = Store::open(config).unwrap();
    store.change_role(Role::ActiveSecondary).unwrap();
    store
}

fn read(store: &Store<u64, String>, key: u64) -> Option<String> {
    let txn = store.begin_transaction().unwrap();
    store.get(&txn, &key, TIMEOUT).unwrap()
}

fn apply_all(
    secondary: &Store<u64, String>,
    records: &[(i64, OperationRecord<u64, String>)],
) -> Vec<ApplyOutcome> {
    records
        .iter()
        .map(|(lsn, record)| secondary.apply(*lsn, record, ApplyContext::Secondary).unwrap())
        .collect()
}

fn update(key: u64, value: &str) -> StoreOperation<u64, String> {
    StoreOperation::Update {
        key,
        value: value.to_string(),
    }
}

// =============================================================================
// Apply Tests
// =============================================================================

#[test]
fn test_secondary_converges_with_primary() {
    let primary_dir = TempDir::new().unwrap();
    let secondary_dir = TempDir::new().unwrap();
    let (primary, replicator) = setup_primary(&primary_dir);
    let secondary = setup_secondary(&secondary_dir);

    for key in 0..5u64 {
        let txn = primary.begin_transaction().unwrap();
        primary.add(&txn, key, format!("v{}", key), TIMEOUT).unwrap();
        primary.commit(&txn).unwrap();
    }
    let txn = primary.begin_transaction().unwrap();
    primary.conditional_remove(&txn, 1, None, TIMEOUT).unwrap();
    primary
        .conditional_update(&txn, 2, "changed".to_string(), None, TIMEOUT)
        .unwrap();
    primary.commit(&txn).unwrap();

    let outcomes = apply_all(&secondary, &replicator.records());
    assert!(outcomes.iter().all(|o| *o == ApplyOutcome::Applied));

    assert_eq!(secondary.count(), primary.count());
    assert_eq!(secondary.last_committed_lsn(), primary.last_committed_lsn());
    for key in 0..5u64 {
        assert_eq!(read(&secondary, key), read(&primary, key));
    }

    // Versions match the primary's sequence numbers
    let txn = secondary.begin_transaction().unwrap();
    let versioned = secondary
        .conditional_get(&txn, &2, TIMEOUT, tessera::ReadMode::Off)
        .unwrap()
        .unwrap();
    assert_eq!(versioned.version, 6);
}

#[test]
fn test_apply_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let secondary = setup_secondary(&dir);
    let record = OperationRecord::new(vec![StoreOperation::Add {
        key: 1,
        value: "one".to_string(),
    }]);

    let first = secondary.apply(1, &record, ApplyContext::Secondary).unwrap();
    let second = secondary.apply(1, &record, ApplyContext::Secondary).unwrap();

    assert_eq!(first, ApplyOutcome::Applied);
    assert_eq!(second, ApplyOutcome::Duplicate);
    assert_eq!(secondary.count(), 1);
}

#[test]
fn test_out_of_order_apply_keeps_newest_version() {
    let dir = TempDir::new().unwrap();
    let secondary = setup_secondary(&dir);

    let newer = OperationRecord::new(vec![update(1, "newer")]);
    let older = OperationRecord::new(vec![update(1, "older"), update(9, "nine")]);

    secondary.apply(3, &newer, ApplyContext::Secondary).unwrap();
    let outcome = secondary.apply(2, &older, ApplyContext::Secondary).unwrap();

    // Key 9 had nothing newer, so the record still applies
    assert_eq!(outcome, ApplyOutcome::Applied);
    assert_eq!(read(&secondary, 1), Some("newer".to_string()));
    assert_eq!(read(&secondary, 9), Some("nine".to_string()));
    assert_eq!(secondary.last_committed_lsn(), 3);
}

#[test]
fn test_apply_below_checkpoint_is_duplicate() {
    let dir = TempDir::new().unwrap();
    let secondary = setup_secondary(&dir);
    let record = OperationRecord::new(vec![update(1, "one")]);
    secondary.apply(4, &record, ApplyContext::Secondary).unwrap();
    secondary.checkpoint(4).unwrap();

    let replay = OperationRecord::new(vec![update(2, "two")]);
    let outcome = secondary.apply(3, &replay, ApplyContext::Secondary).unwrap();

    assert_eq!(outcome, ApplyOutcome::Duplicate);
    assert_eq!(read(&secondary, 2), None);
}

#[test]
fn test_replay_after_consolidated_delete_is_duplicate() {
    let dir = TempDir::new().unwrap();
    let open = || {
        let config = StoreConfig::builder()
            .data_dir(dir.path())
            .number_of_deltas_to_be_consolidated(1)
            .build();
        let store: Store<u64, String> = Store::open(config).unwrap();
        store.change_role(Role::ActiveSecondary).unwrap();
        store
    };
    let add = OperationRecord::new(vec![StoreOperation::Add {
        key: 7,
        value: "x".to_string(),
    }]);
    let remove = OperationRecord::new(vec![StoreOperation::Remove { key: 7 }]);

    {
        let secondary = open();
        secondary.apply(1, &add, ApplyContext::Secondary).unwrap();
        secondary.apply(2, &remove, ApplyContext::Secondary).unwrap();
        // Checkpoint lsn stays below the deletion
        secondary.checkpoint(0).unwrap();
        assert_eq!(secondary.delta_count(), 0);

        let outcome = secondary.apply(1, &add, ApplyContext::Secondary).unwrap();
        assert_eq!(outcome, ApplyOutcome::Duplicate);
        assert_eq!(read(&secondary, 7), None);
        assert_eq!(secondary.count(), 0);
    }

    // The deletion is still known after recovery
    let secondary = open();
    let outcome = secondary.apply(1, &add, ApplyContext::Secondary).unwrap();
    assert_eq!(outcome, ApplyOutcome::Duplicate);
    assert_eq!(read(&secondary, 7), None);
    assert_eq!(secondary.count(), 0);
}

#[test]
fn test_secondary_apply_on_primary_rejected() {
    let dir = TempDir::new().unwrap();
    let (primary, _replicator) = setup_primary(&dir);
    let record = OperationRecord::new(vec![update(1, "one")]);

    let result = primary.apply(1, &record, ApplyContext::Secondary);
    assert!(matches!(result, Err(TesseraError::InvalidState(_))));
}

#[test]
fn test_promoted_secondary_continues_sequence() {
    let primary_dir = TempDir::new().unwrap();
    let secondary_dir = TempDir::new().unwrap();
    let (primary, replicator) = setup_primary(&primary_dir);
    let secondary = setup_secondary(&secondary_dir);

    for key in 0..3u64 {
        let txn = primary.begin_transaction().unwrap();
        primary.add(&txn, key, "v".to_string(), TIMEOUT).unwrap();
        primary.commit(&txn).unwrap();
    }
    apply_all(&secondary, &replicator.records());

    secondary.change_role(Role::Primary).unwrap();
    let txn = secondary.begin_transaction().unwrap();
    secondary.add(&txn, 10, "after".to_string(), TIMEOUT).unwrap();
    assert_eq!(secondary.commit(&txn).unwrap(), 4);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_conflicting_add_times_out() {
    let dir = TempDir::new().unwrap();
    let (store, _replicator) = setup_primary(&dir);

    let first = store.begin_transaction().unwrap();
    store.add(&first, 5, "first".to_string(), TIMEOUT).unwrap();

    let second = store.begin_transaction().unwrap();
    let result = store.add(&second, 5, "second".to_string(), Duration::from_millis(50));
    assert!(matches!(result, Err(TesseraError::Timeout(_))));
    assert!(result.unwrap_err().is_transient());

    // The timed-out transaction is aborted and holds nothing
    assert!(!second.is_active());
    assert!(matches!(
        store.add(&second, 6, "other".to_string(), TIMEOUT),
        Err(TesseraError::InvalidState(_))
    ));

    store.commit(&first).unwrap();
    assert_eq!(store.locked_resources(), 0);

    let retry = store.begin_transaction().unwrap();
    let result = store.add(&retry, 5, "second".to_string(), TIMEOUT);
    assert!(matches!(result, Err(TesseraError::KeyExists)));
    assert_eq!(read(&store, 5), Some("first".to_string()));
}

#[test]
fn test_concurrent_commits_get_distinct_lsns() {
    let dir = TempDir::new().unwrap();
    let (store, replicator) = setup_primary(&dir);

    let mut lsns: Vec<i64> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4u64)
            .map(|worker| {
                let store = &store;
                scope.spawn(move || {
                    let mut lsns = Vec::new();
                    for i in 0..25u64 {
                        let txn = store.begin_transaction().unwrap();
                        let key = worker * 1000 + i;
                        store.add(&txn, key, format!("w{}", worker), TIMEOUT).unwrap();
                        lsns.push(store.commit(&txn).unwrap());
                    }
                    lsns
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    lsns.sort_unstable();
    lsns.dedup();
    assert_eq!(lsns.len(), 100);
    assert_eq!(store.count(), 100);
    assert_eq!(store.last_committed_lsn(), 100);
    assert_eq!(replicator.records().len(), 100);
}

#[test]
fn test_concurrent_updates_same_key_serialize() {
    let dir = TempDir::new().unwrap();
    let (store, _replicator) = setup_primary(&dir);
    let txn = store.begin_transaction().unwrap();
    store.add(&txn, 1, "0".to_string(), TIMEOUT).unwrap();
    store.commit(&txn).unwrap();

    thread::scope(|scope| {
        for _ in 0..4 {
            let store = &store;
            scope.spawn(move || {
                for _ in 0..10 {
                    let txn = store.begin_transaction().unwrap();
                    let current = store
                        .conditional_get(&txn, &1, TIMEOUT, tessera::ReadMode::CacheResult)
                        .unwrap()
                        .unwrap();
                    let next: u64 = current.value.unwrap().parse::<u64>().unwrap() + 1;
                    let outcome = store
                        .conditional_update(
                            &txn,
                            1,
                            next.to_string(),
                            Some(current.version),
                            Duration::from_secs(5),
                        )
                        .unwrap();
                    if outcome.is_applied() {
                        store.commit(&txn).unwrap();
                    } else {
                        store.abort(&txn).unwrap();
                    }
                }
            });
        }
    });

    let final_value: u64 = read(&store, 1).unwrap().parse().unwrap();
    let committed_updates = store.last_committed_lsn() - 1;
    assert_eq!(final_value as i64, committed_updates);
}
