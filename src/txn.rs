//! Transactions
//!
//! A transaction buffers its writes in a private write set until commit.
//! Reads inside the transaction see its own writes first, then committed
//! state according to the isolation level:
//!
//! - `Snapshot`: a visibility sequence number is captured at the first read
//!   and registered with the snapshot container until the transaction ends
//! - `ReadRepeatable`: every key read takes a shared lock held to the end
//!
//! Locks and snapshot registrations are released on commit, abort or drop.
//! A lock wait that times out aborts the transaction.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, TesseraError};
use crate::lock::{LockMode, LockResource};
use crate::replicator::StoreOperation;
use crate::state::{RecordKind, StoreKey, StoreValue};
use crate::store::StoreInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Snapshot,
    ReadRepeatable,
}

/// How a read treats values that sweep moved out of memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Load from disk and keep the value in memory again
    #[default]
    CacheResult,
    /// Load from disk without caching
    ReadValue,
    /// Do not read the value at all (existence and version only)
    Off,
}

/// A value together with the sequence number that wrote it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<V> {
    /// Commit sequence number, or -1 for the transaction's own pending write
    pub version: i64,
    /// `None` only when read with `ReadMode::Off`
    pub value: Option<V>,
}

/// Outcome of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    KeyNotFound,
    VersionMismatch { current: i64 },
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed(i64),
    Aborted,
}

/// Net effect of a transaction on one key
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite<V> {
    pub kind: RecordKind,
    pub value: Option<V>,
}

impl<V> PendingWrite<V> {
    pub fn is_deleted(&self) -> bool {
        self.kind == RecordKind::Deleted
    }
}

/// Fold a sequence of operations into one write per key.
///
/// An add followed by updates stays an insert; the last value wins.
pub(crate) fn net_writes<K: StoreKey, V: StoreValue>(
    operations: &[StoreOperation<K, V>],
) -> BTreeMap<K, PendingWrite<V>> {
    let mut writes: BTreeMap<K, PendingWrite<V>> = BTreeMap::new();
    for operation in operations {
        let (key, write) = match operation {
            StoreOperation::Add { key, value } => (
                key,
                PendingWrite {
                    kind: RecordKind::Inserted,
                    value: Some(value.clone()),
                },
            ),
            StoreOperation::Update { key, value } => {
                let kind = match writes.get(key) {
                    Some(previous) if previous.kind == RecordKind::Inserted => RecordKind::Inserted,
                    _ => RecordKind::Updated,
                };
                (
                    key,
                    PendingWrite {
                        kind,
                        value: Some(value.clone()),
                    },
                )
            }
            StoreOperation::Remove { key } => (
                key,
                PendingWrite {
                    kind: RecordKind::Deleted,
                    value: None,
                },
            ),
        };
        writes.insert(key.clone(), write);
    }
    writes
}

pub(crate) struct TransactionState<K, V> {
    pub status: TransactionStatus,
    pub writes: BTreeMap<K, PendingWrite<V>>,
    pub operations: Vec<StoreOperation<K, V>>,
    pub locks: Vec<LockResource>,
    pub visibility_lsn: Option<i64>,
}

pub struct Transaction<K: StoreKey, V: StoreValue> {
    id: u64,
    isolation: IsolationLevel,
    pub(crate) store: Arc<StoreInner<K, V>>,
    pub(crate) state: Mutex<TransactionState<K, V>>,
}

impl<K: StoreKey, V: StoreValue> Transaction<K, V> {
    pub(crate) fn new(id: u64, isolation: IsolationLevel, store: Arc<StoreInner<K, V>>) -> Self {
        Self {
            id,
            isolation,
            store,
            state: Mutex::new(TransactionState {
                status: TransactionStatus::Active,
                writes: BTreeMap::new(),
                operations: Vec::new(),
                locks: Vec::new(),
                visibility_lsn: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    /// Number of operations buffered for commit
    pub fn operation_count(&self) -> usize {
        self.state.lock().operations.len()
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.status() {
            TransactionStatus::Active => Ok(()),
            status => Err(TesseraError::InvalidState(format!(
                "transaction {} is {:?}",
                self.id, status
            ))),
        }
    }

    /// Acquire a lock and remember it for release at the end.
    ///
    /// A timed-out wait aborts the transaction and releases what it holds.
    pub(crate) fn lock(
        &self,
        resource: LockResource,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let already_held = self.store.locks.held_mode(self.id, resource).is_some();
        if let Err(e) = self.store.locks.acquire(self.id, resource, mode, timeout) {
            if matches!(e, TesseraError::Timeout(_)) {
                self.finish(TransactionStatus::Aborted);
            }
            return Err(e);
        }
        if !already_held {
            self.state.lock().locks.push(resource);
        }
        Ok(())
    }

    /// The transaction's own pending write for `key`
    pub(crate) fn pending(&self, key: &K) -> Option<PendingWrite<V>> {
        self.state.lock().writes.get(key).cloned()
    }

    pub(crate) fn record(&self, operation: StoreOperation<K, V>, write: PendingWrite<V>) {
        let mut state = self.state.lock();
        state.writes.insert(operation.key().clone(), write);
        state.operations.push(operation);
    }

    /// Visibility sequence number for snapshot reads, registered on first use
    pub(crate) fn visibility_lsn(&self) -> i64 {
        let mut state = self.state.lock();
        if let Some(lsn) = state.visibility_lsn {
            return lsn;
        }
        let store = &self.store;
        let lsn = store.snapshots.register(|| store.last_committed_lsn());
        state.visibility_lsn = Some(lsn);
        lsn
    }

    /// Release locks and the snapshot registration and settle the status.
    pub(crate) fn finish(&self, status: TransactionStatus) {
        let (locks, visibility_lsn) = {
            let mut state = self.state.lock();
            if state.status == TransactionStatus::Active {
                state.status = status;
            }
            state.writes.clear();
            state.operations.clear();
            (std::mem::take(&mut state.locks), state.visibility_lsn.take())
        };
        self.store.locks.release_all(self.id, &locks);
        if let Some(lsn) = visibility_lsn {
            self.store.snapshots.unregister(lsn);
        }
    }
}

impl<K: StoreKey, V: StoreValue> Drop for Transaction<K, V> {
    fn drop(&mut self) {
        self.finish(TransactionStatus::Aborted);
    }
}
