//! Replication Contract
//!
//! The store does not order or ship operations itself. A `Replicator`
//! assigns each committed transaction its sequence number and delivers the
//! operation record to secondaries, which feed it to `Store::apply`.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One write inside a committed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOperation<K, V> {
    Add { key: K, value: V },
    Update { key: K, value: V },
    Remove { key: K },
}

impl<K, V> StoreOperation<K, V> {
    pub fn key(&self) -> &K {
        match self {
            StoreOperation::Add { key, .. }
            | StoreOperation::Update { key, .. }
            | StoreOperation::Remove { key } => key,
        }
    }
}

/// The writes of one transaction, in the order they were made
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord<K, V> {
    pub operations: Vec<StoreOperation<K, V>>,
}

impl<K, V> OperationRecord<K, V> {
    pub fn new(operations: Vec<StoreOperation<K, V>>) -> Self {
        Self { operations }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Replica role, as handed down by the replication layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    None,
    Primary,
    ActiveSecondary,
    IdleSecondary,
}

impl Role {
    pub fn can_write(self) -> bool {
        self == Role::Primary
    }

    pub fn can_read(self) -> bool {
        matches!(self, Role::Primary | Role::ActiveSecondary)
    }
}

/// Why an operation record is being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyContext {
    /// Delivered by replication to a secondary
    Secondary,
    /// Replayed from the log while recovering
    Recovery,
}

/// Result of applying an operation record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already reflected in the store; nothing changed
    Duplicate,
}

pub trait Replicator<K, V>: Send + Sync {
    /// Assign the commit sequence number for `record` and deliver it.
    fn replicate(&self, record: &OperationRecord<K, V>) -> Result<i64>;

    /// Highest sequence number handed out so far
    fn last_sequence_number(&self) -> i64;

    /// The store holds state as of `lsn`; never hand out a number at or below it.
    fn observe(&self, _lsn: i64) {}
}

// =============================================================================
// In-memory Replicator
// =============================================================================

/// Replicator backed by a counter and an in-memory log.
///
/// Tests use the log to drive secondaries through `Store::apply`.
pub struct InMemoryReplicator<K, V> {
    last_lsn: AtomicI64,
    log: Mutex<Vec<(i64, OperationRecord<K, V>)>>,
}

impl<K: Clone, V: Clone> InMemoryReplicator<K, V> {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Continue numbering after `last_lsn` (a reopened store)
    pub fn starting_at(last_lsn: i64) -> Self {
        Self {
            last_lsn: AtomicI64::new(last_lsn),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Hand out a sequence number without logging a record (checkpoint LSNs)
    pub fn increment_and_get(&self) -> i64 {
        self.last_lsn.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Every record logged after `lsn`, oldest first
    pub fn records_after(&self, lsn: i64) -> Vec<(i64, OperationRecord<K, V>)> {
        self.log
            .lock()
            .iter()
            .filter(|(record_lsn, _)| *record_lsn > lsn)
            .cloned()
            .collect()
    }

    pub fn records(&self) -> Vec<(i64, OperationRecord<K, V>)> {
        self.records_after(i64::MIN)
    }
}

impl<K: Clone, V: Clone> Default for InMemoryReplicator<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Replicator<K, V> for InMemoryReplicator<K, V>
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn replicate(&self, record: &OperationRecord<K, V>) -> Result<i64> {
        let mut log = self.log.lock();
        let lsn = self.last_lsn.fetch_add(1, Ordering::SeqCst) + 1;
        log.push((lsn, record.clone()));
        Ok(lsn)
    }

    fn last_sequence_number(&self) -> i64 {
        self.last_lsn.load(Ordering::SeqCst)
    }

    fn observe(&self, lsn: i64) {
        self.last_lsn.fetch_max(lsn, Ordering::SeqCst);
    }
}
