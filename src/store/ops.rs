//! Transactional operations
//!
//! Writes take the prime lock shared and the key lock exclusive, then land
//! in the transaction's write set. Nothing reaches the store until commit,
//! which replicates the operation record and installs the net writes under
//! the sequence number the replicator assigned.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::consolidation::owned_bounds;
use crate::error::{Result, TesseraError};
use crate::lock::{LockMode, LockResource};
use crate::replicator::{OperationRecord, StoreOperation};
use crate::serializer::to_bytes;
use crate::state::{RecordKind, StoreKey, StoreValue, VersionedItem};
use crate::txn::{
    net_writes, IsolationLevel, PendingWrite, ReadMode, Transaction, TransactionStatus, Versioned,
    WriteOutcome,
};

use super::{Store, StoreInner};

/// Version reported for a transaction's own uncommitted write
const PENDING_VERSION: i64 = -1;

/// A net write with its serialized value size, ready to install
pub(super) struct SizedWrite<V> {
    pub kind: RecordKind,
    pub value: Option<V>,
    pub size: u32,
}

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert `key`. Fails with `KeyExists` if the key is live, either
    /// committed or written earlier in this transaction.
    pub fn add(&self, txn: &Transaction<K, V>, key: K, value: V, timeout: Duration) -> Result<()> {
        self.check_transaction(txn)?;
        self.inner.ensure_writable()?;
        self.lock_for_write(txn, &key, timeout)?;

        let live = match txn.pending(&key) {
            Some(pending) => !pending.is_deleted(),
            None => self.inner.read_latest(&key).map_or(false, |item| !item.is_deleted()),
        };
        if live {
            return Err(TesseraError::KeyExists);
        }

        let write = PendingWrite {
            kind: RecordKind::Inserted,
            value: Some(value.clone()),
        };
        txn.record(StoreOperation::Add { key, value }, write);
        Ok(())
    }

    /// Replace the value of `key` if it exists and, when `expected_version`
    /// is given, still carries that version.
    pub fn conditional_update(
        &self,
        txn: &Transaction<K, V>,
        key: K,
        value: V,
        expected_version: Option<i64>,
        timeout: Duration,
    ) -> Result<WriteOutcome> {
        self.check_transaction(txn)?;
        self.inner.ensure_writable()?;
        self.lock_for_write(txn, &key, timeout)?;

        let (current, pending) = match self.current_version(txn, &key) {
            Some(found) => found,
            None => return Ok(WriteOutcome::KeyNotFound),
        };
        if let Some(expected) = expected_version {
            if expected != current {
                return Ok(WriteOutcome::VersionMismatch { current });
            }
        }

        let kind = match pending {
            Some(RecordKind::Inserted) => RecordKind::Inserted,
            _ => RecordKind::Updated,
        };
        let write = PendingWrite {
            kind,
            value: Some(value.clone()),
        };
        txn.record(StoreOperation::Update { key, value }, write);
        Ok(WriteOutcome::Applied)
    }

    /// Delete `key` if it exists and, when `expected_version` is given,
    /// still carries that version.
    pub fn conditional_remove(
        &self,
        txn: &Transaction<K, V>,
        key: K,
        expected_version: Option<i64>,
        timeout: Duration,
    ) -> Result<WriteOutcome> {
        self.check_transaction(txn)?;
        self.inner.ensure_writable()?;
        self.lock_for_write(txn, &key, timeout)?;

        let current = match self.current_version(txn, &key) {
            Some((current, _)) => current,
            None => return Ok(WriteOutcome::KeyNotFound),
        };
        if let Some(expected) = expected_version {
            if expected != current {
                return Ok(WriteOutcome::VersionMismatch { current });
            }
        }

        let write = PendingWrite {
            kind: RecordKind::Deleted,
            value: None,
        };
        txn.record(StoreOperation::Remove { key }, write);
        Ok(WriteOutcome::Applied)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read `key` as the transaction sees it
    pub fn conditional_get(
        &self,
        txn: &Transaction<K, V>,
        key: &K,
        timeout: Duration,
        mode: ReadMode,
    ) -> Result<Option<Versioned<V>>> {
        self.check_transaction(txn)?;
        self.inner.ensure_readable()?;
        self.read_in(txn, key, Some(timeout), mode)
    }

    /// Value of `key`, loading it from disk if it was swept
    pub fn get(&self, txn: &Transaction<K, V>, key: &K, timeout: Duration) -> Result<Option<V>> {
        Ok(self
            .conditional_get(txn, key, timeout, ReadMode::CacheResult)?
            .and_then(|versioned| versioned.value))
    }

    pub fn contains_key(&self, txn: &Transaction<K, V>, key: &K, timeout: Duration) -> Result<bool> {
        Ok(self.conditional_get(txn, key, timeout, ReadMode::Off)?.is_some())
    }

    /// Key-ordered iteration over `range` as the transaction sees it
    pub fn create_enumerator<'a, R: RangeBounds<K>>(
        &'a self,
        txn: &'a Transaction<K, V>,
        range: R,
    ) -> Result<StoreEnumerator<'a, K, V>> {
        self.check_transaction(txn)?;
        self.inner.ensure_readable()?;

        let bounds = owned_bounds(&range);
        if is_inverted(&bounds) {
            return Err(TesseraError::InvalidArgument(
                "enumeration range ends before it starts".to_string(),
            ));
        }
        // Capture visibility before collecting keys so no pinned version is missed.
        let visibility_lsn = match txn.isolation() {
            IsolationLevel::Snapshot => Some(txn.visibility_lsn()),
            IsolationLevel::ReadRepeatable => None,
        };
        let mut keys: BTreeSet<K> = self.inner.consolidation.keys_in(bounds.clone());
        keys.extend(self.inner.live_differential().keys_in(bounds.clone()));
        if let Some(visibility_lsn) = visibility_lsn {
            keys.extend(
                self.inner
                    .snapshots
                    .keys(visibility_lsn)
                    .into_iter()
                    .filter(|k| range.contains(k)),
            );
        }
        keys.extend(
            txn.state
                .lock()
                .writes
                .range(bounds)
                .map(|(k, _)| k.clone()),
        );

        Ok(StoreEnumerator {
            store: self,
            txn,
            keys: keys.into_iter(),
        })
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Replicate and install the transaction's writes.
    ///
    /// Returns the commit sequence number, which becomes the version of
    /// every key the transaction wrote.
    pub fn commit(&self, txn: &Transaction<K, V>) -> Result<i64> {
        self.check_transaction(txn)?;

        let operations = std::mem::take(&mut txn.state.lock().operations);
        if operations.is_empty() {
            let lsn = self.inner.last_committed_lsn();
            txn.finish(TransactionStatus::Committed(lsn));
            return Ok(lsn);
        }
        if let Err(e) = self.inner.ensure_writable() {
            txn.finish(TransactionStatus::Aborted);
            return Err(e);
        }

        let writes = match self.inner.size_writes(net_writes(&operations)) {
            Ok(writes) => writes,
            Err(e) => {
                txn.finish(TransactionStatus::Aborted);
                return Err(e);
            }
        };
        let record = OperationRecord::new(operations);

        let lsn = {
            let _gate = self.inner.gate.read();
            let _commit = self.inner.commit_lock.lock();
            match self.inner.replicator.replicate(&record) {
                Ok(lsn) => {
                    self.inner.install_writes(lsn, writes);
                    self.inner.last_committed_lsn.fetch_max(lsn, Ordering::SeqCst);
                    Ok(lsn)
                }
                Err(e) => Err(e),
            }
        };
        let lsn = match lsn {
            Ok(lsn) => lsn,
            Err(e) => {
                txn.finish(TransactionStatus::Aborted);
                return Err(e);
            }
        };

        debug!(txn = txn.id(), lsn, operations = record.operations.len(), "transaction committed");
        txn.finish(TransactionStatus::Committed(lsn));
        Ok(lsn)
    }

    /// Discard the transaction's writes and release its locks
    pub fn abort(&self, txn: &Transaction<K, V>) -> Result<()> {
        self.check_transaction(txn)?;
        trace!(txn = txn.id(), "transaction aborted");
        txn.finish(TransactionStatus::Aborted);
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn check_transaction(&self, txn: &Transaction<K, V>) -> Result<()> {
        self.inner.ensure_open()?;
        if !Arc::ptr_eq(&txn.store, &self.inner) {
            return Err(TesseraError::InvalidArgument(format!(
                "transaction {} belongs to another store",
                txn.id()
            )));
        }
        txn.ensure_active()
    }

    fn lock_for_write(&self, txn: &Transaction<K, V>, key: &K, timeout: Duration) -> Result<()> {
        txn.lock(LockResource::Prime, LockMode::Shared, Some(timeout))?;
        txn.lock(LockResource::key(key), LockMode::Exclusive, Some(timeout))
    }

    /// Version a conditional write compares against, and the kind of the
    /// transaction's own pending write if there is one.
    fn current_version(&self, txn: &Transaction<K, V>, key: &K) -> Option<(i64, Option<RecordKind>)> {
        match txn.pending(key) {
            Some(pending) if pending.is_deleted() => None,
            Some(pending) => Some((PENDING_VERSION, Some(pending.kind))),
            None => self
                .inner
                .read_latest(key)
                .filter(|item| !item.is_deleted())
                .map(|item| (item.version_sequence_number(), None)),
        }
    }

    /// Shared read path of `conditional_get` and the enumerator
    fn read_in(
        &self,
        txn: &Transaction<K, V>,
        key: &K,
        timeout: Option<Duration>,
        mode: ReadMode,
    ) -> Result<Option<Versioned<V>>> {
        if let Some(pending) = txn.pending(key) {
            if pending.is_deleted() {
                return Ok(None);
            }
            let value = match mode {
                ReadMode::Off => None,
                _ => pending.value,
            };
            return Ok(Some(Versioned {
                version: PENDING_VERSION,
                value,
            }));
        }

        let item = match txn.isolation() {
            IsolationLevel::Snapshot => {
                let visibility_lsn = txn.visibility_lsn();
                self.inner.read_visible(key, visibility_lsn)
            }
            IsolationLevel::ReadRepeatable => {
                txn.lock(LockResource::key(key), LockMode::Shared, timeout)?;
                self.inner.read_latest(key)
            }
        };

        match item {
            Some(item) if !item.is_deleted() => {
                let value = self.inner.load_value(key, &item, mode)?;
                Ok(Some(Versioned {
                    version: item.version_sequence_number(),
                    value,
                }))
            }
            _ => Ok(None),
        }
    }
}

impl<K: StoreKey, V: StoreValue> StoreInner<K, V> {
    /// Serialize every value once to learn its size
    pub(super) fn size_writes(
        &self,
        writes: BTreeMap<K, PendingWrite<V>>,
    ) -> Result<BTreeMap<K, SizedWrite<V>>> {
        writes
            .into_iter()
            .map(|(key, write)| {
                let size = match &write.value {
                    Some(value) => to_bytes(self.value_serializer.as_ref(), value)?.len() as u32,
                    None => 0,
                };
                Ok((
                    key,
                    SizedWrite {
                        kind: write.kind,
                        value: write.value,
                        size,
                    },
                ))
            })
            .collect()
    }

    /// Install net writes under `lsn` into the live differential.
    ///
    /// Caller holds the gate shared and the commit lock.
    pub(super) fn install_writes(&self, lsn: i64, writes: BTreeMap<K, SizedWrite<V>>) {
        let differential = self.live_differential();
        for (key, write) in writes {
            let was_live = self.read_latest(&key).map_or(false, |item| !item.is_deleted());
            let item = match write.value {
                Some(value) if write.kind != RecordKind::Deleted => {
                    VersionedItem::with_value(write.kind, lsn, value, write.size)
                }
                _ => VersionedItem::deleted(lsn),
            };
            let now_live = !item.is_deleted();

            if let Some((dropped, replaced_by)) = differential.add(key.clone(), Arc::new(item)) {
                self.snapshots
                    .preserve(&key, &dropped, replaced_by, |id| self.resolve_file(id));
            }
            self.adjust_count(was_live, now_live);
        }
    }
}

/// A range `BTreeMap::range` would reject
fn is_inverted<K: Ord>(bounds: &(Bound<K>, Bound<K>)) -> bool {
    match bounds {
        (Bound::Included(start), Bound::Included(end)) => start > end,
        (Bound::Included(start), Bound::Excluded(end))
        | (Bound::Excluded(start), Bound::Included(end)) => start > end,
        (Bound::Excluded(start), Bound::Excluded(end)) => start >= end,
        _ => false,
    }
}

// =============================================================================
// Enumerator
// =============================================================================

/// Iterator over `(key, versioned value)` in key order.
///
/// The key set is fixed when the enumerator is created; values are read
/// one key at a time through the transaction's read path.
pub struct StoreEnumerator<'a, K: StoreKey, V: StoreValue> {
    store: &'a Store<K, V>,
    txn: &'a Transaction<K, V>,
    keys: std::collections::btree_set::IntoIter<K>,
}

impl<'a, K: StoreKey, V: StoreValue> Iterator for StoreEnumerator<'a, K, V> {
    type Item = Result<(K, Versioned<V>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let timeout = self.store.inner.config.default_lock_timeout;
        for key in self.keys.by_ref() {
            match self.store.read_in(self.txn, &key, timeout, ReadMode::CacheResult) {
                Ok(Some(versioned)) => return Some(Ok((key, versioned))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
