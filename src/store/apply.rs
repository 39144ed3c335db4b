//! Replicated apply
//!
//! Secondaries receive committed operation records from the replication
//! layer and install them under the primary's sequence numbers. Records
//! are redelivered after failover and during recovery, so apply skips
//! anything the store already reflects.

use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::error::{Result, TesseraError};
use crate::replicator::{ApplyContext, ApplyOutcome, OperationRecord};
use crate::state::{StoreKey, StoreValue};
use crate::txn::net_writes;

use super::Store;

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    /// Apply the record committed at `lsn`.
    ///
    /// Returns `Duplicate` when the record is covered by a checkpoint or
    /// every key it touches already holds a version at or above `lsn`.
    pub fn apply(
        &self,
        lsn: i64,
        record: &OperationRecord<K, V>,
        context: ApplyContext,
    ) -> Result<ApplyOutcome> {
        self.inner.ensure_open()?;
        if context == ApplyContext::Secondary && self.inner.role.read().can_write() {
            return Err(TesseraError::InvalidState(
                "replicated apply on a primary".to_string(),
            ));
        }

        if lsn <= self.inner.durable_lsn() {
            trace!(lsn, "apply covered by checkpoint");
            return Ok(ApplyOutcome::Duplicate);
        }

        let _gate = self.inner.gate.read();
        let _commit = self.inner.commit_lock.lock();

        let mut writes = net_writes(&record.operations);
        writes.retain(|key, _| {
            self.inner
                .read_latest(key)
                .map_or(true, |item| item.version_sequence_number() < lsn)
        });
        if writes.is_empty() {
            trace!(lsn, "apply already reflected");
            return Ok(ApplyOutcome::Duplicate);
        }

        let keys = writes.len();
        let writes = self.inner.size_writes(writes)?;
        self.inner.install_writes(lsn, writes);
        self.inner.last_committed_lsn.fetch_max(lsn, Ordering::SeqCst);
        self.inner.replicator.observe(lsn);

        debug!(lsn, keys, ?context, "operation record applied");
        Ok(ApplyOutcome::Applied)
    }
}
