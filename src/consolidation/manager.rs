//! Consolidation Manager
//!
//! Holds the aggregated read view below the live differential: the frozen
//! delta generations (oldest first) and the consolidated state. Consolidation
//! folds the deltas into a new consolidated state built off to the side; the
//! new state is installed in one swap, so a failed or cancelled
//! consolidation leaves the old one untouched.

use std::collections::{BTreeSet, HashMap};
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, TesseraError};
use crate::state::{
    ConsolidatedState, DifferentialState, SnapshotContainer, StoreKey, StoreValue, VersionedItem,
    Visibility,
};
use crate::storage::FileMetadata;

/// Deltas plus consolidated state, as seen at one moment
pub struct AggregatedState<K, V> {
    pub deltas: Vec<Arc<DifferentialState<K, V>>>,
    pub consolidated: Arc<ConsolidatedState<K, V>>,
}

impl<K, V> Clone for AggregatedState<K, V> {
    fn clone(&self) -> Self {
        Self {
            deltas: self.deltas.clone(),
            consolidated: Arc::clone(&self.consolidated),
        }
    }
}

/// A consolidated state built from a snapshot, not yet installed
pub struct ConsolidationBuild<K, V> {
    pub consolidated: Arc<ConsolidatedState<K, V>>,
    /// Number of leading deltas folded in
    pub consumed_deltas: usize,
    /// file id -> entries of that file superseded by this consolidation
    pub invalidated: HashMap<u32, u64>,
}

/// Check for cancellation every this many keys
const CANCEL_CHECK_INTERVAL: usize = 1024;

pub struct ConsolidationManager<K, V> {
    state: RwLock<AggregatedState<K, V>>,
    number_of_deltas_to_be_consolidated: usize,
}

impl<K: StoreKey, V: StoreValue> ConsolidationManager<K, V> {
    pub fn new(number_of_deltas_to_be_consolidated: usize) -> Self {
        Self::with_consolidated(number_of_deltas_to_be_consolidated, ConsolidatedState::new())
    }

    pub fn with_consolidated(
        number_of_deltas_to_be_consolidated: usize,
        consolidated: ConsolidatedState<K, V>,
    ) -> Self {
        Self {
            state: RwLock::new(AggregatedState {
                deltas: Vec::new(),
                consolidated: Arc::new(consolidated),
            }),
            number_of_deltas_to_be_consolidated,
        }
    }

    // =========================================================================
    // Deltas
    // =========================================================================

    /// Add a newly frozen generation
    pub fn append_delta(&self, delta: Arc<DifferentialState<K, V>>) {
        self.state.write().deltas.push(delta);
    }

    /// Newest frozen generation
    pub fn last_delta(&self) -> Option<Arc<DifferentialState<K, V>>> {
        self.state.read().deltas.last().cloned()
    }

    pub fn delta_count(&self) -> usize {
        self.state.read().deltas.len()
    }

    /// Enough deltas have piled up for a consolidation
    pub fn should_consolidate(&self) -> bool {
        self.delta_count() >= self.number_of_deltas_to_be_consolidated
    }

    pub fn number_of_deltas_to_be_consolidated(&self) -> usize {
        self.number_of_deltas_to_be_consolidated
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn snapshot(&self) -> AggregatedState<K, V> {
        self.state.read().clone()
    }

    pub fn consolidated(&self) -> Arc<ConsolidatedState<K, V>> {
        Arc::clone(&self.state.read().consolidated)
    }

    /// Latest version of `key` below the live differential
    pub fn read(&self, key: &K) -> Option<Arc<VersionedItem<V>>> {
        let state = self.snapshot();
        for delta in state.deltas.iter().rev() {
            if let Some(item) = delta.read(key) {
                return Some(item);
            }
        }
        state.consolidated.read(key)
    }

    /// Newest version of `key` visible at `visibility_lsn`
    pub fn read_visible(&self, key: &K, visibility_lsn: i64) -> Option<Arc<VersionedItem<V>>> {
        let state = self.snapshot();
        for delta in state.deltas.iter().rev() {
            match delta.read_visible(key, visibility_lsn) {
                Visibility::Visible(item) => return Some(item),
                Visibility::TooNew | Visibility::Absent => continue,
            }
        }
        state.consolidated.read_visible(key, visibility_lsn)
    }

    /// Keys known below the live differential inside `range`
    pub fn keys_in(&self, range: (Bound<K>, Bound<K>)) -> BTreeSet<K> {
        let state = self.snapshot();
        let mut keys: BTreeSet<K> = state.consolidated.keys_in(range.clone()).into_iter().collect();
        for delta in &state.deltas {
            keys.extend(delta.keys_in(range.clone()));
        }
        keys
    }

    /// Bytes of values held in memory by deltas and consolidated state
    pub fn memory_size(&self) -> i64 {
        let state = self.snapshot();
        state.consolidated.memory_size()
            + state.deltas.iter().map(|d| d.memory_size()).sum::<i64>()
    }

    // =========================================================================
    // Consolidation
    // =========================================================================

    /// Fold the deltas of `snapshot` into a new consolidated state.
    ///
    /// For each key the newest version wins. A deletion stays as a marker
    /// until a merge drops it from disk, so replayed older records for the
    /// key are still recognised as stale.
    /// Replaced versions that a registered snapshot reader may still need are
    /// pinned in `snapshots`; `resolve_file` finds the file backing them.
    pub fn consolidate<F>(
        &self,
        snapshot: &AggregatedState<K, V>,
        snapshots: &SnapshotContainer<K, V>,
        resolve_file: F,
        cancel: &AtomicBool,
    ) -> Result<ConsolidationBuild<K, V>>
    where
        F: Fn(u32) -> Option<Arc<FileMetadata>>,
    {
        let mut entries = snapshot.consolidated.to_map();
        let mut invalidated: HashMap<u32, u64> = HashMap::new();
        let mut invalidate = |item: &VersionedItem<V>| {
            if let Some(location) = item.location() {
                *invalidated.entry(location.file_id).or_insert(0) += 1;
            }
        };

        let mut processed = 0usize;
        for delta in &snapshot.deltas {
            for (key, versions) in delta.entries() {
                processed += 1;
                if processed % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                    return Err(TesseraError::Cancelled("consolidation".to_string()));
                }

                let current_lsn = versions.current.version_sequence_number();
                let oldest_new_lsn = versions
                    .previous
                    .as_ref()
                    .map(|p| p.version_sequence_number())
                    .unwrap_or(current_lsn);

                if let Some(previous) = &versions.previous {
                    snapshots.preserve(&key, previous, current_lsn, &resolve_file);
                    invalidate(previous);
                }

                let replaced = entries.insert(key.clone(), Arc::clone(&versions.current));
                if let Some(old) = replaced {
                    snapshots.preserve(&key, &old, oldest_new_lsn, &resolve_file);
                    invalidate(&old);
                }
            }
        }

        debug!(
            deltas = snapshot.deltas.len(),
            keys = entries.len(),
            "consolidated state built"
        );

        Ok(ConsolidationBuild {
            consolidated: Arc::new(ConsolidatedState::from_map(entries)),
            consumed_deltas: snapshot.deltas.len(),
            invalidated,
        })
    }

    /// Install a built state, dropping the deltas it consumed.
    ///
    /// Deltas appended after the snapshot was taken stay in place.
    pub fn reset_to(&self, build: &ConsolidationBuild<K, V>) {
        let mut state = self.state.write();
        let consumed = build.consumed_deltas.min(state.deltas.len());
        state.deltas.drain(..consumed);
        state.consolidated = Arc::clone(&build.consolidated);
    }

    /// Replace everything (recovery, copy install)
    pub fn install(&self, consolidated: ConsolidatedState<K, V>) {
        let mut state = self.state.write();
        state.deltas.clear();
        state.consolidated = Arc::new(consolidated);
    }

    /// Deltas newer than `lsn`, folded into one generation (copy install)
    pub fn deltas_newer_than(&self, lsn: i64) -> Vec<Arc<DifferentialState<K, V>>> {
        self.snapshot()
            .deltas
            .iter()
            .map(|d| Arc::new(d.retain_newer_than(lsn)))
            .filter(|d| !d.is_empty())
            .collect()
    }
}

/// Helper so callers can pass any `RangeBounds` to `keys_in`
pub(crate) fn owned_bounds<K: Clone, R: RangeBounds<K>>(range: &R) -> (Bound<K>, Bound<K>) {
    (range.start_bound().cloned(), range.end_bound().cloned())
}
