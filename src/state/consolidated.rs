//! Consolidated state
//!
//! The key-ordered index built by consolidation. Entries are replaced,
//! never mutated: merge swaps in an item pointing at the merged file.

use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::item::VersionedItem;
use super::{StoreKey, StoreValue};

pub struct ConsolidatedState<K, V> {
    entries: RwLock<BTreeMap<K, Arc<VersionedItem<V>>>>,
    /// Bytes of values currently held in memory
    memory_size: AtomicI64,
}

impl<K: StoreKey, V: StoreValue> ConsolidatedState<K, V> {
    pub fn new() -> Self {
        Self::from_map(BTreeMap::new())
    }

    /// Build from a finished map, accounting for values already in memory.
    pub fn from_map(entries: BTreeMap<K, Arc<VersionedItem<V>>>) -> Self {
        let memory: i64 = entries
            .values()
            .filter(|item| item.is_in_memory())
            .map(|item| item.value_size() as i64)
            .sum();
        Self {
            entries: RwLock::new(entries),
            memory_size: AtomicI64::new(memory),
        }
    }

    pub fn read(&self, key: &K) -> Option<Arc<VersionedItem<V>>> {
        self.entries.read().get(key).cloned()
    }

    /// The entry for `key` if it is visible at `visibility_lsn`
    pub fn read_visible(&self, key: &K, visibility_lsn: i64) -> Option<Arc<VersionedItem<V>>> {
        self.read(key)
            .filter(|item| item.version_sequence_number() <= visibility_lsn)
    }

    /// Replace the entry for `key` (merge relocation, recovery)
    pub fn update(&self, key: K, item: Arc<VersionedItem<V>>) {
        let added = if item.is_in_memory() { item.value_size() as i64 } else { 0 };
        let previous = self.entries.write().insert(key, item);
        let removed = previous
            .filter(|p| p.is_in_memory())
            .map(|p| p.value_size() as i64)
            .unwrap_or(0);
        self.memory_size.fetch_add(added - removed, Ordering::Relaxed);
    }

    /// Drop the deletion marker for `key` if it is still the one at `lsn`
    pub fn remove_deleted(&self, key: &K, lsn: i64) -> bool {
        let mut entries = self.entries.write();
        let matches = entries
            .get(key)
            .map_or(false, |item| item.is_deleted() && item.version_sequence_number() == lsn);
        if matches {
            entries.remove(key);
        }
        matches
    }

    /// Entries that are not deletion markers
    pub fn live_count(&self) -> usize {
        self.entries.read().values().filter(|item| !item.is_deleted()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Clone of the whole index (cheap: values are shared)
    pub fn to_map(&self) -> BTreeMap<K, Arc<VersionedItem<V>>> {
        self.entries.read().clone()
    }

    pub fn keys_in<R: RangeBounds<K>>(&self, range: R) -> Vec<K> {
        self.entries.read().range(range).map(|(k, _)| k.clone()).collect()
    }

    /// Run `f` over every entry in key order while holding the read lock.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &Arc<VersionedItem<V>>) -> bool,
    {
        for (key, item) in self.entries.read().iter() {
            if !f(key, item) {
                break;
            }
        }
    }

    pub fn memory_size(&self) -> i64 {
        self.memory_size.load(Ordering::Relaxed)
    }

    pub(crate) fn add_memory(&self, bytes: i64) {
        self.memory_size.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl<K: StoreKey, V: StoreValue> Default for ConsolidatedState<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
