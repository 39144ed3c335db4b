//! Differential state
//!
//! Committed writes of one checkpoint generation. Each key keeps its
//! current version and the one before it so that snapshot readers
//! started before the last write can still be served.

use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::item::VersionedItem;
use super::{StoreKey, StoreValue};

/// The versions a generation keeps for one key
pub struct DifferentialVersions<V> {
    pub current: Arc<VersionedItem<V>>,
    pub previous: Option<Arc<VersionedItem<V>>>,
}

impl<V> Clone for DifferentialVersions<V> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
            previous: self.previous.clone(),
        }
    }
}

/// Outcome of a visibility-bounded read
pub enum Visibility<V> {
    /// A version at or below the visibility sequence number
    Visible(Arc<VersionedItem<V>>),
    /// The key exists here but every retained version is too new
    TooNew,
    /// The key is not in this layer
    Absent,
}

/// One generation of committed, not yet consolidated writes
pub struct DifferentialState<K, V> {
    entries: RwLock<BTreeMap<K, DifferentialVersions<V>>>,
    /// Bytes of values held in memory by this generation
    memory_size: AtomicI64,
}

impl<K: StoreKey, V: StoreValue> DifferentialState<K, V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            memory_size: AtomicI64::new(0),
        }
    }

    /// Add a new version for `key`.
    ///
    /// Returns the version that fell out of the two-slot window, if any,
    /// paired with the sequence number of the version that replaced it.
    pub fn add(&self, key: K, item: Arc<VersionedItem<V>>) -> Option<(Arc<VersionedItem<V>>, i64)> {
        let lsn = item.version_sequence_number();
        self.memory_size
            .fetch_add(item.value_size() as i64, Ordering::Relaxed);

        let mut entries = self.entries.write();
        match entries.get_mut(&key) {
            Some(versions) => {
                debug_assert!(versions.current.version_sequence_number() < lsn);
                let previous = std::mem::replace(&mut versions.current, item);
                let dropped = versions.previous.replace(previous);
                let dropped = dropped.map(|d| {
                    self.memory_size
                        .fetch_sub(d.value_size() as i64, Ordering::Relaxed);
                    let replaced_by = versions
                        .previous
                        .as_ref()
                        .map(|p| p.version_sequence_number())
                        .unwrap_or(lsn);
                    (d, replaced_by)
                });
                dropped
            }
            None => {
                entries.insert(
                    key,
                    DifferentialVersions {
                        current: item,
                        previous: None,
                    },
                );
                None
            }
        }
    }

    /// Latest version of `key` in this generation
    pub fn read(&self, key: &K) -> Option<Arc<VersionedItem<V>>> {
        self.entries.read().get(key).map(|v| Arc::clone(&v.current))
    }

    /// Newest version of `key` whose sequence number is at most `visibility_lsn`
    pub fn read_visible(&self, key: &K, visibility_lsn: i64) -> Visibility<V> {
        let entries = self.entries.read();
        let versions = match entries.get(key) {
            Some(v) => v,
            None => return Visibility::Absent,
        };
        if versions.current.version_sequence_number() <= visibility_lsn {
            return Visibility::Visible(Arc::clone(&versions.current));
        }
        match &versions.previous {
            Some(previous) if previous.version_sequence_number() <= visibility_lsn => {
                Visibility::Visible(Arc::clone(previous))
            }
            _ => Visibility::TooNew,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn memory_size(&self) -> i64 {
        self.memory_size.load(Ordering::Relaxed)
    }

    /// Key-ordered copy of the generation
    pub fn entries(&self) -> Vec<(K, DifferentialVersions<V>)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Keys of this generation inside `range`
    pub fn keys_in<R: RangeBounds<K>>(&self, range: R) -> Vec<K> {
        self.entries.read().range(range).map(|(k, _)| k.clone()).collect()
    }

    /// Fold a newer generation into this one.
    ///
    /// Used when prepare runs twice before perform. Returns the versions
    /// squeezed out, each paired with the sequence number that replaced it.
    pub fn absorb(&self, newer: &DifferentialState<K, V>) -> Vec<(K, Arc<VersionedItem<V>>, i64)> {
        let mut dropped = Vec::new();
        for (key, versions) in newer.entries() {
            if let Some(previous) = versions.previous {
                if let Some((old, replaced_by)) = self.add(key.clone(), previous) {
                    dropped.push((key.clone(), old, replaced_by));
                }
            }
            if let Some((old, replaced_by)) = self.add(key.clone(), versions.current) {
                dropped.push((key, old, replaced_by));
            }
        }
        dropped
    }

    /// Keep only versions newer than `lsn`, returning the survivors as a new generation.
    pub fn retain_newer_than(&self, lsn: i64) -> DifferentialState<K, V> {
        let survivors = DifferentialState::new();
        for (key, versions) in self.entries() {
            if let Some(previous) = versions.previous {
                if previous.version_sequence_number() > lsn {
                    survivors.add(key.clone(), previous);
                }
            }
            if versions.current.version_sequence_number() > lsn {
                survivors.add(key, versions.current);
            }
        }
        survivors
    }
}

impl<K: StoreKey, V: StoreValue> Default for DifferentialState<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
