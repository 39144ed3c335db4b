//! Snapshot container
//!
//! Keeps superseded versions alive for snapshot readers. Every snapshot
//! transaction registers the visibility sequence number it reads at; a
//! version that is replaced while some registered reader could still see
//! it is copied into that reader's component, together with a reference on
//! the checkpoint file holding its value.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::storage::FileMetadata;

use super::item::VersionedItem;
use super::{StoreKey, StoreValue};

struct SnapshotComponent<K, V> {
    items: BTreeMap<K, Arc<VersionedItem<V>>>,
    /// Files whose values the pinned items may need
    files: HashMap<u32, Arc<FileMetadata>>,
}

impl<K, V> Default for SnapshotComponent<K, V> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
            files: HashMap::new(),
        }
    }
}

struct SnapshotInner<K, V> {
    /// visibility lsn -> number of open readers at it
    readers: BTreeMap<i64, usize>,
    components: BTreeMap<i64, SnapshotComponent<K, V>>,
}

pub struct SnapshotContainer<K, V> {
    inner: Mutex<SnapshotInner<K, V>>,
}

impl<K: StoreKey, V: StoreValue> SnapshotContainer<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SnapshotInner {
                readers: BTreeMap::new(),
                components: BTreeMap::new(),
            }),
        }
    }

    /// Register a reader. `capture` yields the visibility sequence number and
    /// runs under the container lock, so no version it can see is dropped
    /// between capture and registration.
    pub fn register<F: FnOnce() -> i64>(&self, capture: F) -> i64 {
        let mut inner = self.inner.lock();
        let visibility_lsn = capture();
        *inner.readers.entry(visibility_lsn).or_insert(0) += 1;
        visibility_lsn
    }

    /// Drop a reader; its component goes away with the last reader at that lsn.
    pub fn unregister(&self, visibility_lsn: i64) {
        let mut inner = self.inner.lock();
        let remaining = match inner.readers.get_mut(&visibility_lsn) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return,
        };
        if remaining == 0 {
            inner.readers.remove(&visibility_lsn);
            if let Some(component) = inner.components.remove(&visibility_lsn) {
                trace!(
                    visibility_lsn,
                    items = component.items.len(),
                    "releasing snapshot component"
                );
            }
        }
    }

    /// Oldest visibility sequence number any reader still uses
    pub fn oldest_visibility(&self) -> Option<i64> {
        self.inner.lock().readers.keys().next().copied()
    }

    pub fn reader_count(&self) -> usize {
        self.inner.lock().readers.values().sum()
    }

    /// Pin `old` for every reader in `[old.lsn, replaced_by)`.
    ///
    /// `resolve_file` looks up the file backing the value so the reference
    /// keeps it on disk as long as the component lives.
    pub fn preserve<F>(&self, key: &K, old: &Arc<VersionedItem<V>>, replaced_by: i64, resolve_file: F)
    where
        F: Fn(u32) -> Option<Arc<FileMetadata>>,
    {
        let from = old.version_sequence_number();
        if from >= replaced_by {
            return;
        }
        if self.inner.lock().readers.range(from..replaced_by).next().is_none() {
            return;
        }

        // Resolved outside the lock: the resolver may search this container.
        let file = old
            .location()
            .and_then(|location| resolve_file(location.file_id));

        let mut inner = self.inner.lock();
        let targets: Vec<i64> = inner
            .readers
            .range(from..replaced_by)
            .map(|(lsn, _)| *lsn)
            .collect();
        for visibility_lsn in targets {
            let component = inner.components.entry(visibility_lsn).or_default();
            component
                .items
                .entry(key.clone())
                .or_insert_with(|| Arc::clone(old));
            if let Some(file) = &file {
                component
                    .files
                    .entry(file.file_id())
                    .or_insert_with(|| Arc::clone(file));
            }
        }
    }

    /// Version pinned for `key` at `visibility_lsn`
    pub fn read(&self, key: &K, visibility_lsn: i64) -> Option<Arc<VersionedItem<V>>> {
        self.inner
            .lock()
            .components
            .get(&visibility_lsn)
            .and_then(|c| c.items.get(key).cloned())
    }

    /// Any pinned reference to `file_id`, across all components
    pub fn find_file(&self, file_id: u32) -> Option<Arc<FileMetadata>> {
        self.inner
            .lock()
            .components
            .values()
            .find_map(|c| c.files.get(&file_id).cloned())
    }

    /// Keys pinned at `visibility_lsn`
    pub fn keys(&self, visibility_lsn: i64) -> Vec<K> {
        self.inner
            .lock()
            .components
            .get(&visibility_lsn)
            .map(|c| c.items.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl<K: StoreKey, V: StoreValue> Default for SnapshotContainer<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
