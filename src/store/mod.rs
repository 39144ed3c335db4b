//! Store Module
//!
//! The transactional store that coordinates all components.
//!
//! ## Responsibilities
//! - Admit transactional reads and writes according to the replica role
//! - Drive the checkpoint state machine (prepare, perform, complete)
//! - Apply replicated operations on secondaries
//! - Produce and consume copy streams
//! - Recover the durable state on open
//!
//! ## Lock Order
//! `gate` → `checkpoint` → `commit_lock` → table slots. Row and prime locks
//! are taken by transactions before any of these.

mod apply;
mod checkpoint;
mod copy;
mod ops;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::consolidation::{ConsolidationManager, ConsolidationTask};
use crate::copy::CopyManager;
use crate::error::{Result, TesseraError};
use crate::lock::LockManager;
use crate::replicator::{InMemoryReplicator, Replicator, Role};
use crate::serializer::{BincodeSerializer, Serializer};
use crate::state::{
    ConsolidatedState, DifferentialState, SnapshotContainer, StoreKey, StoreValue, VersionedItem,
    Visibility,
};
use crate::storage::{FileMetadata, MetadataManager, MetadataTable};
use crate::sweep::{SweepManager, SweepReport};
use crate::txn::{IsolationLevel, ReadMode, Transaction};

pub use checkpoint::CheckpointPhase;
pub use ops::StoreEnumerator;

/// Lock owner used by checkpoint for the prime lock
const CHECKPOINT_LOCK_OWNER: u64 = u64::MAX;

/// Lock owner used by copy installation for the prime lock
const COPY_LOCK_OWNER: u64 = u64::MAX - 1;

/// Attempts at loading a value whose file was merged away meanwhile
const MAX_LOAD_ATTEMPTS: usize = 3;

/// Checkpoint bookkeeping, guarded by one mutex
pub(crate) struct CheckpointState<K, V> {
    phase: CheckpointPhase,
    /// A perform is running (it drops the mutex while waiting on the task)
    performing: bool,
    prepared_lsn: i64,
    /// Generation frozen by prepare, written by perform
    pending_delta: Option<Arc<DifferentialState<K, V>>>,
    task: Option<ConsolidationTask<K, V>>,
    /// Output of a finished background merge, waiting for a perform to land
    collected_files: Vec<Arc<FileMetadata>>,
    collected_removals: Vec<u32>,
    /// Files dropped from Next, deletable once Next is durable
    pending_deletions: Vec<Arc<FileMetadata>>,
}

pub(crate) struct StoreInner<K: StoreKey, V: StoreValue> {
    config: StoreConfig,
    files: MetadataManager,
    key_serializer: Arc<dyn Serializer<K>>,
    value_serializer: Arc<dyn Serializer<V>>,
    replicator: Arc<dyn Replicator<K, V>>,
    role: RwLock<Role>,
    closed: AtomicBool,

    /// Live generation receiving commits
    differential: RwLock<Arc<DifferentialState<K, V>>>,
    consolidation: ConsolidationManager<K, V>,
    pub(crate) snapshots: SnapshotContainer<K, V>,
    pub(crate) locks: LockManager,

    /// Table serving reads
    current: RwLock<Arc<MetadataTable>>,
    /// Table built by perform, installed by complete
    next: RwLock<Option<Arc<MetadataTable>>>,
    /// Merge outputs referenced by consolidated items but not yet in a table
    pending_files: RwLock<HashMap<u32, Arc<FileMetadata>>>,

    checkpoint: Mutex<CheckpointState<K, V>>,
    /// Shared by commit and apply, exclusive for prepare
    gate: RwLock<()>,
    commit_lock: Mutex<()>,
    last_committed_lsn: AtomicI64,
    count: AtomicI64,
    next_txn_id: AtomicU64,

    sweep: SweepManager,
    copy: Mutex<Option<CopyManager>>,
}

/// A transactional, replicated key-value store
pub struct Store<K: StoreKey, V: StoreValue> {
    inner: Arc<StoreInner<K, V>>,
}

impl<K, V> Store<K, V>
where
    K: StoreKey + Serialize + DeserializeOwned,
    V: StoreValue + Serialize + DeserializeOwned,
{
    /// Open or create a store with bincode serializers and an in-memory replicator
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with(
            config,
            Arc::new(BincodeSerializer::<K>::new()),
            Arc::new(BincodeSerializer::<V>::new()),
            Arc::new(InMemoryReplicator::<K, V>::new()),
        )
    }

    /// Open with bincode serializers and the given replicator
    pub fn open_with_replicator(
        config: StoreConfig,
        replicator: Arc<dyn Replicator<K, V>>,
    ) -> Result<Self> {
        Self::open_with(
            config,
            Arc::new(BincodeSerializer::<K>::new()),
            Arc::new(BincodeSerializer::<V>::new()),
            replicator,
        )
    }
}

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    /// Open or create a store
    ///
    /// On startup:
    /// 1. Validate config and create the directory layout
    /// 2. Load the durable metadata table (or install an empty one)
    /// 3. Rebuild the consolidated state from the checkpoint files
    /// 4. Delete files no table references
    pub fn open_with(
        config: StoreConfig,
        key_serializer: Arc<dyn Serializer<K>>,
        value_serializer: Arc<dyn Serializer<V>>,
        replicator: Arc<dyn Replicator<K, V>>,
    ) -> Result<Self> {
        // Step 1: Validate and lay out the data directory
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let files = MetadataManager::open(&config.data_dir)?;

        let sweep = SweepManager::new(config.memory_buffer_size, config.sweep_interval);
        let inner = Arc::new(StoreInner {
            consolidation: ConsolidationManager::new(config.number_of_deltas_to_be_consolidated),
            config,
            files,
            key_serializer,
            value_serializer,
            replicator,
            role: RwLock::new(Role::None),
            closed: AtomicBool::new(false),
            differential: RwLock::new(Arc::new(DifferentialState::new())),
            snapshots: SnapshotContainer::new(),
            locks: LockManager::new(),
            current: RwLock::new(Arc::new(MetadataTable::new(0))),
            next: RwLock::new(None),
            pending_files: RwLock::new(HashMap::new()),
            checkpoint: Mutex::new(CheckpointState {
                phase: CheckpointPhase::Idle,
                performing: false,
                prepared_lsn: 0,
                pending_delta: None,
                task: None,
                collected_files: Vec::new(),
                collected_removals: Vec::new(),
                pending_deletions: Vec::new(),
            }),
            gate: RwLock::new(()),
            commit_lock: Mutex::new(()),
            last_committed_lsn: AtomicI64::new(0),
            count: AtomicI64::new(0),
            next_txn_id: AtomicU64::new(1),
            sweep,
            copy: Mutex::new(None),
        });

        // Steps 2-4: Recover
        inner.recover()?;

        info!(
            data_dir = %inner.config.data_dir.display(),
            checkpoint_lsn = inner.current_table().checkpoint_lsn(),
            files = inner.current_table().file_count(),
            keys = inner.count(),
            "store opened"
        );

        Ok(Self { inner })
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start a snapshot-isolation transaction
    pub fn begin_transaction(&self) -> Result<Transaction<K, V>> {
        self.begin_transaction_with(IsolationLevel::Snapshot)
    }

    pub fn begin_transaction_with(&self, isolation: IsolationLevel) -> Result<Transaction<K, V>> {
        self.inner.ensure_open()?;
        let id = self.inner.next_txn_id.fetch_add(1, Ordering::Relaxed);
        Ok(Transaction::new(id, isolation, Arc::clone(&self.inner)))
    }

    // =========================================================================
    // Role & Lifecycle
    // =========================================================================

    pub fn role(&self) -> Role {
        *self.inner.role.read()
    }

    /// Switch replica role; takes effect for operations admitted afterwards
    pub fn change_role(&self, role: Role) -> Result<()> {
        self.inner.ensure_open()?;
        let previous = std::mem::replace(&mut *self.inner.role.write(), role);
        info!(from = ?previous, to = ?role, "role changed");
        Ok(())
    }

    /// Stop background work. Every later call fails with `ObjectClosed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown();
        info!(data_dir = %self.inner.config.data_dir.display(), "store closed");
        Ok(())
    }

    /// Close the store and delete everything it persisted
    pub fn remove_state(&self) -> Result<()> {
        self.close()?;
        let data_dir = self.inner.config.data_dir.clone();
        if data_dir.exists() {
            fs::remove_dir_all(&data_dir)?;
        }
        info!(data_dir = %data_dir.display(), "store state removed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Evict cold values according to the memory thresholds
    pub fn sweep(&self) -> Result<SweepReport> {
        self.inner.ensure_open()?;
        let cancel = AtomicBool::new(false);
        Ok(self.inner.sweep_pass(&cancel))
    }

    /// Evict until the footprint is at most `target_bytes` or nothing is left to evict
    pub fn sweep_until_below(&self, target_bytes: u64) -> Result<SweepReport> {
        self.inner.ensure_open()?;
        let cancel = AtomicBool::new(false);
        let consolidated = self.inner.consolidation.consolidated();
        let inner = &self.inner;
        Ok(self
            .inner
            .sweep
            .sweep_until_below(&consolidated, target_bytes, || inner.memory_footprint(), &cancel))
    }

    pub fn start_background_sweep(&self) -> Result<()> {
        self.inner.ensure_open()?;
        StoreInner::start_background_sweep(&self.inner)
    }

    /// Stop the background sweep and wait for it to exit
    pub fn cancel_sweep_task(&self) {
        self.inner.sweep.cancel();
    }

    pub fn is_sweep_running(&self) -> bool {
        self.inner.sweep.is_running()
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Number of live keys
    pub fn count(&self) -> u64 {
        self.inner.count()
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.config.data_dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Table currently serving reads
    pub fn current_table(&self) -> Arc<MetadataTable> {
        self.inner.current_table()
    }

    pub fn checkpoint_lsn(&self) -> i64 {
        self.inner.current_table().checkpoint_lsn()
    }

    pub fn last_committed_lsn(&self) -> i64 {
        self.inner.last_committed_lsn()
    }

    /// Bytes of values held in memory
    pub fn memory_footprint(&self) -> u64 {
        self.inner.memory_footprint()
    }

    /// Frozen generations not yet consolidated
    pub fn delta_count(&self) -> usize {
        self.inner.consolidation.delta_count()
    }

    /// Open snapshot readers
    pub fn snapshot_reader_count(&self) -> usize {
        self.inner.snapshots.reader_count()
    }

    /// Resources some transaction or checkpoint currently holds a lock on
    pub fn locked_resources(&self) -> usize {
        self.inner.locks.locked_resources()
    }
}

impl<K: StoreKey, V: StoreValue> Drop for Store<K, V> {
    fn drop(&mut self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.shutdown();
        }
    }
}

impl<K: StoreKey, V: StoreValue> StoreInner<K, V> {
    // =========================================================================
    // Recovery
    // =========================================================================

    fn recover(&self) -> Result<()> {
        let record = self.files.load_current()?;
        let table = match record {
            None => {
                // Fresh store: an empty table makes later opens take the same path.
                let table = MetadataTable::new(0);
                self.files.install_table(&table)?;
                debug!("installed empty metadata table");
                table
            }
            Some(record) => self.files.open_table(&record)?,
        };

        let consolidated = ConsolidatedState::from_map(self.rebuild_consolidated(&table)?);
        let live = consolidated.live_count() as i64;
        self.consolidation.install(consolidated);
        self.files.trim_files(&[&table])?;

        let checkpoint_lsn = table.checkpoint_lsn();
        self.count.store(live, Ordering::SeqCst);
        self.last_committed_lsn.store(checkpoint_lsn, Ordering::SeqCst);
        self.replicator.observe(checkpoint_lsn);
        *self.current.write() = Arc::new(table);
        Ok(())
    }

    /// Build the consolidated index from the key files of `table`.
    ///
    /// For every key the record with the highest sequence number wins;
    /// a winning deletion is kept as a marker. Values stay on disk until read.
    fn rebuild_consolidated(
        &self,
        table: &MetadataTable,
    ) -> Result<BTreeMap<K, Arc<VersionedItem<V>>>> {
        let mut files: Vec<&Arc<FileMetadata>> = table.files().collect();
        files.sort_by_key(|f| f.logical_timestamp());

        let mut entries: BTreeMap<K, Arc<VersionedItem<V>>> = BTreeMap::new();
        for file in files {
            for record in file.checkpoint().key_records()? {
                let record = record?;
                let key = self.key_serializer.read(&record.key)?;
                let newer = entries
                    .get(&key)
                    .map_or(true, |existing| existing.version_sequence_number() < record.lsn);
                if newer {
                    let item = VersionedItem::on_disk(
                        record.kind,
                        record.lsn,
                        record.location(file.file_id()),
                    );
                    entries.insert(key, Arc::new(item));
                }
            }
        }
        Ok(entries)
    }

    fn shutdown(&self) {
        self.sweep.cancel();
        let task = self.checkpoint.lock().task.take();
        if let Some(task) = task {
            task.cancel();
        }
        if let Some(copy) = self.copy.lock().take() {
            copy.discard();
        }
    }

    // =========================================================================
    // Admission
    // =========================================================================

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TesseraError::ObjectClosed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.role.read().can_write() {
            return Err(TesseraError::NotPrimary);
        }
        Ok(())
    }

    fn ensure_readable(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.role.read().can_read() {
            return Err(TesseraError::NotReadable);
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub(crate) fn last_committed_lsn(&self) -> i64 {
        self.last_committed_lsn.load(Ordering::SeqCst)
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst).max(0) as u64
    }

    fn current_table(&self) -> Arc<MetadataTable> {
        Arc::clone(&self.current.read())
    }

    fn live_differential(&self) -> Arc<DifferentialState<K, V>> {
        Arc::clone(&self.differential.read())
    }

    /// Newest committed version of `key`, deleted or not
    fn read_latest(&self, key: &K) -> Option<Arc<VersionedItem<V>>> {
        self.live_differential()
            .read(key)
            .or_else(|| self.consolidation.read(key))
    }

    /// Newest version of `key` at or below `visibility_lsn`
    fn read_visible(&self, key: &K, visibility_lsn: i64) -> Option<Arc<VersionedItem<V>>> {
        if let Visibility::Visible(item) = self.live_differential().read_visible(key, visibility_lsn) {
            return Some(item);
        }
        if let Some(item) = self.snapshots.read(key, visibility_lsn) {
            return Some(item);
        }
        self.consolidation.read_visible(key, visibility_lsn)
    }

    /// Find the file behind a value location.
    ///
    /// Merge output not yet in a table comes first, then Next, then Current,
    /// then files pinned by snapshot readers.
    fn resolve_file(&self, file_id: u32) -> Option<Arc<FileMetadata>> {
        if let Some(file) = self.pending_files.read().get(&file_id) {
            return Some(Arc::clone(file));
        }
        if let Some(next) = self.next.read().as_ref() {
            if let Some(file) = next.get(file_id) {
                return Some(Arc::clone(file));
            }
        }
        if let Some(file) = self.current.read().get(file_id) {
            return Some(Arc::clone(file));
        }
        self.snapshots.find_file(file_id)
    }

    /// Value of `item`, loading it from its checkpoint file when swept
    fn load_value(&self, key: &K, item: &Arc<VersionedItem<V>>, mode: ReadMode) -> Result<Option<V>> {
        if item.is_deleted() || mode == ReadMode::Off {
            return Ok(None);
        }
        if let Some(value) = item.value() {
            return Ok(Some(value));
        }

        let mut item = Arc::clone(item);
        for _ in 0..MAX_LOAD_ATTEMPTS {
            let location = item.location().ok_or_else(|| {
                TesseraError::Storage(format!("value of {:?} is neither in memory nor on disk", key))
            })?;

            if let Some(file) = self.resolve_file(location.file_id) {
                let bytes = file.checkpoint().read_value(&location)?;
                let value = self.value_serializer.read(&bytes)?;
                if mode == ReadMode::CacheResult {
                    // Only consolidated entries are swept, so only they are re-cached.
                    let consolidated = self.consolidation.consolidated();
                    let owned = consolidated
                        .read(key)
                        .map_or(false, |entry| Arc::ptr_eq(&entry, &item));
                    if owned && item.cache_value(value.clone()) {
                        consolidated.add_memory(item.value_size() as i64);
                    }
                }
                return Ok(Some(value));
            }

            // The file was merged away after the item was read; the
            // consolidated state now points at the merged copy.
            match self.consolidation.consolidated().read(key) {
                Some(relocated)
                    if relocated.version_sequence_number() == item.version_sequence_number()
                        && !Arc::ptr_eq(&relocated, &item) =>
                {
                    if let Some(value) = relocated.value() {
                        return Ok(Some(value));
                    }
                    item = relocated;
                }
                _ => break,
            }
        }

        Err(TesseraError::Storage(format!(
            "checkpoint file holding {:?} is no longer available",
            key
        )))
    }

    // =========================================================================
    // Memory
    // =========================================================================

    fn memory_footprint(&self) -> u64 {
        let bytes = self.live_differential().memory_size() + self.consolidation.memory_size();
        bytes.max(0) as u64
    }

    fn sweep_pass(&self, cancel: &AtomicBool) -> SweepReport {
        let consolidated = self.consolidation.consolidated();
        self.sweep
            .sweep(&consolidated, || self.memory_footprint(), cancel)
    }

    fn start_background_sweep(this: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(this);
        this.sweep.start(move |cancel| {
            if let Some(inner) = weak.upgrade() {
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                let report = inner.sweep_pass(cancel);
                if report.evicted_items > 0 {
                    debug!(evicted = report.evicted_items, "background sweep pass");
                }
            }
        })
    }

    /// Count change when `key` goes from `was_live` to `now_live`
    fn adjust_count(&self, was_live: bool, now_live: bool) {
        match (was_live, now_live) {
            (false, true) => {
                self.count.fetch_add(1, Ordering::SeqCst);
            }
            (true, false) => {
                self.count.fetch_sub(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}
