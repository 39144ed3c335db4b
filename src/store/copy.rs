//! State transfer
//!
//! The primary streams its durable table and files; the new replica
//! receives them privately and, once the stream is complete, installs
//! them in place of whatever it held. Writes newer than the copied
//! checkpoint survive the install.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::copy::{CopiedState, CopyManager, CopyStream};
use crate::error::{Result, TesseraError};
use crate::lock::LockMode;
use crate::state::{ConsolidatedState, DifferentialState, StoreKey, StoreValue};
use crate::storage::checkpoint::{key_file_path, value_file_path};
use crate::storage::{FileMetadataRecord, MetadataTable, MetadataTableRecord};

use super::checkpoint::{CheckpointPhase, PrimeGuard};
use super::{Store, StoreInner, COPY_LOCK_OWNER};

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    /// Stream of copy records describing the durable state
    pub fn get_current_state(&self) -> Result<CopyStream> {
        self.inner.ensure_open()?;
        let table = self.inner.current_table();
        info!(
            checkpoint_lsn = table.checkpoint_lsn(),
            files = table.file_count(),
            "copy stream opened"
        );
        Ok(CopyStream::new(table, self.inner.config.copy_chunk_size))
    }

    /// Start receiving a copy. A copy already in progress is discarded.
    pub fn begin_setting_current_state(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let mut copy = self.inner.copy.lock();
        if let Some(previous) = copy.take() {
            warn!("restarting copy, discarding the partial one");
            previous.discard();
        }
        *copy = Some(CopyManager::begin(self.inner.files.copy_dir())?);
        Ok(())
    }

    /// Hand over copy record `record_number`
    pub fn set_current_state(&self, record_number: u64, bytes: &[u8]) -> Result<()> {
        self.inner.ensure_open()?;
        let mut copy = self.inner.copy.lock();
        let manager = copy
            .as_mut()
            .ok_or_else(|| TesseraError::InvalidState("no copy in progress".to_string()))?;
        manager.set(record_number, bytes)
    }

    /// Install the received state.
    ///
    /// An incomplete stream fails with `CopyIncomplete` and leaves the
    /// store as it was.
    pub fn end_setting_current_state(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let manager = self
            .inner
            .copy
            .lock()
            .take()
            .ok_or_else(|| TesseraError::InvalidState("no copy in progress".to_string()))?;
        let copied = manager.finish()?;

        let result = self.inner.install_copy(&copied);
        if copied.dir.exists() {
            if let Err(e) = fs::remove_dir_all(&copied.dir) {
                warn!(dir = %copied.dir.display(), error = %e, "failed to remove copy directory");
            }
        }
        result
    }
}

impl<K: StoreKey, V: StoreValue> StoreInner<K, V> {
    fn install_copy(&self, copied: &CopiedState) -> Result<()> {
        // Step 1: Adopt the files under local ids and names
        let (record, moved) = self.adopt_copied_files(copied)?;

        // Step 2: Open and index them before touching the durable table
        let adopted = self.files.open_table(&record).and_then(|table| {
            let entries = self.rebuild_consolidated(&table)?;
            Ok((table, entries))
        });
        let (table, entries) = match adopted {
            Ok(adopted) => adopted,
            Err(e) => {
                remove_paths(&moved);
                return Err(e);
            }
        };

        // Step 3: Quiesce writers and checkpoints, then swap everything
        let _prime = match PrimeGuard::acquire(
            &self.locks,
            COPY_LOCK_OWNER,
            LockMode::Exclusive,
            self.config.checkpoint_lock_timeout,
        ) {
            Ok(guard) => guard,
            Err(e) => {
                discard_table(&table);
                return Err(e);
            }
        };
        let _gate = self.gate.write();
        let state = self.checkpoint.lock();
        if state.phase != CheckpointPhase::Idle || state.performing {
            discard_table(&table);
            return Err(TesseraError::InvalidState(format!(
                "cannot install a copy while checkpoint is {:?}",
                state.phase
            )));
        }
        if let Err(e) = self.files.install_table(&table) {
            discard_table(&table);
            return Err(e);
        }

        let copied_lsn = table.checkpoint_lsn();

        // Writes above the copied checkpoint are not in the copy.
        let deltas = self.consolidation.deltas_newer_than(copied_lsn);
        let differential = Arc::new(self.live_differential().retain_newer_than(copied_lsn));
        let consolidated = ConsolidatedState::from_map(entries);
        let live = count_live(&consolidated, &deltas, &differential);

        self.consolidation.install(consolidated);
        for delta in deltas {
            self.consolidation.append_delta(delta);
        }
        *self.differential.write() = differential;

        let previous = std::mem::replace(&mut *self.current.write(), Arc::new(table));
        for file in previous.files() {
            file.mark_for_deletion();
        }
        for (_, file) in self.pending_files.write().drain() {
            file.mark_for_deletion();
        }
        drop(state);

        self.count.store(live, Ordering::SeqCst);
        self.last_committed_lsn.fetch_max(copied_lsn, Ordering::SeqCst);
        self.replicator.observe(copied_lsn);

        info!(
            checkpoint_lsn = copied_lsn,
            files = self.current_table().file_count(),
            keys = live,
            "copied state installed"
        );
        Ok(())
    }

    /// Move every received file pair into the checkpoint directory under a
    /// freshly allocated id, returning the rewritten table record and the
    /// paths now holding the moved files.
    fn adopt_copied_files(
        &self,
        copied: &CopiedState,
    ) -> Result<(MetadataTableRecord, Vec<PathBuf>)> {
        let checkpoint_dir = self.files.checkpoint_dir();
        let mut moved = Vec::new();
        let mut files = Vec::with_capacity(copied.table.files.len());

        for entry in &copied.table.files {
            let file_id = self.files.allocate_file_id();
            let file_name = self.files.new_file_name(file_id);
            let pairs = [
                (
                    key_file_path(&copied.dir, &entry.file_name),
                    key_file_path(checkpoint_dir, &file_name),
                ),
                (
                    value_file_path(&copied.dir, &entry.file_name),
                    value_file_path(checkpoint_dir, &file_name),
                ),
            ];
            for (from, to) in pairs {
                if let Err(e) = fs::rename(&from, &to) {
                    remove_paths(&moved);
                    return Err(e.into());
                }
                moved.push(to);
            }
            debug!(from = %entry.file_name, to = %file_name, file_id, "adopted copied file");

            files.push(FileMetadataRecord {
                file_id,
                file_name,
                ..entry.clone()
            });
        }

        let record = MetadataTableRecord {
            checkpoint_lsn: copied.table.checkpoint_lsn,
            files,
        };
        Ok((record, moved))
    }
}

/// Live keys once `deltas` and `differential` are layered over `consolidated`
fn count_live<K: StoreKey, V: StoreValue>(
    consolidated: &ConsolidatedState<K, V>,
    deltas: &[Arc<DifferentialState<K, V>>],
    differential: &DifferentialState<K, V>,
) -> i64 {
    let mut live: BTreeMap<K, bool> = BTreeMap::new();
    consolidated.for_each(|key, item| {
        live.insert(key.clone(), !item.is_deleted());
        true
    });
    for layer in deltas.iter().map(|d| d.as_ref()).chain(std::iter::once(differential)) {
        for (key, versions) in layer.entries() {
            live.insert(key, !versions.current.is_deleted());
        }
    }
    live.values().filter(|alive| **alive).count() as i64
}

fn remove_paths(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove adopted copy file");
        }
    }
}

/// Drop a table that never became durable, files included
fn discard_table(table: &MetadataTable) {
    for file in table.files() {
        file.mark_for_deletion();
    }
}
