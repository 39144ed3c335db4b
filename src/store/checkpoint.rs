//! Checkpoint Protocol
//!
//! Three steps driven by the replication layer:
//!
//! ```text
//!   Idle ──prepare(lsn)──► Prepared ──perform()──► Performed ──complete()──► Idle
//!                          │    ▲
//!                          └────┘ prepare again: fold new writes into the pending delta
//! ```
//!
//! - prepare: freeze the live differential under the exclusive gate
//! - perform: write the frozen generation to a new checkpoint file, build
//!   the Next table (folding in any merge output) and persist it as
//!   `metadata.tmp`; optionally consolidate and merge
//! - complete: swap `metadata.tmp` in as the durable table and retire
//!   files the new table no longer names
//!
//! A failed perform removes what it wrote and leaves the store Prepared.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::consolidation::{
    AggregatedState, ConsolidationBuild, ConsolidationResult, ConsolidationTask,
};
use crate::error::{Result, TesseraError};
use crate::lock::{LockManager, LockMode, LockOwner, LockResource};
use crate::merge::{merge_files, MergeHelper, MergeRequest};
use crate::serializer::to_bytes;
use crate::state::{DifferentialState, StoreKey, StoreValue, ValueLocation, VersionedItem};
use crate::storage::checkpoint::WrittenValue;
use crate::storage::{CheckpointFile, CheckpointFileWriter, FileMetadata, MetadataTable};

use super::{Store, StoreInner, CHECKPOINT_LOCK_OWNER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPhase {
    Idle,
    Prepared,
    Performed,
}

/// Prime lock held for the duration of a scope
pub(super) struct PrimeGuard<'a> {
    locks: &'a LockManager,
    owner: LockOwner,
}

impl<'a> PrimeGuard<'a> {
    pub(super) fn acquire(
        locks: &'a LockManager,
        owner: LockOwner,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Self> {
        locks.acquire(owner, LockResource::Prime, mode, Some(timeout))?;
        Ok(Self { locks, owner })
    }
}

impl Drop for PrimeGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(self.owner, LockResource::Prime);
    }
}

/// Next table, the consolidated state to install with it, and the files it dropped
type NextTable<K, V> = (
    MetadataTable,
    Option<ConsolidationBuild<K, V>>,
    Vec<Arc<FileMetadata>>,
);

impl<K: StoreKey, V: StoreValue> Store<K, V> {
    /// Freeze every write committed so far; `lsn` is the sequence number
    /// the checkpoint will be durable as of.
    pub fn prepare_checkpoint(&self, lsn: i64) -> Result<()> {
        self.inner.ensure_open()?;
        if lsn < 0 {
            return Err(TesseraError::InvalidArgument(format!(
                "checkpoint lsn {} is negative",
                lsn
            )));
        }
        self.inner.prepare(lsn)
    }

    /// Persist the prepared generation and build the Next table
    pub fn perform_checkpoint(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let task = {
            let mut state = self.inner.checkpoint.lock();
            if state.phase != CheckpointPhase::Prepared {
                return Err(TesseraError::InvalidState(format!(
                    "perform requires a prepared checkpoint, phase is {:?}",
                    state.phase
                )));
            }
            if state.performing {
                return Err(TesseraError::InvalidState(
                    "checkpoint perform already running".to_string(),
                ));
            }
            state.performing = true;
            state.task.take()
        };

        let result = StoreInner::perform(&self.inner, task);
        self.inner.checkpoint.lock().performing = false;
        result
    }

    /// Make the Next table durable and retire the files it dropped
    pub fn complete_checkpoint(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.complete()?;
        if self.inner.config.enable_sweep {
            StoreInner::start_background_sweep(&self.inner)?;
        }
        Ok(())
    }

    /// Prepare, perform and complete in one call
    pub fn checkpoint(&self, lsn: i64) -> Result<()> {
        self.prepare_checkpoint(lsn)?;
        self.perform_checkpoint()?;
        self.complete_checkpoint()
    }

    pub fn checkpoint_phase(&self) -> CheckpointPhase {
        self.inner.checkpoint.lock().phase
    }

    /// True while a background consolidation is outstanding
    pub fn has_pending_consolidation(&self) -> bool {
        self.inner.checkpoint.lock().task.is_some()
    }
}

impl<K: StoreKey, V: StoreValue> StoreInner<K, V> {
    /// Highest sequence number a checkpoint file captures
    pub(super) fn durable_lsn(&self) -> i64 {
        let current = self.current.read().checkpoint_lsn();
        match self.next.read().as_ref() {
            Some(next) => current.max(next.checkpoint_lsn()),
            None => current,
        }
    }

    // =========================================================================
    // Prepare
    // =========================================================================

    fn prepare(&self, lsn: i64) -> Result<()> {
        let _gate = self.gate.write();
        let mut state = self.checkpoint.lock();
        if state.phase == CheckpointPhase::Performed || state.performing {
            return Err(TesseraError::InvalidState(format!(
                "cannot prepare while checkpoint is {:?}",
                state.phase
            )));
        }

        let frozen = self.live_differential();
        // The frozen writes become reachable below the live differential
        // before it is swapped out, so readers never miss them.
        match state.pending_delta.clone() {
            Some(pending) if !pending.is_empty() => {
                for (key, old, replaced_by) in pending.absorb(&frozen) {
                    self.snapshots
                        .preserve(&key, &old, replaced_by, |id| self.resolve_file(id));
                }
            }
            _ => {
                if !frozen.is_empty() {
                    self.consolidation.append_delta(Arc::clone(&frozen));
                }
                state.pending_delta = Some(Arc::clone(&frozen));
            }
        }
        *self.differential.write() = Arc::new(DifferentialState::new());

        let again = state.phase == CheckpointPhase::Prepared;
        state.prepared_lsn = lsn;
        state.phase = CheckpointPhase::Prepared;

        info!(lsn, keys = frozen.len(), again, "checkpoint prepared");
        Ok(())
    }

    // =========================================================================
    // Perform
    // =========================================================================

    fn perform(this: &Arc<Self>, task: Option<ConsolidationTask<K, V>>) -> Result<()> {
        // Step 1: Land the outstanding background consolidation
        if let Some(task) = task {
            match task.wait() {
                Ok(result) => this.collect(result),
                Err(e) => warn!(error = %e, "background consolidation failed, deltas kept"),
            }
        }

        // Step 2: Hold the prime lock shared so copy install cannot interleave
        let _prime = PrimeGuard::acquire(
            &this.locks,
            CHECKPOINT_LOCK_OWNER,
            LockMode::Shared,
            this.config.checkpoint_lock_timeout,
        )?;

        let (delta, prepared_lsn, collected_files, collected_removals) = {
            let state = this.checkpoint.lock();
            (
                state.pending_delta.clone(),
                state.prepared_lsn,
                state.collected_files.clone(),
                state.collected_removals.clone(),
            )
        };

        let mut produced: Vec<Arc<FileMetadata>> = Vec::new();
        let outcome = this.build_next(
            delta.as_deref(),
            prepared_lsn,
            collected_files,
            &collected_removals,
            &mut produced,
        );

        let (next, build, removed) = match outcome {
            Ok(built) => built,
            Err(e) => {
                for file in &produced {
                    file.mark_for_deletion();
                    if let Some(delta) = &delta {
                        for (_, versions) in delta.entries() {
                            versions.current.clear_location(file.file_id());
                        }
                    }
                }
                warn!(error = %e, "checkpoint perform failed, staying prepared");
                return Err(e);
            }
        };

        // Next must be resolvable before relocated items become visible.
        let next = Arc::new(next);
        *this.next.write() = Some(Arc::clone(&next));
        if let Some(build) = &build {
            this.consolidation.reset_to(build);
        }

        let mut state = this.checkpoint.lock();
        state.pending_deletions.extend(removed);
        state.collected_files.clear();
        state.collected_removals.clear();
        state.pending_delta = None;
        state.phase = CheckpointPhase::Performed;

        info!(
            checkpoint_lsn = next.checkpoint_lsn(),
            files = next.file_count(),
            "checkpoint performed"
        );

        // Step 7: Hand the next consolidation to a background thread
        if this.config.enable_background_consolidation && this.consolidation.should_consolidate() {
            match Self::spawn_consolidation(this, Arc::clone(&next)) {
                Ok(task) => state.task = Some(task),
                Err(e) => warn!(error = %e, "failed to start background consolidation"),
            }
        }
        Ok(())
    }

    /// Steps 3-6 of perform. Every file created is pushed onto `produced`
    /// so a failure can remove it.
    fn build_next(
        &self,
        delta: Option<&DifferentialState<K, V>>,
        prepared_lsn: i64,
        collected_files: Vec<Arc<FileMetadata>>,
        collected_removals: &[u32],
        produced: &mut Vec<Arc<FileMetadata>>,
    ) -> Result<NextTable<K, V>> {
        // Step 3: Write the frozen generation
        let written = match delta {
            Some(delta) if !delta.is_empty() => self.write_delta(delta)?,
            _ => None,
        };
        if let Some(file) = &written {
            produced.push(Arc::clone(file));
        }

        // Step 4: Derive Next from Current
        let current = self.current_table();
        let mut next = (*current).clone();
        next.set_checkpoint_lsn(current.checkpoint_lsn().max(prepared_lsn));
        if let Some(file) = written {
            next.insert(file);
        }
        for file in collected_files {
            next.insert(file);
        }
        let mut removed = Vec::new();
        for file_id in collected_removals {
            if let Some(file) = next.remove(*file_id) {
                removed.push(file);
            }
        }

        // Step 5: Foreground consolidation and merge
        let mut build = None;
        if !self.config.enable_background_consolidation && self.consolidation.should_consolidate() {
            let cancel = AtomicBool::new(false);
            let snapshot = self.consolidation.snapshot();
            let result = self.consolidate_and_merge(&snapshot, &next, &cancel)?;
            if let Some(file) = &result.merged_file {
                produced.push(Arc::clone(file));
                next.insert(Arc::clone(file));
            }
            for file_id in &result.removed_file_ids {
                if let Some(file) = next.remove(*file_id) {
                    removed.push(file);
                }
            }
            build = result.build;
        }

        // Step 6: Persist Next as metadata.tmp
        self.files.write_table(&self.files.tmp_path(), &next)?;
        Ok((next, build, removed))
    }

    /// Write the current version of every key in `delta` to a new file pair
    fn write_delta(&self, delta: &DifferentialState<K, V>) -> Result<Option<Arc<FileMetadata>>> {
        let file_id = self.files.allocate_file_id();
        let name = self.files.new_file_name(file_id);
        let timestamp = self.files.allocate_timestamp();
        let mut writer = CheckpointFileWriter::create(self.files.checkpoint_dir(), &name, timestamp)?;

        let mut written = Vec::new();
        for (key, versions) in delta.entries() {
            let item = versions.current;
            let key_bytes = match to_bytes(self.key_serializer.as_ref(), &key) {
                Ok(bytes) => bytes,
                Err(e) => {
                    writer.abandon();
                    return Err(e);
                }
            };
            let outcome = if item.is_deleted() {
                writer.add_deleted(&key_bytes, item.version_sequence_number())
            } else {
                self.write_value(&mut writer, &key, &key_bytes, &item)
                    .map(|w| written.push((item, w)))
            };
            if let Err(e) = outcome {
                writer.abandon();
                return Err(e);
            }
        }

        let info = writer.finish()?;
        let checkpoint = CheckpointFile::open(self.files.checkpoint_dir(), &info.name)?;
        let file = Arc::new(FileMetadata::new(file_id, checkpoint, written.len() as u64));

        for (item, value) in written {
            item.set_location(ValueLocation {
                file_id,
                offset: value.offset,
                length: value.length,
                crc: value.crc,
            });
        }

        debug!(
            file_id,
            entries = info.entry_count,
            deleted = info.deleted_count,
            bytes = info.size_bytes,
            "checkpoint file written"
        );
        Ok(Some(file))
    }

    fn write_value(
        &self,
        writer: &mut CheckpointFileWriter,
        key: &K,
        key_bytes: &[u8],
        item: &VersionedItem<V>,
    ) -> Result<WrittenValue> {
        let value = item.value().ok_or_else(|| {
            TesseraError::Storage(format!("value of {:?} missing from its generation", key))
        })?;
        let value_bytes = to_bytes(self.value_serializer.as_ref(), &value)?;
        writer.add_value(key_bytes, item.kind(), item.version_sequence_number(), &value_bytes)
    }

    // =========================================================================
    // Consolidation & Merge
    // =========================================================================

    /// Fold the deltas of `snapshot`, then merge files of `table` if a
    /// policy fires. Merge relocations land in the built state only.
    fn consolidate_and_merge(
        &self,
        snapshot: &AggregatedState<K, V>,
        table: &MetadataTable,
        cancel: &AtomicBool,
    ) -> Result<ConsolidationResult<K, V>> {
        let build = self.consolidation.consolidate(
            snapshot,
            &self.snapshots,
            |id| table.get(id).cloned().or_else(|| self.resolve_file(id)),
            cancel,
        )?;
        for (file_id, count) in &build.invalidated {
            let file = table.get(*file_id).cloned().or_else(|| self.resolve_file(*file_id));
            if let Some(file) = file {
                file.decrement_valid_entries(*count);
            }
        }

        let selection = match MergeHelper::new(&self.config.merge).select(table) {
            Some(selection) => selection,
            None => {
                return Ok(ConsolidationResult {
                    build: Some(build),
                    merged_file: None,
                    removed_file_ids: Vec::new(),
                })
            }
        };
        let inputs: Vec<Arc<FileMetadata>> = selection
            .file_ids
            .iter()
            .filter_map(|id| table.get(*id).cloned())
            .collect();
        info!(reason = ?selection.reason, files = inputs.len(), "merge selected");

        let output = merge_files(
            &self.files,
            MergeRequest {
                files: inputs,
                table,
                consolidated: &build.consolidated,
                key_serializer: self.key_serializer.as_ref(),
                oldest_snapshot_lsn: self.snapshots.oldest_visibility(),
                cancel,
            },
        )?;
        for (key, item) in output.relocations {
            build.consolidated.update(key, item);
        }
        for (key, lsn) in output.dropped_deletions {
            build.consolidated.remove_deleted(&key, lsn);
        }

        Ok(ConsolidationResult {
            build: Some(build),
            merged_file: output.merged_file,
            removed_file_ids: output.removed_file_ids,
        })
    }

    fn spawn_consolidation(
        this: &Arc<Self>,
        table: Arc<MetadataTable>,
    ) -> Result<ConsolidationTask<K, V>> {
        let weak = Arc::downgrade(this);
        let snapshot = this.consolidation.snapshot();
        debug!(deltas = snapshot.deltas.len(), "starting background consolidation");
        ConsolidationTask::spawn(move |cancel| match weak.upgrade() {
            Some(inner) => inner.consolidate_and_merge(&snapshot, &table, cancel),
            None => Ok(ConsolidationResult::empty()),
        })
    }

    /// Install what a background consolidation produced.
    ///
    /// The merged file becomes resolvable before the state that points at
    /// it; the table changes wait for the next perform.
    fn collect(&self, result: ConsolidationResult<K, V>) {
        let ConsolidationResult {
            build,
            merged_file,
            removed_file_ids,
        } = result;
        let build = match build {
            Some(build) => build,
            None => {
                if let Some(file) = merged_file {
                    file.mark_for_deletion();
                }
                return;
            }
        };

        if let Some(file) = &merged_file {
            self.pending_files
                .write()
                .insert(file.file_id(), Arc::clone(file));
        }
        self.consolidation.reset_to(&build);

        let mut state = self.checkpoint.lock();
        state.collected_files.extend(merged_file);
        state.collected_removals.extend(removed_file_ids);
        debug!(
            merged = state.collected_files.len(),
            removed = state.collected_removals.len(),
            "background consolidation collected"
        );
    }

    // =========================================================================
    // Complete
    // =========================================================================

    fn complete(&self) -> Result<()> {
        let mut state = self.checkpoint.lock();
        if state.phase != CheckpointPhase::Performed {
            return Err(TesseraError::InvalidState(format!(
                "complete requires a performed checkpoint, phase is {:?}",
                state.phase
            )));
        }
        let next = self
            .next
            .read()
            .clone()
            .ok_or_else(|| TesseraError::InvalidState("no Next table to install".to_string()))?;

        self.files.replace_current_with_tmp()?;
        *self.current.write() = Arc::clone(&next);
        *self.next.write() = None;

        let retired = state.pending_deletions.len();
        for file in state.pending_deletions.drain(..) {
            file.mark_for_deletion();
        }
        self.pending_files
            .write()
            .retain(|file_id, _| !next.contains(*file_id));
        state.phase = CheckpointPhase::Idle;

        info!(
            checkpoint_lsn = next.checkpoint_lsn(),
            files = next.file_count(),
            retired,
            "checkpoint completed"
        );
        Ok(())
    }
}
