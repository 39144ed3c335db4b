//! Merge engine
//!
//! Rewrites a set of checkpoint files into one. The files' key enumerators
//! are merged with a heap; for each key only the newest record among the
//! inputs is considered, and it is kept only if it is still the version the
//! consolidated state points at. Value bytes are copied without decoding.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Result, TesseraError};
use crate::serializer::Serializer;
use crate::state::{ConsolidatedState, StoreKey, StoreValue, ValueLocation, VersionedItem};
use crate::storage::{
    CheckpointFile, CheckpointFileWriter, FileMetadata, KeyRecord, MetadataManager, MetadataTable,
};

/// Inputs of one merge
pub struct MergeRequest<'a, K, V> {
    /// Files to rewrite
    pub files: Vec<Arc<FileMetadata>>,
    /// Table the files were selected from
    pub table: &'a MetadataTable,
    /// State after consolidation; decides which records are still live
    pub consolidated: &'a ConsolidatedState<K, V>,
    pub key_serializer: &'a dyn Serializer<K>,
    /// Oldest visibility of any open snapshot reader
    pub oldest_snapshot_lsn: Option<i64>,
    pub cancel: &'a AtomicBool,
}

/// What a merge produced
pub struct MergeOutput<K, V> {
    /// None when no record survived
    pub merged_file: Option<Arc<FileMetadata>>,
    pub removed_file_ids: Vec<u32>,
    /// Consolidated entries that now point into the merged file
    pub relocations: Vec<(K, Arc<VersionedItem<V>>)>,
    /// Deletion markers no longer on disk; the consolidated state drops them too
    pub dropped_deletions: Vec<(K, i64)>,
}

struct Cursor<K> {
    key: K,
    record: KeyRecord,
    source: usize,
}

impl<K: Ord> PartialEq for Cursor<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl<K: Ord> Eq for Cursor<K> {}

impl<K: Ord> PartialOrd for Cursor<K> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for Cursor<K> {
    // BinaryHeap pops the greatest: smallest key first, then highest lsn.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.record.lsn.cmp(&other.record.lsn))
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merge `request.files` into a single new checkpoint file.
pub fn merge_files<K, V>(
    manager: &MetadataManager,
    request: MergeRequest<'_, K, V>,
) -> Result<MergeOutput<K, V>>
where
    K: StoreKey,
    V: StoreValue,
{
    let MergeRequest {
        files,
        table,
        consolidated,
        key_serializer,
        oldest_snapshot_lsn,
        cancel,
    } = request;

    let merge_set: HashSet<u32> = files.iter().map(|f| f.file_id()).collect();
    let file_id = manager.allocate_file_id();
    let name = manager.new_file_name(file_id);
    let timestamp = files
        .iter()
        .map(|f| f.logical_timestamp())
        .max()
        .unwrap_or(0);

    debug!(
        file_id,
        inputs = ?merge_set,
        "merging checkpoint files"
    );

    let mut writer = CheckpointFileWriter::create(manager.checkpoint_dir(), &name, timestamp)?;
    let outcome = write_merged(
        &mut writer,
        file_id,
        &files,
        &merge_set,
        table,
        consolidated,
        key_serializer,
        oldest_snapshot_lsn,
        cancel,
    );

    let (relocations, dropped_deletions, live) = match outcome {
        Ok(result) => result,
        Err(e) => {
            writer.abandon();
            return Err(e);
        }
    };

    let removed_file_ids: Vec<u32> = files.iter().map(|f| f.file_id()).collect();

    if writer.entry_count() == 0 {
        writer.abandon();
        info!(removed = ?removed_file_ids, "merge produced no surviving entries");
        return Ok(MergeOutput {
            merged_file: None,
            removed_file_ids,
            relocations,
            dropped_deletions,
        });
    }

    let info = writer.finish()?;
    let checkpoint = CheckpointFile::open(manager.checkpoint_dir(), &info.name)?;
    let merged = Arc::new(FileMetadata::new(file_id, checkpoint, live));

    info!(
        file_id,
        entries = info.entry_count,
        deleted = info.deleted_count,
        bytes = info.size_bytes,
        removed = ?removed_file_ids,
        "merge complete"
    );

    Ok(MergeOutput {
        merged_file: Some(merged),
        removed_file_ids,
        relocations,
        dropped_deletions,
    })
}

/// Relocated live entries, dropped deletion markers, live entry count
type MergedEntries<K, V> = (Vec<(K, Arc<VersionedItem<V>>)>, Vec<(K, i64)>, u64);

#[allow(clippy::too_many_arguments)]
fn write_merged<K, V>(
    writer: &mut CheckpointFileWriter,
    file_id: u32,
    files: &[Arc<FileMetadata>],
    merge_set: &HashSet<u32>,
    table: &MetadataTable,
    consolidated: &ConsolidatedState<K, V>,
    key_serializer: &dyn Serializer<K>,
    oldest_snapshot_lsn: Option<i64>,
    cancel: &AtomicBool,
) -> Result<MergedEntries<K, V>>
where
    K: StoreKey,
    V: StoreValue,
{
    let mut sources = Vec::with_capacity(files.len());
    let mut heap = BinaryHeap::new();
    for (source, file) in files.iter().enumerate() {
        let mut records = file.checkpoint().key_records()?;
        if let Some(record) = records.next() {
            let record = record?;
            let key = key_serializer.read(&record.key)?;
            heap.push(Cursor { key, record, source });
        }
        sources.push(records);
    }

    let mut relocations = Vec::new();
    let mut dropped_deletions = Vec::new();
    let mut live = 0u64;
    let mut last_key: Option<K> = None;

    while let Some(cursor) = heap.pop() {
        if cancel.load(Ordering::Relaxed) {
            return Err(TesseraError::Cancelled("merge".to_string()));
        }

        if let Some(next) = sources[cursor.source].next() {
            let record = next?;
            let key = key_serializer.read(&record.key)?;
            heap.push(Cursor {
                key,
                record,
                source: cursor.source,
            });
        }

        // Older duplicates of a key already handled
        if last_key.as_ref() == Some(&cursor.key) {
            continue;
        }
        last_key = Some(cursor.key.clone());

        let source_file = &files[cursor.source];
        let record = &cursor.record;

        match consolidated.read(&cursor.key) {
            Some(item) if item.is_deleted() => {
                // Only the marker itself is kept; older values it shadows go.
                if !record.is_deleted() || item.version_sequence_number() != record.lsn {
                    continue;
                }
                if keep_deletion(record.lsn, source_file, merge_set, table, oldest_snapshot_lsn) {
                    writer.add_deleted(&record.key, record.lsn)?;
                } else {
                    dropped_deletions.push((cursor.key, record.lsn));
                }
            }
            Some(item) => {
                let is_live_here = !record.is_deleted()
                    && item.version_sequence_number() == record.lsn
                    && item.location().map(|l| l.file_id) == Some(source_file.file_id());
                if !is_live_here {
                    continue;
                }
                let location = record.location(source_file.file_id()).ok_or_else(|| {
                    TesseraError::Corruption("live record without value".to_string())
                })?;
                let bytes = source_file.checkpoint().read_value(&location)?;
                let written = writer.add_value(&record.key, record.kind, record.lsn, &bytes)?;
                let relocated = item.relocated(ValueLocation {
                    file_id,
                    offset: written.offset,
                    length: written.length,
                    crc: written.crc,
                });
                relocations.push((cursor.key, Arc::new(relocated)));
                live += 1;
            }
            None => {
                if record.is_deleted()
                    && keep_deletion(record.lsn, source_file, merge_set, table, oldest_snapshot_lsn)
                {
                    writer.add_deleted(&record.key, record.lsn)?;
                }
            }
        }
    }

    Ok((relocations, dropped_deletions, live))
}

/// A deletion marker survives while an older file outside the merge may
/// still hold a value it shadows, or while a snapshot reader may be older
/// than the deletion.
fn keep_deletion(
    lsn: i64,
    source: &FileMetadata,
    merge_set: &HashSet<u32>,
    table: &MetadataTable,
    oldest_snapshot_lsn: Option<i64>,
) -> bool {
    if oldest_snapshot_lsn.map_or(false, |oldest| lsn >= oldest) {
        return true;
    }
    table.files().any(|f| {
        !merge_set.contains(&f.file_id()) && f.logical_timestamp() < source.logical_timestamp()
    })
}
