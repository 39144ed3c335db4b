//! Metadata Table
//!
//! Maps file ids to checkpoint files. Tables are immutable once built:
//! a checkpoint derives the next table from the current one and the store
//! swaps the `Arc` handle when the checkpoint completes.
//!
//! ## File lifetime
//! Every holder of a file (tables, snapshot components, copy streams,
//! in-flight value loads) owns an `Arc<FileMetadata>`. The files on disk
//! are deleted when the last `Arc` is dropped, provided the file was
//! marked deletable once no durable table needs it any more.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::checkpoint::CheckpointFile;

// =============================================================================
// File Metadata
// =============================================================================

/// One checkpoint file known to the store
pub struct FileMetadata {
    file_id: u32,
    checkpoint: CheckpointFile,
    total_entries: u64,
    /// Entries not yet superseded by a later version
    valid_entries: AtomicU64,
    deleted_entries: u64,
    logical_timestamp: u64,
    can_be_deleted: AtomicBool,
}

impl FileMetadata {
    pub fn new(file_id: u32, checkpoint: CheckpointFile, valid_entries: u64) -> Self {
        Self {
            file_id,
            total_entries: checkpoint.entry_count(),
            deleted_entries: checkpoint.deleted_count(),
            logical_timestamp: checkpoint.logical_timestamp(),
            valid_entries: AtomicU64::new(valid_entries),
            can_be_deleted: AtomicBool::new(false),
            checkpoint,
        }
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn file_name(&self) -> &str {
        self.checkpoint.name()
    }

    pub fn checkpoint(&self) -> &CheckpointFile {
        &self.checkpoint
    }

    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    pub fn valid_entries(&self) -> u64 {
        self.valid_entries.load(Ordering::Relaxed)
    }

    pub fn invalid_entries(&self) -> u64 {
        self.total_entries.saturating_sub(self.valid_entries())
    }

    pub fn deleted_entries(&self) -> u64 {
        self.deleted_entries
    }

    pub fn logical_timestamp(&self) -> u64 {
        self.logical_timestamp
    }

    pub fn size_bytes(&self) -> u64 {
        self.checkpoint.size_bytes()
    }

    /// Record that one entry of this file was superseded
    pub(crate) fn decrement_valid_entries(&self, count: u64) {
        let _ = self
            .valid_entries
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(count))
            });
    }

    /// Allow the files to be removed once the last reference goes away
    pub fn mark_for_deletion(&self) {
        self.can_be_deleted.store(true, Ordering::Release);
    }

    pub fn can_be_deleted(&self) -> bool {
        self.can_be_deleted.load(Ordering::Acquire)
    }

    /// Number of live handles on this file
    pub fn reference_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    pub(crate) fn to_record(&self) -> FileMetadataRecord {
        FileMetadataRecord {
            file_id: self.file_id,
            file_name: self.file_name().to_string(),
            total_entries: self.total_entries,
            valid_entries: self.valid_entries(),
            deleted_entries: self.deleted_entries,
            logical_timestamp: self.logical_timestamp,
            size_bytes: self.size_bytes(),
        }
    }
}

impl Drop for FileMetadata {
    fn drop(&mut self) {
        if !self.can_be_deleted() {
            return;
        }
        match self.checkpoint.delete_files() {
            Ok(()) => debug!(file_id = self.file_id, name = self.file_name(), "deleted checkpoint file"),
            Err(e) => warn!(
                file_id = self.file_id,
                name = self.file_name(),
                error = %e,
                "failed to delete checkpoint file"
            ),
        }
    }
}

impl fmt::Debug for FileMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMetadata")
            .field("file_id", &self.file_id)
            .field("name", &self.file_name())
            .field("total_entries", &self.total_entries)
            .field("valid_entries", &self.valid_entries())
            .field("deleted_entries", &self.deleted_entries)
            .field("logical_timestamp", &self.logical_timestamp)
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

// =============================================================================
// Metadata Table
// =============================================================================

/// Snapshot of the checkpoint files the store needs
#[derive(Clone, Default)]
pub struct MetadataTable {
    checkpoint_lsn: i64,
    files: BTreeMap<u32, Arc<FileMetadata>>,
}

impl MetadataTable {
    pub fn new(checkpoint_lsn: i64) -> Self {
        Self {
            checkpoint_lsn,
            files: BTreeMap::new(),
        }
    }

    /// Sequence number as of which this table is durable
    pub fn checkpoint_lsn(&self) -> i64 {
        self.checkpoint_lsn
    }

    pub fn set_checkpoint_lsn(&mut self, lsn: i64) {
        self.checkpoint_lsn = lsn;
    }

    pub fn insert(&mut self, file: Arc<FileMetadata>) {
        self.files.insert(file.file_id(), file);
    }

    pub fn remove(&mut self, file_id: u32) -> Option<Arc<FileMetadata>> {
        self.files.remove(&file_id)
    }

    pub fn get(&self, file_id: u32) -> Option<&Arc<FileMetadata>> {
        self.files.get(&file_id)
    }

    pub fn contains(&self, file_id: u32) -> bool {
        self.files.contains_key(&file_id)
    }

    /// Files in ascending id order
    pub fn files(&self) -> impl Iterator<Item = &Arc<FileMetadata>> {
        self.files.values()
    }

    pub fn file_ids(&self) -> Vec<u32> {
        self.files.keys().copied().collect()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Bytes on disk across all files
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size_bytes()).sum()
    }

    pub fn max_file_id(&self) -> u32 {
        self.files.keys().next_back().copied().unwrap_or(0)
    }

    pub fn max_logical_timestamp(&self) -> u64 {
        self.files
            .values()
            .map(|f| f.logical_timestamp())
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn to_record(&self) -> MetadataTableRecord {
        MetadataTableRecord {
            checkpoint_lsn: self.checkpoint_lsn,
            files: self.files.values().map(|f| f.to_record()).collect(),
        }
    }
}

impl fmt::Debug for MetadataTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataTable")
            .field("checkpoint_lsn", &self.checkpoint_lsn)
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Durable Records
// =============================================================================

/// On-disk form of one table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadataRecord {
    pub file_id: u32,
    pub file_name: String,
    pub total_entries: u64,
    pub valid_entries: u64,
    pub deleted_entries: u64,
    pub logical_timestamp: u64,
    pub size_bytes: u64,
}

/// On-disk form of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataTableRecord {
    pub checkpoint_lsn: i64,
    pub files: Vec<FileMetadataRecord>,
}
