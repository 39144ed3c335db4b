//! Metadata Manager
//!
//! Owns the on-disk layout of a store: the durable metadata table files and
//! the checkpoint file directory.
//!
//! ## Responsibilities
//! - Allocate file ids, file names and logical timestamps
//! - Write the next table to `metadata.tmp` and swap it in safely
//! - Load the durable table on open (falling back to the backup file)
//! - Remove checkpoint files no durable table references
//!
//! ## Metadata File Format
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ Magic: "TSMT" (4) | Version: u16 (2) | BodyLen: u32 (4)│
//! ├────────────────────────────────────────────────────────┤
//! │ Body: bincode(MetadataTableRecord)                     │
//! ├────────────────────────────────────────────────────────┤
//! │ BodyCRC: u32 (4)                                       │
//! └────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::error::{Result, TesseraError};

use super::checkpoint::{CheckpointFile, KEY_FILE_EXTENSION, VALUE_FILE_EXTENSION};
use super::checkpoint::{le_u16, le_u32};
use super::metadata::{FileMetadata, MetadataTable, MetadataTableRecord};

/// Magic bytes identifying a metadata table file
const TABLE_MAGIC: &[u8; 4] = b"TSMT";

const TABLE_VERSION: u16 = 1;

/// Magic (4) + Version (2) + BodyLen (4)
const TABLE_HEADER_SIZE: usize = 10;

/// Manages file placement for one store
///
/// ## Concurrency:
/// - `next_file_id` / `next_timestamp`: atomic counters (lock-free)
/// - Table file writes are driven by the checkpoint state machine, which
///   runs one phase at a time
pub struct MetadataManager {
    /// Root of the store
    data_dir: PathBuf,

    /// Directory holding checkpoint file pairs
    checkpoint_dir: PathBuf,

    /// Next id for new checkpoint files
    next_file_id: AtomicU32,

    /// Next logical timestamp for new checkpoint files
    next_timestamp: AtomicU64,
}

impl MetadataManager {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const CURRENT_FILENAME: &'static str = "metadata.current";
    const TMP_FILENAME: &'static str = "metadata.tmp";
    const BACKUP_FILENAME: &'static str = "metadata.bkp";
    const CHECKPOINT_DIR: &'static str = "checkpoints";
    const COPY_DIR: &'static str = "copy";

    /// Open or create the layout under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        let checkpoint_dir = data_dir.join(Self::CHECKPOINT_DIR);
        fs::create_dir_all(&checkpoint_dir)?;

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            checkpoint_dir,
            next_file_id: AtomicU32::new(1),
            next_timestamp: AtomicU64::new(1),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn copy_dir(&self) -> PathBuf {
        self.data_dir.join(Self::COPY_DIR)
    }

    pub fn current_path(&self) -> PathBuf {
        self.data_dir.join(Self::CURRENT_FILENAME)
    }

    pub fn tmp_path(&self) -> PathBuf {
        self.data_dir.join(Self::TMP_FILENAME)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.data_dir.join(Self::BACKUP_FILENAME)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Next checkpoint file id (atomic, lock-free)
    pub fn allocate_file_id(&self) -> u32 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Next logical timestamp; later files always get larger values
    pub fn allocate_timestamp(&self) -> u64 {
        self.next_timestamp.fetch_add(1, Ordering::SeqCst)
    }

    /// Unique base name for a file pair.
    ///
    /// The wall-clock suffix keeps names unique across replicas, so a copied
    /// file never collides with a local file that shares its id.
    pub fn new_file_name(&self, file_id: u32) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("ckpt_{:08}_{:x}", file_id, nanos)
    }

    /// Make sure future ids and timestamps are above everything in `table`
    pub fn observe(&self, table: &MetadataTable) {
        self.next_file_id
            .fetch_max(table.max_file_id() + 1, Ordering::SeqCst);
        self.next_timestamp
            .fetch_max(table.max_logical_timestamp() + 1, Ordering::SeqCst);
    }

    pub fn next_file_id(&self) -> u32 {
        self.next_file_id.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Table Files
    // =========================================================================

    /// Encode a table into the metadata file format
    pub fn encode_table(table: &MetadataTable) -> Result<Vec<u8>> {
        Self::encode_record(&table.to_record())
    }

    pub fn encode_record(record: &MetadataTableRecord) -> Result<Vec<u8>> {
        let body = bincode::serialize(record)?;
        let body_len = u32::try_from(body.len())
            .map_err(|_| TesseraError::Storage("metadata table too large".to_string()))?;

        let mut out = Vec::with_capacity(TABLE_HEADER_SIZE + body.len() + 4);
        out.extend_from_slice(TABLE_MAGIC);
        out.extend_from_slice(&TABLE_VERSION.to_le_bytes());
        out.extend_from_slice(&body_len.to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        Ok(out)
    }

    /// Decode the metadata file format
    pub fn decode_table(bytes: &[u8]) -> Result<MetadataTableRecord> {
        if bytes.len() < TABLE_HEADER_SIZE + 4 {
            return Err(TesseraError::Corruption(format!(
                "metadata table truncated ({} bytes)",
                bytes.len()
            )));
        }
        if &bytes[0..4] != TABLE_MAGIC {
            return Err(TesseraError::Corruption(format!(
                "Invalid metadata magic: expected TSMT, got {:?}",
                &bytes[0..4]
            )));
        }
        let version = le_u16(bytes, 4);
        if version != TABLE_VERSION {
            return Err(TesseraError::Corruption(format!(
                "Unsupported metadata version: {}",
                version
            )));
        }
        let body_len = le_u32(bytes, 6) as usize;
        if bytes.len() != TABLE_HEADER_SIZE + body_len + 4 {
            return Err(TesseraError::Corruption(format!(
                "metadata body length {} does not match file size {}",
                body_len,
                bytes.len()
            )));
        }
        let body = &bytes[TABLE_HEADER_SIZE..TABLE_HEADER_SIZE + body_len];
        let stored_crc = le_u32(bytes, TABLE_HEADER_SIZE + body_len);
        if crc32fast::hash(body) != stored_crc {
            return Err(TesseraError::Corruption(
                "metadata table fails checksum".to_string(),
            ));
        }
        bincode::deserialize(body)
            .map_err(|e| TesseraError::Corruption(format!("metadata table body: {}", e)))
    }

    /// Write `table` to `path` and sync it
    pub fn write_table(&self, path: &Path, table: &MetadataTable) -> Result<()> {
        let bytes = Self::encode_table(table)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn read_table(path: &Path) -> Result<MetadataTableRecord> {
        let bytes = fs::read(path)?;
        Self::decode_table(&bytes)
    }

    /// Replace `metadata.current` with `metadata.tmp`.
    ///
    /// current -> bkp, tmp -> current, then bkp is removed. A crash at any
    /// point leaves either current or bkp holding a complete table.
    pub fn replace_current_with_tmp(&self) -> Result<()> {
        let current = self.current_path();
        let tmp = self.tmp_path();
        let backup = self.backup_path();

        if !tmp.exists() {
            return Err(TesseraError::InvalidState(
                "no prepared metadata table to install".to_string(),
            ));
        }

        if current.exists() {
            if backup.exists() {
                fs::remove_file(&backup)?;
            }
            fs::rename(&current, &backup)?;
        }
        fs::rename(&tmp, &current)?;
        self.sync_dir();

        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        Ok(())
    }

    /// Write `table` as the durable table in one step (used on first open and copy)
    pub fn install_table(&self, table: &MetadataTable) -> Result<()> {
        self.write_table(&self.tmp_path(), table)?;
        self.replace_current_with_tmp()
    }

    /// Load the durable table, if any.
    ///
    /// When only the backup exists a replace was interrupted between its two
    /// renames; the backup is the last complete table.
    pub fn load_current(&self) -> Result<Option<MetadataTableRecord>> {
        let current = self.current_path();
        let backup = self.backup_path();

        if current.exists() {
            return Self::read_table(&current).map(Some);
        }
        if backup.exists() {
            warn!(path = %backup.display(), "restoring metadata table from backup");
            fs::rename(&backup, &current)?;
            return Self::read_table(&current).map(Some);
        }
        Ok(None)
    }

    /// Read the durable table of `data_dir` without changing anything there.
    ///
    /// Falls back to the backup like `load_current` but leaves it in place.
    pub fn peek_current(data_dir: &Path) -> Result<Option<MetadataTableRecord>> {
        for name in [Self::CURRENT_FILENAME, Self::BACKUP_FILENAME] {
            let path = data_dir.join(name);
            if path.exists() {
                return Self::read_table(&path).map(Some);
            }
        }
        Ok(None)
    }

    /// Open the checkpoint files named by `record` under `data_dir` for reading
    pub fn peek_files(data_dir: &Path, record: &MetadataTableRecord) -> Result<Vec<CheckpointFile>> {
        let checkpoint_dir = data_dir.join(Self::CHECKPOINT_DIR);
        record
            .files
            .iter()
            .map(|entry| CheckpointFile::open(&checkpoint_dir, &entry.file_name))
            .collect()
    }

    /// Open every file named by `record`
    pub fn open_table(&self, record: &MetadataTableRecord) -> Result<MetadataTable> {
        let mut table = MetadataTable::new(record.checkpoint_lsn);
        for entry in &record.files {
            let checkpoint = CheckpointFile::open(&self.checkpoint_dir, &entry.file_name)
                .map_err(|e| match e {
                    TesseraError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                        TesseraError::Corruption(format!(
                            "checkpoint file {} referenced by the metadata table is missing",
                            entry.file_name
                        ))
                    }
                    other => other,
                })?;
            if checkpoint.entry_count() != entry.total_entries {
                return Err(TesseraError::Corruption(format!(
                    "checkpoint file {} holds {} entries, metadata table says {}",
                    entry.file_name,
                    checkpoint.entry_count(),
                    entry.total_entries
                )));
            }
            table.insert(Arc::new(FileMetadata::new(
                entry.file_id,
                checkpoint,
                entry.valid_entries,
            )));
        }
        self.observe(&table);
        Ok(table)
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Delete checkpoint files not referenced by any of `tables`, plus stale
    /// temporary state from an interrupted checkpoint or copy.
    pub fn trim_files(&self, tables: &[&MetadataTable]) -> Result<usize> {
        let keep: HashSet<&str> = tables
            .iter()
            .flat_map(|t| t.files().map(|f| f.file_name()))
            .collect();

        let mut removed = 0;
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            match Self::parse_file_name(&path) {
                Some(name) if keep.contains(name.as_str()) => {}
                _ => {
                    debug!(path = %path.display(), "trimming unreferenced checkpoint file");
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }

        let tmp = self.tmp_path();
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        let copy_dir = self.copy_dir();
        if copy_dir.exists() {
            fs::remove_dir_all(&copy_dir)?;
        }

        if removed > 0 {
            info!(removed, "trimmed unreferenced checkpoint files");
        }
        Ok(removed)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Base name of a checkpoint file
    /// "ckpt_00000042_17a.key" → Some("ckpt_00000042_17a")
    fn parse_file_name(path: &Path) -> Option<String> {
        let extension = path.extension()?.to_str()?;
        if extension != KEY_FILE_EXTENSION && extension != VALUE_FILE_EXTENSION {
            return None;
        }
        Some(path.file_stem()?.to_string_lossy().into_owned())
    }

    fn sync_dir(&self) {
        // Directory fsync is best effort; not every platform allows opening a directory.
        if let Ok(dir) = File::open(&self.data_dir) {
            let _ = dir.sync_all();
        }
    }
}
