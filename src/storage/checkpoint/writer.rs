//! Checkpoint File Writer
//!
//! Writes ordered key records and their values to a new key/value file pair.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Result, TesseraError};
use crate::state::RecordKind;

use super::{
    key_file_path, value_file_path, CheckpointFileInfo, KEY_HEADER_SIZE, KEY_MAGIC,
    VALUE_HEADER_SIZE, VALUE_MAGIC, VERSION,
};

/// Builder for a new checkpoint file pair
pub struct CheckpointFileWriter {
    name: String,
    key_path: PathBuf,
    value_path: PathBuf,
    key_writer: BufWriter<File>,
    value_writer: BufWriter<File>,
    entry_count: u64,
    deleted_count: u64,
    logical_timestamp: u64,
    /// Next write position in the value file
    value_offset: u64,
    key_hasher: crc32fast::Hasher,
    value_hasher: crc32fast::Hasher,
}

/// Position of a value just written
#[derive(Debug, Clone, Copy)]
pub struct WrittenValue {
    pub offset: u64,
    pub length: u32,
    pub crc: u32,
}

impl CheckpointFileWriter {
    /// Create both files and write their headers.
    ///
    /// Call `add_value()`/`add_deleted()` in ascending key order, then
    /// `finish()`. Dropping the writer without finishing leaves partial
    /// files behind; use `abandon()` to remove them.
    pub fn create(dir: &Path, name: &str, logical_timestamp: u64) -> Result<Self> {
        let key_path = key_file_path(dir, name);
        let value_path = value_file_path(dir, name);

        let key_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&key_path)?;
        let value_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&value_path)?;

        let mut key_writer = BufWriter::new(key_file);
        let mut value_writer = BufWriter::new(value_file);

        // Counts are placeholders, patched in finish
        key_writer.write_all(KEY_MAGIC)?;
        key_writer.write_all(&VERSION.to_le_bytes())?;
        key_writer.write_all(&0u64.to_le_bytes())?;
        key_writer.write_all(&0u64.to_le_bytes())?;
        key_writer.write_all(&logical_timestamp.to_le_bytes())?;

        value_writer.write_all(VALUE_MAGIC)?;
        value_writer.write_all(&VERSION.to_le_bytes())?;
        value_writer.write_all(&[0u8; 2])?;

        Ok(Self {
            name: name.to_string(),
            key_path,
            value_path,
            key_writer,
            value_writer,
            entry_count: 0,
            deleted_count: 0,
            logical_timestamp,
            value_offset: VALUE_HEADER_SIZE,
            key_hasher: crc32fast::Hasher::new(),
            value_hasher: crc32fast::Hasher::new(),
        })
    }

    /// Append a live key and its serialized value
    pub fn add_value(
        &mut self,
        key: &[u8],
        kind: RecordKind,
        lsn: i64,
        value: &[u8],
    ) -> Result<WrittenValue> {
        if kind == RecordKind::Deleted {
            return Err(TesseraError::InvalidArgument(
                "deleted records carry no value".to_string(),
            ));
        }
        let length = u32::try_from(value.len()).map_err(|_| {
            TesseraError::InvalidArgument(format!("value of {} bytes is too large", value.len()))
        })?;

        let offset = self.value_offset;
        let crc = crc32fast::hash(value);
        self.value_writer.write_all(value)?;
        self.value_hasher.update(value);
        self.value_offset += value.len() as u64;

        self.write_key_record(key, kind, lsn, offset, length, crc)?;
        Ok(WrittenValue { offset, length, crc })
    }

    /// Append a deletion marker
    pub fn add_deleted(&mut self, key: &[u8], lsn: i64) -> Result<()> {
        self.deleted_count += 1;
        self.write_key_record(key, RecordKind::Deleted, lsn, 0, 0, 0)
    }

    fn write_key_record(
        &mut self,
        key: &[u8],
        kind: RecordKind,
        lsn: i64,
        offset: u64,
        length: u32,
        crc: u32,
    ) -> Result<()> {
        let key_len = u32::try_from(key.len()).map_err(|_| {
            TesseraError::InvalidArgument(format!("key of {} bytes is too large", key.len()))
        })?;

        let mut record = Vec::with_capacity(super::KEY_RECORD_PREFIX + key.len());
        record.extend_from_slice(&key_len.to_le_bytes());
        record.push(kind.as_u8());
        record.extend_from_slice(&lsn.to_le_bytes());
        record.extend_from_slice(&offset.to_le_bytes());
        record.extend_from_slice(&length.to_le_bytes());
        record.extend_from_slice(&crc.to_le_bytes());
        record.extend_from_slice(key);

        self.key_writer.write_all(&record)?;
        self.key_hasher.update(&record);
        self.entry_count += 1;
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Write footers, patch the header counts and sync both files
    pub fn finish(mut self) -> Result<CheckpointFileInfo> {
        let key_crc = self.key_hasher.clone().finalize();
        self.key_writer.write_all(&key_crc.to_le_bytes())?;
        self.key_writer.write_all(&[0u8; 4])?;
        self.key_writer.flush()?;

        let value_crc = self.value_hasher.clone().finalize();
        self.value_writer.write_all(&value_crc.to_le_bytes())?;
        self.value_writer.write_all(&[0u8; 4])?;
        self.value_writer.flush()?;

        let mut key_file = self.key_writer.into_inner().map_err(|e| {
            TesseraError::Storage(format!("Failed to flush key file: {}", e))
        })?;
        key_file.seek(SeekFrom::Start(6))?; // After magic + version
        key_file.write_all(&self.entry_count.to_le_bytes())?;
        key_file.write_all(&self.deleted_count.to_le_bytes())?;
        key_file.sync_all()?;

        let value_file = self.value_writer.into_inner().map_err(|e| {
            TesseraError::Storage(format!("Failed to flush value file: {}", e))
        })?;
        value_file.sync_all()?;

        let size_bytes = key_file.metadata()?.len() + value_file.metadata()?.len();
        debug_assert!(size_bytes >= KEY_HEADER_SIZE + VALUE_HEADER_SIZE);

        Ok(CheckpointFileInfo {
            name: self.name,
            entry_count: self.entry_count,
            deleted_count: self.deleted_count,
            logical_timestamp: self.logical_timestamp,
            size_bytes,
        })
    }

    /// Discard the partially written pair
    pub fn abandon(self) {
        let CheckpointFileWriter {
            key_path,
            value_path,
            key_writer,
            value_writer,
            ..
        } = self;
        drop(key_writer);
        drop(value_writer);
        for path in [key_path, value_path] {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove abandoned checkpoint file");
            }
        }
    }
}
