//! Checkpoint File Reader
//!
//! Opens an existing key/value file pair. Keys are streamed through
//! `KeyFileIterator`; values are read on demand by location.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Result, TesseraError};
use crate::state::ValueLocation;

use super::iterator::KeyFileIterator;
use super::{
    corruption_on_eof, key_file_path, le_u16, le_u32, le_u64, value_file_path, FOOTER_SIZE,
    KEY_HEADER_SIZE, KEY_MAGIC, VALUE_HEADER_SIZE, VALUE_MAGIC, VERSION,
};

/// Handle on a finished checkpoint file pair
pub struct CheckpointFile {
    name: String,
    key_path: PathBuf,
    value_path: PathBuf,
    entry_count: u64,
    deleted_count: u64,
    logical_timestamp: u64,
    size_bytes: u64,
    /// Positioned value reads share one handle
    value_file: Mutex<File>,
}

impl CheckpointFile {
    /// Open a checkpoint file pair and validate both headers.
    ///
    /// Bad magic, unknown versions or truncated files are reported as
    /// `Corruption`.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let key_path = key_file_path(dir, name);
        let value_path = value_file_path(dir, name);

        let mut key_file = File::open(&key_path)?;
        let key_size = key_file.metadata()?.len();
        if key_size < KEY_HEADER_SIZE + FOOTER_SIZE {
            return Err(TesseraError::Corruption(format!(
                "key file {} is too short ({} bytes)",
                key_path.display(),
                key_size
            )));
        }

        let mut header = [0u8; KEY_HEADER_SIZE as usize];
        key_file
            .read_exact(&mut header)
            .map_err(|e| corruption_on_eof(e, "key file header"))?;

        if &header[0..4] != KEY_MAGIC {
            return Err(TesseraError::Corruption(format!(
                "Invalid key file magic: expected TSKF, got {:?}",
                &header[0..4]
            )));
        }
        let version = le_u16(&header, 4);
        if version != VERSION {
            return Err(TesseraError::Corruption(format!(
                "Unsupported key file version: {}",
                version
            )));
        }
        let entry_count = le_u64(&header, 6);
        let deleted_count = le_u64(&header, 14);
        let logical_timestamp = le_u64(&header, 22);

        let mut value_file = File::open(&value_path)?;
        let value_size = value_file.metadata()?.len();
        if value_size < VALUE_HEADER_SIZE + FOOTER_SIZE {
            return Err(TesseraError::Corruption(format!(
                "value file {} is too short ({} bytes)",
                value_path.display(),
                value_size
            )));
        }
        let mut value_header = [0u8; VALUE_HEADER_SIZE as usize];
        value_file
            .read_exact(&mut value_header)
            .map_err(|e| corruption_on_eof(e, "value file header"))?;
        if &value_header[0..4] != VALUE_MAGIC {
            return Err(TesseraError::Corruption(format!(
                "Invalid value file magic: expected TSVF, got {:?}",
                &value_header[0..4]
            )));
        }
        let value_version = le_u16(&value_header, 4);
        if value_version != VERSION {
            return Err(TesseraError::Corruption(format!(
                "Unsupported value file version: {}",
                value_version
            )));
        }

        Ok(Self {
            name: name.to_string(),
            key_path,
            value_path,
            entry_count,
            deleted_count,
            logical_timestamp,
            size_bytes: key_size + value_size,
            value_file: Mutex::new(value_file),
        })
    }

    /// Read the serialized value at `location`, checking its CRC
    pub fn read_value(&self, location: &ValueLocation) -> Result<Vec<u8>> {
        let mut value = vec![0u8; location.length as usize];
        {
            let mut file = self.value_file.lock();
            file.seek(SeekFrom::Start(location.offset))?;
            file.read_exact(&mut value)
                .map_err(|e| corruption_on_eof(e, "value record"))?;
        }

        let crc = crc32fast::hash(&value);
        if crc != location.crc {
            return Err(TesseraError::Corruption(format!(
                "value at offset {} in {} fails checksum",
                location.offset, self.name
            )));
        }
        Ok(value)
    }

    /// Stream the key records in key order
    pub fn key_records(&self) -> Result<KeyFileIterator> {
        KeyFileIterator::open(&self.key_path, self.entry_count)
    }

    /// Check every checksum in both files
    pub fn verify(&self) -> Result<()> {
        for record in self.key_records()? {
            record?;
        }

        let mut file = BufReader::new(File::open(&self.value_path)?);
        let total = file.get_ref().metadata()?.len();
        file.seek(SeekFrom::Start(VALUE_HEADER_SIZE))?;

        let mut remaining = total - VALUE_HEADER_SIZE - FOOTER_SIZE;
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            file.read_exact(&mut buf[..chunk])
                .map_err(|e| corruption_on_eof(e, "value file"))?;
            hasher.update(&buf[..chunk]);
            remaining -= chunk as u64;
        }

        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)
            .map_err(|e| corruption_on_eof(e, "value file footer"))?;
        if le_u32(&footer, 0) != hasher.finalize() {
            return Err(TesseraError::Corruption(format!(
                "value file {} fails checksum",
                self.value_path.display()
            )));
        }
        Ok(())
    }

    /// Remove both files from disk
    pub fn delete_files(&self) -> io::Result<()> {
        fs::remove_file(&self.key_path)?;
        fs::remove_file(&self.value_path)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn value_path(&self) -> &Path {
        &self.value_path
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted_count
    }

    pub fn logical_timestamp(&self) -> u64 {
        self.logical_timestamp
    }

    /// Key file + value file bytes
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}
