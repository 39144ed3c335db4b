//! Checkpoint File Module
//!
//! Immutable on-disk image of one checkpoint generation (or one merge
//! output). A checkpoint file is a pair: a key file holding ordered key
//! records, and a value file holding raw serialized values.
//!
//! ## Key File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Header (30 bytes)                                                │
//! │   Magic: "TSKF" (4) | Version: u16 (2) | Count: u64 (8)          │
//! │   Deleted: u64 (8) | LogicalTimestamp: u64 (8)                   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Records (variable, ascending key order)                          │
//! │   [KeyLen: u32][Kind: u8][Lsn: i64][ValOffset: u64]              │
//! │   [ValLen: u32][ValCrc: u32][Key]                                │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Footer (8 bytes)                                                 │
//! │   RecordsCRC: u32 (4) | Padding (4)                              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Value File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Header (8 bytes)                                                 │
//! │   Magic: "TSVF" (4) | Version: u16 (2) | Padding (2)             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Values (variable, raw serialized bytes, addressed by key file)   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Footer (8 bytes)                                                 │
//! │   ValuesCRC: u32 (4) | Padding (4)                               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Deleted keys carry `ValLen = 0` and no value bytes.

mod iterator;
mod reader;
mod writer;

use std::io;
use std::path::{Path, PathBuf};

pub use iterator::KeyFileIterator;
pub use reader::CheckpointFile;
pub use writer::{CheckpointFileWriter, WrittenValue};

use crate::error::TesseraError;
use crate::state::{RecordKind, ValueLocation};

// =============================================================================
// Shared Constants (used by writer, reader, iterator)
// =============================================================================

/// Magic bytes identifying a key file
pub(crate) const KEY_MAGIC: &[u8; 4] = b"TSKF";

/// Magic bytes identifying a value file
pub(crate) const VALUE_MAGIC: &[u8; 4] = b"TSVF";

/// Current checkpoint file format version
pub(crate) const VERSION: u16 = 1;

/// Key header: Magic (4) + Version (2) + Count (8) + Deleted (8) + Timestamp (8)
pub(crate) const KEY_HEADER_SIZE: u64 = 30;

/// Value header: Magic (4) + Version (2) + Padding (2)
pub(crate) const VALUE_HEADER_SIZE: u64 = 8;

/// Footer: CRC (4) + Padding (4), same for both files
pub(crate) const FOOTER_SIZE: u64 = 8;

/// Fixed part of a key record: KeyLen (4) + Kind (1) + Lsn (8) + Offset (8) + Len (4) + Crc (4)
pub(crate) const KEY_RECORD_PREFIX: usize = 29;

pub(crate) const KEY_FILE_EXTENSION: &str = "key";
pub(crate) const VALUE_FILE_EXTENSION: &str = "val";

pub(crate) fn key_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, KEY_FILE_EXTENSION))
}

pub(crate) fn value_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, VALUE_FILE_EXTENSION))
}

/// Truncated reads inside a checkpoint file mean damage, not a transient I/O error.
pub(crate) fn corruption_on_eof(err: io::Error, what: &str) -> TesseraError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        TesseraError::Corruption(format!("{} truncated", what))
    } else {
        TesseraError::Io(err)
    }
}

// Little-endian field readers. Callers check lengths first.

pub(crate) fn le_u16(buf: &[u8], pos: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[pos..pos + 2]);
    u16::from_le_bytes(raw)
}

pub(crate) fn le_u32(buf: &[u8], pos: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn le_u64(buf: &[u8], pos: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn le_i64(buf: &[u8], pos: usize) -> i64 {
    le_u64(buf, pos) as i64
}

// =============================================================================
// Key Records
// =============================================================================

/// One record of a key file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    /// Serialized key
    pub key: Vec<u8>,
    pub kind: RecordKind,
    pub lsn: i64,
    pub value_offset: u64,
    pub value_len: u32,
    pub value_crc: u32,
}

impl KeyRecord {
    pub fn is_deleted(&self) -> bool {
        self.kind == RecordKind::Deleted
    }

    /// Location of the value inside file `file_id` (None for deletions)
    pub fn location(&self, file_id: u32) -> Option<ValueLocation> {
        if self.is_deleted() {
            return None;
        }
        Some(ValueLocation {
            file_id,
            offset: self.value_offset,
            length: self.value_len,
            crc: self.value_crc,
        })
    }
}

/// Summary returned when a checkpoint file is finished
#[derive(Debug, Clone)]
pub struct CheckpointFileInfo {
    pub name: String,
    pub entry_count: u64,
    pub deleted_count: u64,
    pub logical_timestamp: u64,
    /// Key file + value file bytes
    pub size_bytes: u64,
}
