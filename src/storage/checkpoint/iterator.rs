//! Key File Iterator
//!
//! Sequential iteration over the records of a key file. The records CRC
//! is checked once the last record has been read.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Result, TesseraError};
use crate::state::RecordKind;

use super::{
    corruption_on_eof, le_i64, le_u32, le_u64, KeyRecord, FOOTER_SIZE, KEY_HEADER_SIZE,
    KEY_RECORD_PREFIX,
};

/// Iterator over key records in ascending key order
pub struct KeyFileIterator {
    file: BufReader<File>,
    /// Records still to read
    remaining: u64,
    /// Record bytes left before the footer
    bytes_left: u64,
    hasher: crc32fast::Hasher,
    /// Set after an error or the footer check, iteration stops
    done: bool,
}

impl KeyFileIterator {
    pub(super) fn open(path: &Path, entry_count: u64) -> Result<Self> {
        let file = File::open(path)?;
        let bytes_left = file
            .metadata()?
            .len()
            .saturating_sub(KEY_HEADER_SIZE + FOOTER_SIZE);
        let mut file = BufReader::new(file);
        file.seek(SeekFrom::Start(KEY_HEADER_SIZE))?;
        Ok(Self {
            file,
            remaining: entry_count,
            bytes_left,
            hasher: crc32fast::Hasher::new(),
            done: false,
        })
    }

    fn read_record(&mut self) -> Result<KeyRecord> {
        if self.bytes_left < KEY_RECORD_PREFIX as u64 {
            return Err(TesseraError::Corruption("key record truncated".to_string()));
        }
        let mut prefix = [0u8; KEY_RECORD_PREFIX];
        self.file
            .read_exact(&mut prefix)
            .map_err(|e| corruption_on_eof(e, "key record"))?;

        let key_len = le_u32(&prefix, 0) as usize;
        let kind = RecordKind::from_u8(prefix[4]).ok_or_else(|| {
            TesseraError::Corruption(format!("unknown record kind {}", prefix[4]))
        })?;
        let lsn = le_i64(&prefix, 5);
        let value_offset = le_u64(&prefix, 13);
        let value_len = le_u32(&prefix, 21);
        let value_crc = le_u32(&prefix, 25);

        // A damaged length must not drive the allocation below
        let bytes_left = self.bytes_left - KEY_RECORD_PREFIX as u64;
        if key_len as u64 > bytes_left {
            return Err(TesseraError::Corruption(format!(
                "key length {} exceeds the {} record bytes left",
                key_len, bytes_left
            )));
        }
        self.bytes_left = bytes_left - key_len as u64;

        let mut key = vec![0u8; key_len];
        self.file
            .read_exact(&mut key)
            .map_err(|e| corruption_on_eof(e, "key record"))?;

        self.hasher.update(&prefix);
        self.hasher.update(&key);

        Ok(KeyRecord {
            key,
            kind,
            lsn,
            value_offset,
            value_len,
            value_crc,
        })
    }

    fn check_footer(&mut self) -> Result<()> {
        let mut footer = [0u8; FOOTER_SIZE as usize];
        self.file
            .read_exact(&mut footer)
            .map_err(|e| corruption_on_eof(e, "key file footer"))?;
        let expected = le_u32(&footer, 0);
        let actual = self.hasher.clone().finalize();
        if expected != actual {
            return Err(TesseraError::Corruption(format!(
                "key file checksum mismatch: stored {:#010x}, computed {:#010x}",
                expected, actual
            )));
        }
        Ok(())
    }
}

impl Iterator for KeyFileIterator {
    type Item = Result<KeyRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.remaining == 0 {
            self.done = true;
            return match self.check_footer() {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            };
        }

        match self.read_record() {
            Ok(record) => {
                self.remaining -= 1;
                Some(Ok(record))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
