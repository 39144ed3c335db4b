//! Copy manager (consumer side)
//!
//! Receives copy records into the private copy directory. Nothing received
//! here is visible to readers; the store installs the result only once the
//! stream was complete.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Result, TesseraError};
use crate::storage::checkpoint::{KEY_FILE_EXTENSION, VALUE_FILE_EXTENSION};
use crate::storage::{MetadataManager, MetadataTableRecord};

use super::record::{CopyRecord, COPY_PROTOCOL_VERSION};

/// A fully received copy, ready to install
pub struct CopiedState {
    pub dir: PathBuf,
    pub table: MetadataTableRecord,
}

struct OpenFile {
    name: String,
    extension: &'static str,
    file: File,
}

pub struct CopyManager {
    dir: PathBuf,
    next_record: u64,
    table: Option<MetadataTableRecord>,
    open_file: Option<OpenFile>,
    /// (base name, extension) of every file fully received
    received: HashSet<(String, &'static str)>,
    complete: bool,
}

impl CopyManager {
    /// Start receiving into `dir`, discarding leftovers of an earlier attempt
    pub fn begin(dir: PathBuf) -> Result<Self> {
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "copy started");
        Ok(Self {
            dir,
            next_record: 0,
            table: None,
            open_file: None,
            received: HashSet::new(),
            complete: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn records_received(&self) -> u64 {
        self.next_record
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Apply record `record_number`.
    ///
    /// Records must arrive as 0, 1, 2, ... A number already applied is a
    /// retry and is ignored; skipping ahead is rejected without applying.
    pub fn set(&mut self, record_number: u64, bytes: &[u8]) -> Result<()> {
        if record_number < self.next_record {
            debug!(record_number, "ignoring redelivered copy record");
            return Ok(());
        }
        if record_number > self.next_record {
            return Err(TesseraError::CopyOutOfOrder {
                expected: self.next_record,
                actual: record_number,
            });
        }

        let record = CopyRecord::decode(bytes)?;
        self.apply(record)?;
        self.next_record += 1;
        Ok(())
    }

    fn apply(&mut self, record: CopyRecord) -> Result<()> {
        if self.complete {
            return Err(TesseraError::InvalidState(
                "copy record after the end of the stream".to_string(),
            ));
        }
        match record {
            CopyRecord::Version { version } => {
                if version != COPY_PROTOCOL_VERSION {
                    return Err(TesseraError::Corruption(format!(
                        "unsupported copy protocol version {}",
                        version
                    )));
                }
            }
            CopyRecord::MetadataTable { bytes } => {
                self.table = Some(MetadataManager::decode_table(&bytes)?);
            }
            CopyRecord::StartKeyFile { file_name } => self.start_file(file_name, KEY_FILE_EXTENSION)?,
            CopyRecord::StartValueFile { file_name } => {
                self.start_file(file_name, VALUE_FILE_EXTENSION)?
            }
            CopyRecord::KeyFileChunk { bytes } => self.write_chunk(KEY_FILE_EXTENSION, &bytes)?,
            CopyRecord::ValueFileChunk { bytes } => self.write_chunk(VALUE_FILE_EXTENSION, &bytes)?,
            CopyRecord::EndKeyFile => self.end_file(KEY_FILE_EXTENSION)?,
            CopyRecord::EndValueFile => self.end_file(VALUE_FILE_EXTENSION)?,
            CopyRecord::Complete => {
                if self.open_file.is_some() {
                    return Err(TesseraError::Corruption(
                        "copy stream completed with a file still open".to_string(),
                    ));
                }
                self.complete = true;
                info!(records = self.next_record + 1, "copy stream fully received");
            }
        }
        Ok(())
    }

    fn start_file(&mut self, name: String, extension: &'static str) -> Result<()> {
        if self.table.is_none() {
            return Err(TesseraError::Corruption(
                "copy file received before the metadata table".to_string(),
            ));
        }
        if let Some(open) = &self.open_file {
            return Err(TesseraError::Corruption(format!(
                "copy of {}.{} started while {}.{} is open",
                name, extension, open.name, open.extension
            )));
        }
        let path = self.dir.join(format!("{}.{}", name, extension));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        self.open_file = Some(OpenFile {
            name,
            extension,
            file,
        });
        Ok(())
    }

    fn write_chunk(&mut self, extension: &'static str, bytes: &[u8]) -> Result<()> {
        match &mut self.open_file {
            Some(open) if open.extension == extension => {
                open.file.write_all(bytes)?;
                Ok(())
            }
            _ => Err(TesseraError::Corruption(format!(
                "{} chunk outside of a {} file",
                extension, extension
            ))),
        }
    }

    fn end_file(&mut self, extension: &'static str) -> Result<()> {
        match self.open_file.take() {
            Some(open) if open.extension == extension => {
                open.file.sync_all()?;
                self.received.insert((open.name, extension));
                Ok(())
            }
            other => {
                self.open_file = other;
                Err(TesseraError::Corruption(format!(
                    "end of {} file without a matching start",
                    extension
                )))
            }
        }
    }

    /// Finish receiving.
    ///
    /// Fails with `CopyIncomplete` (and removes the copy directory) unless
    /// the stream reached its end and every file of the table arrived.
    pub fn finish(self) -> Result<CopiedState> {
        let missing = match &self.table {
            Some(table) => table.files.iter().any(|f| {
                !self.received.contains(&(f.file_name.clone(), KEY_FILE_EXTENSION))
                    || !self.received.contains(&(f.file_name.clone(), VALUE_FILE_EXTENSION))
            }),
            None => true,
        };

        if !self.complete || missing {
            warn!(
                records = self.next_record,
                complete = self.complete,
                "discarding incomplete copy"
            );
            self.discard();
            return Err(TesseraError::CopyIncomplete);
        }

        let table = self.table.ok_or(TesseraError::CopyIncomplete)?;
        Ok(CopiedState {
            dir: self.dir,
            table,
        })
    }

    /// Drop everything received so far
    pub fn discard(self) {
        drop(self.open_file);
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "failed to remove copy directory");
        }
    }
}
