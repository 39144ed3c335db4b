//! Copy stream (producer side)
//!
//! Walks a pinned metadata table and emits its files as chunked records:
//!
//! ```text
//! Version, MetadataTable,
//!   { StartKeyFile, KeyFileChunk*, EndKeyFile,
//!     StartValueFile, ValueFileChunk*, EndValueFile }  per file
//! Complete
//! ```
//!
//! The stream holds a reference on every file it will send, so a merge on
//! the primary cannot delete them mid-copy.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::{FileMetadata, MetadataManager, MetadataTable};

use super::record::{CopyRecord, COPY_PROTOCOL_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilePart {
    Key,
    Value,
}

enum Phase {
    Version,
    Table,
    Start(usize, FilePart),
    Chunks(usize, FilePart, File),
    Complete,
    Done,
}

pub struct CopyStream {
    table: Arc<MetadataTable>,
    files: Vec<Arc<FileMetadata>>,
    chunk_size: usize,
    phase: Phase,
    records_emitted: u64,
}

impl CopyStream {
    pub(crate) fn new(table: Arc<MetadataTable>, chunk_size: usize) -> Self {
        let files = table.files().cloned().collect();
        Self {
            table,
            files,
            chunk_size: chunk_size.max(1),
            phase: Phase::Version,
            records_emitted: 0,
        }
    }

    /// Sequence number the copied state is durable as of
    pub fn checkpoint_lsn(&self) -> i64 {
        self.table.checkpoint_lsn()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn records_emitted(&self) -> u64 {
        self.records_emitted
    }

    /// Next encoded record, or `None` once the stream is exhausted
    pub fn next_record(&mut self) -> Result<Option<Bytes>> {
        match self.next_copy_record()? {
            Some(record) => {
                self.records_emitted += 1;
                record.encode().map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_copy_record(&mut self) -> Result<Option<CopyRecord>> {
        loop {
            let phase = std::mem::replace(&mut self.phase, Phase::Done);
            match phase {
                Phase::Version => {
                    self.phase = Phase::Table;
                    return Ok(Some(CopyRecord::Version {
                        version: COPY_PROTOCOL_VERSION,
                    }));
                }
                Phase::Table => {
                    let bytes = MetadataManager::encode_table(&self.table)?;
                    debug!(
                        files = self.files.len(),
                        checkpoint_lsn = self.table.checkpoint_lsn(),
                        "copy stream sending metadata table"
                    );
                    self.phase = Phase::Start(0, FilePart::Key);
                    return Ok(Some(CopyRecord::MetadataTable { bytes }));
                }
                Phase::Start(index, part) => {
                    let Some(file) = self.files.get(index) else {
                        self.phase = Phase::Complete;
                        continue;
                    };
                    let checkpoint = file.checkpoint();
                    let file_name = checkpoint.name().to_string();
                    let (path, record) = match part {
                        FilePart::Key => (checkpoint.key_path(), CopyRecord::StartKeyFile { file_name }),
                        FilePart::Value => (
                            checkpoint.value_path(),
                            CopyRecord::StartValueFile { file_name },
                        ),
                    };
                    let handle = File::open(path)?;
                    self.phase = Phase::Chunks(index, part, handle);
                    return Ok(Some(record));
                }
                Phase::Chunks(index, part, mut handle) => {
                    let bytes = read_chunk(&mut handle, self.chunk_size)?;
                    if bytes.is_empty() {
                        self.phase = match part {
                            FilePart::Key => Phase::Start(index, FilePart::Value),
                            FilePart::Value => Phase::Start(index + 1, FilePart::Key),
                        };
                        return Ok(Some(match part {
                            FilePart::Key => CopyRecord::EndKeyFile,
                            FilePart::Value => CopyRecord::EndValueFile,
                        }));
                    }
                    self.phase = Phase::Chunks(index, part, handle);
                    return Ok(Some(match part {
                        FilePart::Key => CopyRecord::KeyFileChunk { bytes },
                        FilePart::Value => CopyRecord::ValueFileChunk { bytes },
                    }));
                }
                Phase::Complete => {
                    info!(
                        records = self.records_emitted + 1,
                        files = self.files.len(),
                        "copy stream complete"
                    );
                    self.phase = Phase::Done;
                    return Ok(Some(CopyRecord::Complete));
                }
                Phase::Done => return Ok(None),
            }
        }
    }
}

/// Read up to `limit` bytes, short only at end of file
fn read_chunk(file: &mut File, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(limit);
    file.by_ref().take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}
