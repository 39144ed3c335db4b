//! Copy record definitions
//!
//! The records of a state-transfer stream. They are opaque to the consumer's
//! transport; only their delivery order matters.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Version of the copy record layout
pub const COPY_PROTOCOL_VERSION: u32 = 1;

/// One record of the copy stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyRecord {
    /// Always the first record
    Version { version: u32 },

    /// Encoded metadata table of the copied state
    MetadataTable { bytes: Vec<u8> },

    StartKeyFile { file_name: String },
    KeyFileChunk { bytes: Vec<u8> },
    EndKeyFile,

    StartValueFile { file_name: String },
    ValueFileChunk { bytes: Vec<u8> },
    EndValueFile,

    /// Always the last record
    Complete,
}

impl CopyRecord {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
