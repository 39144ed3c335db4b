//! Storage Module
//!
//! Persistent storage layer: checkpoint file pairs and the metadata table
//! that lists them.
//!
//! ## Responsibilities
//! - Persist checkpoint generations to immutable key/value file pairs
//! - Keep a durable, crash-safe manifest of the files the store needs
//! - Delete files once nothing references them
//!
//! ## Layout
//! ```text
//! {data_dir}/
//!   ├── metadata.current
//!   ├── metadata.tmp
//!   ├── metadata.bkp
//!   ├── checkpoints/
//!   │     ├── ckpt_00000001_<stamp>.key
//!   │     └── ckpt_00000001_<stamp>.val
//!   └── copy/
//! ```

pub mod checkpoint;
mod manager;
mod metadata;

pub use checkpoint::{CheckpointFile, CheckpointFileInfo, CheckpointFileWriter, KeyRecord};
pub use manager::MetadataManager;
pub use metadata::{FileMetadata, FileMetadataRecord, MetadataTable, MetadataTableRecord};
