//! Error types for Tessera
//!
//! Provides a unified error type for all store operations.
//!
//! Lock timeouts and precondition failures are recoverable by the caller.
//! I/O failures inside a checkpoint or merge only fail that checkpoint; the
//! durable metadata table stays authoritative. `Corruption` is kept apart
//! from `Io` so that a damaged checkpoint file is distinguishable at open.

use thiserror::Error;

/// Result type alias using TesseraError
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Unified error type for Tessera operations
#[derive(Debug, Error)]
pub enum TesseraError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error("Timed out acquiring lock: {0}")]
    Timeout(String),

    #[error("Write conflict: key already exists")]
    KeyExists,

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // -------------------------------------------------------------------------
    // Role / Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Store is not primary")]
    NotPrimary,

    #[error("Store is not readable in its current role")]
    NotReadable,

    #[error("Store is closed")]
    ObjectClosed,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Copy Errors
    // -------------------------------------------------------------------------
    #[error("Copy record out of order: expected {expected}, got {actual}")]
    CopyOutOfOrder { expected: u64, actual: u64 },

    #[error("Copy ended before the stream was complete")]
    CopyIncomplete,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for TesseraError {
    fn from(err: bincode::Error) -> Self {
        TesseraError::Serialization(err.to_string())
    }
}

impl TesseraError {
    /// True for failures the caller may retry or resolve by aborting.
    pub fn is_transient(&self) -> bool {
        matches!(self, TesseraError::Timeout(_) | TesseraError::KeyExists)
    }
}
