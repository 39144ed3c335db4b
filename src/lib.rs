//! # Tessera
//!
//! A transactional, replicated key-value store engine with:
//! - Multi-version in-memory state with snapshot isolation
//! - Three-phase checkpoints to immutable key/value file pairs
//! - Background consolidation, policy-driven file merge and value sweep
//! - Idempotent replicated apply and full-state copy for new replicas
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Transactions  /  Replicated Apply              │
//! │          (row locks, write sets, snapshot visibility)        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ commit (lsn from Replicator)
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                  DifferentialState (live)                    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ prepare_checkpoint
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   ┌─────────────┐          ┌──────────────────┐
//!   │   Deltas    │──────────► ConsolidatedState │◄── Sweep
//!   │  (frozen)   │ consolid.└────────┬─────────┘
//!   └──────┬──────┘                   │ values faulted in
//!          │ perform_checkpoint       │
//!          ▼                          ▼
//!   ┌─────────────────────────────────────────────┐
//!   │   Checkpoint files + Metadata Table (Merge)  │──► Copy stream
//!   └─────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod serializer;

pub mod state;
pub mod storage;
pub mod merge;
pub mod consolidation;
pub mod sweep;
pub mod lock;
pub mod txn;
pub mod replicator;
pub mod copy;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, TesseraError};
pub use config::{FileCountMergeConfig, MergeConfig, StoreConfig};
pub use merge::MergePolicy;
pub use replicator::{
    ApplyContext, ApplyOutcome, InMemoryReplicator, OperationRecord, Replicator, Role,
    StoreOperation,
};
pub use serializer::{BincodeSerializer, Serializer};
pub use store::{CheckpointPhase, Store, StoreEnumerator};
pub use txn::{IsolationLevel, ReadMode, Transaction, TransactionStatus, Versioned, WriteOutcome};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of Tessera
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
