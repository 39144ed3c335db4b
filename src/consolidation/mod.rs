//! Consolidation Module
//!
//! In-memory compaction: frozen delta generations are folded into the
//! consolidated state, optionally on a background thread.

mod manager;
mod task;

pub use manager::{AggregatedState, ConsolidationBuild, ConsolidationManager};
pub use task::{ConsolidationResult, ConsolidationTask};

pub(crate) use manager::owned_bounds;
