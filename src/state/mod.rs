//! In-memory State Module
//!
//! Versioned items and the in-memory structures that hold them.
//!
//! ## Layers (newest first)
//! ```text
//! ┌──────────────────────┐
//! │  DifferentialState   │  live generation, receives commits
//! ├──────────────────────┤
//! │  delta generations   │  frozen by prepare, awaiting consolidation
//! ├──────────────────────┤
//! │  SnapshotContainer   │  superseded versions pinned by snapshot readers
//! ├──────────────────────┤
//! │  ConsolidatedState   │  key-ordered index, values may be swept to disk
//! └──────────────────────┘
//! ```
//!
//! ## Data Structure Choice
//! BTreeMap wrapped in RwLock, as keys must come out ordered when a
//! generation is written to a checkpoint file.

mod consolidated;
mod differential;
mod item;
mod snapshot;

use std::fmt::Debug;
use std::hash::Hash;

pub use consolidated::ConsolidatedState;
pub use differential::{DifferentialState, DifferentialVersions, Visibility};
pub use item::{RecordKind, ValueLocation, VersionedItem};
pub(crate) use item::SweepStep;
pub use snapshot::SnapshotContainer;

/// Bounds every key type must satisfy
pub trait StoreKey: Ord + Clone + Hash + Debug + Send + Sync + 'static {}

impl<T> StoreKey for T where T: Ord + Clone + Hash + Debug + Send + Sync + 'static {}

/// Bounds every value type must satisfy
pub trait StoreValue: Clone + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Clone + Send + Sync + 'static {}
