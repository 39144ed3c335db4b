//! Merge Module
//!
//! On-disk compaction of checkpoint files.
//!
//! ## Responsibilities
//! - Pick files to merge by policy (file count ladder, invalid entries,
//!   deleted entries, size on disk)
//! - Rewrite the still-live entries of the picked files into one file
//! - Drop deletion markers that no longer shadow anything

mod engine;
mod policy;

pub use engine::{merge_files, MergeOutput, MergeRequest};
pub use policy::{MergeHelper, MergePolicy, MergeReason, MergeSelection, SizeClass};
