//! Merge policy
//!
//! Decides which checkpoint files, if any, the next merge should rewrite.
//! Policies are bit flags and can be combined; they are evaluated in a fixed
//! order and the first one that selects files wins.

use crate::config::{FileCountMergeConfig, MergeConfig};
use crate::storage::{FileMetadata, MetadataTable};

bitflags::bitflags! {
    /// Which conditions may trigger a merge
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MergePolicy: u32 {
        /// Too many files of one size class
        const FILE_COUNT = 0b0000_0001;
        /// Files dominated by superseded entries
        const INVALID_ENTRIES = 0b0000_0010;
        /// Files dominated by deletion markers
        const DELETED_ENTRIES = 0b0000_0100;
        /// Total bytes on disk above the configured threshold
        const SIZE_ON_DISK = 0b0000_1000;
        const ALL = Self::FILE_COUNT.bits()
            | Self::INVALID_ENTRIES.bits()
            | Self::DELETED_ENTRIES.bits()
            | Self::SIZE_ON_DISK.bits();
    }
}

impl MergePolicy {
    /// Never merge
    pub const NONE: MergePolicy = MergePolicy::empty();
}

impl Default for MergePolicy {
    fn default() -> Self {
        MergePolicy::INVALID_ENTRIES | MergePolicy::FILE_COUNT
    }
}

/// Size ladder used by the file count policy, smallest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeClass {
    VerySmall,
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub const LADDER: [SizeClass; 4] = [
        SizeClass::VerySmall,
        SizeClass::Small,
        SizeClass::Medium,
        SizeClass::Large,
    ];

    pub fn of(size_bytes: u64, config: &FileCountMergeConfig) -> SizeClass {
        if size_bytes < config.very_small_file_size_threshold {
            SizeClass::VerySmall
        } else if size_bytes < config.small_file_size_threshold {
            SizeClass::Small
        } else if size_bytes < config.medium_file_size_threshold {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }
}

/// Why a set of files was picked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeReason {
    InvalidEntries,
    DeletedEntries,
    SizeOnDisk,
    FileCount(SizeClass),
}

/// Files chosen for one merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSelection {
    pub reason: MergeReason,
    /// Ascending file ids
    pub file_ids: Vec<u32>,
}

/// Evaluates the configured merge policies against a table
pub struct MergeHelper<'a> {
    config: &'a MergeConfig,
}

impl<'a> MergeHelper<'a> {
    pub fn new(config: &'a MergeConfig) -> Self {
        Self { config }
    }

    /// Pick the files to merge, or None when no policy fires
    pub fn select(&self, table: &MetadataTable) -> Option<MergeSelection> {
        let policy = self.config.policy;
        if policy.is_empty() || table.is_empty() {
            return None;
        }

        if policy.contains(MergePolicy::INVALID_ENTRIES) {
            if let Some(ids) = self.select_by_ratio(table, |f| self.is_invalid_candidate(f)) {
                return Some(MergeSelection {
                    reason: MergeReason::InvalidEntries,
                    file_ids: ids,
                });
            }
        }

        if policy.contains(MergePolicy::DELETED_ENTRIES) {
            if let Some(ids) = self.select_by_ratio(table, |f| self.is_deleted_candidate(f)) {
                return Some(MergeSelection {
                    reason: MergeReason::DeletedEntries,
                    file_ids: ids,
                });
            }
        }

        if policy.contains(MergePolicy::SIZE_ON_DISK)
            && table.file_count() >= 2
            && table.total_size() > self.config.size_on_disk_threshold
        {
            return Some(MergeSelection {
                reason: MergeReason::SizeOnDisk,
                file_ids: table.file_ids(),
            });
        }

        if policy.contains(MergePolicy::FILE_COUNT) {
            return self.select_by_file_count(table);
        }

        None
    }

    fn select_by_ratio<F>(&self, table: &MetadataTable, is_candidate: F) -> Option<Vec<u32>>
    where
        F: Fn(&FileMetadata) -> bool,
    {
        let ids: Vec<u32> = table
            .files()
            .filter(|f| is_candidate(f))
            .map(|f| f.file_id())
            .collect();
        if ids.is_empty() || ids.len() < self.config.merge_files_count_threshold {
            return None;
        }
        Some(ids)
    }

    fn is_invalid_candidate(&self, file: &FileMetadata) -> bool {
        let total = file.total_entries();
        let invalid = file.invalid_entries();
        total > 0
            && invalid >= self.config.number_of_invalid_entries
            && invalid * 100 >= total * self.config.percentage_of_invalid_entries_per_file as u64
    }

    fn is_deleted_candidate(&self, file: &FileMetadata) -> bool {
        let total = file.total_entries();
        let deleted = file.deleted_entries();
        total > 0
            && deleted > 0
            && deleted * 100 >= total * self.config.percentage_of_deleted_entries_per_file as u64
    }

    /// Walk the ladder smallest class first; the first class holding
    /// `threshold` files has its oldest `threshold` files merged.
    fn select_by_file_count(&self, table: &MetadataTable) -> Option<MergeSelection> {
        let ladder = &self.config.file_count;
        let threshold = ladder.file_count_merge_threshold;

        for class in SizeClass::LADDER {
            let mut files: Vec<&FileMetadata> = table
                .files()
                .map(|f| f.as_ref())
                .filter(|f| SizeClass::of(f.size_bytes(), ladder) == class)
                .collect();
            if files.len() < threshold {
                continue;
            }
            files.sort_by_key(|f| (f.logical_timestamp(), f.file_id()));
            let mut ids: Vec<u32> = files.iter().take(threshold).map(|f| f.file_id()).collect();
            ids.sort_unstable();
            return Some(MergeSelection {
                reason: MergeReason::FileCount(class),
                file_ids: ids,
            });
        }
        None
    }
}
