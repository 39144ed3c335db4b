//! Configuration for Tessera
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TesseraError};
use crate::merge::MergePolicy;

/// Main configuration for a store instance
#[derive(Debug, Clone)]
pub struct StoreConfig {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── metadata.current  (durable metadata table)
    ///     ├── metadata.tmp      (next table, written by perform)
    ///     ├── metadata.bkp      (previous table during replace)
    ///     ├── checkpoints/      (key/value file pairs)
    ///     └── copy/             (in-progress state transfer)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Consolidation Configuration
    // -------------------------------------------------------------------------
    /// Delta generations that must accumulate before they are consolidated
    pub number_of_deltas_to_be_consolidated: usize,

    /// Run consolidation (and the merge it drives) on a background thread
    pub enable_background_consolidation: bool,

    // -------------------------------------------------------------------------
    // Merge Configuration
    // -------------------------------------------------------------------------
    pub merge: MergeConfig,

    // -------------------------------------------------------------------------
    // Sweep Configuration
    // -------------------------------------------------------------------------
    /// Evict cold values once they are durable on disk
    pub enable_sweep: bool,

    /// Memory budget for in-memory values (in bytes)
    pub memory_buffer_size: u64,

    /// Pause between background sweep passes
    pub sweep_interval: Duration,

    // -------------------------------------------------------------------------
    // Copy Configuration
    // -------------------------------------------------------------------------
    /// Max bytes of file content carried by one copy record
    pub copy_chunk_size: usize,

    // -------------------------------------------------------------------------
    // Locking Configuration
    // -------------------------------------------------------------------------
    /// Timeout used when an operation is given none. `None` waits forever.
    pub default_lock_timeout: Option<Duration>,

    /// Timeout for the shared prime lock taken by checkpoint
    pub checkpoint_lock_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./tessera_data"),
            number_of_deltas_to_be_consolidated: 3,
            enable_background_consolidation: false,
            merge: MergeConfig::default(),
            enable_sweep: false,
            memory_buffer_size: 1024 * 1024 * 1024, // 1 GB
            sweep_interval: Duration::from_secs(5),
            copy_chunk_size: 500 * 1024, // 500 KB
            default_lock_timeout: Some(Duration::from_secs(4)),
            checkpoint_lock_timeout: Duration::from_millis(1000),
        }
    }
}

impl StoreConfig {
    /// Create a new config builder
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Reject knob values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.number_of_deltas_to_be_consolidated == 0 {
            return Err(TesseraError::Config(
                "number_of_deltas_to_be_consolidated must be at least 1".to_string(),
            ));
        }
        if self.copy_chunk_size == 0 {
            return Err(TesseraError::Config("copy_chunk_size must be positive".to_string()));
        }
        if self.merge.merge_files_count_threshold == 0 {
            return Err(TesseraError::Config(
                "merge_files_count_threshold must be at least 1".to_string(),
            ));
        }
        if self.merge.file_count.file_count_merge_threshold < 2 {
            return Err(TesseraError::Config(
                "file_count_merge_threshold must be at least 2".to_string(),
            ));
        }
        for pct in [
            self.merge.percentage_of_invalid_entries_per_file,
            self.merge.percentage_of_deleted_entries_per_file,
        ] {
            if pct > 100 {
                return Err(TesseraError::Config(format!("percentage {} exceeds 100", pct)));
            }
        }
        Ok(())
    }
}

/// Merge policy knobs
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Which policies may trigger a merge
    pub policy: MergePolicy,

    /// Candidate files needed before the invalid/deleted entry policies merge
    pub merge_files_count_threshold: usize,

    /// Invalid entries a file needs before it becomes a candidate
    pub number_of_invalid_entries: u64,

    /// Share of invalid entries (percent) a file needs before it becomes a candidate
    pub percentage_of_invalid_entries_per_file: u32,

    /// Share of tombstones (percent) a file needs before it becomes a candidate
    pub percentage_of_deleted_entries_per_file: u32,

    /// Total on-disk bytes above which every file is merged
    pub size_on_disk_threshold: u64,

    pub file_count: FileCountMergeConfig,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            policy: MergePolicy::INVALID_ENTRIES | MergePolicy::FILE_COUNT,
            merge_files_count_threshold: 16,
            number_of_invalid_entries: 1000,
            percentage_of_invalid_entries_per_file: 33,
            percentage_of_deleted_entries_per_file: 33,
            size_on_disk_threshold: 10 * 1024 * 1024 * 1024, // 10 GB
            file_count: FileCountMergeConfig::default(),
        }
    }
}

/// Size-class ladder for the file count policy
#[derive(Debug, Clone)]
pub struct FileCountMergeConfig {
    /// Files of one size class that trigger a merge of that class
    pub file_count_merge_threshold: usize,

    /// Upper bound (exclusive) of the very small class
    pub very_small_file_size_threshold: u64,

    /// Upper bound (exclusive) of the small class
    pub small_file_size_threshold: u64,

    /// Upper bound (exclusive) of the medium class; anything bigger is large
    pub medium_file_size_threshold: u64,
}

impl FileCountMergeConfig {
    pub const DEFAULT_VERY_SMALL_FILE_SIZE_THRESHOLD: u64 = 1024 * 1024; // 1 MB
    pub const DEFAULT_SMALL_FILE_SIZE_THRESHOLD: u64 = 16 * 1024 * 1024; // 16 MB
    pub const DEFAULT_MEDIUM_FILE_SIZE_THRESHOLD: u64 = 256 * 1024 * 1024; // 256 MB

    pub fn with_threshold(file_count_merge_threshold: usize) -> Self {
        Self {
            file_count_merge_threshold,
            ..Self::default()
        }
    }
}

impl Default for FileCountMergeConfig {
    fn default() -> Self {
        Self {
            file_count_merge_threshold: 3,
            very_small_file_size_threshold: Self::DEFAULT_VERY_SMALL_FILE_SIZE_THRESHOLD,
            small_file_size_threshold: Self::DEFAULT_SMALL_FILE_SIZE_THRESHOLD,
            medium_file_size_threshold: Self::DEFAULT_MEDIUM_FILE_SIZE_THRESHOLD,
        }
    }
}

/// Builder for StoreConfig
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set how many delta generations accumulate before consolidation
    pub fn number_of_deltas_to_be_consolidated(mut self, count: usize) -> Self {
        self.config.number_of_deltas_to_be_consolidated = count;
        self
    }

    /// Route consolidation to a background thread
    pub fn enable_background_consolidation(mut self, enabled: bool) -> Self {
        self.config.enable_background_consolidation = enabled;
        self
    }

    /// Set the merge policy flags
    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.config.merge.policy = policy;
        self
    }

    /// Replace the whole merge configuration
    pub fn merge_config(mut self, merge: MergeConfig) -> Self {
        self.config.merge = merge;
        self
    }

    /// Set the candidate file count for the invalid/deleted entry policies
    pub fn merge_files_count_threshold(mut self, count: usize) -> Self {
        self.config.merge.merge_files_count_threshold = count;
        self
    }

    /// Set the invalid entry count that makes a file a merge candidate
    pub fn number_of_invalid_entries(mut self, count: u64) -> Self {
        self.config.merge.number_of_invalid_entries = count;
        self
    }

    /// Set the size-class ladder for the file count policy
    pub fn file_count_merge(mut self, file_count: FileCountMergeConfig) -> Self {
        self.config.merge.file_count = file_count;
        self
    }

    /// Enable sweeping of cold values
    pub fn enable_sweep(mut self, enabled: bool) -> Self {
        self.config.enable_sweep = enabled;
        self
    }

    /// Set the memory budget for values (in bytes)
    pub fn memory_buffer_size(mut self, bytes: u64) -> Self {
        self.config.memory_buffer_size = bytes;
        self
    }

    /// Set the pause between background sweep passes
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set the copy chunk size (in bytes)
    pub fn copy_chunk_size(mut self, bytes: usize) -> Self {
        self.config.copy_chunk_size = bytes;
        self
    }

    /// Set the default lock timeout (`None` waits forever)
    pub fn default_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.default_lock_timeout = timeout;
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}
