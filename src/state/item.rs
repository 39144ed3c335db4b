//! Versioned items
//!
//! One key's state at one version. The kind and sequence number never
//! change; the value may be dropped by sweep and faulted back in from its
//! checkpoint file.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// What a versioned item records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    Inserted,
    Updated,
    Deleted,
}

impl RecordKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            RecordKind::Inserted => 0,
            RecordKind::Updated => 1,
            RecordKind::Deleted => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RecordKind::Inserted),
            1 => Some(RecordKind::Updated),
            2 => Some(RecordKind::Deleted),
            _ => None,
        }
    }
}

/// Where a value lives inside a value file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueLocation {
    pub file_id: u32,
    pub offset: u64,
    pub length: u32,
    /// CRC32 of the value bytes
    pub crc: u32,
}

struct ValueSlot<V> {
    value: Option<V>,
    location: Option<ValueLocation>,
}

/// A single version of a key
pub struct VersionedItem<V> {
    kind: RecordKind,
    version_sequence_number: i64,
    value_size: u32,
    slot: Mutex<ValueSlot<V>>,
    /// Clock bit for sweep: set on access, cleared by a sweep pass
    in_use: AtomicBool,
}

impl<V: Clone> VersionedItem<V> {
    /// Create an inserted or updated item whose value is in memory
    pub fn with_value(kind: RecordKind, lsn: i64, value: V, value_size: u32) -> Self {
        debug_assert!(kind != RecordKind::Deleted);
        Self {
            kind,
            version_sequence_number: lsn,
            value_size,
            slot: Mutex::new(ValueSlot {
                value: Some(value),
                location: None,
            }),
            in_use: AtomicBool::new(true),
        }
    }

    /// Create a deletion marker
    pub fn deleted(lsn: i64) -> Self {
        Self {
            kind: RecordKind::Deleted,
            version_sequence_number: lsn,
            value_size: 0,
            slot: Mutex::new(ValueSlot {
                value: None,
                location: None,
            }),
            in_use: AtomicBool::new(false),
        }
    }

    /// Create an item recovered from a key file; the value stays on disk.
    pub fn on_disk(kind: RecordKind, lsn: i64, location: Option<ValueLocation>) -> Self {
        let value_size = location.map(|l| l.length).unwrap_or(0);
        Self {
            kind,
            version_sequence_number: lsn,
            value_size,
            slot: Mutex::new(ValueSlot {
                value: None,
                location,
            }),
            in_use: AtomicBool::new(false),
        }
    }

    /// Copy of this item pointing at a new location (used by merge).
    pub fn relocated(&self, location: ValueLocation) -> Self {
        let slot = self.slot.lock();
        Self {
            kind: self.kind,
            version_sequence_number: self.version_sequence_number,
            value_size: location.length,
            slot: Mutex::new(ValueSlot {
                value: slot.value.clone(),
                location: Some(location),
            }),
            in_use: AtomicBool::new(self.in_use.load(Ordering::Relaxed)),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn version_sequence_number(&self) -> i64 {
        self.version_sequence_number
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == RecordKind::Deleted
    }

    /// Serialized size of the value (0 for deletions)
    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    /// The in-memory value, if it has not been swept
    pub fn value(&self) -> Option<V> {
        let slot = self.slot.lock();
        if slot.value.is_some() {
            self.in_use.store(true, Ordering::Relaxed);
        }
        slot.value.clone()
    }

    pub fn is_in_memory(&self) -> bool {
        self.slot.lock().value.is_some()
    }

    pub fn location(&self) -> Option<ValueLocation> {
        self.slot.lock().location
    }

    pub(crate) fn set_location(&self, location: ValueLocation) {
        self.slot.lock().location = Some(location);
    }

    pub(crate) fn clear_location(&self, file_id: u32) {
        let mut slot = self.slot.lock();
        if slot.location.map(|l| l.file_id) == Some(file_id) {
            slot.location = None;
        }
    }

    /// Put a value loaded from disk back in memory.
    ///
    /// Returns true when the value was absent, so the caller can account for it.
    pub(crate) fn cache_value(&self, value: V) -> bool {
        let mut slot = self.slot.lock();
        self.in_use.store(true, Ordering::Relaxed);
        if slot.value.is_some() {
            return false;
        }
        slot.value = Some(value);
        true
    }

    /// One clock step of sweep.
    ///
    /// A recently used item only loses its clock bit. Otherwise the value is
    /// dropped when a durable copy exists.
    pub(crate) fn sweep_step(&self) -> SweepStep {
        if self.kind == RecordKind::Deleted {
            return SweepStep::Skipped;
        }
        let mut slot = self.slot.lock();
        if slot.value.is_none() || slot.location.is_none() {
            return SweepStep::Skipped;
        }
        if self.in_use.swap(false, Ordering::Relaxed) {
            return SweepStep::Cleared;
        }
        slot.value = None;
        SweepStep::Evicted(self.value_size)
    }
}

/// Result of one sweep step on an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepStep {
    /// Value dropped, releasing this many bytes
    Evicted(u32),
    /// Recently used; clock bit cleared
    Cleared,
    /// Nothing to evict (no value in memory, no disk copy, or deleted)
    Skipped,
}

impl<V> fmt::Debug for VersionedItem<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("VersionedItem")
            .field("kind", &self.kind)
            .field("lsn", &self.version_sequence_number)
            .field("value_size", &self.value_size)
            .field("in_memory", &slot.value.is_some())
            .field("location", &slot.location)
            .finish()
    }
}
