//! Lock Manager
//!
//! Row-level and store-wide locks held by transactions.
//!
//! ## Compatibility
//! ```text
//!              held by another owner
//! requested    Shared   Update   Exclusive
//! Shared         ok       ok        wait
//! Update         ok      wait       wait
//! Exclusive     wait     wait       wait
//! ```
//!
//! Locks are re-entrant per owner; asking for a stronger mode upgrades in
//! place once the other holders allow it. A waiter that times out leaves
//! nothing behind.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{Result, TesseraError};

/// Lock strength, ordered weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Shared,
    Update,
    Exclusive,
}

/// What a lock protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockResource {
    /// The whole store
    Prime,
    /// One key, identified by its hash
    Key(u64),
}

impl LockResource {
    pub fn key<K: Hash>(key: &K) -> Self {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        LockResource::Key(hasher.finish())
    }
}

/// Identifies a lock holder (a transaction id)
pub type LockOwner = u64;

pub struct LockManager {
    table: Mutex<HashMap<LockResource, HashMap<LockOwner, LockMode>>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Acquire `resource` in `mode` for `owner`, waiting at most `timeout`
    /// (`None` waits forever).
    ///
    /// Returns the mode now held, which may be stronger than requested.
    pub fn acquire(
        &self,
        owner: LockOwner,
        resource: LockResource,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<LockMode> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut table = self.table.lock();

        loop {
            let holders = table.entry(resource).or_default();
            let held = holders.get(&owner).copied();
            if held.map_or(false, |h| h >= mode) {
                return Ok(held.unwrap_or(mode));
            }
            let wanted = held.map_or(mode, |h| h.max(mode));

            if Self::compatible(holders, owner, wanted) {
                holders.insert(owner, wanted);
                trace!(owner, ?resource, mode = ?wanted, "lock granted");
                return Ok(wanted);
            }

            if holders.is_empty() {
                table.remove(&resource);
            }

            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut table, deadline).timed_out() {
                        // One last look: the release may have raced the timeout.
                        let holders = table.entry(resource).or_default();
                        if Self::compatible(holders, owner, wanted) {
                            holders.insert(owner, wanted);
                            return Ok(wanted);
                        }
                        if holders.is_empty() {
                            table.remove(&resource);
                        }
                        return Err(TesseraError::Timeout(format!(
                            "{:?} lock on {:?} after {:?}",
                            wanted,
                            resource,
                            timeout.unwrap_or_default()
                        )));
                    }
                }
                None => self.released.wait(&mut table),
            }
        }
    }

    fn compatible(holders: &HashMap<LockOwner, LockMode>, owner: LockOwner, wanted: LockMode) -> bool {
        holders
            .iter()
            .filter(|(holder, _)| **holder != owner)
            .all(|(_, held)| match wanted {
                LockMode::Shared => *held != LockMode::Exclusive,
                LockMode::Update => *held == LockMode::Shared,
                LockMode::Exclusive => false,
            })
    }

    /// Release one resource held by `owner`
    pub fn release(&self, owner: LockOwner, resource: LockResource) {
        let mut table = self.table.lock();
        if let Some(holders) = table.get_mut(&resource) {
            holders.remove(&owner);
            if holders.is_empty() {
                table.remove(&resource);
            }
        }
        drop(table);
        self.released.notify_all();
    }

    /// Release every resource in `resources` held by `owner`
    pub fn release_all(&self, owner: LockOwner, resources: &[LockResource]) {
        if resources.is_empty() {
            return;
        }
        let mut table = self.table.lock();
        for resource in resources {
            if let Some(holders) = table.get_mut(resource) {
                holders.remove(&owner);
                if holders.is_empty() {
                    table.remove(resource);
                }
            }
        }
        drop(table);
        self.released.notify_all();
    }

    /// Mode `owner` holds on `resource`, if any
    pub fn held_mode(&self, owner: LockOwner, resource: LockResource) -> Option<LockMode> {
        self.table
            .lock()
            .get(&resource)
            .and_then(|holders| holders.get(&owner).copied())
    }

    /// Number of resources with at least one holder
    pub fn locked_resources(&self) -> usize {
        self.table.lock().len()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
