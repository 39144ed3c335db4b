//! Background consolidation
//!
//! Runs one consolidation (and the merge it may drive) on its own thread.
//! The outcome is delivered over a channel that the next checkpoint waits
//! on, so consolidations never overlap. Nothing the task produces becomes
//! visible until that checkpoint collects it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver};
use tracing::warn;

use crate::error::{Result, TesseraError};
use crate::state::{StoreKey, StoreValue};
use crate::storage::FileMetadata;

use super::manager::ConsolidationBuild;

/// Everything one consolidation produced
pub struct ConsolidationResult<K, V> {
    /// New consolidated state, relocations from the merge already applied
    pub build: Option<ConsolidationBuild<K, V>>,
    pub merged_file: Option<Arc<FileMetadata>>,
    pub removed_file_ids: Vec<u32>,
}

impl<K, V> ConsolidationResult<K, V> {
    pub fn empty() -> Self {
        Self {
            build: None,
            merged_file: None,
            removed_file_ids: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.build.is_none() && self.merged_file.is_none() && self.removed_file_ids.is_empty()
    }

    /// Throw away a result that will never be applied
    pub fn discard(self) {
        if let Some(file) = self.merged_file {
            file.mark_for_deletion();
        }
    }
}

impl<K, V> Default for ConsolidationResult<K, V> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Handle on a running background consolidation
pub struct ConsolidationTask<K, V> {
    receiver: Receiver<Result<ConsolidationResult<K, V>>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<K: StoreKey, V: StoreValue> ConsolidationTask<K, V> {
    /// Start `work` on a new thread. The closure receives the cancellation flag.
    pub fn spawn<F>(work: F) -> Result<Self>
    where
        F: FnOnce(&AtomicBool) -> Result<ConsolidationResult<K, V>> + Send + 'static,
    {
        let (sender, receiver) = channel::bounded(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        let handle = thread::Builder::new()
            .name("tessera-consolidation".to_string())
            .spawn(move || {
                let outcome = work(&flag);
                // Nobody listens if the task was abandoned
                if let Err(channel::SendError(Ok(result))) = sender.send(outcome) {
                    result.discard();
                }
            })?;

        Ok(Self {
            receiver,
            cancel,
            handle: Some(handle),
        })
    }
}

impl<K, V> ConsolidationTask<K, V> {
    pub fn is_finished(&self) -> bool {
        !self.receiver.is_empty() || self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Block until the consolidation settles and return its outcome
    pub fn wait(mut self) -> Result<ConsolidationResult<K, V>> {
        let outcome = self.receiver.recv().map_err(|_| {
            TesseraError::Storage("background consolidation exited without a result".to_string())
        });
        self.join();
        outcome?
    }

    /// Stop the consolidation and wait for its thread to exit.
    ///
    /// Whatever it managed to produce is discarded.
    pub fn cancel(mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Ok(Ok(result)) = self.receiver.recv() {
            result.discard();
        }
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("background consolidation thread panicked");
            }
        }
    }
}

impl<K, V> Drop for ConsolidationTask<K, V> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel.store(true, Ordering::Relaxed);
            if let Ok(Ok(result)) = self.receiver.try_recv() {
                result.discard();
            }
            self.join();
            if let Ok(Ok(result)) = self.receiver.try_recv() {
                result.discard();
            }
        }
    }
}
