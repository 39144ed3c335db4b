//! Sweep Manager
//!
//! Bounds memory by dropping in-memory values of consolidated entries that
//! already have a durable copy in a checkpoint file. Entries whose only copy
//! is in memory are never touched.
//!
//! ## Policy
//! - footprint below 50% of the buffer: nothing to do
//! - between 50% and 75%: one clock pass
//! - above 75%: passes until the footprint is below 50%
//!
//! Each pass walks the consolidated state once: a recently used entry only
//! loses its clock bit, an entry not used since the previous pass is evicted.
//! Sweeping stops as soon as a pass makes no progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::state::{ConsolidatedState, StoreKey, StoreValue, SweepStep};

/// Summary of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub cycles: usize,
    pub evicted_items: u64,
    pub evicted_bytes: u64,
    pub memory_before: u64,
    pub memory_after: u64,
}

struct SweepWorker {
    stop: Sender<()>,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct SweepManager {
    memory_buffer_size: u64,
    interval: Duration,
    worker: Mutex<Option<SweepWorker>>,
}

impl SweepManager {
    pub fn new(memory_buffer_size: u64, interval: Duration) -> Self {
        Self {
            memory_buffer_size,
            interval,
            worker: Mutex::new(None),
        }
    }

    pub fn memory_buffer_size(&self) -> u64 {
        self.memory_buffer_size
    }

    /// Sweep according to the footprint thresholds.
    ///
    /// `footprint` reports the current in-memory value bytes of the store.
    pub fn sweep<K, V, F>(
        &self,
        consolidated: &ConsolidatedState<K, V>,
        footprint: F,
        cancel: &AtomicBool,
    ) -> SweepReport
    where
        K: StoreKey,
        V: StoreValue,
        F: Fn() -> u64,
    {
        let before = footprint();
        let low = self.memory_buffer_size / 2;
        let high = self.memory_buffer_size / 4 * 3;

        if before < low {
            trace!(footprint = before, "sweep not needed");
            return SweepReport {
                memory_before: before,
                memory_after: before,
                ..SweepReport::default()
            };
        }
        if before <= high {
            let mut report = SweepReport {
                memory_before: before,
                ..SweepReport::default()
            };
            let (items, bytes, _) = Self::sweep_cycle(consolidated, cancel);
            report.cycles = 1;
            report.evicted_items = items;
            report.evicted_bytes = bytes;
            report.memory_after = footprint();
            return report;
        }
        self.sweep_until_below(consolidated, low, footprint, cancel)
    }

    /// Repeat passes until the footprint is at most `target` or no pass can
    /// make progress.
    pub fn sweep_until_below<K, V, F>(
        &self,
        consolidated: &ConsolidatedState<K, V>,
        target: u64,
        footprint: F,
        cancel: &AtomicBool,
    ) -> SweepReport
    where
        K: StoreKey,
        V: StoreValue,
        F: Fn() -> u64,
    {
        let mut report = SweepReport {
            memory_before: footprint(),
            ..SweepReport::default()
        };

        while footprint() > target && !cancel.load(Ordering::Relaxed) {
            let (items, bytes, cleared) = Self::sweep_cycle(consolidated, cancel);
            report.cycles += 1;
            report.evicted_items += items;
            report.evicted_bytes += bytes;
            if items == 0 && cleared == 0 {
                break;
            }
        }

        report.memory_after = footprint();
        debug!(
            cycles = report.cycles,
            evicted = report.evicted_items,
            bytes = report.evicted_bytes,
            before = report.memory_before,
            after = report.memory_after,
            "sweep finished"
        );
        report
    }

    /// One clock pass. Returns (evicted items, evicted bytes, cleared bits).
    fn sweep_cycle<K, V>(consolidated: &ConsolidatedState<K, V>, cancel: &AtomicBool) -> (u64, u64, u64)
    where
        K: StoreKey,
        V: StoreValue,
    {
        let mut items = 0u64;
        let mut bytes = 0u64;
        let mut cleared = 0u64;
        consolidated.for_each(|_, item| {
            if cancel.load(Ordering::Relaxed) {
                return false;
            }
            match item.sweep_step() {
                SweepStep::Evicted(size) => {
                    items += 1;
                    bytes += size as u64;
                }
                SweepStep::Cleared => cleared += 1,
                SweepStep::Skipped => {}
            }
            true
        });
        consolidated.add_memory(-(bytes as i64));
        (items, bytes, cleared)
    }

    // =========================================================================
    // Background Task
    // =========================================================================

    /// Run `pass` every interval on a background thread until cancelled.
    /// Does nothing when a task is already running.
    pub fn start<F>(&self, mut pass: F) -> Result<()>
    where
        F: FnMut(&AtomicBool) + Send + 'static,
    {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (stop, stopped) = channel::bounded::<()>(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name("tessera-sweep".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if flag.load(Ordering::Relaxed) {
                            break;
                        }
                        pass(&flag);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        debug!(interval_ms = interval.as_millis() as u64, "background sweep started");
        *worker = Some(SweepWorker {
            stop,
            cancel,
            handle,
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Stop the background task, interrupting a pass in progress, and wait
    /// for the thread to exit.
    pub fn cancel(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.cancel.store(true, Ordering::Relaxed);
            let _ = worker.stop.try_send(());
            if worker.handle.join().is_err() {
                warn!("background sweep thread panicked");
            }
            debug!("background sweep cancelled");
        }
    }
}

impl Drop for SweepManager {
    fn drop(&mut self) {
        self.cancel();
    }
}
