//! Bounded worker pool backed by dedicated OS threads.
//!
//! The claim loop and the workers meet at a bounded crossbeam channel: the
//! channel depth caps how far the loop can run ahead of actual processing,
//! and [`WorkerPool::submit_and_wait`] lets the loop block briefly until a
//! worker confirms pickup. Workers exit when the sender side is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, SendTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::WorkerPoolConfig;
use crate::core::error::PoolError;

/// Work a pool thread performs for each submitted record.
pub trait Worker<T>: Send + Sync + 'static {
    /// Process one record.
    ///
    /// `pickup` must be signalled as soon as the worker has reserved
    /// whatever it needs to run; the submitter may be blocked on it.
    fn run(&self, record: T, pickup: &PickupAck);
}

struct AckState {
    picked: Mutex<bool>,
    cv: Condvar,
}

impl AckState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            picked: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn signal(&self) {
        let mut picked = self.picked.lock();
        *picked = true;
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let mut picked = self.picked.lock();
        if !*picked {
            let _ = self.cv.wait_for(&mut picked, timeout);
        }
        *picked
    }
}

/// Handoff acknowledgement between a submitter and the worker that picks
/// the item up. Untracked submissions carry an inert ack.
pub struct PickupAck {
    inner: Option<Arc<AckState>>,
}

impl PickupAck {
    /// Mark the item as picked up and wake the submitter.
    pub fn signal(&self) {
        if let Some(state) = &self.inner {
            state.signal();
        }
    }
}

impl Drop for PickupAck {
    fn drop(&mut self) {
        // A worker that returns (or unwinds) without signalling still
        // unblocks its submitter.
        self.signal();
    }
}

struct WorkItem<T> {
    record: T,
    ack: Option<Arc<AckState>>,
}

/// Fixed-size pool of worker threads fed by a bounded queue.
pub struct WorkerPool<T> {
    tx: Mutex<Option<Sender<WorkItem<T>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
    worker_count: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `config.worker_count` threads running `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] when the configuration fails
    /// validation or a worker thread cannot be spawned.
    pub fn new<W: Worker<T>>(config: &WorkerPoolConfig, worker: Arc<W>) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let (tx, rx) = bounded::<WorkItem<T>>(config.queue_depth);

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let rx = rx.clone();
            let worker = Arc::clone(&worker);
            let handle = thread::Builder::new()
                .name(format!("drumbeat-worker-{worker_id}"))
                .stack_size(config.thread_stack_size)
                .spawn(move || {
                    debug!(worker_id, "worker thread started");
                    // Blocking recv; a dropped sender ends the loop.
                    while let Ok(item) = rx.recv() {
                        let pickup = PickupAck { inner: item.ack };
                        worker.run(item.record, &pickup);
                    }
                    debug!(worker_id, "worker thread exiting");
                })
                .map_err(|e| PoolError::InvalidConfig(format!("could not spawn worker: {e}")))?;
            workers.push(handle);
        }

        info!(
            worker_count = config.worker_count,
            queue_depth = config.queue_depth,
            "worker pool initialized"
        );

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shutdown: AtomicBool::new(false),
            worker_count: config.worker_count,
        })
    }

    /// Queue a record without waiting for pickup confirmation.
    ///
    /// Blocks while the queue is full; this is the backpressure path for
    /// bulk sweeps.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Shutdown`] when the pool is gone.
    pub fn submit(&self, record: T) -> Result<(), PoolError> {
        let Some(tx) = self.sender() else {
            return Err(PoolError::Shutdown);
        };
        tx.send(WorkItem { record, ack: None })
            .map_err(|_| PoolError::Shutdown)
    }

    /// Queue a record and wait up to `timeout` for a worker to pick it up.
    ///
    /// A pickup that is not confirmed in time is not an error for the
    /// caller's progress: the record stays queued and will be processed;
    /// `Ok(false)` reports the unconfirmed handoff.
    ///
    /// # Errors
    ///
    /// [`PoolError::QueueFull`] when no queue slot freed within `timeout`,
    /// [`PoolError::Shutdown`] when the pool is gone.
    pub fn submit_and_wait(&self, record: T, timeout: Duration) -> Result<bool, PoolError> {
        let Some(tx) = self.sender() else {
            return Err(PoolError::Shutdown);
        };

        let ack = AckState::new();
        let item = WorkItem {
            record,
            ack: Some(Arc::clone(&ack)),
        };
        tx.send_timeout(item, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(_) => PoolError::QueueFull,
            SendTimeoutError::Disconnected(_) => PoolError::Shutdown,
        })?;

        Ok(ack.wait(timeout))
    }

    /// Number of items waiting in the queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.tx.lock().as_ref().map_or(0, Sender::len)
    }

    /// Configured worker-thread count.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Drop the queue and join the workers. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down worker pool");
        {
            let mut tx = self.tx.lock();
            *tx = None;
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }

    fn sender(&self) -> Option<Sender<WorkItem<T>>> {
        self.tx.lock().as_ref().cloned()
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        // Signal shutdown without joining; workers drain the queue and exit
        // once the sender is gone. Explicit shutdown() joins.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            let mut tx = self.tx.lock();
            *tx = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingWorker {
        seen: AtomicUsize,
        delay: Duration,
    }

    impl Worker<u32> for CountingWorker {
        fn run(&self, _record: u32, pickup: &PickupAck) {
            pickup.signal();
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(workers: usize, depth: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::new()
            .with_worker_count(workers)
            .with_queue_depth(depth)
    }

    #[test]
    fn submitted_records_are_processed() {
        let worker = Arc::new(CountingWorker {
            seen: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let pool = WorkerPool::new(&config(2, 8), Arc::clone(&worker)).unwrap();

        for i in 0..10 {
            pool.submit(i).unwrap();
        }
        pool.shutdown();
        assert_eq!(worker.seen.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn submit_and_wait_confirms_pickup() {
        let worker = Arc::new(CountingWorker {
            seen: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let pool = WorkerPool::new(&config(1, 4), Arc::clone(&worker)).unwrap();

        let picked = pool.submit_and_wait(7, Duration::from_secs(2)).unwrap();
        assert!(picked);
        pool.shutdown();
        assert_eq!(worker.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let worker = Arc::new(CountingWorker {
            seen: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let pool = WorkerPool::new(&config(1, 1), worker).unwrap();
        pool.shutdown();
        assert!(matches!(pool.submit(1), Err(PoolError::Shutdown)));
    }

    #[test]
    fn full_queue_times_out() {
        let worker = Arc::new(CountingWorker {
            seen: AtomicUsize::new(0),
            delay: Duration::from_millis(300),
        });
        let pool = WorkerPool::new(&config(1, 1), worker).unwrap();

        // One in flight, one queued; the third submission has no slot.
        pool.submit(1).unwrap();
        pool.submit(2).unwrap();
        let result = pool.submit_and_wait(3, Duration::from_millis(30));
        assert!(matches!(result, Err(PoolError::QueueFull)));
        pool.shutdown();
    }
}
