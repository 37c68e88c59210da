//! Thread handle for engines running in loop mode.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::warn;

use crate::core::iterator::{ProcessMode, RecordIterator};
use crate::core::record::IterableRecord;
use crate::core::registry::SchedulerControl;
use crate::infra::record_store::RecordStore;

/// Owns the loop thread of one engine and exposes its control surface.
///
/// For a pump-mode engine, `wakeup` triggers a fresh drain on a short-lived
/// thread; for a loop-mode engine it interrupts the idle sleep.
pub struct IteratorHandle<T, S>
where
    T: IterableRecord,
    S: RecordStore<T>,
{
    iterator: Arc<RecordIterator<T, S>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T, S> IteratorHandle<T, S>
where
    T: IterableRecord,
    S: RecordStore<T>,
{
    /// Spawn the engine loop on a dedicated named thread.
    #[must_use]
    pub fn start(iterator: RecordIterator<T, S>) -> Self {
        let iterator = Arc::new(iterator);
        let runner = Arc::clone(&iterator);
        let thread = thread::Builder::new()
            .name(format!("drumbeat-iterator-{}", iterator.name()))
            .spawn(move || runner.process())
            .map_err(|err| warn!(error = %err, "could not spawn iterator thread"))
            .ok();
        Self {
            iterator,
            thread: Mutex::new(thread),
        }
    }

    /// Wrap an engine without spawning a thread; `wakeup` drives pump-mode
    /// drains on demand.
    #[must_use]
    pub fn detached(iterator: RecordIterator<T, S>) -> Self {
        Self {
            iterator: Arc::new(iterator),
            thread: Mutex::new(None),
        }
    }

    /// The underlying engine.
    #[must_use]
    pub fn iterator(&self) -> &Arc<RecordIterator<T, S>> {
        &self.iterator
    }

    /// Stop the engine and join its loop thread.
    pub fn stop_and_join(&self) {
        self.iterator.stop();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!(iterator = %self.iterator.name(), "iterator thread panicked");
            }
        }
    }
}

impl<T, S> SchedulerControl for IteratorHandle<T, S>
where
    T: IterableRecord,
    S: RecordStore<T>,
{
    fn name(&self) -> &str {
        self.iterator.name()
    }

    fn wakeup(&self) {
        match self.iterator.mode() {
            ProcessMode::Loop => self.iterator.wakeup(),
            ProcessMode::Pump => {
                let runner = Arc::clone(&self.iterator);
                let spawned = thread::Builder::new()
                    .name(format!("drumbeat-pump-{}", self.iterator.name()))
                    .spawn(move || runner.process());
                if spawned.is_err() {
                    warn!(iterator = %self.iterator.name(), "could not spawn pump thread");
                }
            }
        }
    }

    fn stop(&self) {
        self.stop_and_join();
    }
}
