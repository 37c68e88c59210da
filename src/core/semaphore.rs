//! Counting semaphore bounding in-flight claims and active work.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore built on a parking_lot mutex and condvar.
///
/// One instance bounds the concurrent datastore round-trips plus in-flight
/// worker executions of a single engine. It is a per-process cap only;
/// cluster-wide limiting is what the restraint subsystem provides.
pub struct Semaphore {
    permits: Mutex<u32>,
    released: Condvar,
    bound: u32,
}

/// Permit returned by [`Semaphore::acquire`]; released on drop.
pub struct SemaphorePermit<'a> {
    owner: &'a Semaphore,
}

impl Semaphore {
    /// Create a semaphore with `bound` permits (minimum 1).
    #[must_use]
    pub fn new(bound: u32) -> Self {
        let bound = bound.max(1);
        Self {
            permits: Mutex::new(bound),
            released: Condvar::new(),
            bound,
        }
    }

    /// Block until a permit is available and take it.
    pub fn acquire(&self) -> SemaphorePermit<'_> {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.released.wait(&mut permits);
        }
        *permits -= 1;
        SemaphorePermit { owner: self }
    }

    /// Take a permit if one is free right now.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return None;
        }
        *permits -= 1;
        Some(SemaphorePermit { owner: self })
    }

    /// Number of permits currently available.
    #[must_use]
    pub fn available(&self) -> u32 {
        *self.permits.lock()
    }

    /// Configured permit bound.
    #[must_use]
    pub const fn bound(&self) -> u32 {
        self.bound
    }

    fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.released.notify_one();
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.owner.release();
    }
}
