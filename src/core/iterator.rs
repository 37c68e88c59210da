//! The polling engine: discovers due records and feeds the worker pool.
//!
//! Every replica runs the same loop against the shared store. Correctness
//! does not depend on mutual exclusion between replicas, only on the
//! store's atomic claim: among concurrent claimants racing for the same due
//! record, exactly one wins and the rest observe nothing due.

use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::error::{AppResult, PoolError};
use crate::core::metrics::{self, MetricsSink};
use crate::core::record::IterableRecord;
use crate::core::semaphore::Semaphore;
use crate::core::worker_pool::{PickupAck, Worker, WorkerPool};
use crate::infra::record_store::RecordStore;
use crate::util::clock::now_ms;

/// Backoff applied after an unexpected iteration error. The loop never exits
/// on transient failures.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// How the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// Run until stopped, sleeping between polls.
    Loop,
    /// Run until the store has nothing due, then return. Used for bounded
    /// batch drains and one-shot invocations.
    Pump,
}

/// Rescheduling discipline applied to claimed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingKind {
    /// Fixed recurring interval kept in a single next-run field.
    Regular,
    /// Explicit list of future run times; missed occurrences are kept.
    Irregular,
    /// Explicit list of future run times; missed occurrences are dropped.
    IrregularSkipMissed,
}

/// Per-record business callback.
pub trait Handler<T>: Send + Sync + 'static {
    /// Process one claimed record.
    ///
    /// Errors are logged with the record's identity and never stall the
    /// engine or the worker pool.
    fn handle(&self, record: T) -> anyhow::Result<()>;
}

/// Gate consulted before every claim attempt.
///
/// A `false` return skips the attempt. This is a flag, not a distributed
/// lock: multiple replicas may poll concurrently.
pub trait ProcessGate: Send + Sync {
    /// Whether this replica should poll right now.
    fn should_process(&self) -> bool;
}

/// Gate that always polls.
pub struct AlwaysProcess;

impl ProcessGate for AlwaysProcess {
    fn should_process(&self) -> bool {
        true
    }
}

/// Gate combining a maintenance flag with replica eligibility.
#[derive(Default)]
pub struct ReplicaGate {
    maintenance: AtomicBool,
    not_eligible: AtomicBool,
}

impl ReplicaGate {
    /// Create a gate that is open (eligible, not in maintenance).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter or leave maintenance mode.
    pub fn set_maintenance(&self, maintenance: bool) {
        self.maintenance.store(maintenance, Ordering::Release);
    }

    /// Mark this replica as eligible for the workload or not.
    pub fn set_eligible(&self, eligible: bool) {
        self.not_eligible.store(!eligible, Ordering::Release);
    }
}

impl ProcessGate for ReplicaGate {
    fn should_process(&self) -> bool {
        !self.maintenance.load(Ordering::Acquire) && !self.not_eligible.load(Ordering::Acquire)
    }
}

/// Optional per-record veto applied after a claim, before the handoff.
pub trait RecordFilter<T>: Send + Sync {
    /// Whether the claimed record should be handed to the handler.
    fn should_process(&self, record: &T) -> bool;
}

/// Damped moving average used to smear synchronized wakeups across
/// replicas. The 15/16 damping factor is load-bearing; changing it changes
/// contention behavior.
const fn moving_avg(current: i64, sample: i64) -> i64 {
    (15 * current + sample) / 16
}

enum Step {
    /// A record was claimed and handed off; claim again immediately.
    Claimed,
    /// A claim was discarded (stale irregular occurrence or filter veto).
    Skipped,
    /// Nothing due; the idle sleep already happened (loop mode).
    Slept,
    /// Nothing due in pump mode; the drain is complete.
    Drained,
}

struct SleepState {
    wake_pending: bool,
    stopped: bool,
}

/// Polling engine for one record type and scheduling field.
///
/// Construct through [`crate::builders::RecordIteratorBuilder`].
pub struct RecordIterator<T, S>
where
    T: IterableRecord,
    S: RecordStore<T>,
{
    name: String,
    mode: ProcessMode,
    kind: SchedulingKind,
    field: String,
    target_interval: Duration,
    max_sleep: Duration,
    throttle_ms: i64,
    redistribute: bool,
    unsorted: bool,
    handoff_wait: Duration,
    store: Arc<S>,
    gate: Arc<dyn ProcessGate>,
    filter: Option<Arc<dyn RecordFilter<T>>>,
    metrics: Arc<dyn MetricsSink>,
    semaphore: Arc<Semaphore>,
    pool: WorkerPool<T>,
    sleep_state: Mutex<SleepState>,
    sleep_cv: Condvar,
}

/// Construction parameters assembled by the builder.
pub(crate) struct IteratorParts<T, S>
where
    T: IterableRecord,
    S: RecordStore<T>,
{
    pub name: String,
    pub mode: ProcessMode,
    pub kind: SchedulingKind,
    pub field: String,
    pub target_interval: Duration,
    pub max_sleep: Duration,
    pub throttle: Option<Duration>,
    pub redistribute: bool,
    pub unsorted: bool,
    pub handoff_wait: Duration,
    pub store: Arc<S>,
    pub gate: Arc<dyn ProcessGate>,
    pub filter: Option<Arc<dyn RecordFilter<T>>>,
    pub metrics: Arc<dyn MetricsSink>,
    pub semaphore: Arc<Semaphore>,
    pub pool: WorkerPool<T>,
}

impl<T, S> RecordIterator<T, S>
where
    T: IterableRecord,
    S: RecordStore<T>,
{
    pub(crate) fn from_parts(parts: IteratorParts<T, S>) -> Self {
        Self {
            name: parts.name,
            mode: parts.mode,
            kind: parts.kind,
            field: parts.field,
            target_interval: parts.target_interval,
            max_sleep: parts.max_sleep,
            throttle_ms: parts
                .throttle
                .map_or(0, |t| i64::try_from(t.as_millis()).unwrap_or(i64::MAX)),
            redistribute: parts.redistribute,
            unsorted: parts.unsorted,
            handoff_wait: parts.handoff_wait,
            store: parts.store,
            gate: parts.gate,
            filter: parts.filter,
            metrics: parts.metrics,
            semaphore: parts.semaphore,
            pool: parts.pool,
            sleep_state: Mutex::new(SleepState {
                wake_pending: false,
                stopped: false,
            }),
            sleep_cv: Condvar::new(),
        }
    }

    /// Iterator name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured process mode.
    #[must_use]
    pub const fn mode(&self) -> ProcessMode {
        self.mode
    }

    /// Run the engine until stopped (loop mode) or drained (pump mode).
    pub fn process(&self) {
        let mut moving_average: i64 = 0;
        let mut previous: i64 = 0;

        info!(iterator = %self.name, mode = ?self.mode, "engine started");
        loop {
            if self.is_stopped() {
                break;
            }
            if !self.gate.should_process() {
                if self.mode == ProcessMode::Pump {
                    return;
                }
                self.interruptible_sleep(ERROR_BACKOFF);
                continue;
            }
            match self.iteration(&mut moving_average, &mut previous) {
                Ok(Step::Claimed | Step::Skipped | Step::Slept) => {}
                Ok(Step::Drained) => break,
                Err(err) => {
                    error!(iterator = %self.name, error = %format!("{err:#}"), "iteration failed");
                    self.metrics.record_count(metrics::CLAIM_ERROR, &self.name);
                    self.interruptible_sleep(ERROR_BACKOFF);
                }
            }
        }
        info!(iterator = %self.name, "engine stopped");
    }

    /// In loop mode, wake a sleeping engine so it re-evaluates immediately.
    ///
    /// Callers holding a pump-mode engine trigger a fresh drain through
    /// [`crate::runtime::IteratorHandle`] instead.
    pub fn wakeup(&self) {
        let mut state = self.sleep_state.lock();
        state.wake_pending = true;
        self.sleep_cv.notify_all();
    }

    /// Ask the engine to stop after the current iteration and shut the
    /// worker pool down.
    pub fn stop(&self) {
        {
            let mut state = self.sleep_state.lock();
            state.stopped = true;
        }
        self.sleep_cv.notify_all();
        self.pool.shutdown();
    }

    /// Rewind records a paused claimant advanced but never processed.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn recover_after_pause(&self) -> AppResult<u64> {
        Ok(self
            .store
            .recover_after_pause(&self.field, now_ms(), self.target_interval)?)
    }

    fn iteration(&self, moving_average: &mut i64, previous: &mut i64) -> AppResult<Step> {
        let (claimed, throttled) = {
            // Bound concurrent store round-trips; the permit is dropped
            // before any processing happens.
            let _permit = self.semaphore.acquire();

            let mut base = now_ms();
            let throttled = base + self.throttle_ms;
            // Redistribution only makes sense for regular iteration.
            if self.redistribute && self.kind == SchedulingKind::Regular && *previous != 0 {
                base = moving_avg(*previous + *moving_average, base);
                *moving_average = moving_avg(*moving_average, base - *previous);
            }
            *previous = base;

            let claimed = self.store.claim_next(
                &self.field,
                base,
                throttled,
                self.kind,
                self.target_interval,
                self.unsorted,
            )?;
            (claimed, throttled)
        };

        let Some(mut record) = claimed else {
            if self.mode == ProcessMode::Pump {
                return Ok(Step::Drained);
            }
            let next = self.store.find_next_due(&self.field)?;
            let sleep = self.sleep_duration(next.as_ref());
            if !sleep.is_zero() {
                // Reset the redistribution base; a wakeup invalidates it.
                *previous = 0;
                self.interruptible_sleep(sleep);
            }
            return Ok(Step::Slept);
        };

        if self.kind != SchedulingKind::Regular {
            let due = record.next_run_at(&self.field);
            let times = record.recalculate_run_times(
                &self.field,
                self.kind == SchedulingKind::IrregularSkipMissed,
                throttled,
            );
            if !times.is_empty() {
                self.store.persist_run_times(&record, &self.field, &times)?;
            }
            // The claim raced a schedule edit and found no occurrence.
            if due.is_none() {
                return Ok(Step::Skipped);
            }
        }

        if let Some(filter) = &self.filter {
            if !filter.should_process(&record) {
                return Ok(Step::Skipped);
            }
        }

        match self.pool.submit_and_wait(record, self.handoff_wait) {
            Ok(true) => {}
            Ok(false) => {
                debug!(iterator = %self.name, "worker pickup not confirmed within the handoff wait");
            }
            Err(PoolError::Shutdown) => {
                info!(iterator = %self.name, "worker pool has shut down; dropping claimed record");
            }
            Err(err) => {
                warn!(iterator = %self.name, error = %err, "could not queue claimed record");
            }
        }
        Ok(Step::Claimed)
    }

    /// Sleep until the next-soonest-due record, capped by the configured
    /// maximum poll delay.
    fn sleep_duration(&self, next: Option<&T>) -> Duration {
        let Some(next) = next else {
            return self.max_sleep;
        };
        let Some(next_at) = next.next_run_at(&self.field) else {
            return Duration::ZERO;
        };
        let until = next_at - now_ms();
        if until <= 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(u64::try_from(until).unwrap_or(u64::MAX)).min(self.max_sleep)
    }

    fn interruptible_sleep(&self, duration: Duration) {
        let mut state = self.sleep_state.lock();
        if state.stopped {
            return;
        }
        if state.wake_pending {
            state.wake_pending = false;
            return;
        }
        let _ = self.sleep_cv.wait_for(&mut state, duration);
        state.wake_pending = false;
    }

    fn is_stopped(&self) -> bool {
        self.sleep_state.lock().stopped
    }
}

/// Worker-side processing for records claimed by the polling loop.
pub(crate) struct ProcessWorker<T, H> {
    pub name: String,
    pub field: String,
    pub kind: SchedulingKind,
    pub acceptable_delay: Duration,
    pub acceptable_execution_time: Option<Duration>,
    pub handler: H,
    pub semaphore: Arc<Semaphore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub _record: PhantomData<fn(T)>,
}

impl<T, H> Worker<T> for ProcessWorker<T, H>
where
    T: IterableRecord,
    H: Handler<T>,
{
    fn run(&self, mut record: T, pickup: &PickupAck) {
        // The shared semaphore also bounds in-flight work; the submitter's
        // handoff wait covers this acquisition.
        let _permit = self.semaphore.acquire();
        pickup.signal();

        let start = now_ms();
        let due = record.next_run_at(&self.field);
        if self.kind == SchedulingKind::Regular {
            // Clear the consumed occurrence on the in-memory copy so a
            // handler that re-saves the record cannot resurrect it.
            record.update_next_run(&self.field, None);
        }

        let delay_ms = due.filter(|d| *d != 0).map_or(0, |d| (start - d).max(0));
        self.metrics
            .record_count(metrics::WORKING_ON_RECORD, &self.name);
        self.metrics.record_duration(
            metrics::CLAIM_DELAY,
            &self.name,
            Duration::from_millis(u64::try_from(delay_ms).unwrap_or_default()),
        );
        if delay_ms >= i64::try_from(self.acceptable_delay.as_millis()).unwrap_or(i64::MAX) {
            debug!(
                iterator = %self.name,
                delay_ms,
                "record picked up later than the acceptable delay"
            );
        }

        let id = record.record_id().to_owned();
        debug!(iterator = %self.name, record = %id, "working on record");

        match catch_unwind(AssertUnwindSafe(|| self.handler.handle(record))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(iterator = %self.name, record = %id, error = %format!("{err:#}"), "handler failed for record");
                self.metrics.record_count(metrics::CLAIM_ERROR, &self.name);
            }
            Err(_) => {
                error!(iterator = %self.name, record = %id, "handler panicked for record");
                self.metrics.record_count(metrics::CLAIM_ERROR, &self.name);
            }
        }

        let elapsed = now_ms().saturating_sub(start);
        self.metrics.record_duration(
            metrics::PROCESSING_TIME,
            &self.name,
            Duration::from_millis(u64::try_from(elapsed).unwrap_or_default()),
        );
        if let Some(limit) = self.acceptable_execution_time {
            if elapsed > i64::try_from(limit.as_millis()).unwrap_or(i64::MAX) {
                debug!(
                    iterator = %self.name,
                    record = %id,
                    elapsed_ms = elapsed,
                    "record processing exceeded the acceptable execution time"
                );
            }
        }
        debug!(iterator = %self.name, record = %id, "done with record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_avg_is_damped_by_fifteen_sixteenths() {
        assert_eq!(moving_avg(0, 1600), 100);
        assert_eq!(moving_avg(1600, 1600), 1600);
        // A single outlier barely moves an established average.
        assert_eq!(moving_avg(1000, 2000), 1062);
    }

    #[test]
    fn replica_gate_combines_both_flags() {
        let gate = ReplicaGate::new();
        assert!(gate.should_process());

        gate.set_maintenance(true);
        assert!(!gate.should_process());
        gate.set_maintenance(false);

        gate.set_eligible(false);
        assert!(!gate.should_process());
        gate.set_eligible(true);
        assert!(gate.should_process());
    }

    #[test]
    fn always_process_is_open() {
        assert!(AlwaysProcess.should_process());
    }
}
