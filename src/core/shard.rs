//! Sharded single-pass collection sweeps.
//!
//! Shard mode partitions the full collection across cooperating replicas by
//! ordinal position and streams each shard's slice to the worker pool. It
//! serves exhaustive one-off sweeps (backfills, audits) and never touches a
//! scheduling field. Skip-based paging is used exactly once to locate the
//! shard's start; the remainder is cursor-based to avoid quadratic skip
//! cost.

use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::core::error::{AppResult, PoolError};
use crate::core::iterator::{Handler, ProcessGate, RecordFilter};
use crate::core::metrics::{self, MetricsSink};
use crate::core::record::IterableRecord;
use crate::core::semaphore::Semaphore;
use crate::core::worker_pool::{PickupAck, Worker, WorkerPool};
use crate::infra::record_store::RecordStore;
use crate::util::clock::now_ms;

/// Batch size multiplier over the pool's worker count.
const BATCH_FACTOR: usize = 2;

/// Streams one shard's slice of the full collection to the worker pool.
///
/// Construct through [`crate::builders::ShardScannerBuilder`].
pub struct ShardScanner<T, S>
where
    T: IterableRecord,
    S: RecordStore<T>,
{
    name: String,
    replica_count: u32,
    shard_id: u32,
    store: Arc<S>,
    gate: Arc<dyn ProcessGate>,
    filter: Option<Arc<dyn RecordFilter<T>>>,
    metrics: Arc<dyn MetricsSink>,
    semaphore: Arc<Semaphore>,
    pool: WorkerPool<T>,
}

/// Construction parameters assembled by the builder.
pub(crate) struct ScannerParts<T, S>
where
    T: IterableRecord,
    S: RecordStore<T>,
{
    pub name: String,
    pub replica_count: u32,
    pub shard_id: u32,
    pub store: Arc<S>,
    pub gate: Arc<dyn ProcessGate>,
    pub filter: Option<Arc<dyn RecordFilter<T>>>,
    pub metrics: Arc<dyn MetricsSink>,
    pub semaphore: Arc<Semaphore>,
    pub pool: WorkerPool<T>,
}

impl<T, S> ShardScanner<T, S>
where
    T: IterableRecord,
    S: RecordStore<T>,
{
    pub(crate) fn from_parts(parts: ScannerParts<T, S>) -> Self {
        Self {
            name: parts.name,
            replica_count: parts.replica_count.max(1),
            shard_id: parts.shard_id,
            store: parts.store,
            gate: parts.gate,
            filter: parts.filter,
            metrics: parts.metrics,
            semaphore: parts.semaphore,
            pool: parts.pool,
        }
    }

    /// Scanner name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sweep this shard's slice once. Completion is implicit when the
    /// cursor is exhausted; errors are logged and counted, never raised.
    pub fn scan(&self) {
        if !self.gate.should_process() {
            return;
        }
        if let Err(err) = self.scan_slice() {
            error!(scanner = %self.name, error = %format!("{err:#}"), "shard scan failed");
            self.metrics.record_count(metrics::CLAIM_ERROR, &self.name);
        }
    }

    /// Join the worker pool after a sweep so every submitted record has
    /// been processed.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn scan_slice(&self) -> AppResult<()> {
        let _permit = self.semaphore.acquire();
        let sweep_start = now_ms();

        let total = self.store.count_all()?;
        let slice = total.div_ceil(u64::from(self.replica_count));
        let start = slice * u64::from(self.shard_id);
        let mut remaining = slice;

        let Some(first) = self.store.fetch_by_skip(start)? else {
            info!(scanner = %self.name, shard = self.shard_id, "no records in this shard's slice");
            return Ok(());
        };
        info!(
            scanner = %self.name,
            shard = self.shard_id,
            docs = slice,
            start,
            "shard scan started"
        );

        let mut last_id = first.record_id().to_owned();
        self.submit(first);
        remaining = remaining.saturating_sub(1);

        // Adjacent shards may both see a boundary record; re-processing one
        // is accepted, permanently skipping one is not.
        while remaining > 0 {
            let batch_cap = BATCH_FACTOR * self.pool.worker_count().saturating_sub(1).max(1);
            let limit = usize::try_from(remaining).map_or(batch_cap, |r| batch_cap.min(r)).max(1);

            let batch = self.store.fetch_id_greater_than(&last_id, limit)?;
            if batch.is_empty() {
                break;
            }
            for record in batch {
                last_id = record.record_id().to_owned();
                self.submit(record);
                remaining = remaining.saturating_sub(1);
            }
        }

        info!(
            scanner = %self.name,
            shard = self.shard_id,
            last = %last_id,
            elapsed_ms = now_ms().saturating_sub(sweep_start),
            "shard scan finished"
        );
        Ok(())
    }

    fn submit(&self, record: T) {
        if let Some(filter) = &self.filter {
            if !filter.should_process(&record) {
                return;
            }
        }
        match self.pool.submit(record) {
            Ok(()) => {}
            Err(PoolError::Shutdown) => {
                info!(scanner = %self.name, "worker pool has shut down; ending submissions");
            }
            Err(err) => {
                warn!(scanner = %self.name, error = %err, "worker pool rejected record");
            }
        }
    }
}

/// Worker-side processing for shard sweeps: invoke the handler, touch no
/// scheduling field.
pub(crate) struct ShardWorker<T, H> {
    pub name: String,
    pub handler: H,
    pub semaphore: Arc<Semaphore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub _record: PhantomData<fn(T)>,
}

impl<T, H> Worker<T> for ShardWorker<T, H>
where
    T: IterableRecord,
    H: Handler<T>,
{
    fn run(&self, record: T, pickup: &PickupAck) {
        let _permit = self.semaphore.acquire();
        pickup.signal();

        let start = now_ms();
        let id = record.record_id().to_owned();
        self.metrics
            .record_count(metrics::WORKING_ON_RECORD, &self.name);

        match catch_unwind(AssertUnwindSafe(|| self.handler.handle(record))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(scanner = %self.name, record = %id, error = %format!("{err:#}"), "handler failed for record");
                self.metrics.record_count(metrics::CLAIM_ERROR, &self.name);
            }
            Err(_) => {
                error!(scanner = %self.name, record = %id, "handler panicked for record");
                self.metrics.record_count(metrics::CLAIM_ERROR, &self.name);
            }
        }

        let elapsed = now_ms().saturating_sub(start);
        self.metrics.record_duration(
            metrics::PROCESSING_TIME,
            &self.name,
            Duration::from_millis(u64::try_from(elapsed).unwrap_or_default()),
        );
        debug!(scanner = %self.name, record = %id, "done with record");
    }
}
