//! Builder for shard-mode sweeps.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::{IteratorConfig, WorkerPoolConfig};
use crate::core::error::PoolError;
use crate::core::iterator::{AlwaysProcess, Handler, ProcessGate, RecordFilter};
use crate::core::metrics::{MetricsSink, NoopMetrics};
use crate::core::record::IterableRecord;
use crate::core::semaphore::Semaphore;
use crate::core::shard::{ScannerParts, ShardScanner, ShardWorker};
use crate::core::worker_pool::WorkerPool;
use crate::infra::record_store::RecordStore;

/// Assembles a [`ShardScanner`] from configuration, a store, and a handler.
///
/// The `replica_count` and `shard_id` of the [`IteratorConfig`] determine
/// this replica's slice of the collection.
pub struct ShardScannerBuilder<T, S, H>
where
    T: IterableRecord,
    S: RecordStore<T>,
    H: Handler<T>,
{
    config: IteratorConfig,
    pool: WorkerPoolConfig,
    store: Arc<S>,
    handler: H,
    gate: Arc<dyn ProcessGate>,
    filter: Option<Arc<dyn RecordFilter<T>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<T, S, H> ShardScannerBuilder<T, S, H>
where
    T: IterableRecord,
    S: RecordStore<T>,
    H: Handler<T>,
{
    /// Start a builder with default pool sizing, an always-open gate, no
    /// filter, and no-op metrics.
    pub fn new(config: IteratorConfig, store: Arc<S>, handler: H) -> Self {
        Self {
            config,
            pool: WorkerPoolConfig::default(),
            store,
            handler,
            gate: Arc::new(AlwaysProcess),
            filter: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Worker-pool sizing for this sweep.
    #[must_use]
    pub fn pool_config(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Gate consulted before the sweep starts.
    #[must_use]
    pub fn gate(mut self, gate: Arc<dyn ProcessGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Per-record veto applied before submission.
    #[must_use]
    pub fn filter(mut self, filter: Arc<dyn RecordFilter<T>>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Metrics sink for durations and errors.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate the configuration and assemble the scanner.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] for configuration violations or worker
    /// spawn failures.
    pub fn build(self) -> Result<ShardScanner<T, S>, PoolError> {
        self.config.validate().map_err(PoolError::InvalidConfig)?;

        let semaphore = Arc::new(Semaphore::new(self.config.semaphore_bound));
        let metrics = Arc::clone(&self.metrics);

        let worker = Arc::new(ShardWorker {
            name: self.config.name.clone(),
            handler: self.handler,
            semaphore: Arc::clone(&semaphore),
            metrics: Arc::clone(&metrics),
            _record: PhantomData,
        });
        let pool = WorkerPool::new(&self.pool, worker)?;

        Ok(ShardScanner::from_parts(ScannerParts {
            name: self.config.name.clone(),
            replica_count: self.config.replica_count,
            shard_id: self.config.shard_id,
            store: self.store,
            gate: self.gate,
            filter: self.filter,
            metrics,
            semaphore,
            pool,
        }))
    }
}
