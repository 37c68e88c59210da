//! Builders assembling engines from configuration and collaborators.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::{IteratorConfig, WorkerPoolConfig};
use crate::core::error::PoolError;
use crate::core::iterator::{
    AlwaysProcess, Handler, IteratorParts, ProcessGate, ProcessWorker, RecordFilter,
    RecordIterator,
};
use crate::core::metrics::{MetricsSink, NoopMetrics};
use crate::core::record::IterableRecord;
use crate::core::semaphore::Semaphore;
use crate::core::worker_pool::WorkerPool;
use crate::infra::record_store::RecordStore;

/// Default scheduling field name when the caller does not override it.
const DEFAULT_FIELD: &str = "next_run_at";

/// Assembles a [`RecordIterator`] from configuration, a store, and a
/// handler, with optional gate/filter/metrics collaborators.
pub struct RecordIteratorBuilder<T, S, H>
where
    T: IterableRecord,
    S: RecordStore<T>,
    H: Handler<T>,
{
    config: IteratorConfig,
    pool: WorkerPoolConfig,
    field: String,
    store: Arc<S>,
    handler: H,
    gate: Arc<dyn ProcessGate>,
    filter: Option<Arc<dyn RecordFilter<T>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<T, S, H> RecordIteratorBuilder<T, S, H>
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
            field: DEFAULT_FIELD.into(),
            store,
            handler,
            gate: Arc::new(AlwaysProcess),
            filter: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Name of the scheduling field the engine claims on.
    #[must_use]
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    /// Worker-pool sizing for this engine.
    #[must_use]
    pub fn pool_config(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Gate consulted before every claim attempt.
    #[must_use]
    pub fn gate(mut self, gate: Arc<dyn ProcessGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Per-record veto applied after a claim.
    #[must_use]
    pub fn filter(mut self, filter: Arc<dyn RecordFilter<T>>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Metrics sink for claim delays, durations, and errors.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate the configuration and assemble the engine.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] for configuration violations or worker
    /// spawn failures.
    pub fn build(self) -> Result<RecordIterator<T, S>, PoolError> {
        self.config.validate().map_err(PoolError::InvalidConfig)?;

        let semaphore = Arc::new(Semaphore::new(self.config.semaphore_bound));
        let metrics = Arc::clone(&self.metrics);

        let worker = Arc::new(ProcessWorker {
            name: self.config.name.clone(),
            field: self.field.clone(),
            kind: self.config.kind,
            acceptable_delay: self.config.acceptable_delay(),
            acceptable_execution_time: self.config.acceptable_execution_time(),
            handler: self.handler,
            semaphore: Arc::clone(&semaphore),
            metrics: Arc::clone(&metrics),
            _record: PhantomData,
        });
        let pool = WorkerPool::new(&self.pool, worker)?;

        Ok(RecordIterator::from_parts(IteratorParts {
            name: self.config.name.clone(),
            mode: self.config.mode,
            kind: self.config.kind,
            field: self.field,
            target_interval: self.config.target_interval(),
            max_sleep: self.config.max_sleep(),
            throttle: self.config.throttle(),
            redistribute: self.config.redistribute,
            unsorted: self.config.unsorted,
            handoff_wait: self.pool.handoff_wait(),
            store: self.store,
            gate: self.gate,
            filter: self.filter,
            metrics,
            semaphore,
            pool,
        }))
    }
}
