//! Core engine logic: the polling iterator, shard scanner, and restraint
//! coordination.

pub mod constraint;
pub mod error;
pub mod iterator;
pub mod metrics;
pub mod record;
pub mod registry;
pub mod restraint;
pub mod semaphore;
pub mod shard;
pub mod worker_pool;

pub use constraint::{
    overlapping_scope, runnable_consumers, Constraint, ConstraintInstance, ConsumerState,
    ReleaseScope, ReleaseScopeKind, Strategy, NEXT_CHECK_FIELD,
};
pub use error::{AppResult, PoolError, RestraintError, StoreError};
pub use iterator::{
    AlwaysProcess, Handler, ProcessGate, ProcessMode, RecordFilter, RecordIterator, ReplicaGate,
    SchedulingKind,
};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use record::IterableRecord;
pub use registry::{IteratorRegistry, SchedulerControl};
pub use restraint::{
    AcquireMode, AdmittedNotice, Notifier, Registration, RestraintCoordinator, RestraintHandler,
    ScopeStatusSource,
};
pub use semaphore::{Semaphore, SemaphorePermit};
pub use shard::ShardScanner;
pub use worker_pool::{PickupAck, Worker, WorkerPool};
