//! # Drumbeat
//!
//! Datastore-coordinated work discovery and cluster-wide concurrency
//! limiting for orchestration runtimes.
//!
//! Every stateless replica of an orchestration service runs the same two
//! engines against a shared datastore: no leader election, no external
//! lock service:
//!
//! - **Polling engine** ([`core::RecordIterator`]): discovers "due" work
//!   records and dispatches them to a bounded local worker pool. Safety
//!   under concurrent polling comes from the store's atomic claim, a
//!   single conditional update that selects the most-overdue record and
//!   advances its schedule, so exactly one replica wins each occurrence.
//! - **Restraint engine** ([`core::RestraintCoordinator`]): a named,
//!   capacity-bounded counting semaphore partitioned by resource unit
//!   (say, "at most N concurrent deployments to environment X"), with
//!   strict FIFO admission persisted in the store and a continuation hook
//!   fired when a queued consumer is admitted.
//!
//! A third mode, the [`core::ShardScanner`], deterministically partitions
//! the full collection across cooperating replicas for exhaustive one-off
//! sweeps.
//!
//! ## Claiming work
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use drumbeat::builders::RecordIteratorBuilder;
//! use drumbeat::config::IteratorConfig;
//! use drumbeat::core::{Handler, ProcessMode};
//! use drumbeat::infra::MemoryRecordStore;
//! use drumbeat::runtime::IteratorHandle;
//!
//! struct DeployHandler;
//!
//! impl Handler<DeployCheck> for DeployHandler {
//!     fn handle(&self, record: DeployCheck) -> anyhow::Result<()> {
//!         // business logic; errors are logged per record
//!         Ok(())
//!     }
//! }
//!
//! let store = Arc::new(MemoryRecordStore::new());
//! let mut config = IteratorConfig::named("deploy-checks");
//! config.target_interval_ms = 1_000;
//!
//! let iterator = RecordIteratorBuilder::new(config, store, DeployHandler).build()?;
//! let handle = IteratorHandle::start(iterator);
//! handle.wakeup(); // new work just became due
//! ```
//!
//! ## Bounding concurrency cluster-wide
//!
//! ```rust,ignore
//! use drumbeat::core::{AcquireMode, Registration, ReleaseScope, ReleaseScopeKind};
//!
//! let registration = coordinator.register_consumer(
//!     "deploy-slots",
//!     "prod",
//!     1,
//!     ReleaseScope { kind: ReleaseScopeKind::Plan, execution_id: plan_id },
//!     AcquireMode::Accumulate,
//! )?;
//! match registration {
//!     Registration::Admitted { .. } => { /* proceed */ }
//!     Registration::Queued { .. } => { /* suspend; the notifier resumes us */ }
//!     Registration::AlreadyHeld => { /* nothing more to acquire */ }
//! }
//! ```
//!
//! The local semaphore and worker pool are per-process caps; the restraint
//! subsystem is the cluster-wide one. For complete wiring, see the
//! integration tests.

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core engine logic: polling iterator, shard scanner, restraint engine.
pub mod core;
/// Configuration models for engines and worker pools.
pub mod config;
/// Builders to construct engines from configuration.
pub mod builders;
/// Store abstractions and in-memory reference backends.
pub mod infra;
/// Runtime adapters: loop threads and the optional async surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
