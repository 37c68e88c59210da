//! Error types for engine, store, and restraint operations.

use thiserror::Error;

/// Errors produced by record-store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend-specific failure with context.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A record referenced by id was not found.
    #[error("record not found: {0}")]
    RecordNotFound(String),
}

/// Errors produced by the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The bounded work queue stayed full past the submit wait.
    #[error("work queue is full")]
    QueueFull,
    /// The pool has been shut down.
    #[error("pool has been shut down")]
    Shutdown,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors produced by the restraint subsystem.
///
/// `ConstraintNotFound`, `InvalidPermits`, and `SelfDeadlock` are caller
/// errors and non-retryable; the rest surface store-level conditions.
#[derive(Debug, Error)]
pub enum RestraintError {
    /// No constraint exists with the given id.
    #[error("there is no resource constraint with id: {0}")]
    ConstraintNotFound(String),
    /// A constraint with this id already exists.
    #[error("resource constraint already exists: {0}")]
    DuplicateConstraint(String),
    /// Requested permits are zero or exceed the constraint capacity.
    #[error("invalid permits {permits} for constraint {constraint_id} with capacity {capacity}")]
    InvalidPermits {
        /// Constraint the registration targeted.
        constraint_id: String,
        /// Permits requested.
        permits: u32,
        /// Configured per-unit capacity.
        capacity: u32,
    },
    /// Every active holder of the unit belongs to the registrant's own
    /// execution; queueing would block the execution on itself forever.
    #[error("registering on unit {unit} would deadlock: all held permits belong to the registrant's execution {execution_id}")]
    SelfDeadlock {
        /// Resource unit the registration targeted.
        unit: String,
        /// The execution that already holds every active permit.
        execution_id: String,
    },
    /// A consumer with the same id is already registered.
    #[error("consumer already registered: {0}")]
    DuplicateConsumer(String),
    /// Another replica registered the same order concurrently.
    #[error("order {order} already taken for constraint {constraint_id}")]
    OrderTaken {
        /// Constraint whose order index collided.
        constraint_id: String,
        /// The colliding order value.
        order: u64,
    },
    /// Registration kept colliding on the order index.
    #[error("could not allocate a unique order for constraint {0}")]
    OrderContention(String),
    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Application-facing result using anyhow for loop-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
