//! Registration, admission, and release of constraint consumers.
//!
//! The coordinator runs on every replica; all state lives in the shared
//! restraint store, and admission decisions rest on the store's conditional
//! transitions rather than any cross-replica lock. FIFO precedence comes
//! from the persisted `order` field, so any replica can evaluate a unit and
//! reach the same admission sequence.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::core::constraint::{
    overlapping_scope, runnable_consumers, ConstraintInstance, ConsumerState, ReleaseScope,
    ReleaseScopeKind,
};
use crate::core::error::RestraintError;
use crate::core::iterator::Handler;
use crate::infra::restraint_store::RestraintStore;
use crate::util::clock::now_ms;
use crate::util::ids::generate_id;

/// Attempts to win the order index before registration gives up.
const REGISTER_ATTEMPTS: u32 = 3;

/// How requested permits relate to permits the scope already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Request the full amount on top of anything already held.
    Accumulate,
    /// Top the scope up to the requested amount, counting permits it
    /// already holds active on the unit.
    Ensure,
}

/// Payload delivered to the continuation hook when a waiter is admitted.
#[derive(Debug, Clone)]
pub struct AdmittedNotice {
    /// Constraint the consumer was admitted on.
    pub constraint_id: String,
    /// Resource unit the permits were granted for.
    pub unit: String,
}

/// Continuation hook invoked when a blocked consumer becomes active,
/// typically resuming a suspended workflow step.
pub trait Notifier: Send + Sync {
    /// Resume whatever was suspended waiting on `consumer_id`.
    fn notify_admitted(&self, consumer_id: &str, notice: AdmittedNotice);
}

/// Status lookup for the execution scope that owns an instance.
pub trait ScopeStatusSource: Send + Sync {
    /// Whether the scope has reached a terminal status.
    ///
    /// # Errors
    ///
    /// Lookup failures; the coordinator logs them and treats the scope as
    /// still running.
    fn is_terminal(&self, scope: &ReleaseScope) -> anyhow::Result<bool>;
}

/// Outcome of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The scope already holds enough permits; nothing new was created.
    AlreadyHeld,
    /// Admitted synchronously and now holding permits.
    Admitted {
        /// Id of the new active consumer.
        consumer_id: String,
    },
    /// Queued behind earlier waiters; the notifier fires on admission.
    Queued {
        /// Id of the new blocked consumer.
        consumer_id: String,
    },
}

/// Coordinates cluster-wide admission over the shared restraint store.
pub struct RestraintCoordinator<R> {
    store: Arc<R>,
    scope_status: Arc<dyn ScopeStatusSource>,
    notifier: Arc<dyn Notifier>,
}

impl<R: RestraintStore> RestraintCoordinator<R> {
    /// Create a coordinator over the given collaborators.
    pub fn new(
        store: Arc<R>,
        scope_status: Arc<dyn ScopeStatusSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            scope_status,
            notifier,
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<R> {
        &self.store
    }

    /// Register a consumer for `permits` of `(constraint, unit)`.
    ///
    /// Admission is decided synchronously from the permits active instances
    /// currently hold: the consumer is persisted `Active` when it fits and
    /// `Blocked` otherwise. Orders are assigned strictly increasing per
    /// constraint; a collision with a concurrent registrant is retried with
    /// a recomputed order.
    ///
    /// # Errors
    ///
    /// [`RestraintError::ConstraintNotFound`] for an unknown constraint,
    /// [`RestraintError::InvalidPermits`] for zero or over-capacity
    /// requests, [`RestraintError::SelfDeadlock`] when queueing could never
    /// be served (see below), [`RestraintError::OrderContention`] when the
    /// order index stayed contended, and store failures.
    ///
    /// # Self-deadlock
    ///
    /// If the consumer would queue while *every* active holder of the unit
    /// belongs to the registrant's own top-level execution, no external
    /// completion can ever free capacity; the execution would wait on
    /// itself forever. Registration fails fast instead of parking an
    /// unservable waiter; capacity is never exceeded to work around it.
    pub fn register_consumer(
        &self,
        constraint_id: &str,
        unit: &str,
        permits: u32,
        scope: ReleaseScope,
        mode: AcquireMode,
    ) -> Result<Registration, RestraintError> {
        let constraint = self
            .store
            .constraint(constraint_id)?
            .ok_or_else(|| RestraintError::ConstraintNotFound(constraint_id.to_owned()))?;

        let mut permits = permits;
        if mode == AcquireMode::Ensure {
            let held = self
                .store
                .active_permits_for_scope(&scope, constraint_id, unit)?;
            permits = permits.saturating_sub(held);
            if permits == 0 {
                debug!(
                    constraint = constraint_id,
                    unit, "scope already holds the requested permits"
                );
                return Ok(Registration::AlreadyHeld);
            }
        }
        if permits == 0 || permits > constraint.capacity {
            return Err(RestraintError::InvalidPermits {
                constraint_id: constraint_id.to_owned(),
                permits,
                capacity: constraint.capacity,
            });
        }

        let consumer_id = generate_id();
        for attempt in 1..=REGISTER_ATTEMPTS {
            let consumers = self.store.instances_in_states(
                constraint_id,
                unit,
                &[ConsumerState::Active, ConsumerState::Blocked],
            )?;
            let active: Vec<&ConstraintInstance> = consumers
                .iter()
                .filter(|c| c.state == ConsumerState::Active)
                .collect();
            let held_active: u32 = active.iter().map(|c| c.permits).sum();
            let admitted = held_active + permits <= constraint.capacity;

            if !admitted
                && !active.is_empty()
                && active.iter().all(|c| overlapping_scope(&scope, &c.scope))
            {
                return Err(RestraintError::SelfDeadlock {
                    unit: unit.to_owned(),
                    execution_id: scope.execution_id.clone(),
                });
            }

            let now = now_ms();
            let instance = ConstraintInstance {
                id: consumer_id.clone(),
                constraint_id: constraint_id.to_owned(),
                unit: unit.to_owned(),
                permits,
                state: if admitted {
                    ConsumerState::Active
                } else {
                    ConsumerState::Blocked
                },
                order: self.store.max_order(constraint_id)? + 1,
                scope: scope.clone(),
                acquired_at: admitted.then_some(now),
                next_check_at: Some(now),
            };

            match self.store.insert_instance(instance) {
                Ok(()) => {
                    info!(
                        consumer = %consumer_id,
                        constraint = constraint_id,
                        unit,
                        permits,
                        admitted,
                        "consumer registered"
                    );
                    return Ok(if admitted {
                        Registration::Admitted { consumer_id }
                    } else {
                        Registration::Queued { consumer_id }
                    });
                }
                Err(RestraintError::OrderTaken { order, .. }) => {
                    warn!(
                        constraint = constraint_id,
                        order, attempt, "order taken by a concurrent registration; retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Err(RestraintError::OrderContention(constraint_id.to_owned()))
    }

    /// Move a consumer to FINISHED.
    ///
    /// Returns `false` when the instance was already finished or unknown.
    /// That is expected under concurrent finishers: logged, never an error.
    pub fn consumer_finished(&self, constraint_id: &str, unit: &str, consumer_id: &str) -> bool {
        match self.store.finish_instance(consumer_id) {
            Ok(Some(_)) => {
                info!(consumer = %consumer_id, constraint = constraint_id, unit, "consumer finished");
                true
            }
            Ok(None) => {
                warn!(
                    consumer = %consumer_id,
                    constraint = constraint_id,
                    unit,
                    "consumer was not active or blocked; nothing to finish"
                );
                false
            }
            Err(err) => {
                error!(
                    consumer = %consumer_id,
                    constraint = constraint_id,
                    unit,
                    error = %err,
                    "could not finish consumer"
                );
                false
            }
        }
    }

    /// Admit blocked consumers for a unit in strict FIFO order.
    ///
    /// Stops at the first waiter that does not fit and at the first
    /// conditional activation lost to a concurrent evaluation. Each
    /// admission triggers the notifier. Returns the ids admitted by this
    /// call.
    ///
    /// # Errors
    ///
    /// Unknown constraint and store failures.
    pub fn evaluate_unit(
        &self,
        constraint_id: &str,
        unit: &str,
    ) -> Result<Vec<String>, RestraintError> {
        let constraint = self
            .store
            .constraint(constraint_id)?
            .ok_or_else(|| RestraintError::ConstraintNotFound(constraint_id.to_owned()))?;

        let consumers = self.store.instances_in_states(
            constraint_id,
            unit,
            &[ConsumerState::Active, ConsumerState::Blocked],
        )?;
        let runnable = runnable_consumers(constraint.capacity, &consumers);

        let mut admitted = Vec::new();
        for id in runnable {
            match self.store.activate_instance(&id, unit, now_ms())? {
                Some(_) => {
                    info!(consumer = %id, constraint = constraint_id, unit, "blocked consumer admitted");
                    self.notifier.notify_admitted(
                        &id,
                        AdmittedNotice {
                            constraint_id: constraint_id.to_owned(),
                            unit: unit.to_owned(),
                        },
                    );
                    admitted.push(id);
                }
                None => {
                    debug!(consumer = %id, "activation lost to a concurrent evaluation");
                    break;
                }
            }
        }
        Ok(admitted)
    }

    /// Re-evaluate every unit of the given constraints.
    ///
    /// # Errors
    ///
    /// Unknown constraint and store failures.
    pub fn evaluate_constraints(
        &self,
        constraint_ids: &HashSet<String>,
    ) -> Result<(), RestraintError> {
        for constraint_id in constraint_ids {
            let units = self.store.units_with_consumers(constraint_id)?;
            if units.is_empty() {
                continue;
            }
            info!(
                constraint = %constraint_id,
                units = units.join(", "),
                "re-evaluating constraint units"
            );
            for unit in units {
                self.evaluate_unit(constraint_id, &unit)?;
            }
        }
        Ok(())
    }

    /// Driving-loop step for one polled instance.
    ///
    /// A blocked instance re-tries admission for its unit; an active
    /// instance whose owning scope has terminated is finished and its unit
    /// re-evaluated (one freed holder may admit several waiters).
    ///
    /// # Errors
    ///
    /// Unknown constraint and store failures.
    pub fn process_instance(&self, instance: &ConstraintInstance) -> Result<(), RestraintError> {
        let unblock = match instance.state {
            ConsumerState::Blocked => true,
            ConsumerState::Active => self.release_if_scope_finished(instance),
            ConsumerState::Finished => false,
        };
        if unblock {
            self.evaluate_unit(&instance.constraint_id, &instance.unit)?;
        }
        Ok(())
    }

    /// ACTIVE permits the scope currently holds on `(constraint, unit)`.
    /// Blocked instances hold nothing yet.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn currently_held_permits(
        &self,
        scope: &ReleaseScope,
        constraint_id: &str,
        unit: &str,
    ) -> Result<u32, RestraintError> {
        self.store
            .active_permits_for_scope(scope, constraint_id, unit)
    }

    /// Active or blocked instances owned by the execution.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn instances_for_release(
        &self,
        execution_id: &str,
    ) -> Result<Vec<ConstraintInstance>, RestraintError> {
        self.store.instances_for_release(execution_id)
    }

    /// Administrative batch cleanup when a release-entity set is torn down.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn delete_for_scope(
        &self,
        kind: ReleaseScopeKind,
        execution_ids: &HashSet<String>,
    ) -> Result<u64, RestraintError> {
        self.store.delete_for_scope(kind, execution_ids)
    }

    fn release_if_scope_finished(&self, instance: &ConstraintInstance) -> bool {
        let terminal = match self.scope_status.is_terminal(&instance.scope) {
            Ok(done) => done,
            Err(err) => {
                warn!(
                    consumer = %instance.id,
                    execution = %instance.scope.execution_id,
                    error = %format!("{err:#}"),
                    "scope status lookup failed; keeping instance active"
                );
                false
            }
        };
        terminal && self.consumer_finished(&instance.constraint_id, &instance.unit, &instance.id)
    }
}

/// Handler wiring the polling engine to the coordinator: the engine claims
/// due instances, this handler re-evaluates them.
pub struct RestraintHandler<R> {
    coordinator: Arc<RestraintCoordinator<R>>,
}

impl<R> RestraintHandler<R> {
    /// Wrap a coordinator.
    pub fn new(coordinator: Arc<RestraintCoordinator<R>>) -> Self {
        Self { coordinator }
    }
}

impl<R: RestraintStore> Handler<ConstraintInstance> for RestraintHandler<R> {
    fn handle(&self, record: ConstraintInstance) -> anyhow::Result<()> {
        self.coordinator.process_instance(&record)?;
        Ok(())
    }
}
