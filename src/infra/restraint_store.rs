//! Restraint store abstraction and the in-memory reference backend.
//!
//! Constraint instances are mutated only through conditional transitions:
//! `Blocked → Active` on admission and `{Active, Blocked} → Finished` on
//! release. A transition that finds the instance in another state reports
//! `None` instead of failing; losing such a race to another replica is
//! expected steady-state behavior.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::constraint::{Constraint, ConstraintInstance, ConsumerState, ReleaseScope, ReleaseScopeKind};
use crate::core::error::{RestraintError, StoreError};
use crate::core::iterator::SchedulingKind;
use crate::core::record::IterableRecord;
use crate::infra::record_store::{claim_in_map, RecordStore};

/// CRUD and conditional-transition primitives for constraints and their
/// instances.
pub trait RestraintStore: Send + Sync + 'static {
    /// Insert a constraint definition.
    ///
    /// # Errors
    ///
    /// [`RestraintError::DuplicateConstraint`] when the id exists.
    fn insert_constraint(&self, constraint: Constraint) -> Result<(), RestraintError>;

    /// Look up a constraint by id.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn constraint(&self, id: &str) -> Result<Option<Constraint>, RestraintError>;

    /// Insert a new instance.
    ///
    /// # Errors
    ///
    /// [`RestraintError::DuplicateConsumer`] on an id collision,
    /// [`RestraintError::OrderTaken`] when another replica registered the
    /// same `(constraint, order)` pair concurrently.
    fn insert_instance(&self, instance: ConstraintInstance) -> Result<(), RestraintError>;

    /// Instances for `(constraint, unit)` in any of `states`, ascending by
    /// order.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn instances_in_states(
        &self,
        constraint_id: &str,
        unit: &str,
        states: &[ConsumerState],
    ) -> Result<Vec<ConstraintInstance>, RestraintError>;

    /// Conditional `Blocked → Active` transition. `None` when the instance
    /// was not blocked on that unit (a concurrent evaluation won).
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn activate_instance(
        &self,
        id: &str,
        unit: &str,
        acquired_at: i64,
    ) -> Result<Option<ConstraintInstance>, RestraintError>;

    /// Conditional `{Active, Blocked} → Finished` transition. `None` when
    /// no transition applied (already finished or unknown).
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn finish_instance(&self, id: &str) -> Result<Option<ConstraintInstance>, RestraintError>;

    /// Highest order assigned for the constraint so far, 0 when none.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn max_order(&self, constraint_id: &str) -> Result<u64, RestraintError>;

    /// ACTIVE permits the scope holds on `(constraint, unit)`. Blocked
    /// instances hold nothing yet.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn active_permits_for_scope(
        &self,
        scope: &ReleaseScope,
        constraint_id: &str,
        unit: &str,
    ) -> Result<u32, RestraintError>;

    /// Active or blocked instances owned by the execution.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn instances_for_release(
        &self,
        execution_id: &str,
    ) -> Result<Vec<ConstraintInstance>, RestraintError>;

    /// Distinct units with active or blocked consumers on the constraint.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn units_with_consumers(&self, constraint_id: &str) -> Result<Vec<String>, RestraintError>;

    /// Remove every instance owned by the given executions of `kind`.
    /// Administrative batch cleanup, outside the steady-state path.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn delete_for_scope(
        &self,
        kind: ReleaseScopeKind,
        execution_ids: &HashSet<String>,
    ) -> Result<u64, RestraintError>;
}

#[derive(Default)]
struct Inner {
    constraints: HashMap<String, Constraint>,
    instances: BTreeMap<String, ConstraintInstance>,
}

/// Mutex-backed restraint store; the critical section stands in for the
/// datastore's conditional updates. Also implements
/// [`RecordStore`] over the instances' `next_check_at`
/// field so the polling engine can drive re-evaluation directly.
#[derive(Default)]
pub struct MemoryRestraintStore {
    inner: Mutex<Inner>,
}

impl MemoryRestraintStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the instance with the given id.
    #[must_use]
    pub fn instance(&self, id: &str) -> Option<ConstraintInstance> {
        self.inner.lock().instances.get(id).cloned()
    }
}

impl RestraintStore for MemoryRestraintStore {
    fn insert_constraint(&self, constraint: Constraint) -> Result<(), RestraintError> {
        let mut inner = self.inner.lock();
        if inner.constraints.contains_key(&constraint.id) {
            return Err(RestraintError::DuplicateConstraint(constraint.id));
        }
        inner.constraints.insert(constraint.id.clone(), constraint);
        Ok(())
    }

    fn constraint(&self, id: &str) -> Result<Option<Constraint>, RestraintError> {
        Ok(self.inner.lock().constraints.get(id).cloned())
    }

    fn insert_instance(&self, instance: ConstraintInstance) -> Result<(), RestraintError> {
        let mut inner = self.inner.lock();
        if inner.instances.contains_key(&instance.id) {
            return Err(RestraintError::DuplicateConsumer(instance.id));
        }
        // The (constraint, order) pair carries the FIFO precedence and is
        // unique forever, like a compound unique index would make it.
        let collision = inner.instances.values().any(|existing| {
            existing.constraint_id == instance.constraint_id && existing.order == instance.order
        });
        if collision {
            return Err(RestraintError::OrderTaken {
                constraint_id: instance.constraint_id,
                order: instance.order,
            });
        }
        inner.instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    fn instances_in_states(
        &self,
        constraint_id: &str,
        unit: &str,
        states: &[ConsumerState],
    ) -> Result<Vec<ConstraintInstance>, RestraintError> {
        let inner = self.inner.lock();
        let mut found: Vec<ConstraintInstance> = inner
            .instances
            .values()
            .filter(|i| {
                i.constraint_id == constraint_id && i.unit == unit && states.contains(&i.state)
            })
            .cloned()
            .collect();
        found.sort_by_key(|i| i.order);
        Ok(found)
    }

    fn activate_instance(
        &self,
        id: &str,
        unit: &str,
        acquired_at: i64,
    ) -> Result<Option<ConstraintInstance>, RestraintError> {
        let mut inner = self.inner.lock();
        let Some(instance) = inner.instances.get_mut(id) else {
            return Ok(None);
        };
        if instance.state != ConsumerState::Blocked || instance.unit != unit {
            return Ok(None);
        }
        instance.state = ConsumerState::Active;
        instance.acquired_at = Some(acquired_at);
        Ok(Some(instance.clone()))
    }

    fn finish_instance(&self, id: &str) -> Result<Option<ConstraintInstance>, RestraintError> {
        let mut inner = self.inner.lock();
        let Some(instance) = inner.instances.get_mut(id) else {
            return Ok(None);
        };
        if instance.state == ConsumerState::Finished {
            return Ok(None);
        }
        instance.state = ConsumerState::Finished;
        // Finished instances leave the polling set until batch cleanup.
        instance.next_check_at = None;
        Ok(Some(instance.clone()))
    }

    fn max_order(&self, constraint_id: &str) -> Result<u64, RestraintError> {
        let inner = self.inner.lock();
        Ok(inner
            .instances
            .values()
            .filter(|i| i.constraint_id == constraint_id)
            .map(|i| i.order)
            .max()
            .unwrap_or(0))
    }

    fn active_permits_for_scope(
        &self,
        scope: &ReleaseScope,
        constraint_id: &str,
        unit: &str,
    ) -> Result<u32, RestraintError> {
        let inner = self.inner.lock();
        Ok(inner
            .instances
            .values()
            .filter(|i| {
                i.state == ConsumerState::Active
                    && i.constraint_id == constraint_id
                    && i.unit == unit
                    && i.scope == *scope
            })
            .map(|i| i.permits)
            .sum())
    }

    fn instances_for_release(
        &self,
        execution_id: &str,
    ) -> Result<Vec<ConstraintInstance>, RestraintError> {
        let inner = self.inner.lock();
        Ok(inner
            .instances
            .values()
            .filter(|i| {
                i.scope.execution_id == execution_id
                    && matches!(i.state, ConsumerState::Active | ConsumerState::Blocked)
            })
            .cloned()
            .collect())
    }

    fn units_with_consumers(&self, constraint_id: &str) -> Result<Vec<String>, RestraintError> {
        let inner = self.inner.lock();
        let units: BTreeSet<String> = inner
            .instances
            .values()
            .filter(|i| {
                i.constraint_id == constraint_id
                    && matches!(i.state, ConsumerState::Active | ConsumerState::Blocked)
            })
            .map(|i| i.unit.clone())
            .collect();
        Ok(units.into_iter().collect())
    }

    fn delete_for_scope(
        &self,
        kind: ReleaseScopeKind,
        execution_ids: &HashSet<String>,
    ) -> Result<u64, RestraintError> {
        let mut inner = self.inner.lock();
        let before = inner.instances.len();
        inner.instances.retain(|_, i| {
            !(i.scope.kind == kind && execution_ids.contains(&i.scope.execution_id))
        });
        Ok((before - inner.instances.len()) as u64)
    }
}

impl RecordStore<ConstraintInstance> for MemoryRestraintStore {
    fn claim_next(
        &self,
        field: &str,
        base: i64,
        throttled: i64,
        kind: SchedulingKind,
        target_interval: Duration,
        unsorted: bool,
    ) -> Result<Option<ConstraintInstance>, StoreError> {
        let mut inner = self.inner.lock();
        Ok(claim_in_map(
            &mut inner.instances,
            |i| i.state != ConsumerState::Finished,
            field,
            base,
            throttled,
            kind,
            target_interval,
            unsorted,
        ))
    }

    fn persist_run_times(
        &self,
        record: &ConstraintInstance,
        field: &str,
        times: &[i64],
    ) -> Result<(), StoreError> {
        let mut updated = record.clone();
        updated.update_next_run(field, times.first().copied());
        self.inner
            .lock()
            .instances
            .insert(updated.id.clone(), updated);
        Ok(())
    }

    fn find_next_due(&self, field: &str) -> Result<Option<ConstraintInstance>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .instances
            .values()
            .filter(|i| i.state != ConsumerState::Finished && i.next_run_at(field).is_some())
            .min_by_key(|i| i.next_run_at(field))
            .cloned())
    }

    fn count_all(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().instances.len() as u64)
    }

    fn fetch_by_skip(&self, offset: u64) -> Result<Option<ConstraintInstance>, StoreError> {
        let inner = self.inner.lock();
        let offset = usize::try_from(offset).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(inner.instances.values().nth(offset).cloned())
    }

    fn fetch_id_greater_than(
        &self,
        last_id: &str,
        limit: usize,
    ) -> Result<Vec<ConstraintInstance>, StoreError> {
        use std::ops::Bound;
        let inner = self.inner.lock();
        Ok(inner
            .instances
            .range::<str, _>((Bound::Excluded(last_id), Bound::Unbounded))
            .take(limit)
            .map(|(_, i)| i.clone())
            .collect())
    }

    fn recover_after_pause(
        &self,
        field: &str,
        now: i64,
        target_interval: Duration,
    ) -> Result<u64, StoreError> {
        let interval = i64::try_from(target_interval.as_millis()).unwrap_or(i64::MAX);
        let horizon = now.saturating_add(interval.saturating_mul(2));

        let mut inner = self.inner.lock();
        let mut rewound = 0;
        for instance in inner.instances.values_mut() {
            if instance.state == ConsumerState::Finished {
                continue;
            }
            if instance.next_run_at(field).is_some_and(|at| at > horizon) {
                instance.update_next_run(field, Some(now));
                rewound += 1;
            }
        }
        Ok(rewound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constraint::Strategy;

    fn store_with_constraint() -> MemoryRestraintStore {
        let store = MemoryRestraintStore::new();
        store
            .insert_constraint(Constraint {
                id: "deploy-slots".into(),
                capacity: 2,
                strategy: Strategy::Fifo,
            })
            .unwrap();
        store
    }

    fn instance(id: &str, order: u64, state: ConsumerState) -> ConstraintInstance {
        ConstraintInstance {
            id: id.into(),
            constraint_id: "deploy-slots".into(),
            unit: "prod".into(),
            permits: 1,
            state,
            order,
            scope: ReleaseScope {
                kind: ReleaseScopeKind::Plan,
                execution_id: format!("exec-{id}"),
            },
            acquired_at: None,
            next_check_at: Some(100),
        }
    }

    #[test]
    fn duplicate_ids_and_orders_are_rejected() {
        let store = store_with_constraint();
        store
            .insert_instance(instance("a", 1, ConsumerState::Active))
            .unwrap();

        let dup_id = store.insert_instance(instance("a", 2, ConsumerState::Blocked));
        assert!(matches!(dup_id, Err(RestraintError::DuplicateConsumer(_))));

        let dup_order = store.insert_instance(instance("b", 1, ConsumerState::Blocked));
        assert!(matches!(dup_order, Err(RestraintError::OrderTaken { .. })));
    }

    #[test]
    fn activation_is_conditional_on_blocked() {
        let store = store_with_constraint();
        store
            .insert_instance(instance("a", 1, ConsumerState::Blocked))
            .unwrap();

        let activated = store.activate_instance("a", "prod", 500).unwrap().unwrap();
        assert_eq!(activated.state, ConsumerState::Active);
        assert_eq!(activated.acquired_at, Some(500));

        // A second activation loses the race and reports None.
        assert!(store.activate_instance("a", "prod", 600).unwrap().is_none());
        // Wrong unit never matches.
        store
            .insert_instance(instance("b", 2, ConsumerState::Blocked))
            .unwrap();
        assert!(store.activate_instance("b", "staging", 600).unwrap().is_none());
    }

    #[test]
    fn finish_is_idempotent_and_clears_the_check_field() {
        let store = store_with_constraint();
        store
            .insert_instance(instance("a", 1, ConsumerState::Active))
            .unwrap();

        let finished = store.finish_instance("a").unwrap().unwrap();
        assert_eq!(finished.state, ConsumerState::Finished);
        assert_eq!(finished.next_check_at, None);

        assert!(store.finish_instance("a").unwrap().is_none());
        assert!(store.finish_instance("missing").unwrap().is_none());
    }

    #[test]
    fn claims_skip_finished_instances() {
        let store = store_with_constraint();
        store
            .insert_instance(instance("a", 1, ConsumerState::Active))
            .unwrap();
        let mut done = instance("b", 2, ConsumerState::Finished);
        done.next_check_at = Some(50);
        store.insert_instance(done).unwrap();

        let claimed = store
            .claim_next(
                crate::core::constraint::NEXT_CHECK_FIELD,
                1_000,
                1_000,
                SchedulingKind::Regular,
                Duration::from_secs(10),
                false,
            )
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, "a");
        assert!(store
            .claim_next(
                crate::core::constraint::NEXT_CHECK_FIELD,
                1_000,
                1_000,
                SchedulingKind::Regular,
                Duration::from_secs(10),
                false,
            )
            .unwrap()
            .is_none());
    }

    #[test]
    fn scope_cleanup_removes_whole_release_sets() {
        let store = store_with_constraint();
        store
            .insert_instance(instance("a", 1, ConsumerState::Finished))
            .unwrap();
        store
            .insert_instance(instance("b", 2, ConsumerState::Active))
            .unwrap();

        let ids: HashSet<String> = ["exec-a".to_string()].into_iter().collect();
        let removed = store.delete_for_scope(ReleaseScopeKind::Plan, &ids).unwrap();
        assert_eq!(removed, 1);
        assert!(store.instance("a").is_none());
        assert!(store.instance("b").is_some());
    }
}
