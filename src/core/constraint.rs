//! Constraint model and the pure FIFO admission rules.
//!
//! A constraint is a named, capacity-bounded counting semaphore partitioned
//! by resource unit. Consumers request permits against one unit; admission
//! among waiters is strictly first-in-first-out by registration order.

use serde::{Deserialize, Serialize};

use crate::core::record::IterableRecord;

/// Field name the driving engine polls constraint instances on.
pub const NEXT_CHECK_FIELD: &str = "next_check_at";

/// Admission strategy for a constraint's waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Strict first-in-first-out admission by registration order.
    Fifo,
}

/// A named, capacity-bounded counting semaphore over resource units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    /// Unique id.
    pub id: String,
    /// Maximum permits concurrently held per unit.
    pub capacity: u32,
    /// Admission strategy.
    pub strategy: Strategy,
}

/// Lifecycle of a constraint consumer.
///
/// Transitions are one-directional: `Blocked` → `Active` → `Finished`; an
/// instance never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    /// Waiting for capacity; holds no permits yet.
    Blocked,
    /// Holding permits.
    Active,
    /// Released; permits returned.
    Finished,
}

/// Kind of execution whose termination releases a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseScopeKind {
    /// A whole plan (pipeline) execution.
    Plan,
    /// A single stage execution within a plan.
    Stage,
}

/// The execution that must reach a terminal status before an instance is
/// released. The scope, not the instance, is authoritative for finishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseScope {
    /// Scope kind.
    pub kind: ReleaseScopeKind,
    /// Id of the owning execution.
    pub execution_id: String,
}

/// One request to hold permits of a constraint, tied to an execution scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintInstance {
    /// Unique consumer id.
    pub id: String,
    /// Constraint this instance consumes.
    pub constraint_id: String,
    /// Resource unit within the constraint.
    pub unit: String,
    /// Permits requested (blocked) or held (active).
    pub permits: u32,
    /// Lifecycle state.
    pub state: ConsumerState,
    /// FIFO precedence: strictly increasing per constraint, never reused.
    pub order: u64,
    /// Execution whose termination releases this instance.
    pub scope: ReleaseScope,
    /// When the instance became active, epoch millis.
    pub acquired_at: Option<i64>,
    /// Next re-evaluation time for the driving engine, epoch millis.
    pub next_check_at: Option<i64>,
}

impl IterableRecord for ConstraintInstance {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn next_run_at(&self, field: &str) -> Option<i64> {
        if field == NEXT_CHECK_FIELD {
            self.next_check_at
        } else {
            None
        }
    }

    fn update_next_run(&mut self, field: &str, next: Option<i64>) {
        if field == NEXT_CHECK_FIELD {
            self.next_check_at = next;
        }
    }
}

/// True when both scopes name the same top-level execution.
///
/// Only plan scopes can overlap: a stage scope is already unique to its own
/// subtree and never blocks a sibling of the same stage.
#[must_use]
pub fn overlapping_scope(a: &ReleaseScope, b: &ReleaseScope) -> bool {
    a.kind == ReleaseScopeKind::Plan
        && b.kind == ReleaseScopeKind::Plan
        && a.execution_id == b.execution_id
}

/// Ids of blocked consumers that fit under `capacity`, in strict FIFO order.
///
/// The scan walks blocked instances by ascending `order` on top of the
/// permits active instances already hold and stops at the first waiter that
/// does not fit. A later, smaller request never jumps an earlier, larger
/// one; this stop rule is load-bearing for fairness.
#[must_use]
pub fn runnable_consumers(capacity: u32, consumers: &[ConstraintInstance]) -> Vec<String> {
    let mut ordered: Vec<&ConstraintInstance> = consumers.iter().collect();
    ordered.sort_by_key(|c| c.order);

    let mut used: u32 = ordered
        .iter()
        .filter(|c| c.state == ConsumerState::Active)
        .map(|c| c.permits)
        .sum();

    let mut runnable = Vec::new();
    for consumer in ordered {
        if consumer.state != ConsumerState::Blocked {
            continue;
        }
        if used + consumer.permits > capacity {
            break;
        }
        used += consumer.permits;
        runnable.push(consumer.id.clone());
    }
    runnable
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, permits: u32, state: ConsumerState, order: u64) -> ConstraintInstance {
        ConstraintInstance {
            id: id.into(),
            constraint_id: "deploy-slots".into(),
            unit: "prod".into(),
            permits,
            state,
            order,
            scope: ReleaseScope {
                kind: ReleaseScopeKind::Plan,
                execution_id: format!("exec-{id}"),
            },
            acquired_at: None,
            next_check_at: None,
        }
    }

    #[test]
    fn admits_oldest_waiters_first() {
        let consumers = vec![
            instance("a", 1, ConsumerState::Active, 1),
            instance("b", 1, ConsumerState::Blocked, 2),
            instance("c", 1, ConsumerState::Blocked, 3),
        ];
        assert_eq!(runnable_consumers(3, &consumers), vec!["b", "c"]);
    }

    #[test]
    fn stops_at_first_non_fittable_waiter() {
        // Capacity 2, nothing active. The older waiter wants 2, the younger
        // wants 1 and would fit, but must not jump the queue.
        let consumers = vec![
            instance("big", 2, ConsumerState::Blocked, 1),
            instance("small", 1, ConsumerState::Blocked, 2),
        ];
        assert_eq!(runnable_consumers(2, &consumers), vec!["big"]);

        let with_holder = vec![
            instance("holder", 1, ConsumerState::Active, 1),
            instance("big", 2, ConsumerState::Blocked, 2),
            instance("small", 1, ConsumerState::Blocked, 3),
        ];
        assert!(runnable_consumers(2, &with_holder).is_empty());
    }

    #[test]
    fn finished_instances_hold_nothing() {
        let consumers = vec![
            instance("done", 3, ConsumerState::Finished, 1),
            instance("next", 3, ConsumerState::Blocked, 2),
        ];
        assert_eq!(runnable_consumers(3, &consumers), vec!["next"]);
    }

    #[test]
    fn overlap_requires_matching_plan_scopes() {
        let plan_a = ReleaseScope {
            kind: ReleaseScopeKind::Plan,
            execution_id: "exec-1".into(),
        };
        let plan_a_again = plan_a.clone();
        let plan_b = ReleaseScope {
            kind: ReleaseScopeKind::Plan,
            execution_id: "exec-2".into(),
        };
        let stage_a = ReleaseScope {
            kind: ReleaseScopeKind::Stage,
            execution_id: "exec-1".into(),
        };

        assert!(overlapping_scope(&plan_a, &plan_a_again));
        assert!(!overlapping_scope(&plan_a, &plan_b));
        assert!(!overlapping_scope(&plan_a, &stage_a));
    }

    #[test]
    fn instances_iterate_on_the_check_field() {
        let mut inst = instance("a", 1, ConsumerState::Blocked, 1);
        inst.next_check_at = Some(42);

        assert_eq!(inst.next_run_at(NEXT_CHECK_FIELD), Some(42));
        assert_eq!(inst.next_run_at("other_field"), None);

        inst.update_next_run(NEXT_CHECK_FIELD, Some(99));
        assert_eq!(inst.next_check_at, Some(99));
        inst.update_next_run("other_field", None);
        assert_eq!(inst.next_check_at, Some(99));
    }
}
