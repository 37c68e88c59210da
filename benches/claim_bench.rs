//! Microbenchmarks for the claim path and the FIFO admission scan.

use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use drumbeat::core::{
    runnable_consumers, ConstraintInstance, ConsumerState, IterableRecord, ReleaseScope,
    ReleaseScopeKind, SchedulingKind,
};
use drumbeat::infra::{MemoryRecordStore, RecordStore};

#[derive(Debug, Clone)]
struct BenchRecord {
    id: String,
    next_run_at: Option<i64>,
}

impl IterableRecord for BenchRecord {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn next_run_at(&self, _field: &str) -> Option<i64> {
        self.next_run_at
    }

    fn update_next_run(&mut self, _field: &str, next: Option<i64>) {
        self.next_run_at = next;
    }
}

fn seeded_store(records: i64) -> MemoryRecordStore<BenchRecord> {
    let store = MemoryRecordStore::new();
    for i in 0..records {
        store.upsert(BenchRecord {
            id: format!("record-{i:05}"),
            next_run_at: Some(1_000 + i),
        });
    }
    store
}

fn bench_claim_next(c: &mut Criterion) {
    c.bench_function("claim_next_among_1k_due", |b| {
        b.iter_batched(
            || seeded_store(1_000),
            |store| {
                black_box(
                    store
                        .claim_next(
                            "next_run_at",
                            1_000_000,
                            1_000_000,
                            SchedulingKind::Regular,
                            Duration::from_secs(60),
                            false,
                        )
                        .unwrap(),
                )
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_runnable_consumers(c: &mut Criterion) {
    let consumers: Vec<ConstraintInstance> = (0..500)
        .map(|i| ConstraintInstance {
            id: format!("consumer-{i:03}"),
            constraint_id: "bench".into(),
            unit: "prod".into(),
            permits: 1 + (i % 3),
            state: if i % 4 == 0 {
                ConsumerState::Active
            } else {
                ConsumerState::Blocked
            },
            order: u64::from(i) + 1,
            scope: ReleaseScope {
                kind: ReleaseScopeKind::Plan,
                execution_id: format!("exec-{i:03}"),
            },
            acquired_at: None,
            next_check_at: None,
        })
        .collect();

    c.bench_function("runnable_consumers_500", |b| {
        b.iter(|| black_box(runnable_consumers(black_box(200), &consumers)));
    });
}

criterion_group!(benches, bench_claim_next, bench_runnable_consumers);
criterion_main!(benches);
