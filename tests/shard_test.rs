//! Shard-mode sweep coverage: the union of per-shard scans must touch
//! every record, with overlap allowed only at slice boundaries.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use drumbeat::builders::ShardScannerBuilder;
use drumbeat::config::{IteratorConfig, WorkerPoolConfig};
use drumbeat::core::{Handler, IterableRecord, ProcessGate, ReplicaGate};
use drumbeat::infra::MemoryRecordStore;

#[derive(Debug, Clone)]
struct LegacyArtifact {
    id: String,
}

impl IterableRecord for LegacyArtifact {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn next_run_at(&self, _field: &str) -> Option<i64> {
        None
    }

    fn update_next_run(&mut self, _field: &str, _next: Option<i64>) {}
}

struct CollectingHandler {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Handler<LegacyArtifact> for CollectingHandler {
    fn handle(&self, record: LegacyArtifact) -> anyhow::Result<()> {
        self.seen.lock().push(record.id);
        Ok(())
    }
}

fn shard_config(name: &str, replica_count: u32, shard_id: u32) -> IteratorConfig {
    let mut config = IteratorConfig::named(name);
    config.replica_count = replica_count;
    config.shard_id = shard_id;
    config.semaphore_bound = 4;
    config
}

fn small_pool() -> WorkerPoolConfig {
    WorkerPoolConfig::new()
        .with_worker_count(2)
        .with_queue_depth(8)
}

fn seeded_store(docs: usize) -> Arc<MemoryRecordStore<LegacyArtifact>> {
    let store = Arc::new(MemoryRecordStore::new());
    let mut ids: Vec<String> = (0..docs).map(|i| format!("doc-{i:03}")).collect();
    // Insertion order must not matter for coverage.
    ids.shuffle(&mut rand::rng());
    for id in ids {
        store.upsert(LegacyArtifact { id });
    }
    store
}

#[test]
fn shards_cover_every_record() {
    const DOCS: usize = 25;
    const SHARDS: u32 = 4;

    let store = seeded_store(DOCS);
    let seen = Arc::new(Mutex::new(Vec::new()));

    for shard_id in 0..SHARDS {
        let scanner = ShardScannerBuilder::new(
            shard_config(&format!("sweep-{shard_id}"), SHARDS, shard_id),
            Arc::clone(&store),
            CollectingHandler {
                seen: Arc::clone(&seen),
            },
        )
        .pool_config(small_pool())
        .build()
        .unwrap();

        scanner.scan();
        scanner.shutdown();
    }

    let seen = seen.lock().clone();
    let distinct: HashSet<&String> = seen.iter().collect();
    assert_eq!(distinct.len(), DOCS, "no record permanently skipped");
    // Benign overlap at shard boundaries is tolerated, wholesale
    // re-processing is not.
    assert!(seen.len() < DOCS * 2, "unexpected duplication: {}", seen.len());
}

#[test]
fn a_single_shard_sweeps_the_whole_collection() {
    const DOCS: usize = 9;
    let store = seeded_store(DOCS);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let scanner = ShardScannerBuilder::new(
        shard_config("solo", 1, 0),
        store,
        CollectingHandler {
            seen: Arc::clone(&seen),
        },
    )
    .pool_config(small_pool())
    .build()
    .unwrap();
    scanner.scan();
    scanner.shutdown();

    let mut seen = seen.lock().clone();
    seen.sort();
    let expected: Vec<String> = (0..DOCS).map(|i| format!("doc-{i:03}")).collect();
    assert_eq!(seen, expected);
}

#[test]
fn an_empty_collection_is_a_quiet_no_op() {
    let store: Arc<MemoryRecordStore<LegacyArtifact>> = Arc::new(MemoryRecordStore::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let scanner = ShardScannerBuilder::new(
        shard_config("empty", 2, 1),
        store,
        CollectingHandler {
            seen: Arc::clone(&seen),
        },
    )
    .pool_config(small_pool())
    .build()
    .unwrap();
    scanner.scan();
    scanner.shutdown();

    assert!(seen.lock().is_empty());
}

#[test]
fn a_closed_gate_skips_the_sweep() {
    let store = seeded_store(5);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let gate = Arc::new(ReplicaGate::new());
    gate.set_eligible(false);

    let scanner = ShardScannerBuilder::new(
        shard_config("gated", 1, 0),
        store,
        CollectingHandler {
            seen: Arc::clone(&seen),
        },
    )
    .pool_config(small_pool())
    .gate(Arc::clone(&gate) as Arc<dyn ProcessGate>)
    .build()
    .unwrap();
    scanner.scan();
    scanner.shutdown();

    assert!(seen.lock().is_empty());
}
