//! Record-store abstraction and the in-memory reference backend.
//!
//! The store is the only synchronization primitive between replicas: the
//! claim is a single conditional update, and "nothing claimed" is the
//! expected steady-state outcome for every racer but one.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::error::StoreError;
use crate::core::iterator::SchedulingKind;
use crate::core::record::IterableRecord;

/// Claim, peek, and scan primitives over the shared datastore.
///
/// `claim_next` must behave as one atomic conditional update: among any
/// number of concurrent callers racing for the same due record, exactly one
/// receives it and the rest observe `None`.
pub trait RecordStore<T: IterableRecord>: Send + Sync + 'static {
    /// Atomically claim the most-overdue record whose `field` value is
    /// earlier than `base`.
    ///
    /// The winner's field is advanced to `throttled + target_interval` for
    /// the regular discipline and cleared for irregular disciplines. With
    /// `unsorted` the most-overdue-first ordering is waived, a documented
    /// trade-off for very large collections.
    ///
    /// # Errors
    ///
    /// Backend failures only; losing the race is not an error.
    fn claim_next(
        &self,
        field: &str,
        base: i64,
        throttled: i64,
        kind: SchedulingKind,
        target_interval: Duration,
        unsorted: bool,
    ) -> Result<Option<T>, StoreError>;

    /// Persist a recomputed irregular schedule for the record.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn persist_run_times(&self, record: &T, field: &str, times: &[i64]) -> Result<(), StoreError>;

    /// Peek at the next-soonest-due record without claiming it. Used only
    /// to size the idle sleep.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn find_next_due(&self, field: &str) -> Result<Option<T>, StoreError>;

    /// Total records in the collection.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn count_all(&self) -> Result<u64, StoreError>;

    /// Fetch the record at `offset` in ascending id order. Shard scans use
    /// this exactly once to find their start point.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn fetch_by_skip(&self, offset: u64) -> Result<Option<T>, StoreError>;

    /// Fetch up to `limit` records with id strictly greater than `last_id`,
    /// ascending by id.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn fetch_id_greater_than(&self, last_id: &str, limit: usize) -> Result<Vec<T>, StoreError>;

    /// Rewind records whose run time was advanced past
    /// `now + 2 × target_interval` by a claimant that never processed them.
    /// Returns the number of rewound records.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn recover_after_pause(
        &self,
        field: &str,
        now: i64,
        target_interval: Duration,
    ) -> Result<u64, StoreError>;
}

/// Apply the claim's conditional update inside a store's critical section.
///
/// Shared by the in-memory backends; `eligible` lets a backend exclude
/// records that should never be claimed (say, finished consumers).
#[allow(clippy::too_many_arguments)]
pub(crate) fn claim_in_map<T, F>(
    records: &mut BTreeMap<String, T>,
    eligible: F,
    field: &str,
    base: i64,
    throttled: i64,
    kind: SchedulingKind,
    target_interval: Duration,
    unsorted: bool,
) -> Option<T>
where
    T: IterableRecord,
    F: Fn(&T) -> bool,
{
    let mut chosen: Option<(String, i64)> = None;
    for (id, record) in records.iter() {
        if !eligible(record) {
            continue;
        }
        let Some(due) = record.next_run_at(field) else {
            continue;
        };
        if due >= base {
            continue;
        }
        if unsorted {
            chosen = Some((id.clone(), due));
            break;
        }
        match &chosen {
            Some((_, best)) if *best <= due => {}
            _ => chosen = Some((id.clone(), due)),
        }
    }

    let (id, _) = chosen?;
    let record = records.get_mut(&id)?;
    // Return the pre-update snapshot: the engine reads the consumed due
    // time from it (find-and-modify returning the old document).
    let snapshot = record.clone();
    match kind {
        SchedulingKind::Regular => {
            let interval = i64::try_from(target_interval.as_millis()).unwrap_or(i64::MAX);
            record.update_next_run(field, Some(throttled.saturating_add(interval)));
        }
        SchedulingKind::Irregular | SchedulingKind::IrregularSkipMissed => {
            record.update_next_run(field, None);
        }
    }
    Some(snapshot)
}

/// Mutex-backed store whose critical section stands in for the datastore's
/// single-document conditional update. Suited to tests and single-process
/// embeddings; production deployments back the trait with a datastore that
/// has a find-and-modify primitive.
pub struct MemoryRecordStore<T> {
    records: Mutex<BTreeMap<String, T>>,
}

impl<T: IterableRecord> MemoryRecordStore<T> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: T) {
        self.records
            .lock()
            .insert(record.record_id().to_owned(), record);
    }

    /// Snapshot of the record with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<T> {
        self.records.lock().get(id).cloned()
    }

    /// Remove a record, returning it.
    pub fn remove(&self, id: &str) -> Option<T> {
        self.records.lock().remove(id)
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl<T: IterableRecord> Default for MemoryRecordStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: IterableRecord> RecordStore<T> for MemoryRecordStore<T> {
    fn claim_next(
        &self,
        field: &str,
        base: i64,
        throttled: i64,
        kind: SchedulingKind,
        target_interval: Duration,
        unsorted: bool,
    ) -> Result<Option<T>, StoreError> {
        let mut records = self.records.lock();
        Ok(claim_in_map(
            &mut records,
            |_| true,
            field,
            base,
            throttled,
            kind,
            target_interval,
            unsorted,
        ))
    }

    fn persist_run_times(&self, record: &T, field: &str, times: &[i64]) -> Result<(), StoreError> {
        let mut updated = record.clone();
        updated.update_next_run(field, times.first().copied());
        self.records
            .lock()
            .insert(updated.record_id().to_owned(), updated);
        Ok(())
    }

    fn find_next_due(&self, field: &str) -> Result<Option<T>, StoreError> {
        let records = self.records.lock();
        Ok(records
            .values()
            .filter(|r| r.next_run_at(field).is_some())
            .min_by_key(|r| r.next_run_at(field))
            .cloned())
    }

    fn count_all(&self) -> Result<u64, StoreError> {
        Ok(self.records.lock().len() as u64)
    }

    fn fetch_by_skip(&self, offset: u64) -> Result<Option<T>, StoreError> {
        let records = self.records.lock();
        let offset = usize::try_from(offset).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(records.values().nth(offset).cloned())
    }

    fn fetch_id_greater_than(&self, last_id: &str, limit: usize) -> Result<Vec<T>, StoreError> {
        let records = self.records.lock();
        Ok(records
            .range::<str, _>((Bound::Excluded(last_id), Bound::Unbounded))
            .take(limit)
            .map(|(_, r)| r.clone())
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

        let mut records = self.records.lock();
        let mut rewound = 0;
        for record in records.values_mut() {
            if record.next_run_at(field).is_some_and(|at| at > horizon) {
                record.update_next_run(field, Some(now));
                rewound += 1;
            }
        }
        Ok(rewound)
    }
}

/// Schema-only Postgres backing for work records (migration SQL; the I/O
/// wiring is the embedder's concern).
pub struct PostgresRecordStore;

impl PostgresRecordStore {
    /// SQL migration statements for the claimable-record table.
    #[must_use]
    pub fn migrations() -> &'static [&'static str] {
        &[r"
CREATE TABLE IF NOT EXISTS drumbeat_work_records (
    id TEXT PRIMARY KEY,
    next_run_at BIGINT,
    run_times BIGINT[] NOT NULL DEFAULT '{}',
    payload JSONB
);
CREATE INDEX IF NOT EXISTS idx_drumbeat_work_records_next_run
    ON drumbeat_work_records (next_run_at) WHERE next_run_at IS NOT NULL;
"]
    }
}
