//! The work-record contract shared by every schedulable type.

/// A persisted work item the polling engine can discover and claim.
///
/// `field` names the scheduling field, so one record type can expose several
/// independent iteration fields (say, a health-check field and a cleanup
/// field on the same document) and be driven by separate engines.
///
/// Implementations must be cheap to clone: the in-memory store hands out
/// snapshots, and the engine moves claimed copies into worker threads.
pub trait IterableRecord: Clone + Send + 'static {
    /// Stable unique id of the record.
    fn record_id(&self) -> &str;

    /// Next eligible run time in epoch milliseconds, if one is scheduled.
    fn next_run_at(&self, field: &str) -> Option<i64>;

    /// Overwrite the next eligible run time.
    fn update_next_run(&mut self, field: &str, next: Option<i64>);

    /// Recompute the full list of future run times for irregular disciplines
    /// and return it, earliest first.
    ///
    /// The consumed occurrence must be dropped; occurrences earlier than
    /// `not_before` are also dropped when `skip_missed` is set. Regular
    /// records keep the default no-op.
    fn recalculate_run_times(
        &mut self,
        field: &str,
        skip_missed: bool,
        not_before: i64,
    ) -> Vec<i64> {
        let _ = (field, skip_missed, not_before);
        Vec::new()
    }
}
