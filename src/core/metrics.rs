//! Engine metric names and the sink abstraction.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

/// Delay between a record's scheduled run time and pickup by a worker.
pub const CLAIM_DELAY: &str = "claim_delay";
/// Wall-clock duration of one handler invocation.
pub const PROCESSING_TIME: &str = "processing_duration";
/// Unexpected errors in the polling loop or a worker.
pub const CLAIM_ERROR: &str = "claim_error_count";
/// Incremented when a worker starts on a record.
pub const WORKING_ON_RECORD: &str = "working_on_record";

/// Sink for engine metrics. The export format is the embedder's concern.
pub trait MetricsSink: Send + Sync {
    /// Count one occurrence of `name` for the given iterator.
    fn record_count(&self, name: &str, iterator: &str);
    /// Record one duration sample of `name` for the given iterator.
    fn record_duration(&self, name: &str, iterator: &str, duration: Duration);
}

/// Sink that drops everything.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_count(&self, _name: &str, _iterator: &str) {}
    fn record_duration(&self, _name: &str, _iterator: &str, _duration: Duration) {}
}

/// In-memory sink for tests and development.
#[derive(Default)]
pub struct InMemoryMetrics {
    counts: Mutex<HashMap<String, u64>>,
    durations: Mutex<HashMap<String, Vec<Duration>>>,
}

impl InMemoryMetrics {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for `(name, iterator)`.
    #[must_use]
    pub fn count(&self, name: &str, iterator: &str) -> u64 {
        self.counts
            .lock()
            .get(&key(name, iterator))
            .copied()
            .unwrap_or(0)
    }

    /// Duration samples recorded for `(name, iterator)`.
    #[must_use]
    pub fn samples(&self, name: &str, iterator: &str) -> Vec<Duration> {
        self.durations
            .lock()
            .get(&key(name, iterator))
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_count(&self, name: &str, iterator: &str) {
        *self.counts.lock().entry(key(name, iterator)).or_insert(0) += 1;
    }

    fn record_duration(&self, name: &str, iterator: &str, duration: Duration) {
        self.durations
            .lock()
            .entry(key(name, iterator))
            .or_default()
            .push(duration);
    }
}

fn key(name: &str, iterator: &str) -> String {
    format!("{iterator}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_iterator() {
        let sink = InMemoryMetrics::new();
        sink.record_count(CLAIM_ERROR, "deploy");
        sink.record_count(CLAIM_ERROR, "deploy");
        sink.record_count(CLAIM_ERROR, "cleanup");

        assert_eq!(sink.count(CLAIM_ERROR, "deploy"), 2);
        assert_eq!(sink.count(CLAIM_ERROR, "cleanup"), 1);
        assert_eq!(sink.count(CLAIM_DELAY, "deploy"), 0);
    }

    #[test]
    fn duration_samples_are_kept() {
        let sink = InMemoryMetrics::new();
        sink.record_duration(PROCESSING_TIME, "deploy", Duration::from_millis(5));
        sink.record_duration(PROCESSING_TIME, "deploy", Duration::from_millis(7));

        assert_eq!(sink.samples(PROCESSING_TIME, "deploy").len(), 2);
    }
}
