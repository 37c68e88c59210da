//! Engine and worker-pool configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::iterator::{ProcessMode, SchedulingKind};

/// Configuration for one polling engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IteratorConfig {
    /// Iterator name used in logs and metrics.
    pub name: String,
    /// Scheduling discipline applied to claimed records.
    pub kind: SchedulingKind,
    /// Loop forever or pump until drained.
    pub mode: ProcessMode,
    /// Target recurrence interval for regular records, millis.
    pub target_interval_ms: u64,
    /// Upper bound on the idle sleep, millis. Defaults to the target
    /// interval when absent.
    pub max_sleep_ms: Option<u64>,
    /// Pickup delay beyond which a record is logged as late, millis.
    pub acceptable_delay_ms: u64,
    /// Handler duration beyond which completion is logged as slow, millis.
    pub acceptable_execution_ms: Option<u64>,
    /// Earliest-recurrence floor applied at claim time, millis.
    pub throttle_ms: Option<u64>,
    /// Smear synchronized wakeups across replicas (regular discipline
    /// only).
    pub redistribute: bool,
    /// Skip the due-time sort on claims. Ordering is then not guaranteed;
    /// a documented trade-off for very large collections.
    pub unsorted: bool,
    /// Bound on concurrent claims plus in-flight work.
    pub semaphore_bound: u32,
    /// Cooperating replicas in shard mode.
    pub replica_count: u32,
    /// This replica's shard ordinal, `0..replica_count`.
    pub shard_id: u32,
}

impl Default for IteratorConfig {
    fn default() -> Self {
        Self {
            name: "iterator".into(),
            kind: SchedulingKind::Regular,
            mode: ProcessMode::Loop,
            target_interval_ms: 60_000,
            max_sleep_ms: None,
            acceptable_delay_ms: 10_000,
            acceptable_execution_ms: None,
            throttle_ms: None,
            redistribute: false,
            unsorted: false,
            semaphore_bound: 10,
            replica_count: 1,
            shard_id: 0,
        }
    }
}

impl IteratorConfig {
    /// Configuration named for its iterator, otherwise defaults.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Target recurrence interval.
    #[must_use]
    pub const fn target_interval(&self) -> Duration {
        Duration::from_millis(self.target_interval_ms)
    }

    /// Idle-sleep cap, falling back to the target interval.
    #[must_use]
    pub const fn max_sleep(&self) -> Duration {
        match self.max_sleep_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.target_interval(),
        }
    }

    /// Acceptable pickup delay.
    #[must_use]
    pub const fn acceptable_delay(&self) -> Duration {
        Duration::from_millis(self.acceptable_delay_ms)
    }

    /// Acceptable handler duration, if configured.
    #[must_use]
    pub const fn acceptable_execution_time(&self) -> Option<Duration> {
        match self.acceptable_execution_ms {
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        }
    }

    /// Claim-time recurrence floor, if configured.
    #[must_use]
    pub const fn throttle(&self) -> Option<Duration> {
        match self.throttle_ms {
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        }
    }

    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// A human-readable description of the first violated rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("name must not be empty".into());
        }
        if self.target_interval_ms == 0 {
            return Err("target_interval_ms must be greater than 0".into());
        }
        if self.semaphore_bound == 0 {
            return Err("semaphore_bound must be greater than 0".into());
        }
        if self.replica_count == 0 {
            return Err("replica_count must be greater than 0".into());
        }
        if self.shard_id >= self.replica_count {
            return Err(format!(
                "shard_id {} out of range for {} replicas",
                self.shard_id, self.replica_count
            ));
        }
        Ok(())
    }
}

/// Worker-pool sizing and handoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Dedicated worker threads.
    pub worker_count: usize,
    /// Bounded queue depth between the claim loop and the workers.
    pub queue_depth: usize,
    /// How long a submitter waits for pickup confirmation, millis.
    pub handoff_wait_ms: u64,
    /// Stack size per worker thread, bytes.
    pub thread_stack_size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let workers = num_cpus::get().max(2);
        Self {
            worker_count: workers,
            queue_depth: workers * 2,
            handoff_wait_ms: 10_000,
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl WorkerPoolConfig {
    /// Defaults sized from the host's CPU count.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the worker-thread count (minimum 1).
    #[must_use]
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Override the bounded queue depth (minimum 1).
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Override the pickup handoff wait.
    #[must_use]
    pub fn with_handoff_wait(mut self, wait: Duration) -> Self {
        self.handoff_wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Pickup handoff wait.
    #[must_use]
    pub const fn handoff_wait(&self) -> Duration {
        Duration::from_millis(self.handoff_wait_ms)
    }

    /// Defaults with `DRUMBEAT_WORKER_COUNT` / `DRUMBEAT_QUEUE_DEPTH`
    /// environment overrides applied. Call [`crate::config::load_env`]
    /// first to honor a `.env` file.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("DRUMBEAT_WORKER_COUNT") {
            if let Ok(count) = value.parse::<usize>() {
                config.worker_count = count.max(1);
            }
        }
        if let Ok(value) = std::env::var("DRUMBEAT_QUEUE_DEPTH") {
            if let Ok(depth) = value.parse::<usize>() {
                config.queue_depth = depth.max(1);
            }
        }
        config
    }

    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// A human-readable description of the first violated rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.queue_depth == 0 {
            return Err("queue_depth must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }
}

/// Root configuration: named iterator definitions plus shared pool sizing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Iterator name → configuration.
    pub iterators: HashMap<String, IteratorConfig>,
    /// Worker-pool defaults shared by iterators without overrides.
    pub pool: WorkerPoolConfig,
}

impl EngineConfig {
    /// Validate all iterators and the pool defaults.
    ///
    /// # Errors
    ///
    /// A description naming the invalid iterator or pool rule.
    pub fn validate(&self) -> Result<(), String> {
        self.pool.validate().map_err(|e| format!("pool invalid: {e}"))?;
        for (name, iterator) in &self.iterators {
            iterator
                .validate()
                .map_err(|e| format!("iterator `{name}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse engine configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse and validation failures as a human-readable string.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let config: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        config.validate()?;
        Ok(config)
    }
}
