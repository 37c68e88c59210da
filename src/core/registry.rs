//! Explicit registry of engine control handles.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

/// Control surface a registered engine exposes.
pub trait SchedulerControl: Send + Sync {
    /// Registered name.
    fn name(&self) -> &str;
    /// Re-evaluate immediately instead of waiting out the poll interval.
    fn wakeup(&self);
    /// Stop the engine and its workers.
    fn stop(&self);
}

/// Name → control-handle map built at startup and passed by reference.
///
/// Ownership is explicit and scoped to the embedding process; there is no
/// global mutable registry.
#[derive(Default)]
pub struct IteratorRegistry {
    entries: Mutex<HashMap<String, Arc<dyn SchedulerControl>>>,
}

impl IteratorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under its name, replacing any previous entry.
    pub fn register(&self, handle: Arc<dyn SchedulerControl>) {
        let name = handle.name().to_owned();
        if self.entries.lock().insert(name.clone(), handle).is_some() {
            warn!(iterator = %name, "replacing an existing registry entry");
        }
    }

    /// Wake the named engine. Returns `false` for an unknown name.
    pub fn wakeup(&self, name: &str) -> bool {
        let handle = self.entries.lock().get(name).cloned();
        if let Some(handle) = handle {
            handle.wakeup();
            true
        } else {
            false
        }
    }

    /// Stop every registered engine.
    pub fn stop_all(&self) {
        let handles: Vec<Arc<dyn SchedulerControl>> =
            self.entries.lock().values().cloned().collect();
        for handle in handles {
            handle.stop();
        }
    }

    /// Registered names, unordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeControl {
        name: String,
        wakeups: AtomicUsize,
    }

    impl SchedulerControl for FakeControl {
        fn name(&self) -> &str {
            &self.name
        }

        fn wakeup(&self) {
            self.wakeups.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) {}
    }

    #[test]
    fn wakeup_routes_by_name() {
        let registry = IteratorRegistry::new();
        let control = Arc::new(FakeControl {
            name: "deploy".into(),
            wakeups: AtomicUsize::new(0),
        });
        registry.register(Arc::clone(&control) as Arc<dyn SchedulerControl>);

        assert!(registry.wakeup("deploy"));
        assert!(!registry.wakeup("unknown"));
        assert_eq!(control.wakeups.load(Ordering::SeqCst), 1);
        assert_eq!(registry.names(), vec!["deploy".to_string()]);
    }
}
