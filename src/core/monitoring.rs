//! Named integer counters exposed for self-monitoring.
//!
//! Counter names are dotted paths (`metricbeat.redis.info.events`), so a
//! snapshot can be filtered by any prefix of the hierarchy.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MonitoringError {
    #[error("Counter '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// A shared monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registry of named counters. Cloning yields a handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct MonitoringRegistry {
    counters: Arc<Mutex<BTreeMap<String, Counter>>>,
}

impl MonitoringRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new zeroed counter.
    ///
    /// # Errors
    ///
    /// Fails if a counter with this name is already registered.
    pub fn register_counter(&self, name: &str) -> Result<Counter, MonitoringError> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if counters.contains_key(name) {
            return Err(MonitoringError::AlreadyRegistered(name.to_string()));
        }
        let counter = Counter::default();
        counters.insert(name.to_string(), counter.clone());
        trace!(counter = %name, "Counter registered");
        Ok(counter)
    }

    /// Removes a counter. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            trace!(counter = %name, "Counter unregistered");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Counter> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Current values of the counters under `prefix` (all when empty).
    pub fn snapshot(&self, prefix: &str) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(name, _)| {
                prefix.is_empty()
                    || name.as_str() == prefix
                    || name
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('.'))
            })
            .map(|(name, counter)| (name.clone(), counter.get()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_count() {
        let registry = MonitoringRegistry::new();
        let counter = registry.register_counter("a.b.events").unwrap();
        counter.inc();
        counter.add(2);

        assert_eq!(registry.get("a.b.events").unwrap().get(), 3);
        assert_eq!(
            registry.register_counter("a.b.events").unwrap_err(),
            MonitoringError::AlreadyRegistered("a.b.events".into())
        );
    }

    #[test]
    fn test_unregister() {
        let registry = MonitoringRegistry::new();
        registry.register_counter("x").unwrap();
        assert!(registry.unregister("x"));
        assert!(!registry.unregister("x"));
        assert!(registry.is_empty());
        assert!(registry.register_counter("x").is_ok());
    }

    #[test]
    fn test_snapshot_prefix_respects_segments() {
        let registry = MonitoringRegistry::new();
        registry.register_counter("mb.redis.info.success").unwrap().inc();
        registry.register_counter("mb.redis.keyspace.success").unwrap();
        registry.register_counter("mb.redisx.info.success").unwrap();

        let snapshot = registry.snapshot("mb.redis");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["mb.redis.info.success"], 1);
        assert_eq!(registry.snapshot("").len(), 3);
    }
}
