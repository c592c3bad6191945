//! Shared per-metricset fetch statistics.
//!
//! Every running metricset instance of the same `module.metricset` pair shares
//! one set of counters. Handles are reference counted: the first acquisition
//! registers the counters in the monitoring registry, dropping the last
//! handle unregisters them, so two concurrently existing module instances
//! never produce duplicate counter names.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::{debug, warn};

use super::monitoring::{Counter, MonitoringRegistry};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "metricbeat";

const SUCCESS: &str = "success";
const FAILURES: &str = "failures";
const EVENTS: &str = "events";

/// Counters of one `module.metricset` pair.
#[derive(Debug)]
pub struct MetricSetCounters {
    /// Fetches that completed without error.
    pub successes: Counter,
    /// Fetches that returned an error or panicked.
    pub failures: Counter,
    /// Events delivered to the output channel.
    pub events: Counter,
}

struct StatsEntry {
    refs: usize,
    counters: Arc<MetricSetCounters>,
}

struct StatsInner {
    namespace: String,
    monitoring: MonitoringRegistry,
    entries: Mutex<HashMap<String, StatsEntry>>,
}

/// Reference-counted map of metricset counters.
#[derive(Clone)]
pub struct Stats {
    inner: Arc<StatsInner>,
}

impl Stats {
    pub fn new(namespace: impl Into<String>, monitoring: MonitoringRegistry) -> Self {
        Self {
            inner: Arc::new(StatsInner {
                namespace: namespace.into(),
                monitoring,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn monitoring(&self) -> &MonitoringRegistry {
        &self.inner.monitoring
    }

    /// Returns a handle on the counters of `module.metricset`, creating and
    /// registering them on first use.
    pub fn acquire(&self, module: &str, metricset: &str) -> StatsHandle {
        let key = format!("{module}.{metricset}");
        let mut entries = self.lock();

        let counters = match entries.get_mut(&key) {
            Some(entry) => {
                entry.refs += 1;
                Arc::clone(&entry.counters)
            }
            None => {
                let counters = Arc::new(MetricSetCounters {
                    successes: self.register(&key, SUCCESS),
                    failures: self.register(&key, FAILURES),
                    events: self.register(&key, EVENTS),
                });
                entries.insert(
                    key.clone(),
                    StatsEntry {
                        refs: 1,
                        counters: Arc::clone(&counters),
                    },
                );
                debug!(stats = %key, "Metricset stats created");
                counters
            }
        };

        StatsHandle {
            key,
            counters,
            owner: self.clone(),
        }
    }

    /// Number of live handles for `module.metricset`, `None` once released.
    pub fn refcount(&self, key: &str) -> Option<usize> {
        self.lock().get(key).map(|e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            warn!(stats = %key, "Released stats that were never acquired");
            return;
        };

        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(key);
            for counter in [SUCCESS, FAILURES, EVENTS] {
                self.inner.monitoring.unregister(&self.counter_name(key, counter));
            }
            debug!(stats = %key, "Metricset stats removed");
        }
    }

    fn register(&self, key: &str, counter: &str) -> Counter {
        let name = self.counter_name(key, counter);
        match self.inner.monitoring.register_counter(&name) {
            Ok(counter) => counter,
            Err(e) => {
                // Registered outside of this map; share it rather than fail the job.
                warn!("{}", e);
                self.inner.monitoring.get(&name).unwrap_or_default()
            }
        }
    }

    fn counter_name(&self, key: &str, counter: &str) -> String {
        format!("{}.{}.{}", self.inner.namespace, key, counter)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StatsEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE, MonitoringRegistry::new())
    }
}

impl fmt::Debug for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stats")
            .field("namespace", &self.inner.namespace)
            .field("entries", &self.len())
            .finish()
    }
}

/// Scoped access to shared counters; releases its reference when dropped.
pub struct StatsHandle {
    key: String,
    counters: Arc<MetricSetCounters>,
    owner: Stats,
}

impl StatsHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn successes(&self) -> &Counter {
        &self.counters.successes
    }

    pub fn failures(&self) -> &Counter {
        &self.counters.failures
    }

    pub fn events(&self) -> &Counter {
        &self.counters.events
    }
}

impl fmt::Debug for StatsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsHandle")
            .field("key", &self.key)
            .field("counters", &self.counters)
            .finish()
    }
}

impl Drop for StatsHandle {
    fn drop(&mut self) {
        self.owner.release(&self.key);
    }
}
