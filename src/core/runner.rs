//! Start/stop handles for running modules.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{publisher::Publisher, wrapper::Wrapper};

/// A job the reloader can start and stop.
#[async_trait::async_trait]
pub trait Runner: Send + Sync + fmt::Display {
    async fn start(&self);

    /// Stops the job and waits until it no longer produces events.
    async fn stop(&self);
}

/// Turns a built wrapper into a runner.
pub trait RunnerFactory: Send + Sync {
    fn create(&self, wrapper: Wrapper) -> Arc<dyn Runner>;
}

/// Runs one wrapper and drains its output into a publisher.
pub struct ModuleRunner {
    wrapper: Wrapper,
    publisher: Arc<dyn Publisher>,
    cancel: CancellationToken,
    drain: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ModuleRunner {
    pub fn new(wrapper: Wrapper, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            wrapper,
            publisher,
            cancel: CancellationToken::new(),
            drain: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn wrapper(&self) -> &Wrapper {
        &self.wrapper
    }
}

#[async_trait::async_trait]
impl Runner for ModuleRunner {
    async fn start(&self) {
        if self.stopped.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut events = self.wrapper.start(self.cancel.clone());
        let publisher = Arc::clone(&self.publisher);
        let name = self.to_string();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = publisher.publish(event).await {
                    warn!(runner = %name, "Dropping event: {}", e);
                }
            }
            debug!(runner = %name, "Output drained");
        });

        *self.drain.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        let handle = self
            .drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(runner = %self, "Drain task failed: {}", e);
            }
        }
        info!(runner = %self, "Stopped");
    }
}

impl fmt::Display for ModuleRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wrapper)
    }
}

/// Several runners behind one handle. Start and stop act once.
pub struct RunnerGroup {
    runners: Vec<Arc<dyn Runner>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl RunnerGroup {
    pub fn new(runners: Vec<Arc<dyn Runner>>) -> Self {
        Self {
            runners,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

#[async_trait::async_trait]
impl Runner for RunnerGroup {
    async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for runner in &self.runners {
            runner.start().await;
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        join_all(self.runners.iter().map(|r| r.stop())).await;
    }
}

impl fmt::Display for RunnerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RunnerGroup{")?;
        for (i, runner) in self.runners.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", runner)?;
        }
        f.write_str("}")
    }
}

/// Creates one `ModuleRunner` per metricset instance, grouped.
pub struct ModuleRunnerFactory {
    publisher: Arc<dyn Publisher>,
}

impl ModuleRunnerFactory {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }
}

impl RunnerFactory for ModuleRunnerFactory {
    fn create(&self, wrapper: Wrapper) -> Arc<dyn Runner> {
        let runners = wrapper
            .split()
            .into_iter()
            .map(|part| {
                Arc::new(ModuleRunner::new(part, Arc::clone(&self.publisher))) as Arc<dyn Runner>
            })
            .collect();
        Arc::new(RunnerGroup::new(runners))
    }
}
