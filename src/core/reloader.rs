//! Live reconfiguration of module files.
//!
//! The reloader periodically scans a glob of module files. When any file
//! was added, removed or modified it rebuilds every module block, then
//! diffs the configuration hashes against the running jobs: jobs whose
//! block disappeared are stopped, new blocks are started, unchanged blocks
//! keep running untouched.
//!
//! A file that cannot be read or parsed keeps the jobs of its last good
//! content running. A block that fails to build keeps its running job, if
//! any, and is rebuilt on the next tick.

use std::{
    collections::{HashMap, HashSet},
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};

use futures::future::join_all;
use serde::Deserialize;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    mb::Registry,
    runner::{Runner, RunnerFactory},
    stats::Stats,
    wrapper::{config_hash, Wrapper},
};
use crate::config::reload::ConfigModulesConfig;

/// What a reload changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub started: usize,
    pub stopped: usize,
}

/// Running jobs keyed by configuration hash.
#[derive(Default)]
pub struct RunnerList {
    runners: Mutex<HashMap<u64, Arc<dyn Runner>>>,
}

impl RunnerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the running jobs; the lock is released on return.
    pub fn copy_list(&self) -> HashMap<u64, Arc<dyn Runner>> {
        self.lock().clone()
    }

    pub fn has(&self, hash: u64) -> bool {
        self.lock().contains_key(&hash)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add(&self, hash: u64, runner: Arc<dyn Runner>) {
        self.lock().insert(hash, runner);
    }

    fn remove(&self, hash: u64) -> Option<Arc<dyn Runner>> {
        self.lock().remove(&hash)
    }

    /// Makes the running set match `wrappers`.
    ///
    /// Stops run in parallel and are awaited before the starts, which run
    /// one after the other.
    pub async fn reload(&self, wrappers: Vec<Wrapper>, factory: &dyn RunnerFactory) -> ReloadOutcome {
        self.reload_keeping(wrappers, &HashSet::new(), factory).await
    }

    /// Like [`RunnerList::reload`], but jobs whose hash is in `keep` are
    /// never stopped even when no wrapper matches them.
    pub async fn reload_keeping(
        &self,
        wrappers: Vec<Wrapper>,
        keep: &HashSet<u64>,
        factory: &dyn RunnerFactory,
    ) -> ReloadOutcome {
        let mut to_stop = self.copy_list();
        to_stop.retain(|hash, _| !keep.contains(hash));
        let mut to_start = Vec::new();
        let mut queued = HashSet::new();

        for wrapper in wrappers {
            if !wrapper.is_enabled() {
                debug!(module = %wrapper.module().name(), "Skipping disabled module");
                continue;
            }

            let hash = wrapper.hash();
            if to_stop.remove(&hash).is_some() || self.has(hash) {
                trace!(hash, "Module already running");
                continue;
            }
            if queued.insert(hash) {
                to_start.push((hash, wrapper));
            }
        }

        let outcome = ReloadOutcome {
            started: to_start.len(),
            stopped: to_stop.len(),
        };

        join_all(to_stop.into_keys().map(|hash| async move {
            if let Some(runner) = self.remove(hash) {
                info!(runner = %runner, "Stopping module");
                runner.stop().await;
            }
        }))
        .await;

        for (hash, wrapper) in to_start {
            let runner = factory.create(wrapper);
            info!(runner = %runner, "Starting module");
            runner.start().await;
            self.add(hash, runner);
        }

        if outcome != ReloadOutcome::default() {
            info!(
                started = outcome.started,
                stopped = outcome.stopped,
                running = self.len(),
                "Module configuration reloaded"
            );
        }
        outcome
    }

    /// Stops and forgets every running job.
    pub async fn stop_all(&self) {
        let runners: Vec<_> = self.lock().drain().map(|(_, runner)| runner).collect();
        if runners.is_empty() {
            return;
        }
        info!(count = runners.len(), "Stopping all modules");
        join_all(runners.iter().map(|r| r.stop())).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<dyn Runner>>> {
        self.runners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RunnerList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hashes: Vec<u64> = self.lock().keys().copied().collect();
        hashes.sort_unstable();
        f.debug_struct("RunnerList").field("hashes", &hashes).finish()
    }
}

/// Detects changes in the set of files matching a glob.
#[derive(Debug)]
pub struct GlobWatcher {
    pattern: String,
    files: HashMap<PathBuf, (Option<SystemTime>, u64)>,
    scanned: bool,
}

impl GlobWatcher {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            files: HashMap::new(),
            scanned: false,
        }
    }

    /// Lists the matching files and whether anything changed since the
    /// previous scan. The first scan always reports a change.
    ///
    /// # Errors
    ///
    /// Fails if the pattern itself is invalid.
    pub fn scan(&mut self) -> Result<(Vec<PathBuf>, bool), glob::PatternError> {
        let mut current = HashMap::new();
        for entry in glob::glob(&self.pattern)? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("Cannot read {}: {}", e.path().display(), e);
                    continue;
                }
            };
            match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => {
                    current.insert(path, (meta.modified().ok(), meta.len()));
                }
                Ok(_) => {}
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }

        let changed = !self.scanned || current != self.files;
        self.scanned = true;
        self.files = current;

        let mut files: Vec<PathBuf> = self.files.keys().cloned().collect();
        files.sort();
        Ok((files, changed))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModulesFile {
    modules: Vec<toml::Table>,
}

fn read_modules_file(path: &Path) -> Result<Vec<toml::Table>, String> {
    let src = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let file: ModulesFile = toml::from_str(&src).map_err(|e| e.to_string())?;
    Ok(file.modules)
}

fn is_disabled(block: &toml::Table) -> bool {
    block.get("enabled").and_then(toml::Value::as_bool) == Some(false)
}

/// Module blocks built from one scan of the module files.
#[derive(Debug, Default)]
pub struct LoadedModules {
    pub wrappers: Vec<Wrapper>,
    /// Hashes whose running jobs stay up although no wrapper was built for
    /// them: blocks of unreadable files and blocks that failed to build.
    pub keep: HashSet<u64>,
    /// Some block failed to build and should be loaded again.
    pub retry: bool,
}

/// Keeps the running modules in sync with the module files.
pub struct Reloader {
    config: ConfigModulesConfig,
    registry: Arc<Registry>,
    stats: Stats,
    factory: Arc<dyn RunnerFactory>,
    runners: RunnerList,
    last_good: Mutex<HashMap<PathBuf, Vec<toml::Table>>>,
}

impl Reloader {
    pub fn new(
        config: ConfigModulesConfig,
        registry: Arc<Registry>,
        stats: Stats,
        factory: Arc<dyn RunnerFactory>,
    ) -> Self {
        Self {
            config,
            registry,
            stats,
            factory,
            runners: RunnerList::new(),
            last_good: Mutex::new(HashMap::new()),
        }
    }

    pub fn runners(&self) -> &RunnerList {
        &self.runners
    }

    /// Watches the module files until `cancel` fires, then stops every
    /// module it started.
    ///
    /// With reloading disabled the files are loaded once.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut watcher = GlobWatcher::new(self.config.path.clone());
        let mut retry = false;

        if !self.config.reload.enabled {
            info!(path = %self.config.path, "Loading module files once");
            self.check(&mut watcher, &mut retry).await;
            cancel.cancelled().await;
        } else {
            info!(
                path = %self.config.path,
                period = %humantime::format_duration(self.config.reload.period),
                "Watching module files"
            );
            let mut ticker = time::interval(self.config.reload.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.check(&mut watcher, &mut retry).await,
                }
            }
        }

        self.runners.stop_all().await;
        info!("Reloader stopped");
    }

    async fn check(&self, watcher: &mut GlobWatcher, retry: &mut bool) {
        let files = match watcher.scan() {
            Ok((_, false)) if !*retry => {
                trace!("Module files unchanged");
                return;
            }
            Ok((files, changed)) => {
                debug!(files = files.len(), changed, "Loading module files");
                files
            }
            Err(e) => {
                error!(path = %self.config.path, "Invalid module file pattern: {}", e);
                return;
            }
        };

        let loaded = self.load_files(&files);
        *retry = loaded.retry;
        self.runners
            .reload_keeping(loaded.wrappers, &loaded.keep, self.factory.as_ref())
            .await;
    }

    /// Builds every module block of `files`.
    ///
    /// A file that cannot be read or parsed contributes the hashes of its
    /// last good blocks to `keep`. A block that fails to build is logged,
    /// its hash is kept and `retry` is set.
    pub fn load_files(&self, files: &[PathBuf]) -> LoadedModules {
        let parsed: Vec<_> = files
            .iter()
            .map(|path| (path, read_modules_file(path)))
            .collect();

        let mut loaded = LoadedModules::default();
        let mut usable = Vec::with_capacity(parsed.len());
        {
            let mut last_good = self.last_good.lock().unwrap_or_else(PoisonError::into_inner);
            last_good.retain(|path, _| files.contains(path));

            for (path, blocks) in parsed {
                match blocks {
                    Ok(blocks) => {
                        last_good.insert(path.clone(), blocks.clone());
                        usable.push((path, blocks));
                    }
                    Err(e) => match last_good.get(path) {
                        Some(previous) => {
                            warn!(
                                file = %path.display(),
                                "Keeping previous modules of unreadable file: {}", e
                            );
                            loaded.keep.extend(
                                previous
                                    .iter()
                                    .filter(|block| !is_disabled(block))
                                    .map(config_hash),
                            );
                        }
                        None => error!(file = %path.display(), "Skipping module file: {}", e),
                    },
                }
            }
        }

        for (path, blocks) in usable {
            self.build_blocks(path, blocks, &mut loaded);
        }
        loaded
    }

    fn build_blocks(&self, path: &Path, blocks: Vec<toml::Table>, loaded: &mut LoadedModules) {
        for block in blocks {
            if is_disabled(&block) {
                debug!(file = %path.display(), "Skipping disabled module block");
                continue;
            }
            let hash = config_hash(&block);
            match Wrapper::new(block, &self.registry, &self.stats) {
                Ok(wrapper) => loaded.wrappers.push(wrapper),
                Err(e) => {
                    error!(file = %path.display(), "Module block failed to build, retrying: {}", e);
                    loaded.keep.insert(hash);
                    loaded.retry = true;
                }
            }
        }
    }

    /// Applies a snapshot of module configurations.
    pub async fn reload(&self, wrappers: Vec<Wrapper>) -> ReloadOutcome {
        self.runners.reload(wrappers, self.factory.as_ref()).await
    }
}
