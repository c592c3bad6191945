//! Wrapper: a configured module with its metricsets, turned into running
//! fetch workers.
//!
//! Each (metricset × host) instance gets one tokio task. The task fetches
//! immediately, then once per period, and writes enveloped events to an
//! output channel shared by all workers of the wrapper.

use std::{
    any::Any,
    backtrace::Backtrace,
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::Duration,
};

use futures::FutureExt;
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::{
    mb::{
        event::EventOrigin,
        module::{new_module, MetricSet, Module},
        BeatEvent, Event, FetchError, FetchStyle, MbResult, Registry, Reporter,
    },
    stats::{Stats, StatsHandle},
    status::{FailureTracker, LogStatusReporter, Status, StatusReporter},
};

/// Capacity of the output channel shared by the workers of one wrapper.
const OUTPUT_BUFFER: usize = 1;

/// A module instance and the metricset instances built from one
/// configuration block.
pub struct Wrapper {
    module: Arc<dyn Module>,
    metricsets: Vec<Arc<MetricSetWrapper>>,
    raw: toml::Table,
    hash: OnceLock<u64>,
    status: Arc<dyn StatusReporter>,
}

impl Wrapper {
    /// Builds the module and every metricset of `raw`.
    ///
    /// # Errors
    ///
    /// Fails if the module or any of its metricsets cannot be built.
    pub fn new(raw: toml::Table, registry: &Registry, stats: &Stats) -> MbResult<Self> {
        let (module, metricsets) = new_module(&raw, registry)?.into_complete()?;

        let metricsets = metricsets
            .into_iter()
            .map(|metricset| {
                let handle = stats.acquire(module.name(), metricset.name());
                Arc::new(MetricSetWrapper::new(metricset, Arc::clone(&module), handle))
            })
            .collect();

        Ok(Self {
            module,
            metricsets,
            raw,
            hash: OnceLock::new(),
            status: Arc::new(LogStatusReporter),
        })
    }

    /// Routes status changes of the metricsets to `reporter`.
    pub fn with_status_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.status = reporter;
        self
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn metricsets(&self) -> &[Arc<MetricSetWrapper>] {
        &self.metricsets
    }

    pub fn raw_config(&self) -> &toml::Table {
        &self.raw
    }

    pub fn is_enabled(&self) -> bool {
        self.module.config().enabled
    }

    /// Content hash of the configuration block.
    ///
    /// Two blocks with the same keys and values hash equally regardless of
    /// key order, so an unchanged block maps to the job already running.
    pub fn hash(&self) -> u64 {
        *self.hash.get_or_init(|| config_hash(&self.raw))
    }

    /// One wrapper per metricset instance, each keeping this wrapper's hash.
    pub fn split(&self) -> Vec<Wrapper> {
        let hash = self.hash();
        self.metricsets
            .iter()
            .map(|msw| Wrapper {
                module: Arc::clone(&self.module),
                metricsets: vec![Arc::clone(msw)],
                raw: self.raw.clone(),
                hash: OnceLock::from(hash),
                status: Arc::clone(&self.status),
            })
            .collect()
    }

    /// Starts one worker per metricset instance.
    ///
    /// The returned channel is shared by all workers and closes once every
    /// worker has returned after `cancel` fired. It must be drained: a full
    /// channel blocks every worker.
    pub fn start(&self, cancel: CancellationToken) -> mpsc::Receiver<BeatEvent> {
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let mut workers = JoinSet::new();

        for msw in &self.metricsets {
            let msw = Arc::clone(msw);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let status = Arc::clone(&self.status);
            workers.spawn(async move { msw.run(tx, cancel, status).await });
        }
        drop(tx);

        let module = self.module.name().to_string();
        info!(module = %module, workers = self.metricsets.len(), "Module started");

        tokio::spawn(async move {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(module = %module, "Metricset worker panicked: {}", e);
                    }
                }
            }
            debug!(module = %module, "All metricset workers stopped, output closed");
        });

        rx
    }
}

impl fmt::Display for Wrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.module.config();
        let mut names: Vec<&str> = self.metricsets.iter().map(|m| m.name()).collect();
        names.dedup();
        write!(
            f,
            "module={}, metricsets=[{}], hosts=[{}], period={}",
            self.module.name(),
            names.join(", "),
            config.hosts.join(", "),
            humantime::format_duration(config.period),
        )
    }
}

impl fmt::Debug for Wrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wrapper")
            .field("module", &self.module.name())
            .field("metricsets", &self.metricsets)
            .field("hash", &self.hash())
            .finish()
    }
}

/// xxh3 of the canonical JSON form of the table (keys sorted, nested tables
/// included).
pub(crate) fn config_hash(raw: &toml::Table) -> u64 {
    let canonical = serde_json::to_vec(raw).unwrap_or_else(|e| {
        warn!("Config hash falls back to TOML form: {}", e);
        raw.to_string().into_bytes()
    });
    xxh3_64(&canonical)
}

/// One running metricset instance: the metricset, its module, its stats and
/// its health bookkeeping.
pub struct MetricSetWrapper {
    metricset: MetricSet,
    module: Arc<dyn Module>,
    stats: StatsHandle,
    failures: Mutex<FailureTracker>,
}

impl MetricSetWrapper {
    fn new(metricset: MetricSet, module: Arc<dyn Module>, stats: StatsHandle) -> Self {
        let failures = Mutex::new(FailureTracker::new(module.config().failure_threshold));
        Self {
            metricset,
            module,
            stats,
            failures,
        }
    }

    pub fn name(&self) -> &str {
        self.metricset.name()
    }

    pub fn host(&self) -> &str {
        self.metricset.host()
    }

    pub fn stats(&self) -> &StatsHandle {
        &self.stats
    }

    pub fn fetch_style(&self) -> &'static str {
        self.metricset.style.as_str()
    }

    fn period(&self) -> Duration {
        self.module.config().period
    }

    fn job_name(&self) -> String {
        match self.host() {
            "" => format!("{}/{}", self.module.name(), self.name()),
            host => format!("{}/{}@{}", self.module.name(), self.name(), host),
        }
    }

    fn origin(&self) -> EventOrigin<'_> {
        EventOrigin {
            module: self.module.name(),
            metricset: self.name(),
            host: self.metricset.base.display_host(),
            period: self.period(),
            namespace: self.metricset.base.namespace(),
        }
    }

    async fn run(
        self: Arc<Self>,
        out: mpsc::Sender<BeatEvent>,
        cancel: CancellationToken,
        status: Arc<dyn StatusReporter>,
    ) {
        let job = self.job_name();
        debug!(job = %job, style = self.fetch_style(), "Metricset worker started");
        status.update_status(&job, &Status::Starting);

        if let FetchStyle::Push(push) = &self.metricset.style {
            let mut reporter = EventReporter::new(&self, &out, &cancel);
            let ran = AssertUnwindSafe(push.run(&mut reporter)).catch_unwind().await;
            if let Err(panic) = ran {
                self.record_panic(&job, panic, status.as_ref());
            }
        } else {
            self.periodic(&job, &out, &cancel, status.as_ref()).await;
        }

        status.update_status(&job, &Status::Stopped);
        debug!(job = %job, "Metricset worker stopped");
    }

    async fn periodic(
        &self,
        job: &str,
        out: &mpsc::Sender<BeatEvent>,
        cancel: &CancellationToken,
        status: &dyn StatusReporter,
    ) {
        self.fetch(job, out, cancel, status).await;

        let period = self.period();
        if period.is_zero() {
            cancel.cancelled().await;
            return;
        }

        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.fetch(job, out, cancel, status).await,
            }
        }
    }

    /// Runs one fetch, delivers its events and records its outcome.
    async fn fetch(
        &self,
        job: &str,
        out: &mpsc::Sender<BeatEvent>,
        cancel: &CancellationToken,
        status: &dyn StatusReporter,
    ) {
        let mut reporter = EventReporter::new(self, out, cancel);
        let fetched = AssertUnwindSafe(self.fetch_once(&mut reporter))
            .catch_unwind()
            .await;

        match fetched {
            Ok(()) => match reporter.last_error.take() {
                None => {
                    self.stats.successes().inc();
                    let healthy = self.tracker().success();
                    status.update_status(job, &healthy);
                }
                Some(reason) => {
                    self.stats.failures().inc();
                    let (degraded, consecutive) = {
                        let mut tracker = self.tracker();
                        (tracker.failure(&reason), tracker.consecutive())
                    };
                    debug!(job = %job, consecutive, "Fetch failed: {}", reason);
                    if let Some(degraded) = degraded {
                        status.update_status(job, &degraded);
                    }
                }
            },
            Err(panic) => self.record_panic(job, panic, status),
        }
    }

    async fn fetch_once(&self, reporter: &mut EventReporter<'_>) {
        match &self.metricset.style {
            FetchStyle::Event(fetcher) => match fetcher.fetch().await {
                Ok(event) => {
                    reporter.event(event).await;
                }
                Err(err) => {
                    reporter.error(err).await;
                }
            },
            FetchStyle::Events(fetcher) => {
                let (events, err) = fetcher.fetch().await;
                for event in events {
                    if !reporter.event(event).await {
                        break;
                    }
                }
                if let Some(err) = err {
                    reporter.error(err).await;
                }
            }
            FetchStyle::Reporting(fetcher) => {
                if let Err(err) = fetcher.fetch(reporter).await {
                    reporter.error(err).await;
                }
            }
            FetchStyle::Push(_) => {}
        }
    }

    fn record_panic(&self, job: &str, panic: Box<dyn Any + Send>, status: &dyn StatusReporter) {
        let message = panic_message(panic.as_ref());
        error!(
            job = %job,
            "Metricset panicked: {}\n{}",
            message,
            Backtrace::force_capture()
        );
        self.stats.failures().inc();
        if let Some(degraded) = self.tracker().failure(&message) {
            status.update_status(job, &degraded);
        }
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, FailureTracker> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for MetricSetWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSetWrapper")
            .field("module", &self.module.name())
            .field("metricset", &self.name())
            .field("host", &self.host())
            .field("style", &self.fetch_style())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Reporter handed to metricsets; envelopes events and writes them to the
/// output channel of the wrapper.
struct EventReporter<'a> {
    msw: &'a MetricSetWrapper,
    out: &'a mpsc::Sender<BeatEvent>,
    cancel: &'a CancellationToken,
    started: Instant,
    last_error: Option<String>,
}

impl<'a> EventReporter<'a> {
    fn new(
        msw: &'a MetricSetWrapper,
        out: &'a mpsc::Sender<BeatEvent>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            msw,
            out,
            cancel,
            started: Instant::now(),
            last_error: None,
        }
    }

    async fn deliver(&mut self, event: Event) -> bool {
        let event = event.into_beat_event(&self.msw.origin(), self.started.elapsed());
        let delivered = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.out.send(event) => sent.is_ok(),
        };
        if delivered {
            self.msw.stats.events().inc();
        }
        delivered
    }
}

#[async_trait::async_trait]
impl Reporter for EventReporter<'_> {
    async fn event(&mut self, event: Event) -> bool {
        self.deliver(event).await
    }

    async fn error(&mut self, err: FetchError) -> bool {
        let event = Event::from_error(&err);
        self.last_error = Some(err.to_string());
        if self.msw.metricset.style.is_push() {
            // Push metricsets have no fetch cycle; each error is one failure.
            self.msw.stats.failures().inc();
        }
        self.deliver(event).await
    }

    fn done(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::timeout;

    use super::*;
    use crate::core::mb::{
        module::tests::test_registry,
        BaseMetricSet, EventFetcher, EventsFetcher, PushMetricSet, ReportingFetcher,
    };

    fn table(src: &str) -> toml::Table {
        src.parse().unwrap()
    }

    struct Panicky;

    #[async_trait::async_trait]
    impl EventFetcher for Panicky {
        async fn fetch(&self) -> Result<Event, FetchError> {
            panic!("fetch exploded");
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl EventFetcher for Failing {
        async fn fetch(&self) -> Result<Event, FetchError> {
            Err("connection refused".into())
        }
    }

    struct Partial;

    #[async_trait::async_trait]
    impl EventsFetcher for Partial {
        async fn fetch(&self) -> (Vec<Event>, Option<FetchError>) {
            (
                vec![Event::default(), Event::default()],
                Some("third item unreadable".into()),
            )
        }
    }

    struct TwoReports;

    #[async_trait::async_trait]
    impl ReportingFetcher for TwoReports {
        async fn fetch(&self, reporter: &mut dyn Reporter) -> Result<(), FetchError> {
            reporter.event(Event::default()).await;
            reporter.event(Event::default()).await;
            Ok(())
        }
    }

    struct Ticker;

    #[async_trait::async_trait]
    impl PushMetricSet for Ticker {
        async fn run(&self, reporter: &mut dyn Reporter) {
            let done = reporter.done();
            let mut n = 0i64;
            loop {
                let mut fields = serde_json::Map::new();
                fields.insert("n".into(), n.into());
                if !reporter.event(Event::from(fields)).await {
                    break;
                }
                n += 1;
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = time::sleep(Duration::from_millis(1)) => {}
                }
            }
        }
    }

    /// Records every reported status.
    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<Status>>);

    impl StatusReporter for Recorder {
        fn update_status(&self, _job: &str, status: &Status) {
            self.0.lock().unwrap().push(status.clone());
        }
    }

    fn registry() -> Registry {
        let mut registry = test_registry();
        registry
            .add_metricset("test", "panicky", |_: &BaseMetricSet| {
                Ok(FetchStyle::event(Panicky))
            })
            .unwrap();
        registry
            .add_metricset("test", "failing", |_: &BaseMetricSet| {
                Ok(FetchStyle::event(Failing))
            })
            .unwrap();
        registry
            .add_metricset("test", "partial", |_: &BaseMetricSet| {
                Ok(FetchStyle::events(Partial))
            })
            .unwrap();
        registry
            .add_metricset("test", "reports", |_: &BaseMetricSet| {
                Ok(FetchStyle::reporting(TwoReports))
            })
            .unwrap();
        registry
            .add_metricset("test", "push", |_: &BaseMetricSet| {
                Ok(FetchStyle::push(Ticker))
            })
            .unwrap();
        registry
    }

    async fn drain(mut rx: mpsc::Receiver<BeatEvent>) -> usize {
        let mut n = 0;
        while rx.recv().await.is_some() {
            n += 1;
        }
        n
    }

    #[tokio::test]
    async fn test_end_to_end_fetches_every_period() {
        let stats = Stats::default();
        let wrapper = Wrapper::new(
            table(
                r#"
                module = "test"
                metricsets = ["a"]
                hosts = ["h1", "h2"]
                period = "10ms"
                "#,
            ),
            &registry(),
            &stats,
        )
        .unwrap();
        assert_eq!(wrapper.metricsets().len(), 2);

        let cancel = CancellationToken::new();
        let mut rx = wrapper.start(cancel.clone());

        let mut per_host = std::collections::HashMap::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while per_host.values().filter(|n| **n >= 2).count() < 2 {
            let event = timeout(deadline.saturating_duration_since(Instant::now()), rx.recv())
                .await
                .expect("events within deadline")
                .expect("channel open");
            assert_eq!(event.event.module, "test");
            assert_eq!(event.event.dataset, "test.a");
            assert_eq!(event.metricset.period_ms, 10);
            assert_eq!(event.get_path("test.a.value"), Some(&1.into()));
            *per_host.entry(event.host().unwrap().to_string()).or_insert(0) += 1;
        }

        // Counters are shared by both hosts.
        assert!(wrapper.metricsets()[0].stats().successes().get() >= 2);
        assert_eq!(wrapper.metricsets()[0].stats().failures().get(), 0);

        cancel.cancel();
        drain(rx).await;
        let after = wrapper.metricsets()[0].stats().successes().get();
        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(wrapper.metricsets()[0].stats().successes().get(), after);
    }

    #[tokio::test]
    async fn test_output_closes_after_cancel() {
        let stats = Stats::default();
        let wrapper = Wrapper::new(
            table(
                r#"
                module = "test"
                metricsets = ["a", "c"]
                hosts = ["h1", "h2", "h3"]
                period = "1h"
                "#,
            ),
            &registry(),
            &stats,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let mut rx = wrapper.start(cancel.clone());
        // Immediate fetch of every worker.
        for _ in 0..6 {
            assert!(rx.recv().await.is_some());
        }

        cancel.cancel();
        cancel.cancel();
        let closed = timeout(Duration::from_secs(5), drain(rx)).await;
        assert_eq!(closed.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_panicking_fetch_counts_failures() {
        let stats = Stats::default();
        let wrapper = Wrapper::new(
            table(
                r#"
                module = "test"
                metricsets = ["panicky"]
                period = "1ms"
                "#,
            ),
            &registry(),
            &stats,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let rx = wrapper.start(cancel.clone());
        let counters = wrapper.metricsets()[0].stats();

        timeout(Duration::from_secs(10), async {
            while counters.failures().get() < 100 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker keeps running after panics");

        assert_eq!(counters.successes().get(), 0);
        assert_eq!(counters.events().get(), 0);
        cancel.cancel();
        assert_eq!(drain(rx).await, 0);
    }

    #[tokio::test]
    async fn test_partial_events_with_error() {
        let stats = Stats::default();
        let wrapper = Wrapper::new(
            table(
                r#"
                module = "test"
                metricsets = ["partial"]
                period = "1h"
                "#,
            ),
            &registry(),
            &stats,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let mut rx = wrapper.start(cancel.clone());
        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(rx.recv().await.unwrap());
        }

        assert_eq!(received.iter().filter(|e| e.is_error()).count(), 1);
        assert_eq!(
            received[2].error.as_ref().unwrap().message,
            "third item unreadable"
        );

        let counters = wrapper.metricsets()[0].stats();
        assert_eq!(counters.failures().get(), 1);
        assert_eq!(counters.successes().get(), 0);
        assert_eq!(counters.events().get(), 3);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_reporting_fetcher_delivers_all_reports() {
        let stats = Stats::default();
        let wrapper = Wrapper::new(
            table(
                r#"
                module = "test"
                metricsets = ["reports"]
                period = "1h"
                "#,
            ),
            &registry(),
            &stats,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let mut rx = wrapper.start(cancel.clone());
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        cancel.cancel();
        drain(rx).await;

        let counters = wrapper.metricsets()[0].stats();
        assert_eq!(counters.successes().get(), 1);
        assert_eq!(counters.events().get(), 2);
    }

    #[tokio::test]
    async fn test_push_metricset_stops_on_cancel() {
        let stats = Stats::default();
        let wrapper = Wrapper::new(
            table(
                r#"
                module = "test"
                metricsets = ["push"]
                "#,
            ),
            &registry(),
            &stats,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let mut rx = wrapper.start(cancel.clone());
        for expected in 0..5i64 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.get_path("test.push.n"), Some(&expected.into()));
        }

        cancel.cancel();
        timeout(Duration::from_secs(5), drain(rx)).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_after_cancel_is_not_delivered() {
        let stats = Stats::default();
        let wrapper = Wrapper::new(
            table(
                r#"
                module = "test"
                metricsets = ["a"]
                "#,
            ),
            &registry(),
            &stats,
        )
        .unwrap();
        let msw = &wrapper.metricsets()[0];

        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut reporter = EventReporter::new(msw, &tx, &cancel);
        assert!(!reporter.event(Event::default()).await);
        assert_eq!(msw.stats().events().get(), 0);
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_health_threshold() {
        let stats = Stats::default();
        let wrapper = Wrapper::new(
            table(
                r#"
                module = "test"
                metricsets = ["failing", "a"]
                failure_threshold = 2
                "#,
            ),
            &registry(),
            &stats,
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let recorder = Recorder::default();

        let failing = &wrapper.metricsets()[0];
        for _ in 0..3 {
            failing.fetch("failing", &tx, &cancel, &recorder).await;
        }
        {
            let statuses = recorder.0.lock().unwrap();
            assert_eq!(statuses.len(), 1);
            assert!(statuses[0].reason().contains("3 consecutive failures"));
        }
        assert_eq!(failing.stats().failures().get(), 3);

        let healthy = &wrapper.metricsets()[1];
        healthy.fetch("a", &tx, &cancel, &recorder).await;
        assert_eq!(recorder.0.lock().unwrap().last(), Some(&Status::Running));

        drop(tx);
        let mut errors = 0;
        while let Some(event) = rx.recv().await {
            errors += usize::from(event.is_error());
        }
        assert_eq!(errors, 3);
    }

    #[tokio::test]
    async fn test_default_threshold_degrades_on_first_failure() {
        let stats = Stats::default();
        let wrapper = Wrapper::new(
            table(
                r#"
                module = "test"
                metricsets = ["failing"]
                "#,
            ),
            &registry(),
            &stats,
        )
        .unwrap();

        let (tx, _rx) = mpsc::channel(4);
        let recorder = Recorder::default();
        wrapper.metricsets()[0]
            .fetch("failing", &tx, &CancellationToken::new(), &recorder)
            .await;
        assert!(matches!(
            recorder.0.lock().unwrap().as_slice(),
            [Status::Degraded(_)]
        ));
    }

    #[test]
    fn test_hash_stable_and_sensitive() {
        let stats = Stats::default();
        let registry = registry();
        let build = |src: &str| Wrapper::new(table(src), &registry, &stats).unwrap();

        let a = build(
            r#"
            module = "test"
            metricsets = ["a"]
            hosts = ["h1"]
            [extra]
            x = 1
            y = "z"
            "#,
        );
        let reordered = build(
            r#"
            hosts = ["h1"]
            metricsets = ["a"]
            module = "test"
            [extra]
            y = "z"
            x = 1
            "#,
        );
        let changed = build(
            r#"
            module = "test"
            metricsets = ["a"]
            hosts = ["h1"]
            [extra]
            x = 2
            y = "z"
            "#,
        );

        assert_eq!(a.hash(), a.hash());
        assert_eq!(a.hash(), reordered.hash());
        assert_ne!(a.hash(), changed.hash());
    }

    #[test]
    fn test_split_shares_hash_and_stats() {
        let stats = Stats::default();
        let wrapper = Wrapper::new(
            table(
                r#"
                module = "test"
                metricsets = ["a", "c"]
                hosts = ["h1", "h2"]
                "#,
            ),
            &registry(),
            &stats,
        )
        .unwrap();

        assert_eq!(stats.refcount("test.a"), Some(2));
        let parts = wrapper.split();
        assert_eq!(parts.len(), 4);
        assert!(parts.iter().all(|p| p.hash() == wrapper.hash()));
        assert!(parts.iter().all(|p| p.metricsets().len() == 1));
        assert_eq!(stats.refcount("test.a"), Some(2));

        drop(wrapper);
        assert_eq!(stats.refcount("test.a"), Some(2));
        drop(parts);
        assert!(stats.is_empty());
    }

    #[test]
    fn test_strict_construction_releases_stats() {
        let stats = Stats::default();
        let err = Wrapper::new(
            table(
                r#"
                module = "test"
                metricsets = ["a", "broken"]
                "#,
            ),
            &registry(),
            &stats,
        )
        .unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert!(stats.is_empty());
    }

    #[test]
    fn test_disabled_and_display() {
        let stats = Stats::default();
        let wrapper = Wrapper::new(
            table(
                r#"
                module = "test"
                metricsets = ["a"]
                hosts = ["h1", "h2"]
                enabled = false
                period = "30s"
                "#,
            ),
            &registry(),
            &stats,
        )
        .unwrap();
        assert!(!wrapper.is_enabled());
        assert_eq!(
            wrapper.to_string(),
            "module=test, metricsets=[a], hosts=[h1, h2], period=30s"
        );
    }

    #[tokio::test]
    async fn test_zero_period_fetches_once() {
        static FETCHES: AtomicUsize = AtomicUsize::new(0);

        struct Once;

        #[async_trait::async_trait]
        impl EventFetcher for Once {
            async fn fetch(&self) -> Result<Event, FetchError> {
                FETCHES.fetch_add(1, Ordering::SeqCst);
                Ok(Event::default())
            }
        }

        let mut registry = Registry::new();
        registry
            .add_metricset("once", "only", |_: &BaseMetricSet| Ok(FetchStyle::event(Once)))
            .unwrap();

        let stats = Stats::default();
        let wrapper = Wrapper::new(
            table(
                r#"
                module = "once"
                metricsets = ["only"]
                period = "0s"
                "#,
            ),
            &registry,
            &stats,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let mut rx = wrapper.start(cancel.clone());
        rx.recv().await.unwrap();
        time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        drain(rx).await;
        assert_eq!(FETCHES.load(Ordering::SeqCst), 1);
    }
}
