use std::fmt;

use tokio_util::sync::CancellationToken;

use super::{error::FetchError, event::Event};

/// Sink handed to reporting and push metricsets.
///
/// Both methods return `false` once the job is stopping and the value was
/// dropped instead of delivered; implementations should stop producing when
/// that happens.
#[async_trait::async_trait]
pub trait Reporter: Send {
    /// Delivers one event.
    async fn event(&mut self, event: Event) -> bool;

    /// Delivers an error-bearing event.
    async fn error(&mut self, err: FetchError) -> bool;

    /// Token cancelled when the job is asked to stop.
    fn done(&self) -> CancellationToken;
}

/// Fetches exactly one event per period.
#[async_trait::async_trait]
pub trait EventFetcher: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Event, FetchError>;
}

/// Fetches any number of events per period.
///
/// Returning events together with an error is allowed: the events are still
/// delivered and counted, and the fetch is counted as a failure.
#[async_trait::async_trait]
pub trait EventsFetcher: Send + Sync + 'static {
    async fn fetch(&self) -> (Vec<Event>, Option<FetchError>);
}

/// Pushes events through a reporter once per period.
#[async_trait::async_trait]
pub trait ReportingFetcher: Send + Sync + 'static {
    async fn fetch(&self, reporter: &mut dyn Reporter) -> Result<(), FetchError>;
}

/// Streams events for the whole lifetime of the job.
///
/// `run` is called once and must return when `reporter.done()` is cancelled.
#[async_trait::async_trait]
pub trait PushMetricSet: Send + Sync + 'static {
    async fn run(&self, reporter: &mut dyn Reporter);
}

/// The one way a metricset produces events.
///
/// Factories return exactly one of these, so a metricset can never expose
/// zero or several fetch styles.
pub enum FetchStyle {
    Event(Box<dyn EventFetcher>),
    Events(Box<dyn EventsFetcher>),
    Reporting(Box<dyn ReportingFetcher>),
    Push(Box<dyn PushMetricSet>),
}

impl FetchStyle {
    pub fn event(fetcher: impl EventFetcher) -> Self {
        FetchStyle::Event(Box::new(fetcher))
    }

    pub fn events(fetcher: impl EventsFetcher) -> Self {
        FetchStyle::Events(Box::new(fetcher))
    }

    pub fn reporting(fetcher: impl ReportingFetcher) -> Self {
        FetchStyle::Reporting(Box::new(fetcher))
    }

    pub fn push(metricset: impl PushMetricSet) -> Self {
        FetchStyle::Push(Box::new(metricset))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStyle::Event(_) => "event",
            FetchStyle::Events(_) => "events",
            FetchStyle::Reporting(_) => "reporting",
            FetchStyle::Push(_) => "push",
        }
    }

    /// Push metricsets are not scheduled on a period.
    pub fn is_push(&self) -> bool {
        matches!(self, FetchStyle::Push(_))
    }
}

impl fmt::Debug for FetchStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FetchStyle").field(&self.as_str()).finish()
    }
}
