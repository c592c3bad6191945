//! Health status of running metricsets.

use std::fmt;

use tracing::{debug, warn};

/// Health of one metricset instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Not fetched yet.
    Starting,
    /// The last fetch succeeded.
    Running,
    /// Consecutive failures went past the configured threshold.
    Degraded(String),
    /// The job has been asked to stop.
    Stopped,
}

impl Status {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Status::Starting | Status::Running)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Status::Starting => "Starting",
            Status::Running => "Running",
            Status::Degraded(_) => "Degraded",
            Status::Stopped => "Stopped",
        }
    }

    /// Cause of a degraded status, otherwise an empty string.
    pub fn reason(&self) -> &str {
        match self {
            Status::Degraded(reason) => reason,
            _ => "",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Degraded(reason) => write!(f, "Degraded: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Receives status changes of metricset instances.
///
/// Implementations are called from fetch workers and must not block.
pub trait StatusReporter: Send + Sync + fmt::Debug + 'static {
    fn update_status(&self, job: &str, status: &Status);
}

/// Writes status changes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusReporter;

impl StatusReporter for LogStatusReporter {
    fn update_status(&self, job: &str, status: &Status) {
        match status {
            Status::Degraded(reason) => warn!(job = %job, reason = %reason, "Metricset degraded"),
            other => debug!(job = %job, status = %other, "Metricset status"),
        }
    }
}

/// Consecutive-failure bookkeeping for one metricset instance.
///
/// A negative threshold never degrades; otherwise the instance degrades once
/// the number of consecutive failures exceeds the threshold.
#[derive(Debug)]
pub(crate) struct FailureTracker {
    threshold: i64,
    consecutive: u64,
}

impl FailureTracker {
    pub(crate) fn new(threshold: i64) -> Self {
        Self {
            threshold,
            consecutive: 0,
        }
    }

    pub(crate) fn success(&mut self) -> Status {
        self.consecutive = 0;
        Status::Running
    }

    /// Records a failure, returning the status to report, if any.
    pub(crate) fn failure(&mut self, reason: &str) -> Option<Status> {
        self.consecutive += 1;
        let threshold = u64::try_from(self.threshold).ok()?;
        (self.consecutive > threshold).then(|| {
            Status::Degraded(format!(
                "{} consecutive failures, last: {}",
                self.consecutive, reason
            ))
        })
    }

    pub(crate) fn consecutive(&self) -> u64 {
        self.consecutive
    }
}
