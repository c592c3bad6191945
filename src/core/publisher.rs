//! The seam between running modules and the external output pipeline.

use thiserror::Error;
use tracing::info;

use super::mb::BeatEvent;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Output pipeline is closed")]
    Closed,
}

/// Trait for sinks that accept enveloped events.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    /// Hands one event to the pipeline. Errors are logged by the caller and
    /// the event is dropped.
    async fn publish(&self, event: BeatEvent) -> Result<(), PublishError>;
}

/// Writes every event as a JSON line through `tracing`, under the
/// `metricbee::events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait::async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, event: BeatEvent) -> Result<(), PublishError> {
        let json = serde_json::to_string(&event)?;
        info!(target: "metricbee::events", dataset = %event.event.dataset, "{}", json);
        Ok(())
    }
}
