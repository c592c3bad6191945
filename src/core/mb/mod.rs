//! Plugin model: modules, metricsets, fetch styles and the registry.
//!
//! Plugins (one module per product, one metricset per pollable capability)
//! register factories in a [`registry::Registry`]. The scheduler builds
//! modules from configuration blocks with [`module::new_module`] and only
//! ever talks to metricsets through the fetch-style traits.

/// Error types shared by registration and construction.
pub mod error;

/// Metricset events and the published envelope.
pub mod event;

/// Light modules: metricsets described on disk.
pub mod light;

/// Module and metricset instances, and building them from configuration.
pub mod module;

/// The factory catalog.
pub mod registry;

/// Fetch-style traits implemented by plugins.
pub mod traits;

pub use error::{FetchError, MbError, MbResult};
pub use event::{BeatEvent, Event};
pub use module::{BaseMetricSet, BaseModule, HostData, MetricSet, Module};
pub use registry::{MetricSetOptions, Registry};
pub use traits::{EventFetcher, EventsFetcher, FetchStyle, PushMetricSet, Reporter, ReportingFetcher};
