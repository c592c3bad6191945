//! metricbee: dynamic metric collection scheduler
//!
//! Collector plugins (modules, each with metricsets) are registered in a
//! `Registry`. Module configuration blocks are turned into recurring polling
//! jobs, one per metricset and host, whose events flow through a bounded
//! channel into a `Publisher`. Module files can be added, changed or removed
//! at runtime; the reloader starts and stops jobs by diffing configuration
//! hashes.
//!
//! ## Modules
//!
//! * `config`: TOML configuration: logging, static module blocks, module
//!   file reloading, light modules and the monitoring namespace. Validated
//!   with the `validator` crate.
//!
//! * `core`: scheduler runtime:
//!   - Plugin model and registry (`core::mb`)
//!   - Fetch workers (`core::wrapper`)
//!   - Shared per-metricset statistics (`core::stats`, `core::monitoring`)
//!   - Runners and the configuration reloader
//!   - Built-in metricsets (`core::modules`)
//!
//! * `logger`: logging initialization using `tracing`, with console output
//!   (compact, pretty, JSON) and optional systemd journald integration.
//!
//! ## Features
//!
//! * `module-self`: builds the `self/memory` metricset (default: enabled,
//!   Linux only).

pub mod config;
pub mod core;
pub mod logger;
