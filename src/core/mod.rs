//! Scheduler runtime: the plugin model, fetch workers, stats, runners and
//! the configuration reloader.

pub mod mb;
pub mod modules;
pub mod monitoring;
pub mod publisher;
pub mod reloader;
pub mod runner;
pub mod stats;
pub mod status;
pub mod wrapper;
