//! Metricsets compiled into the agent. Each one registers itself with
//! `register_metricset!` and is picked up by `Registry::with_builtins`.

#[cfg(all(feature = "module-self", target_os = "linux"))]
pub mod memory;
