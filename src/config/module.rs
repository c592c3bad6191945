//! Per-module configuration block.
//!
//! A module block names one module, the metricsets to run, the hosts to poll
//! and the polling schedule. Any other keys in the block are metricset
//! specific; they stay in the raw table and are handed to the factories
//! untouched.

use std::{collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::mb::error::{MbError, MbResult};

/// Default polling period when a block does not set one.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(10);

/// Typed view of the scheduling keys of a module configuration block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ModuleConfig {
    /// Module name as registered (matched case-insensitively).
    #[validate(length(min = 1, message = "Module name must not be empty"))]
    pub module: String,

    /// Metricsets to run. Empty means the module's default metricsets.
    pub metricsets: Vec<String>,

    /// Targets to poll. One job is started per metricset and host.
    pub hosts: Vec<String>,

    /// Interval between two fetches.
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// Timeout exposed to metricsets. Falls back to `period` when unset.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Disabled blocks are parsed but never scheduled.
    pub enabled: bool,

    /// Consecutive failed fetches tolerated before a metricset reports itself
    /// degraded. Negative values disable degradation.
    pub failure_threshold: i64,

    /// Event namespace for every metricset of the block. Takes precedence
    /// over the namespace the metricset was registered with.
    pub namespace: Option<String>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            module: String::new(),
            metricsets: Vec::new(),
            hosts: Vec::new(),
            period: DEFAULT_PERIOD,
            timeout: None,
            enabled: true,
            failure_threshold: 0,
            namespace: None,
        }
    }
}

impl ModuleConfig {
    /// Unpacks and validates the scheduling keys of a raw module block.
    ///
    /// # Errors
    ///
    /// Returns `MbError::InvalidConfig` when the block cannot be deserialized
    /// or fails validation, and `MbError::DuplicateHosts` when a host is
    /// listed more than once.
    pub fn from_table(raw: &toml::Table) -> MbResult<Self> {
        let module_name = raw
            .get("module")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut config: ModuleConfig = toml::Value::Table(raw.clone())
            .try_into()
            .map_err(|e: toml::de::Error| MbError::InvalidConfig {
                module: module_name.clone(),
                reason: e.to_string(),
            })?;

        config.validate().map_err(|e| MbError::InvalidConfig {
            module: module_name.clone(),
            reason: e.to_string(),
        })?;

        let duplicates = duplicated_hosts(&config.hosts);
        if !duplicates.is_empty() {
            return Err(MbError::DuplicateHosts {
                module: module_name,
                hosts: duplicates,
            });
        }

        config.module = config.module.to_lowercase();
        config.timeout.get_or_insert(config.period);
        Ok(config)
    }

    /// Effective fetch timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(self.period)
    }
}

/// Hosts that appear more than once, in order of their second occurrence.
fn duplicated_hosts(hosts: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    hosts
        .iter()
        .filter(|h| !seen.insert(h.as_str()) && reported.insert(h.as_str()))
        .cloned()
        .collect()
}
