use std::path::PathBuf;

use thiserror::Error;

/// Error produced by a plugin's fetch implementation.
///
/// Fetchers live outside the scheduler and may fail for any reason (vendor
/// call failure, malformed response), so the scheduler only needs something
/// displayable that can cross task boundaries.
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while registering plugins or building modules and metricsets.
#[derive(Error, Debug)]
pub enum MbError {
    /// A module was registered (or looked up) with an empty name.
    #[error("Module name must not be empty")]
    EmptyModuleName,

    /// A metricset was registered with an empty name.
    #[error("Metricset name must not be empty for module '{module}'")]
    EmptyMetricSetName { module: String },

    /// A module factory is already registered under this name.
    #[error("Module '{0}' is already registered")]
    ModuleAlreadyRegistered(String),

    /// A metricset factory is already registered under this key.
    #[error("Metricset '{module}/{metricset}' is already registered")]
    MetricSetAlreadyRegistered { module: String, metricset: String },

    /// Neither the registry nor the light modules know this module.
    #[error("Module '{0}' not found")]
    ModuleNotFound(String),

    /// The module exists but has no metricset with this name.
    #[error("Metricset '{metricset}' not found in module '{module}'")]
    MetricSetNotFound { module: String, metricset: String },

    /// No metricsets were configured and the module declares no defaults.
    #[error("No metricsets configured for module '{0}' and it has no default metricsets")]
    NoDefaultMetricSets(String),

    /// The module configuration could not be unpacked or failed validation.
    #[error("Invalid configuration for module '{module}': {reason}")]
    InvalidConfig { module: String, reason: String },

    /// The same host appears more than once in a module configuration.
    #[error("Module '{module}' has duplicated hosts: {hosts:?}")]
    DuplicateHosts { module: String, hosts: Vec<String> },

    /// The registered host parser rejected a host string.
    #[error("Failed to parse host '{host}' for metricset '{module}/{metricset}': {reason}")]
    HostParse {
        module: String,
        metricset: String,
        host: String,
        reason: String,
    },

    /// A module or metricset factory returned an error.
    #[error("Factory for '{module}/{metricset}' failed: {source}")]
    Factory {
        module: String,
        metricset: String,
        #[source]
        source: FetchError,
    },

    /// A light module descriptor could not be read or is malformed.
    #[error("Invalid light module descriptor {path}: {reason}")]
    LightModule { path: PathBuf, reason: String },

    /// Several independent failures collected while building one module.
    #[error("{} error(s) occurred: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<MbError>),
}

fn join_errors(errors: &[MbError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl MbError {
    /// Collapses a list of errors: `None` when empty, the error itself when
    /// there is exactly one, `Multiple` otherwise.
    pub fn from_vec(mut errors: Vec<MbError>) -> Option<MbError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(MbError::Multiple(errors)),
        }
    }
}

/// Result alias used by the registry and the module builders.
pub type MbResult<T> = std::result::Result<T, MbError>;
