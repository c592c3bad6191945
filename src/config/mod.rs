//! Application configuration loading and validation.
//!
//! The top-level `Config` aggregates logging, statically configured module
//! blocks, the dynamically reloaded module files, light module locations and
//! the monitoring namespace. It is loaded once at startup; module files
//! matched by `config_modules.path` are re-read by the reloader.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{
    logger::LoggerConfig,
    reload::{ConfigModulesConfig, LightModulesConfig},
};
use crate::core::stats::DEFAULT_NAMESPACE;

pub mod logger;
pub mod module;
pub mod reload;

/// Timestamped console messages for the window before the tracing
/// subscriber is installed (configuration loading, logger setup failures).
#[doc(hidden)]
#[macro_export]
macro_rules! __print_level {
    ($level:expr, $color:ident, $($arg:tt)*) => {
        println!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            console::style($level).$color(),
            format_args!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => { $crate::__print_level!("INFO", green, $($arg)*) };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => { $crate::__print_level!("WARN", yellow, $($arg)*) };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => { $crate::__print_level!("ERROR", red, $($arg)*) };
}

/// Errors that can occur during configuration loading, parsing or
/// validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Generic configuration-related error with a descriptive message.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while accessing configuration files.
    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// Failure to parse a TOML configuration file.
    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    /// Validation failure after successful parsing.
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// `[monitoring]`: where the per-metricset counters are registered.
#[derive(Serialize, Deserialize, Debug, Validate, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Leading segment of every counter name.
    #[validate(length(min = 1))]
    pub namespace: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Logging subsystem configuration.
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Module blocks started at boot and kept for the whole run.
    ///
    /// Blocks stay raw: every key besides the scheduling ones belongs to
    /// the metricsets.
    pub modules: Vec<toml::Table>,

    /// Module files watched by the reloader.
    #[validate(nested)]
    pub config_modules: ConfigModulesConfig,

    #[validate(nested)]
    pub light_modules: LightModulesConfig,

    #[validate(nested)]
    pub monitoring: MonitoringConfig,
}

impl Config {
    /// Constructs a new configuration by locating and loading the config file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the configuration file cannot be found,
    /// read, parsed, or validated.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Determines the configuration file path.
    ///
    /// Priority:
    /// 1. `METRICBEE_CONFIG` environment variable
    /// 2. `/etc/metricbee/config.toml`
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var("METRICBEE_CONFIG") {
            let path = PathBuf::from(config_path);
            print_info!("Using config from METRICBEE_CONFIG: {}", path.display());
            return Ok(path);
        }

        let fallback = Path::new("/etc/metricbee/config.toml");
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(
            "No configuration file found.".to_string(),
        ))
    }

    /// Loads and validates configuration from the specified path.
    ///
    /// Relative `config_modules.path` patterns are resolved against the
    /// directory of the configuration file.
    ///
    /// # Errors
    ///
    /// Propagates IO, parsing, and validation errors as `ConfigError`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        let mut config = Self::parse(&config_str)?;

        if let Some(dir) = path.parent() {
            if Path::new(&config.config_modules.path).is_relative() {
                config.config_modules.path = dir
                    .join(&config.config_modules.path)
                    .to_string_lossy()
                    .into_owned();
            }
        }

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn parse(source: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(source).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }
}
