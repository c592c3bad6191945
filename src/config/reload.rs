//! Settings of the dynamically loaded module configuration files.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// `[config_modules]`: a glob of module configuration files and how often
/// to check them for changes.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConfigModulesConfig {
    /// Glob pattern, e.g. `/etc/metricbee/modules.d/*.toml`. Files renamed
    /// to `*.toml.disabled` no longer match.
    #[validate(length(min = 1))]
    pub path: String,

    #[validate(nested)]
    pub reload: ReloadConfig,
}

impl Default for ConfigModulesConfig {
    fn default() -> Self {
        Self {
            path: "modules.d/*.toml".to_string(),
            reload: ReloadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_reload_period"))]
pub struct ReloadConfig {
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period: Duration::from_secs(10),
        }
    }
}

fn validate_reload_period(config: &ReloadConfig) -> Result<(), ValidationError> {
    if config.enabled && config.period.is_zero() {
        let mut err = ValidationError::new("invalid_reload_period");
        err.message = Some("Reload period must be greater than zero".into());
        return Err(err);
    }
    Ok(())
}

/// `[light_modules]`: directories holding light module descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LightModulesConfig {
    pub path: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: ConfigModulesConfig = toml::from_str("").unwrap();
        assert_eq!(config.path, "modules.d/*.toml");
        assert!(!config.reload.enabled);
        assert_eq!(config.reload.period, Duration::from_secs(10));
    }

    #[test]
    fn test_humantime_period() {
        let config: ConfigModulesConfig = toml::from_str(
            r#"
            path = "/etc/metricbee/modules.d/*.toml"
            [reload]
            enabled = true
            period = "250ms"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.reload.period, Duration::from_millis(250));
    }

    #[test]
    fn test_zero_period_rejected_when_enabled() {
        let config: ConfigModulesConfig = toml::from_str(
            r#"
            [reload]
            enabled = true
            period = "0s"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        let disabled = ReloadConfig {
            enabled: false,
            period: Duration::ZERO,
        };
        assert!(disabled.validate().is_ok());
    }
}
