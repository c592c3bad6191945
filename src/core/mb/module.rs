//! Modules, metricsets and their construction from configuration.

use std::{fmt, sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    error::{FetchError, MbError, MbResult},
    registry::{MetricSetRegistration, Registry},
    traits::FetchStyle,
};
use crate::config::module::ModuleConfig;

/// A configured module instance shared by all of its metricsets.
pub trait Module: Send + Sync + fmt::Debug + 'static {
    fn name(&self) -> &str;

    fn config(&self) -> &ModuleConfig;

    /// The raw configuration block, including metricset-specific keys.
    fn raw_config(&self) -> &toml::Table;
}

/// Module used when no custom module factory is registered.
#[derive(Debug, Clone)]
pub struct BaseModule {
    name: String,
    config: ModuleConfig,
    raw: toml::Table,
}

impl BaseModule {
    pub fn new(config: ModuleConfig, raw: toml::Table) -> Self {
        Self {
            name: config.module.clone(),
            config,
            raw,
        }
    }
}

impl Module for BaseModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ModuleConfig {
        &self.config
    }

    fn raw_config(&self) -> &toml::Table {
        &self.raw
    }
}

/// Structured connection data produced by a host parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostData {
    /// Full URI used to connect.
    pub uri: String,
    /// URI with credentials stripped, safe to log and publish.
    pub sanitized_uri: String,
    /// `host[:port]` part of the URI.
    pub host: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Everything a metricset factory needs to build a metricset.
#[derive(Debug, Clone)]
pub struct BaseMetricSet {
    name: String,
    module: Arc<dyn Module>,
    host: String,
    host_data: Option<HostData>,
    namespace: Option<String>,
    raw: toml::Table,
}

impl BaseMetricSet {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    /// Host as written in the configuration (empty for host-less modules).
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn host_data(&self) -> Option<&HostData> {
        self.host_data.as_ref()
    }

    /// Registration namespace override, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn period(&self) -> Duration {
        self.module.config().period
    }

    pub fn timeout(&self) -> Duration {
        self.module.config().timeout()
    }

    /// Raw configuration visible to this metricset.
    pub fn raw_config(&self) -> &toml::Table {
        &self.raw
    }

    /// Unpacks metricset-specific settings out of the configuration block.
    pub fn config<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        Ok(toml::Value::Table(self.raw.clone()).try_into()?)
    }

    /// Replaces the configuration seen by the factory.
    pub(crate) fn with_raw_config(mut self, raw: toml::Table) -> Self {
        self.raw = raw;
        self
    }

    /// Address used in events: the sanitized URI when a host parser ran.
    pub fn display_host(&self) -> &str {
        match &self.host_data {
            Some(data) if !data.sanitized_uri.is_empty() => &data.sanitized_uri,
            _ => &self.host,
        }
    }
}

/// A built metricset: its base data plus its single fetch style.
#[derive(Debug)]
pub struct MetricSet {
    pub base: BaseMetricSet,
    pub style: FetchStyle,
}

impl MetricSet {
    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn host(&self) -> &str {
        self.base.host()
    }
}

/// Result of building a module: the module, every metricset that could be
/// built, and the errors of the ones that could not.
#[derive(Debug)]
pub struct NewModule {
    pub module: Arc<dyn Module>,
    pub metricsets: Vec<MetricSet>,
    pub errors: Vec<MbError>,
}

impl NewModule {
    /// Fails if any metricset failed to build.
    pub fn into_complete(self) -> MbResult<(Arc<dyn Module>, Vec<MetricSet>)> {
        match MbError::from_vec(self.errors) {
            Some(err) => Err(err),
            None => Ok((self.module, self.metricsets)),
        }
    }
}

/// Builds a module and one metricset per configured metricset and host.
///
/// # Errors
///
/// Fails outright when the block itself is unusable (bad config, duplicate
/// hosts, unknown module, failing module factory, no metricsets to run).
/// Failures of individual metricsets are collected in `NewModule::errors`.
pub fn new_module(raw: &toml::Table, registry: &Registry) -> MbResult<NewModule> {
    let config = ModuleConfig::from_table(raw)?;
    let base = BaseModule::new(config, raw.clone());
    let module_name = base.name().to_string();

    let module: Arc<dyn Module> = match registry.module_factory(&module_name) {
        Some(factory) => factory(base).map_err(|source| MbError::Factory {
            module: module_name.clone(),
            metricset: String::new(),
            source,
        })?,
        None => Arc::new(base),
    };

    let names = metricset_names(module.config(), registry)?;
    let hosts = match module.config().hosts.as_slice() {
        [] => vec![String::new()],
        hosts => hosts.to_vec(),
    };

    let mut metricsets = Vec::with_capacity(names.len() * hosts.len());
    let mut errors = Vec::new();

    for name in &names {
        let registration = match registry.metricset_registration(&module_name, name) {
            Ok(registration) => registration,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };

        for host in &hosts {
            match build_metricset(&module, &registration, host) {
                Ok(metricset) => metricsets.push(metricset),
                Err(e) => errors.push(e),
            }
        }
    }

    debug!(
        module = %module_name,
        built = metricsets.len(),
        failed = errors.len(),
        "Module constructed"
    );

    Ok(NewModule {
        module,
        metricsets,
        errors,
    })
}

fn metricset_names(config: &ModuleConfig, registry: &Registry) -> MbResult<Vec<String>> {
    if !config.metricsets.is_empty() {
        return Ok(config.metricsets.iter().map(|n| n.to_lowercase()).collect());
    }

    let defaults = registry.default_metricsets(&config.module)?;
    if defaults.is_empty() {
        return Err(MbError::NoDefaultMetricSets(config.module.clone()));
    }
    Ok(defaults)
}

fn build_metricset(
    module: &Arc<dyn Module>,
    registration: &MetricSetRegistration,
    host: &str,
) -> MbResult<MetricSet> {
    let host_data = match (&registration.options.host_parser, host.is_empty()) {
        (Some(parser), false) => {
            Some(
                parser(module.as_ref(), host).map_err(|e| MbError::HostParse {
                    module: module.name().to_string(),
                    metricset: registration.name.clone(),
                    host: host.to_string(),
                    reason: e.to_string(),
                })?,
            )
        }
        _ => None,
    };

    let base = BaseMetricSet {
        name: registration.name.clone(),
        module: Arc::clone(module),
        host: host.to_string(),
        host_data,
        namespace: module
            .config()
            .namespace
            .clone()
            .or_else(|| registration.options.namespace.clone()),
        raw: module.raw_config().clone(),
    };

    let style = (registration.factory)(&base).map_err(|source| MbError::Factory {
        module: module.name().to_string(),
        metricset: registration.name.clone(),
        source,
    })?;

    Ok(MetricSet { base, style })
}

#[cfg(test)]
pub(crate) mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::core::mb::{
        event::Event,
        registry::MetricSetOptions,
        traits::{EventFetcher, EventsFetcher},
    };

    pub(crate) struct Constant(pub i64);

    #[async_trait::async_trait]
    impl EventFetcher for Constant {
        async fn fetch(&self) -> Result<Event, FetchError> {
            let mut fields = serde_json::Map::new();
            fields.insert("value".into(), self.0.into());
            Ok(Event::from(fields))
        }
    }

    struct Nothing;

    #[async_trait::async_trait]
    impl EventsFetcher for Nothing {
        async fn fetch(&self) -> (Vec<Event>, Option<FetchError>) {
            (Vec::new(), None)
        }
    }

    pub(crate) fn test_registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .add_metricset_with(
                "test",
                "a",
                |_: &BaseMetricSet| Ok(FetchStyle::event(Constant(1))),
                MetricSetOptions::new().default_metricset(),
            )
            .unwrap();
        registry
            .add_metricset_with(
                "test",
                "b",
                |_: &BaseMetricSet| Ok(FetchStyle::events(Nothing)),
                MetricSetOptions::new().default_metricset(),
            )
            .unwrap();
        registry
            .add_metricset("test", "c", |_: &BaseMetricSet| {
                Ok(FetchStyle::event(Constant(3)))
            })
            .unwrap();
        registry
            .add_metricset("test", "broken", |_: &BaseMetricSet| {
                Err("cannot connect".into())
            })
            .unwrap();
        registry
    }

    fn table(src: &str) -> toml::Table {
        src.parse().unwrap()
    }

    #[test]
    fn test_metricsets_times_hosts() {
        let registry = test_registry();
        let built = new_module(
            &table(
                r#"
                module = "test"
                metricsets = ["a", "C"]
                hosts = ["h1", "h2", "h3"]
                "#,
            ),
            &registry,
        )
        .unwrap();

        assert!(built.errors.is_empty());
        assert_eq!(built.metricsets.len(), 2 * 3);
        let pairs: Vec<_> = built
            .metricsets
            .iter()
            .map(|m| (m.name().to_string(), m.host().to_string()))
            .collect();
        assert_eq!(pairs[0], ("a".to_string(), "h1".to_string()));
        assert_eq!(pairs[3], ("c".to_string(), "h1".to_string()));
    }

    #[test]
    fn test_default_metricsets_used_when_unspecified() {
        let registry = test_registry();
        let built = new_module(
            &table(
                r#"
                module = "test"
                hosts = ["h1", "h2"]
                "#,
            ),
            &registry,
        )
        .unwrap();

        assert_eq!(built.metricsets.len(), 2 * 2);
        let mut names: Vec<_> = built.metricsets.iter().map(|m| m.name()).collect();
        names.dedup();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_hostless_module_builds_one_per_metricset() {
        let registry = test_registry();
        let built = new_module(&table(r#"module = "test""#), &registry).unwrap();
        assert_eq!(built.metricsets.len(), 2);
        assert!(built.metricsets.iter().all(|m| m.host().is_empty()));
    }

    #[test]
    fn test_partial_failures_are_collected() {
        let registry = test_registry();
        let built = new_module(
            &table(
                r#"
                module = "test"
                metricsets = ["a", "missing", "broken"]
                hosts = ["h1", "h2"]
                "#,
            ),
            &registry,
        )
        .unwrap();

        assert_eq!(built.metricsets.len(), 2);
        assert_eq!(built.errors.len(), 1 + 2);
        assert!(built
            .errors
            .iter()
            .any(|e| matches!(e, MbError::MetricSetNotFound { metricset, .. } if metricset == "missing")));
        assert!(built
            .errors
            .iter()
            .any(|e| matches!(e, MbError::Factory { metricset, .. } if metricset == "broken")));

        let err = built.into_complete().unwrap_err();
        assert!(matches!(err, MbError::Multiple(ref errs) if errs.len() == 3));
    }

    #[test]
    fn test_duplicate_hosts_fail_construction() {
        let registry = test_registry();
        let err = new_module(
            &table(
                r#"
                module = "test"
                hosts = ["h1", "h1"]
                "#,
            ),
            &registry,
        )
        .unwrap_err();
        assert!(matches!(err, MbError::DuplicateHosts { .. }));
    }

    #[test]
    fn test_unknown_module() {
        let registry = test_registry();
        let err = new_module(&table(r#"module = "nope""#), &registry).unwrap_err();
        assert!(matches!(err, MbError::ModuleNotFound(name) if name == "nope"));
    }

    #[test]
    fn test_block_namespace_overrides_registration() {
        let mut registry = test_registry();
        registry
            .add_metricset_with(
                "test",
                "named",
                |_: &BaseMetricSet| Ok(FetchStyle::event(Constant(0))),
                MetricSetOptions::new().with_namespace("test.registered"),
            )
            .unwrap();

        let built = new_module(
            &table(
                r#"
                module = "test"
                metricsets = ["named"]
                "#,
            ),
            &registry,
        )
        .unwrap();
        assert_eq!(built.metricsets[0].base.namespace(), Some("test.registered"));

        let built = new_module(
            &table(
                r#"
                module = "test"
                metricsets = ["named", "a"]
                namespace = "test.block"
                "#,
            ),
            &registry,
        )
        .unwrap();
        assert!(built
            .metricsets
            .iter()
            .all(|m| m.base.namespace() == Some("test.block")));
    }

    #[test]
    fn test_host_parser_and_custom_module_factory() {
        #[derive(Debug)]
        struct Tagged(BaseModule);

        impl Module for Tagged {
            fn name(&self) -> &str {
                self.0.name()
            }
            fn config(&self) -> &ModuleConfig {
                self.0.config()
            }
            fn raw_config(&self) -> &toml::Table {
                self.0.raw_config()
            }
        }

        #[derive(Deserialize)]
        struct Settings {
            database: String,
        }

        let mut registry = Registry::new();
        registry
            .add_module("db", |base: BaseModule| {
                Ok(Arc::new(Tagged(base)) as Arc<dyn Module>)
            })
            .unwrap();
        registry
            .add_metricset_with(
                "db",
                "status",
                |base: &BaseMetricSet| {
                    let settings: Settings = base.config()?;
                    assert_eq!(settings.database, "main");
                    assert_eq!(base.host_data().unwrap().user.as_deref(), Some("root"));
                    Ok(FetchStyle::event(Constant(0)))
                },
                MetricSetOptions::new().with_host_parser(|_: &dyn Module, host: &str| {
                    let (user, rest) = host.split_once('@').ok_or("missing user")?;
                    Ok(HostData {
                        uri: format!("tcp://{host}"),
                        sanitized_uri: format!("tcp://{rest}"),
                        host: rest.to_string(),
                        user: Some(user.to_string()),
                        password: None,
                    })
                }),
            )
            .unwrap();

        let built = new_module(
            &table(
                r#"
                module = "db"
                metricsets = ["status"]
                hosts = ["root@db1:5432", "nouser"]
                database = "main"
                "#,
            ),
            &registry,
        )
        .unwrap();

        assert!(format!("{:?}", built.module).contains("Tagged"));
        assert_eq!(built.metricsets.len(), 1);
        assert_eq!(built.metricsets[0].base.display_host(), "tcp://db1:5432");
        assert!(matches!(
            &built.errors[..],
            [MbError::HostParse { host, .. }] if host == "nouser"
        ));
    }
}
