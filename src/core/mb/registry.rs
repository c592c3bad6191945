//! Catalog of module and metricset factories.
//!
//! The registry is built once at startup (from the built-in plugins and any
//! plugin crates linked into the binary) and then shared read-only with the
//! scheduler. Lookups that miss the in-memory catalog fall back to an optional
//! secondary source such as the on-disk light modules.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use tracing::debug;

use super::{
    error::{FetchError, MbError, MbResult},
    module::{BaseMetricSet, BaseModule, HostData, Module},
    traits::FetchStyle,
};

/// Builds a custom module out of the base module.
pub type ModuleFactory =
    Arc<dyn Fn(BaseModule) -> Result<Arc<dyn Module>, FetchError> + Send + Sync>;

/// Builds a metricset for one host.
pub type MetricSetFactory =
    Arc<dyn Fn(&BaseMetricSet) -> Result<FetchStyle, FetchError> + Send + Sync>;

/// Turns a raw host string into structured connection data.
pub type HostParser = Arc<dyn Fn(&dyn Module, &str) -> Result<HostData, FetchError> + Send + Sync>;

/// Optional metadata attached to a metricset registration.
#[derive(Clone, Default)]
pub struct MetricSetOptions {
    /// Run this metricset when a module block lists no metricsets.
    pub is_default: bool,
    pub host_parser: Option<HostParser>,
    /// Overrides the `module.metricset` event namespace.
    pub namespace: Option<String>,
}

impl MetricSetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_metricset(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn with_host_parser<F>(mut self, parser: F) -> Self
    where
        F: Fn(&dyn Module, &str) -> Result<HostData, FetchError> + Send + Sync + 'static,
    {
        self.host_parser = Some(Arc::new(parser));
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl fmt::Debug for MetricSetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSetOptions")
            .field("is_default", &self.is_default)
            .field("host_parser", &self.host_parser.is_some())
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// A registered metricset factory and its metadata.
#[derive(Clone)]
pub struct MetricSetRegistration {
    pub name: String,
    pub factory: MetricSetFactory,
    pub options: MetricSetOptions,
}

impl fmt::Debug for MetricSetRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSetRegistration")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Catalog consulted when a module or metricset is not registered in memory.
pub trait SecondarySource: Send + Sync + fmt::Debug {
    fn has_module(&self, module: &str) -> bool;

    fn has_metricset(&self, module: &str, metricset: &str) -> bool;

    fn modules(&self) -> MbResult<Vec<String>>;

    fn metricsets(&self, module: &str) -> MbResult<Vec<String>>;

    fn default_metricsets(&self, module: &str) -> MbResult<Vec<String>>;

    /// Builds a registration, possibly delegating to metricsets of `registry`.
    fn registration(
        &self,
        registry: &Registry,
        module: &str,
        metricset: &str,
    ) -> MbResult<MetricSetRegistration>;
}

/// A metricset linked into the binary, collected by [`Registry::with_builtins`].
pub struct BuiltinMetricSet {
    pub module: &'static str,
    pub name: &'static str,
    pub factory: fn(&BaseMetricSet) -> Result<FetchStyle, FetchError>,
    pub is_default: bool,
}

inventory::collect!(BuiltinMetricSet);

/// Registers a built-in metricset at link time.
///
/// ```ignore
/// register_metricset!("self", "memory", MemoryMetricSet::build, default);
/// ```
#[macro_export]
macro_rules! register_metricset {
    ($module:expr, $name:expr, $factory:expr) => {
        inventory::submit! {
            $crate::core::mb::registry::BuiltinMetricSet {
                module: $module,
                name: $name,
                factory: $factory,
                is_default: false,
            }
        }
    };
    ($module:expr, $name:expr, $factory:expr, default) => {
        inventory::submit! {
            $crate::core::mb::registry::BuiltinMetricSet {
                module: $module,
                name: $name,
                factory: $factory,
                is_default: true,
            }
        }
    };
}

/// Module and metricset catalog.
#[derive(Default)]
pub struct Registry {
    modules: HashMap<String, ModuleFactory>,
    metricsets: HashMap<String, HashMap<String, MetricSetRegistration>>,
    secondary: Option<Arc<dyn SecondarySource>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every metricset submitted with
    /// [`register_metricset!`].
    ///
    /// # Errors
    ///
    /// Fails if two built-ins claim the same key.
    pub fn with_builtins() -> MbResult<Self> {
        let mut registry = Self::new();
        for builtin in inventory::iter::<BuiltinMetricSet> {
            let mut options = MetricSetOptions::new();
            options.is_default = builtin.is_default;
            registry.add_metricset_with(builtin.module, builtin.name, builtin.factory, options)?;
        }
        Ok(registry)
    }

    /// Attaches the catalog consulted on lookup misses.
    pub fn set_secondary_source(&mut self, source: Arc<dyn SecondarySource>) {
        self.secondary = Some(source);
    }

    /// Registers a custom module factory.
    ///
    /// # Errors
    ///
    /// Fails on an empty name or if the module already has a factory.
    pub fn add_module<F>(&mut self, name: &str, factory: F) -> MbResult<()>
    where
        F: Fn(BaseModule) -> Result<Arc<dyn Module>, FetchError> + Send + Sync + 'static,
    {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return Err(MbError::EmptyModuleName);
        }
        if self.modules.contains_key(&name) {
            return Err(MbError::ModuleAlreadyRegistered(name));
        }

        debug!(module = %name, "Module registered");
        self.modules.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Registers a metricset factory with default options.
    pub fn add_metricset<F>(&mut self, module: &str, name: &str, factory: F) -> MbResult<()>
    where
        F: Fn(&BaseMetricSet) -> Result<FetchStyle, FetchError> + Send + Sync + 'static,
    {
        self.add_metricset_with(module, name, factory, MetricSetOptions::default())
    }

    /// Registers a metricset factory.
    ///
    /// # Errors
    ///
    /// Fails on empty names or if the `(module, name)` key is already taken.
    pub fn add_metricset_with<F>(
        &mut self,
        module: &str,
        name: &str,
        factory: F,
        options: MetricSetOptions,
    ) -> MbResult<()>
    where
        F: Fn(&BaseMetricSet) -> Result<FetchStyle, FetchError> + Send + Sync + 'static,
    {
        let module = module.trim().to_lowercase();
        let name = name.trim().to_lowercase();
        if module.is_empty() {
            return Err(MbError::EmptyModuleName);
        }
        if name.is_empty() {
            return Err(MbError::EmptyMetricSetName { module });
        }

        let sets = self.metricsets.entry(module.clone()).or_default();
        if sets.contains_key(&name) {
            return Err(MbError::MetricSetAlreadyRegistered {
                module,
                metricset: name,
            });
        }

        debug!(module = %module, metricset = %name, is_default = options.is_default, "Metricset registered");
        sets.insert(
            name.clone(),
            MetricSetRegistration {
                name,
                factory: Arc::new(factory),
                options,
            },
        );
        Ok(())
    }

    /// Custom factory for `module`, or `None` when the base module should be used.
    pub fn module_factory(&self, module: &str) -> Option<ModuleFactory> {
        self.modules.get(&module.to_lowercase()).cloned()
    }

    /// Resolves a metricset, consulting the secondary source on a miss.
    ///
    /// # Errors
    ///
    /// `ModuleNotFound` when nothing is known about the module,
    /// `MetricSetNotFound` when only the metricset is missing.
    pub fn metricset_registration(
        &self,
        module: &str,
        name: &str,
    ) -> MbResult<MetricSetRegistration> {
        let module = module.to_lowercase();
        let name = name.to_lowercase();

        if let Some(registration) = self.metricsets.get(&module).and_then(|s| s.get(&name)) {
            return Ok(registration.clone());
        }

        if let Some(source) = &self.secondary {
            if source.has_metricset(&module, &name) {
                return source.registration(self, &module, &name);
            }
        }

        if self.has_module(&module) {
            Err(MbError::MetricSetNotFound {
                module,
                metricset: name,
            })
        } else {
            Err(MbError::ModuleNotFound(module))
        }
    }

    /// Names of the metricsets run when a module block lists none, sorted.
    ///
    /// The in-memory catalog wins; the secondary source is only consulted
    /// for modules that have no metricsets registered in memory.
    pub fn default_metricsets(&self, module: &str) -> MbResult<Vec<String>> {
        let module = module.to_lowercase();

        if let Some(sets) = self.metricsets.get(&module) {
            let mut defaults: Vec<String> = sets
                .values()
                .filter(|r| r.options.is_default)
                .map(|r| r.name.clone())
                .collect();
            defaults.sort();
            return Ok(defaults);
        }

        match &self.secondary {
            Some(source) if source.has_module(&module) => {
                let mut defaults = source.default_metricsets(&module)?;
                defaults.sort();
                Ok(defaults)
            }
            _ if self.modules.contains_key(&module) => Ok(Vec::new()),
            _ => Err(MbError::ModuleNotFound(module)),
        }
    }

    /// Whether anything is known about `module`.
    pub fn has_module(&self, module: &str) -> bool {
        let module = module.to_lowercase();
        self.modules.contains_key(&module)
            || self.metricsets.contains_key(&module)
            || self
                .secondary
                .as_ref()
                .is_some_and(|s| s.has_module(&module))
    }

    /// All known module names, sorted.
    pub fn modules(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self
            .modules
            .keys()
            .chain(self.metricsets.keys())
            .cloned()
            .collect();

        if let Some(source) = &self.secondary {
            match source.modules() {
                Ok(list) => names.extend(list),
                Err(e) => debug!("Failed to list secondary modules: {}", e),
            }
        }
        names.into_iter().collect()
    }

    /// All metricset names of `module`, sorted.
    pub fn metricsets(&self, module: &str) -> Vec<String> {
        let module = module.to_lowercase();
        let mut names: BTreeSet<String> = self
            .metricsets
            .get(&module)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();

        if let Some(source) = &self.secondary {
            if source.has_module(&module) {
                match source.metricsets(&module) {
                    Ok(list) => names.extend(list),
                    Err(e) => debug!(module = %module, "Failed to list secondary metricsets: {}", e),
                }
            }
        }
        names.into_iter().collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field(
                "metricsets",
                &self
                    .metricsets
                    .iter()
                    .map(|(m, s)| (m, s.keys().collect::<Vec<_>>()))
                    .collect::<Vec<_>>(),
            )
            .field("secondary", &self.secondary)
            .finish()
    }
}
