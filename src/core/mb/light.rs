//! File-backed "light" modules.
//!
//! A light module is a directory describing new metricsets in terms of
//! metricsets already registered in memory, plus default settings:
//!
//! ```text
//! <root>/<module>/module.toml              metricsets = ["collector"]
//! <root>/<module>/<metricset>/manifest.toml
//!     default = true
//!     namespace = "custom.stats"            # optional
//!     [input]
//!     module = "prometheus"
//!     metricset = "collector"
//!     [input.defaults]
//!     metrics_path = "/_status/vars"
//! ```
//!
//! Descriptors are read lazily, on first lookup, and cached.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    error::{MbError, MbResult},
    module::BaseMetricSet,
    registry::{MetricSetFactory, MetricSetOptions, MetricSetRegistration, Registry, SecondarySource},
};

const MODULE_FILE: &str = "module.toml";
const MANIFEST_FILE: &str = "manifest.toml";

#[derive(Debug, Clone, Deserialize)]
struct ModuleDescriptor {
    #[serde(default)]
    metricsets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    #[serde(default)]
    default: bool,
    namespace: Option<String>,
    input: ManifestInput,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestInput {
    module: String,
    metricset: String,
    #[serde(default)]
    defaults: toml::Table,
}

#[derive(Debug)]
struct LightModule {
    dir: PathBuf,
    metricsets: Vec<String>,
}

/// Secondary registry source reading light module descriptors from disk.
#[derive(Debug)]
pub struct LightModules {
    roots: Vec<PathBuf>,
    modules: Mutex<HashMap<String, Option<Arc<LightModule>>>>,
    manifests: Mutex<HashMap<(String, String), Arc<Manifest>>>,
}

impl LightModules {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            modules: Mutex::new(HashMap::new()),
            manifests: Mutex::new(HashMap::new()),
        }
    }

    fn module(&self, name: &str) -> MbResult<Option<Arc<LightModule>>> {
        let mut cache = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.get(name) {
            return Ok(cached.clone());
        }

        let found = self.find_module(name)?.map(Arc::new);
        cache.insert(name.to_string(), found.clone());
        Ok(found)
    }

    fn find_module(&self, name: &str) -> MbResult<Option<LightModule>> {
        for root in &self.roots {
            let dir = root.join(name);
            let descriptor_path = dir.join(MODULE_FILE);
            if !descriptor_path.is_file() {
                continue;
            }

            let descriptor: ModuleDescriptor = read_toml(&descriptor_path)?;
            debug!(module = %name, path = %dir.display(), "Light module found");
            return Ok(Some(LightModule {
                dir,
                metricsets: descriptor
                    .metricsets
                    .iter()
                    .map(|m| m.to_lowercase())
                    .collect(),
            }));
        }
        Ok(None)
    }

    fn manifest(&self, module: &str, metricset: &str) -> MbResult<Arc<Manifest>> {
        let key = (module.to_string(), metricset.to_string());
        {
            let cache = self.manifests.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(manifest) = cache.get(&key) {
                return Ok(Arc::clone(manifest));
            }
        }

        let light = self
            .module(module)?
            .ok_or_else(|| MbError::ModuleNotFound(module.to_string()))?;
        if !light.metricsets.iter().any(|m| m == metricset) {
            return Err(MbError::MetricSetNotFound {
                module: module.to_string(),
                metricset: metricset.to_string(),
            });
        }

        let manifest: Arc<Manifest> =
            Arc::new(read_toml(&light.dir.join(metricset).join(MANIFEST_FILE))?);
        self.manifests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&manifest));
        Ok(manifest)
    }

    fn lookup_or_warn(&self, module: &str) -> Option<Arc<LightModule>> {
        match self.module(module) {
            Ok(found) => found,
            Err(e) => {
                warn!(module = %module, "Ignoring unreadable light module: {}", e);
                None
            }
        }
    }
}

impl SecondarySource for LightModules {
    fn has_module(&self, module: &str) -> bool {
        self.lookup_or_warn(module).is_some()
    }

    fn has_metricset(&self, module: &str, metricset: &str) -> bool {
        self.lookup_or_warn(module)
            .is_some_and(|m| m.metricsets.iter().any(|name| name == metricset))
    }

    fn modules(&self) -> MbResult<Vec<String>> {
        let mut names = Vec::new();
        for root in &self.roots {
            let entries = match fs::read_dir(root) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(path = %root.display(), "Skipping light modules root: {}", e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                if entry.path().join(MODULE_FILE).is_file() {
                    names.push(entry.file_name().to_string_lossy().to_lowercase());
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn metricsets(&self, module: &str) -> MbResult<Vec<String>> {
        Ok(self
            .module(module)?
            .map(|m| m.metricsets.clone())
            .unwrap_or_default())
    }

    fn default_metricsets(&self, module: &str) -> MbResult<Vec<String>> {
        let mut defaults = Vec::new();
        for name in self.metricsets(module)? {
            if self.manifest(module, &name)?.default {
                defaults.push(name);
            }
        }
        Ok(defaults)
    }

    fn registration(
        &self,
        registry: &Registry,
        module: &str,
        metricset: &str,
    ) -> MbResult<MetricSetRegistration> {
        let manifest = self.manifest(module, metricset)?;
        let input_module = manifest.input.module.to_lowercase();
        let input_metricset = manifest.input.metricset.to_lowercase();

        if input_module == module && input_metricset == metricset {
            return Err(MbError::LightModule {
                path: self.roots.first().cloned().unwrap_or_default(),
                reason: format!("metricset '{module}/{metricset}' uses itself as input"),
            });
        }

        let input = registry.metricset_registration(&input_module, &input_metricset)?;
        let defaults = manifest.input.defaults.clone();
        let input_factory = input.factory;
        let factory: MetricSetFactory = Arc::new(move |base: &BaseMetricSet| {
            let merged = with_defaults(&defaults, base.raw_config());
            input_factory(&base.clone().with_raw_config(merged))
        });

        Ok(MetricSetRegistration {
            name: metricset.to_string(),
            factory,
            options: MetricSetOptions {
                is_default: manifest.default,
                host_parser: input.options.host_parser,
                namespace: manifest.namespace.clone().or(input.options.namespace),
            },
        })
    }
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> MbResult<T> {
    let content = fs::read_to_string(path).map_err(|e| MbError::LightModule {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    toml::from_str(&content).map_err(|e| MbError::LightModule {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// `config` layered over `defaults`; nested tables are merged key by key.
fn with_defaults(defaults: &toml::Table, config: &toml::Table) -> toml::Table {
    let mut merged = defaults.clone();
    for (key, value) in config {
        let nested = match (merged.get(key), value) {
            (Some(toml::Value::Table(base)), toml::Value::Table(overlay)) => {
                toml::Value::Table(with_defaults(base, overlay))
            }
            _ => value.clone(),
        };
        merged.insert(key.clone(), nested);
    }
    merged
}
