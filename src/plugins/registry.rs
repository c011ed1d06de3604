//! CR-021: Plugin registry: static catalog of importable modules plus installed records.
//!
//! A plugin must be both importable (present in the catalog) and installed (recorded
//! in the `installed_plugins` store) before the pipeline can load it.

use super::{local, shell, Configurer, Initializer, Orchestrator, PluginModule, PluginType};
use crate::core::error::PluginError;
use crate::core::settings::Settings;
use crate::core::store::{Document, DocumentStore};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Entry-point group every catalog module belongs to.
pub const PLUGIN_GROUP: &str = "corral.plugins";

/// Store holding installed plugin records.
pub const INSTALLED_STORE: &str = "installed_plugins";

/// Installed plugin record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    pub group: String,
    pub module: String,

    /// Capabilities installed for this plugin
    #[serde(default)]
    pub types: Vec<PluginType>,
}

impl Document for Plugin {
    fn id(&self) -> &str {
        &self.name
    }
}

/// A discovered plugin together with its imported module.
#[derive(Clone)]
pub struct LoadedPlugin {
    pub plugin: Plugin,
    pub module: Arc<dyn PluginModule>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}

impl LoadedPlugin {
    fn module_not_found(&self, plugin_type: PluginType) -> PluginError {
        PluginError::ModuleNotFound {
            plugin: self.plugin.name.clone(),
            module: plugin_type.to_string(),
        }
    }

    /// The capability, if it was installed and the module provides it.
    fn capability<C: ?Sized>(
        &self,
        plugin_type: PluginType,
        provided: Option<Arc<C>>,
    ) -> Result<Arc<C>, PluginError> {
        if !self.plugin.types.contains(&plugin_type) {
            return Err(self.module_not_found(plugin_type));
        }
        provided.ok_or_else(|| self.module_not_found(plugin_type))
    }

    pub fn orchestrator(&self) -> Result<Arc<dyn Orchestrator>, PluginError> {
        self.capability(PluginType::Orchestrator, self.module.orchestrator())
    }

    pub fn initializer(&self) -> Result<Arc<dyn Initializer>, PluginError> {
        self.capability(PluginType::Initializer, self.module.initializer())
    }

    pub fn configurer(&self) -> Result<Arc<dyn Configurer>, PluginError> {
        self.capability(PluginType::Configurer, self.module.configurer())
    }
}

/// Maps plugin names to modules and tracks which are installed.
pub struct PluginRegistry {
    catalog: IndexMap<String, Arc<dyn PluginModule>>,
    installed: DocumentStore<Plugin>,
    config_dir: PathBuf,
}

impl PluginRegistry {
    /// Registry with an empty catalog.
    pub fn new(settings: &Settings) -> Self {
        Self {
            catalog: IndexMap::new(),
            installed: DocumentStore::open(&settings.directory, INSTALLED_STORE),
            config_dir: settings.config_dir.clone(),
        }
    }

    /// Registry with the built-in `local` and `shell` modules.
    pub fn with_builtins(settings: &Settings) -> Self {
        let mut registry = Self::new(settings);
        registry.register(Arc::new(local::LocalPlugin));
        registry.register(Arc::new(shell::ShellPlugin));
        registry
    }

    /// Make a module importable under its own name.
    pub fn register(&mut self, module: Arc<dyn PluginModule>) {
        self.catalog.insert(module.name().to_string(), module);
    }

    /// Names of importable modules.
    pub fn available(&self) -> Vec<&str> {
        self.catalog.keys().map(String::as_str).collect()
    }

    /// Installed plugin records.
    pub fn ls(&self) -> Vec<Plugin> {
        self.installed.items()
    }

    /// Is a plugin installed under `name`?
    pub fn discover(&self, name: &str) -> Option<Plugin> {
        self.installed.get(name)
    }

    /// Import the module registered under `name`.
    pub fn import_plugin(&self, name: &str) -> Result<Arc<dyn PluginModule>, PluginError> {
        self.catalog
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::Load {
                name: name.to_string(),
                reason: format!("no module named '{}' in {}", name, PLUGIN_GROUP),
            })
    }

    /// Discover and import.
    pub fn load(&self, name: &str) -> Result<LoadedPlugin, PluginError> {
        let plugin = self.discover(name).ok_or_else(|| PluginError::NotInstalled {
            name: name.to_string(),
        })?;
        let module = self.import_plugin(name)?;
        Ok(LoadedPlugin { plugin, module })
    }

    /// Install the `plugin_type` capability of `name`.
    ///
    /// The first install of a plugin materializes its default config.
    pub fn install(&self, plugin_type: PluginType, name: &str) -> Result<Plugin, PluginError> {
        let module = self.import_plugin(name)?;
        if !module.provides(plugin_type) {
            return Err(PluginError::ModuleNotFound {
                plugin: name.to_string(),
                module: plugin_type.to_string(),
            });
        }

        let stored = match self.installed.get(name) {
            Some(mut plugin) => {
                if plugin.types.contains(&plugin_type) {
                    return Ok(plugin);
                }
                plugin.types.push(plugin_type);
                self.installed.update(name, &plugin).then_some(plugin)
            }
            None => {
                let plugin = Plugin {
                    name: name.to_string(),
                    group: PLUGIN_GROUP.to_string(),
                    module: format!("{}::{}", PLUGIN_GROUP, name),
                    types: vec![plugin_type],
                };
                write_default_config(&self.config_dir, name, &module.default_config())?;
                self.installed.add(&plugin).then_some(plugin)
            }
        };

        let plugin = stored.ok_or_else(|| PluginError::Load {
            name: name.to_string(),
            reason: format!("cannot record install in {}", self.installed.path().display()),
        })?;
        tracing::info!(plugin = name, plugin_type = %plugin_type, "plugin installed");
        Ok(plugin)
    }

    /// Uninstall the `plugin_type` capability of `name`; the record goes with the last one.
    pub fn remove(&self, plugin_type: PluginType, name: &str) -> Result<(), PluginError> {
        let mut plugin = self.discover(name).ok_or_else(|| PluginError::NotInstalled {
            name: name.to_string(),
        })?;
        if !plugin.types.contains(&plugin_type) {
            return Err(PluginError::ModuleNotFound {
                plugin: name.to_string(),
                module: plugin_type.to_string(),
            });
        }
        plugin.types.retain(|t| *t != plugin_type);

        let ok = if plugin.types.is_empty() {
            let removed = self.installed.remove(name);
            if removed {
                self.installed.remove_persistence_if_empty();
            }
            removed
        } else {
            self.installed.update(name, &plugin)
        };
        if !ok {
            return Err(PluginError::Load {
                name: name.to_string(),
                reason: format!("cannot record removal in {}", self.installed.path().display()),
            });
        }
        tracing::info!(plugin = name, plugin_type = %plugin_type, "plugin removed");
        Ok(())
    }
}

/// Default config path for a plugin.
pub fn config_path(config_dir: &Path, name: &str) -> PathBuf {
    config_dir.join(format!("{}.yaml", name))
}

fn write_default_config(
    config_dir: &Path,
    name: &str,
    config: &serde_json::Value,
) -> Result<(), PluginError> {
    if config.is_null() {
        return Ok(());
    }
    let path = config_path(config_dir, name);
    if path.exists() {
        return Ok(());
    }
    let fail = |reason: String| PluginError::Load {
        name: name.to_string(),
        reason,
    };
    std::fs::create_dir_all(config_dir)
        .map_err(|e| fail(format!("cannot create {}: {}", config_dir.display(), e)))?;
    let yaml = serde_yaml_ng::to_string(config).map_err(|e| fail(e.to_string()))?;
    std::fs::write(&path, yaml).map_err(|e| fail(format!("cannot write {}: {}", path.display(), e)))
}
