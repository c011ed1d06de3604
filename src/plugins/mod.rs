//! CR-020: Plugin contracts for the orchestrator, initializer and configurer capabilities.
//!
//! A plugin module exposes up to three capability objects. Every action returns a
//! future, and every action reports `(success, response)` through [`Outcome`].
//! Failing to find a plugin, module or function is a [`PluginError`], distinct from
//! a plugin that ran and reported failure.

pub mod local;
pub mod registry;
pub mod shell;
#[cfg(test)]
pub mod testing;

use crate::core::error::PluginError;
use crate::core::types::Kwargs;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use registry::{LoadedPlugin, Plugin, PluginRegistry};

/// Capability a plugin module can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    Orchestrator,
    Initializer,
    Configurer,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Initializer => "initializer",
            Self::Configurer => "configurer",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PluginType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrator" => Ok(Self::Orchestrator),
            "initializer" => Ok(Self::Initializer),
            "configurer" => Ok(Self::Configurer),
            other => Err(format!(
                "unknown plugin type '{}' (expected orchestrator, initializer or configurer)",
                other
            )),
        }
    }
}

/// Client handle produced by `new_client` and handed back to every action.
#[derive(Debug, Clone, PartialEq)]
pub struct Driver {
    pub plugin: String,
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl Driver {
    pub fn new(plugin: &str, name: &str, args: &[Value], kwargs: &Kwargs) -> Self {
        Self {
            plugin: plugin.to_string(),
            name: name.to_string(),
            args: args.to_vec(),
            kwargs: kwargs.clone(),
        }
    }

    /// String keyword argument given at client creation.
    pub fn kwarg_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(Value::as_str)
    }
}

/// Result of a plugin action: success flag plus the plugin's own payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub response: Value,
}

impl Outcome {
    pub fn ok(response: Value) -> Self {
        Self {
            success: true,
            response,
        }
    }

    pub fn failed(response: Value) -> Self {
        Self {
            success: false,
            response,
        }
    }
}

fn missing_function(driver: &Driver, module: PluginType, function: &str) -> PluginError {
    PluginError::FunctionNotFound {
        plugin: driver.plugin.clone(),
        module: module.to_string(),
        function: function.to_string(),
    }
}

/// Creates, removes and inspects resources.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn new_client(
        &self,
        driver: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Driver, PluginError>;

    async fn create(
        &self,
        driver: &Driver,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Outcome, PluginError>;

    async fn remove(&self, driver: &Driver, _instance_id: &str) -> Result<Outcome, PluginError> {
        Err(missing_function(driver, PluginType::Orchestrator, "remove"))
    }

    async fn get(&self, driver: &Driver, _instance_id: &str) -> Result<Outcome, PluginError> {
        Err(missing_function(driver, PluginType::Orchestrator, "get"))
    }
}

/// Prepares whatever an instance needs before it is configured or provisioned.
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn new_client(
        &self,
        driver: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Driver, PluginError>;

    async fn create(
        &self,
        driver: &Driver,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Outcome, PluginError>;
}

/// Configures an instance. May block; runs on the bounded blocking pool.
#[async_trait]
pub trait Configurer: Send + Sync {
    async fn new_client(
        &self,
        driver: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Driver, PluginError>;

    async fn create(
        &self,
        driver: &Driver,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Outcome, PluginError>;
}

/// An importable plugin and the capabilities it provides.
pub trait PluginModule: Send + Sync {
    fn name(&self) -> &str;

    fn orchestrator(&self) -> Option<Arc<dyn Orchestrator>> {
        None
    }

    fn initializer(&self) -> Option<Arc<dyn Initializer>> {
        None
    }

    fn configurer(&self) -> Option<Arc<dyn Configurer>> {
        None
    }

    /// Config written to the plugin config directory on first install.
    fn default_config(&self) -> Value {
        Value::Null
    }

    fn provides(&self, plugin_type: PluginType) -> bool {
        match plugin_type {
            PluginType::Orchestrator => self.orchestrator().is_some(),
            PluginType::Initializer => self.initializer().is_some(),
            PluginType::Configurer => self.configurer().is_some(),
        }
    }
}
