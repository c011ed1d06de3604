//! CR-001: Stack, plan, and instance record types.
//!
//! Everything that lands in a document store derives Serialize/Deserialize.
//! Plugin arguments are kept as `serde_json::Value` so any provider can define
//! its own settings shape.

use super::store::Document;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Keyword arguments handed to a plugin.
pub type Kwargs = serde_json::Map<String, Value>;

// ============================================================================
// Declarations
// ============================================================================

/// Which plugin, driver and client arguments a stage block talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    /// Installed plugin name
    pub name: String,

    /// Driver the plugin client should use
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Positional client arguments
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword client arguments
    #[serde(default)]
    pub kwargs: Kwargs,
}

fn default_driver() -> String {
    "default".to_string()
}

/// Arguments handed to the plugin action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSettings {
    #[serde(default)]
    pub args: Vec<Value>,

    #[serde(default)]
    pub kwargs: Kwargs,
}

/// One `{provider, settings}` block for a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageBlock {
    pub provider: Provider,
    pub settings: ActionSettings,
}

/// The three optional stage blocks of an instance or plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageBlocks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<StageBlock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<StageBlock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configurer: Option<StageBlock>,
}

impl StageBlocks {
    pub fn is_empty(&self) -> bool {
        self.initializer.is_none() && self.orchestrator.is_none() && self.configurer.is_none()
    }

    /// Blocks from `self`, falling back to `base` where `self` has none.
    pub fn overlay(&self, base: &StageBlocks) -> StageBlocks {
        StageBlocks {
            initializer: self.initializer.clone().or_else(|| base.initializer.clone()),
            orchestrator: self.orchestrator.clone().or_else(|| base.orchestrator.clone()),
            configurer: self.configurer.clone().or_else(|| base.configurer.clone()),
        }
    }
}

/// Declared config of one concrete instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Named plan supplying the stage blocks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,

    #[serde(flatten)]
    pub blocks: StageBlocks,
}

/// Declared pool membership, names may use range shorthand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolDeclaration {
    #[serde(default)]
    pub instances: Vec<String>,
}

/// Resolved stack declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default)]
    pub instances: IndexMap<String, InstanceConfig>,

    #[serde(default)]
    pub pools: IndexMap<String, PoolDeclaration>,
}

// ============================================================================
// Persisted records
// ============================================================================

/// Root deployable unit: declaration plus runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,

    #[serde(default)]
    pub config: StackConfig,

    /// Runtime record per live instance
    #[serde(default)]
    pub instances: IndexMap<String, InstanceRecord>,
}

impl Stack {
    pub fn new(id: &str, config: StackConfig) -> Self {
        Self {
            id: id.to_string(),
            config,
            instances: IndexMap::new(),
        }
    }
}

impl Document for Stack {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Runtime progress of one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Plugin response per completed stage (`initialize`, `configure`, `provision`)
    #[serde(default)]
    pub plugin_response: IndexMap<String, Value>,

    #[serde(default)]
    pub initialized: bool,

    #[serde(default)]
    pub configured: bool,

    #[serde(default)]
    pub provisioned: bool,

    /// BLAKE3 of the prepared config the instance was last deployed with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,

    /// When the record last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl InstanceRecord {
    /// Resource id the orchestrator reported at provision time.
    pub fn resource_id(&self) -> Option<&str> {
        self.plugin_response
            .get(Stage::Provision.as_str())
            .and_then(|r| r.get("id"))
            .and_then(Value::as_str)
    }
}

/// Named, reusable triple of stage blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,

    #[serde(default)]
    pub config: StageBlocks,
}

impl Document for Plan {
    fn id(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Stages and reports
// ============================================================================

/// Pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Initialize,
    Configure,
    Provision,
    Destroy,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Initialize => "initialize",
            Self::Configure => "configure",
            Self::Provision => "provision",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Successful pipeline outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    pub stack: String,
    pub msg: String,

    /// Instances completed per stage, in completion order
    pub stages: IndexMap<String, Vec<String>>,
}

impl Report {
    pub fn new(stack: &str) -> Self {
        Self {
            stack: stack.to_string(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, stage: Stage, instance: &str) {
        self.stages
            .entry(stage.as_str().to_string())
            .or_default()
            .push(instance.to_string());
    }

    pub fn completed(&self, stage: Stage) -> &[String] {
        self.stages
            .get(stage.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
