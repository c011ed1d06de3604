//! CR-007: Error taxonomy for config resolution, plugins, persistence and pipelines.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Malformed or missing declaration fields.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("YAML parse error: {0}")]
    Parse(String),

    #[error("invalid declaration: {0}")]
    InvalidDeclaration(String),

    #[error("instance '{instance}' has an invalid range: {reason}")]
    InvalidRange { instance: String, reason: String },

    #[error("instance '{instance}' is declared more than once")]
    DuplicateInstance { instance: String },

    #[error("instance '{instance}' has no provider declared")]
    MissingProvider { instance: String },

    #[error("instance '{instance}' has no settings declared")]
    MissingSettings { instance: String },

    #[error("instance '{instance}': {reason}")]
    Template { instance: String, reason: String },

    #[error("instance '{instance}' references unknown plan '{plan}'")]
    PlanNotFound { instance: String, plan: String },
}

/// A plugin could not be found, imported, or called.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin '{name}' is not installed")]
    NotInstalled { name: String },

    #[error("plugin '{name}' could not be loaded: {reason}")]
    Load { name: String, reason: String },

    #[error("plugin '{plugin}' has no {module} module")]
    ModuleNotFound { plugin: String, module: String },

    #[error("plugin '{plugin}' {module} module has no '{function}' function")]
    FunctionNotFound {
        plugin: String,
        module: String,
        function: String,
    },

    #[error("plugin '{plugin}' could not create a {driver} client: {reason}")]
    Client {
        plugin: String,
        driver: String,
        reason: String,
    },

    #[error("plugin '{plugin}' {function} timed out after {seconds}s")]
    Timeout {
        plugin: String,
        function: String,
        seconds: u64,
    },
}

/// The document store could not be created, locked, or written.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("store '{store}' could not be written: {operation}")]
    Write { store: String, operation: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store {path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// A single per-instance failure collected during a stage.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StageError {
    pub stage: String,
    pub instance: String,
    pub message: String,
    /// Response payload returned by a plugin that ran but reported failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.instance, self.message)
    }
}

/// Failure of a deploy or destroy invocation.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("stack '{0}' not found")]
    StackNotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("prepare failed for {} instance(s)", errors.len())]
    Prepare { errors: Vec<StageError> },

    #[error("{stage} failed for {} instance(s)", errors.len())]
    Stage {
        stage: String,
        errors: Vec<StageError>,
    },
}

impl PipelineError {
    /// Per-instance errors carried by this failure, if any.
    pub fn errors(&self) -> &[StageError] {
        match self {
            Self::Prepare { errors } | Self::Stage { errors, .. } => errors,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cr007_config_error_names_instance() {
        let e = ConfigError::MissingProvider {
            instance: "node01".to_string(),
        };
        assert!(e.to_string().contains("node01"));
        let e = ConfigError::MissingSettings {
            instance: "node02".to_string(),
        };
        assert!(e.to_string().contains("node02"));
    }

    #[test]
    fn test_cr007_plugin_errors_are_distinct() {
        let a = PluginError::NotInstalled { name: "oci".into() };
        let b = PluginError::ModuleNotFound {
            plugin: "oci".into(),
            module: "configurer".into(),
        };
        let c = PluginError::FunctionNotFound {
            plugin: "oci".into(),
            module: "orchestrator".into(),
            function: "get".into(),
        };
        assert!(a.to_string().contains("not installed"));
        assert!(b.to_string().contains("configurer module"));
        assert!(c.to_string().contains("'get'"));
    }

    #[test]
    fn test_cr007_pipeline_error_exposes_stage_errors() {
        let err = PipelineError::Stage {
            stage: "provision".to_string(),
            errors: vec![StageError {
                stage: "provision".to_string(),
                instance: "a".to_string(),
                message: "quota exceeded".to_string(),
                response: Some(serde_json::json!({"code": 429})),
            }],
        };
        assert_eq!(err.errors().len(), 1);
        assert_eq!(err.to_string(), "provision failed for 1 instance(s)");
        assert!(PipelineError::StackNotFound("s".into()).errors().is_empty());
    }

    #[test]
    fn test_cr007_stage_error_serializes_without_empty_response() {
        let e = StageError {
            stage: "initialize".into(),
            instance: "b".into(),
            message: "boom".into(),
            response: None,
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(!json.contains("response"));
        assert_eq!(e.to_string(), "[initialize] b: boom");
    }
}
