//! CR-014: Plans, named stage-block triples kept in the `plans` store.
//!
//! Plan blocks are stored unrendered; `{{ instance.name }}` is filled in per
//! instance when a deploy prepares an instance that references the plan.

use super::error::{ConfigError, PersistenceError, PipelineError};
use super::parser;
use super::resolver::validate_blocks;
use super::store::{ensure, DocumentStore};
use super::types::{Plan, StageBlocks};
use serde_json::Value;
use std::path::Path;

/// Store holding every plan.
pub const PLANS_STORE: &str = "plans";

/// Access to the `plans` store.
pub struct Plans {
    store: DocumentStore<Plan>,
}

impl Plans {
    pub fn open(directory: &Path) -> Self {
        Self {
            store: DocumentStore::open(directory, PLANS_STORE),
        }
    }

    pub fn get(&self, name: &str) -> Option<Plan> {
        self.store.get(name)
    }

    pub fn list(&self) -> Vec<Plan> {
        self.store.items()
    }

    /// Validate and store a new plan. Fails if `name` is already taken.
    pub fn add(&self, name: &str, declaration: &Value) -> Result<Plan, PipelineError> {
        let plan = parse_plan(name, declaration)?;
        ensure(self.store.add(&plan), PLANS_STORE, "add")?;
        tracing::info!(plan = name, "plan added");
        Ok(plan)
    }

    /// Load a plan declaration from a YAML file and store it.
    pub fn add_file(&self, name: &str, path: &Path) -> Result<Plan, PipelineError> {
        let declaration = parser::parse_declaration_file(path)?;
        self.add(name, &declaration)
    }

    /// Delete a plan; the store goes with its last plan.
    pub fn remove(&self, name: &str) -> Result<(), PersistenceError> {
        ensure(self.store.remove(name), PLANS_STORE, "remove")?;
        self.store.remove_persistence_if_empty();
        tracing::info!(plan = name, "plan removed");
        Ok(())
    }
}

/// Check a `{initializer?, orchestrator?, configurer?}` declaration.
pub fn parse_plan(name: &str, declaration: &Value) -> Result<Plan, ConfigError> {
    validate_blocks(name, declaration, true)?;
    let config: StageBlocks = serde_json::from_value(declaration.clone())
        .map_err(|e| ConfigError::InvalidDeclaration(format!("plan '{}': {}", name, e)))?;
    Ok(Plan {
        name: name.to_string(),
        config,
    })
}
