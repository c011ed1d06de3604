//! CR-022: `local` plugin: directory-backed resources.
//!
//! Client kwargs: `root` (required), the directory resources live in.
//! The initializer creates `root`. The orchestrator writes one `<id>.json`
//! per created resource; `id` and `name` come from the action kwargs, the id
//! defaulting to a fresh UUID.

use super::{Driver, Initializer, Orchestrator, Outcome, PluginModule};
use crate::core::error::PluginError;
use crate::core::types::Kwargs;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

const NAME: &str = "local";

/// The `local` plugin module.
pub struct LocalPlugin;

impl PluginModule for LocalPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn orchestrator(&self) -> Option<Arc<dyn Orchestrator>> {
        Some(Arc::new(LocalOrchestrator))
    }

    fn initializer(&self) -> Option<Arc<dyn Initializer>> {
        Some(Arc::new(LocalInitializer))
    }

    fn default_config(&self) -> Value {
        json!({"root": "resources"})
    }
}

fn client(driver: &str, args: &[Value], kwargs: &Kwargs) -> Result<Driver, PluginError> {
    let d = Driver::new(NAME, driver, args, kwargs);
    if d.kwarg_str("root").is_none() {
        return Err(PluginError::Client {
            plugin: NAME.to_string(),
            driver: driver.to_string(),
            reason: "missing 'root' kwarg".to_string(),
        });
    }
    Ok(d)
}

fn root(driver: &Driver) -> PathBuf {
    PathBuf::from(driver.kwarg_str("root").unwrap_or("."))
}

/// `<root>/<id>.json`. The id must name a single file inside the root.
fn resource_path(driver: &Driver, id: &str) -> Result<PathBuf, String> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(format!("invalid resource id '{}'", id));
    }
    Ok(root(driver).join(format!("{}.json", id)))
}

/// Prepares the root directory.
pub struct LocalInitializer;

#[async_trait]
impl Initializer for LocalInitializer {
    async fn new_client(
        &self,
        driver: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Driver, PluginError> {
        client(driver, args, kwargs)
    }

    async fn create(
        &self,
        driver: &Driver,
        _args: &[Value],
        _kwargs: &Kwargs,
    ) -> Result<Outcome, PluginError> {
        let root = root(driver);
        Ok(match std::fs::create_dir_all(&root) {
            Ok(()) => Outcome::ok(json!({"root": root.display().to_string()})),
            Err(e) => Outcome::failed(json!({
                "root": root.display().to_string(),
                "error": e.to_string(),
            })),
        })
    }
}

/// One JSON file per resource.
pub struct LocalOrchestrator;

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    async fn new_client(
        &self,
        driver: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Driver, PluginError> {
        client(driver, args, kwargs)
    }

    async fn create(
        &self,
        driver: &Driver,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Outcome, PluginError> {
        let id = kwargs
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let name = kwargs
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&id)
            .to_string();
        let path = match resource_path(driver, &id) {
            Ok(path) => path,
            Err(error) => return Ok(Outcome::failed(json!({"id": id, "error": error}))),
        };
        if path.exists() {
            return Ok(Outcome::failed(json!({
                "id": id,
                "error": format!("{} already exists", path.display()),
            })));
        }

        let record = json!({"id": id, "name": name, "args": args, "kwargs": kwargs});
        let written = std::fs::create_dir_all(root(driver))
            .and_then(|_| std::fs::write(&path, record.to_string()));
        Ok(match written {
            Ok(()) => Outcome::ok(json!({
                "id": id,
                "name": name,
                "path": path.display().to_string(),
            })),
            Err(e) => Outcome::failed(json!({"id": id, "error": e.to_string()})),
        })
    }

    async fn remove(&self, driver: &Driver, instance_id: &str) -> Result<Outcome, PluginError> {
        let path = match resource_path(driver, instance_id) {
            Ok(path) => path,
            Err(error) => return Ok(Outcome::failed(json!({"id": instance_id, "error": error}))),
        };
        Ok(match std::fs::remove_file(&path) {
            Ok(()) => Outcome::ok(json!({"id": instance_id})),
            Err(e) => Outcome::failed(json!({"id": instance_id, "error": e.to_string()})),
        })
    }

    async fn get(&self, driver: &Driver, instance_id: &str) -> Result<Outcome, PluginError> {
        let read = resource_path(driver, instance_id)
            .and_then(|path| std::fs::read_to_string(&path).map_err(|e| e.to_string()))
            .and_then(|s| serde_json::from_str::<Value>(&s).map_err(|e| e.to_string()));
        Ok(match read {
            Ok(record) => Outcome::ok(record),
            Err(error) => Outcome::failed(json!({"id": instance_id, "error": error})),
        })
    }
}
