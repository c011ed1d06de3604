//! Scripted plugin for tests: records calls, fails or stalls on demand.
//!
//! Instances are identified by the `name` action kwarg, so declarations used with
//! it set `name: "{{ instance.name }}"` in their settings.

use super::{Configurer, Driver, Initializer, Orchestrator, Outcome, PluginModule, PluginType};
use crate::core::error::PluginError;
use crate::core::types::Kwargs;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    name: String,
    missing: HashSet<PluginType>,
    failures: Mutex<HashSet<(String, String)>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<(String, String)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockState {
    fn instance(kwargs: &Kwargs) -> String {
        kwargs
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unnamed")
            .to_string()
    }

    fn should_fail(&self, call: &str, instance: &str) -> bool {
        self.failures
            .lock()
            .unwrap()
            .contains(&(call.to_string(), instance.to_string()))
    }

    fn delay_for(&self, instance: &str) -> Option<Duration> {
        self.delays.lock().unwrap().get(instance).copied()
    }

    fn record(&self, call: &str, instance: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((call.to_string(), instance.to_string()));
    }

    async fn act(&self, call: &str, instance: &str, blocking: bool) -> Outcome {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay_for(instance) {
            if blocking {
                std::thread::sleep(delay);
            } else {
                tokio::time::sleep(delay).await;
            }
        }
        self.record(call, instance);
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.should_fail(call, instance) {
            Outcome::failed(json!({"error": format!("{} failed for {}", call, instance)}))
        } else {
            Outcome::ok(json!({"id": format!("mock-{}", instance), "name": instance, "call": call}))
        }
    }
}

/// Handle to a scripted plugin; clones share state.
#[derive(Clone)]
pub struct MockPlugin {
    state: Arc<MockState>,
}

impl MockPlugin {
    pub fn new(name: &str) -> Self {
        Self {
            state: Arc::new(MockState {
                name: name.to_string(),
                ..MockState::default()
            }),
        }
    }

    /// Same plugin without the given capability.
    pub fn without(name: &str, missing: PluginType) -> Self {
        let mut missing_set = HashSet::new();
        missing_set.insert(missing);
        Self {
            state: Arc::new(MockState {
                name: name.to_string(),
                missing: missing_set,
                ..MockState::default()
            }),
        }
    }

    pub fn module(&self) -> Arc<dyn PluginModule> {
        Arc::new(self.clone())
    }

    /// Make `call` (`initialize`, `configure`, `provision`, `remove`) fail for `instance`.
    pub fn fail(&self, call: &str, instance: &str) {
        self.state
            .failures
            .lock()
            .unwrap()
            .insert((call.to_string(), instance.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.failures.lock().unwrap().clear();
    }

    pub fn delay(&self, instance: &str, delay: Duration) {
        self.state
            .delays
            .lock()
            .unwrap()
            .insert(instance.to_string(), delay);
    }

    /// Instances `call` ran for, in call order.
    pub fn calls(&self, call: &str) -> Vec<String> {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == call)
            .map(|(_, i)| i.clone())
            .collect()
    }

    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }
}

impl PluginModule for MockPlugin {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn orchestrator(&self) -> Option<Arc<dyn Orchestrator>> {
        if self.state.missing.contains(&PluginType::Orchestrator) {
            return None;
        }
        Some(Arc::new(self.clone()))
    }

    fn initializer(&self) -> Option<Arc<dyn Initializer>> {
        if self.state.missing.contains(&PluginType::Initializer) {
            return None;
        }
        Some(Arc::new(self.clone()))
    }

    fn configurer(&self) -> Option<Arc<dyn Configurer>> {
        if self.state.missing.contains(&PluginType::Configurer) {
            return None;
        }
        Some(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Orchestrator for MockPlugin {
    async fn new_client(
        &self,
        driver: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Driver, PluginError> {
        Ok(Driver::new(&self.state.name, driver, args, kwargs))
    }

    async fn create(
        &self,
        _driver: &Driver,
        _args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Outcome, PluginError> {
        let instance = MockState::instance(kwargs);
        Ok(self.state.act("provision", &instance, false).await)
    }

    async fn remove(&self, _driver: &Driver, instance_id: &str) -> Result<Outcome, PluginError> {
        let instance = instance_id.strip_prefix("mock-").unwrap_or(instance_id);
        Ok(self.state.act("remove", instance, false).await)
    }

    async fn get(&self, _driver: &Driver, instance_id: &str) -> Result<Outcome, PluginError> {
        Ok(Outcome::ok(json!({"id": instance_id})))
    }
}

#[async_trait]
impl Initializer for MockPlugin {
    async fn new_client(
        &self,
        driver: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Driver, PluginError> {
        Ok(Driver::new(&self.state.name, driver, args, kwargs))
    }

    async fn create(
        &self,
        _driver: &Driver,
        _args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Outcome, PluginError> {
        let instance = MockState::instance(kwargs);
        Ok(self.state.act("initialize", &instance, false).await)
    }
}

#[async_trait]
impl Configurer for MockPlugin {
    async fn new_client(
        &self,
        driver: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Driver, PluginError> {
        Ok(Driver::new(&self.state.name, driver, args, kwargs))
    }

    async fn create(
        &self,
        _driver: &Driver,
        _args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Outcome, PluginError> {
        let instance = MockState::instance(kwargs);
        Ok(self.state.act("configure", &instance, true).await)
    }
}
