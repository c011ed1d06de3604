//! CR-012: Deploy pipeline, the orchestration loop for `deploy`.
//!
//! resolve → prepare → initialize → configure → provision → pool registration
//!
//! Each stage fans out one task per candidate instance on a `JoinSet`. The
//! coordinator drains completions in arrival order and is the only writer of
//! the stack record: every successful instance is persisted before the next
//! completion is looked at. A stage with failures ends the run once all of its
//! tasks have settled; whatever succeeded stays persisted.

use super::error::{ConfigError, PersistenceError, PipelineError, PluginError, StageError};
use super::parser;
use super::plans::Plans;
use super::pool::{MemberState, Pools};
use super::resolver;
use super::settings::Settings;
use super::store::{ensure, DocumentStore};
use super::types::*;
use crate::journal::events::{self, generate_run_id, now_iso8601, PipelineEvent};
use crate::journal::hasher::hash_value;
use crate::plugins::{
    Configurer, Driver, Initializer, LoadedPlugin, Orchestrator, Outcome, PluginRegistry,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Store holding every stack.
pub const STACKS_STORE: &str = "stacks";

/// A capability paired with the block it was loaded for.
pub(crate) struct Action<C: ?Sized> {
    pub(crate) capability: Arc<C>,
    pub(crate) block: StageBlock,
}

/// One instance with its plan merged, plugins loaded and config hashed.
pub(crate) struct PreparedInstance {
    pub(crate) name: String,
    pub(crate) initializer: Option<Action<dyn Initializer>>,
    pub(crate) configurer: Option<Action<dyn Configurer>>,
    pub(crate) orchestrator: Option<Action<dyn Orchestrator>>,
    pub(crate) config_hash: String,
}

/// What a stage task hands back to the coordinator.
pub(crate) type TaskResult = (String, Result<Outcome, String>);

/// Runs deploys and destroys against one persistence directory.
pub struct Pipeline {
    pub(crate) settings: Settings,
    pub(crate) registry: Arc<PluginRegistry>,
}

impl Pipeline {
    pub fn new(settings: Settings, registry: Arc<PluginRegistry>) -> Self {
        Self { settings, registry }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stacks(&self) -> DocumentStore<Stack> {
        DocumentStore::open(&self.settings.directory, STACKS_STORE)
    }

    /// The stored stack `id`.
    pub fn show(&self, id: &str) -> Result<Stack, PipelineError> {
        self.stacks()
            .get(id)
            .ok_or_else(|| PipelineError::StackNotFound(id.to_string()))
    }

    /// Every stored stack.
    pub fn list(&self) -> Vec<Stack> {
        self.stacks().items()
    }

    /// Deploy the declaration in a YAML file.
    pub async fn deploy_file(&self, stack_id: &str, path: &Path) -> Result<Report, PipelineError> {
        let declaration = parser::parse_declaration_file(path)?;
        self.deploy(stack_id, &declaration).await
    }

    /// Deploy a parsed declaration as stack `stack_id`.
    ///
    /// Safe to call again on a partially deployed stack: completed stages are
    /// skipped per instance.
    pub async fn deploy(&self, stack_id: &str, declaration: &Value) -> Result<Report, PipelineError> {
        let start = Instant::now();
        let run_id = generate_run_id();
        let result = self.run_deploy(stack_id, declaration, &run_id).await;

        let failed = match &result {
            Ok(_) => 0,
            Err(e) => e.errors().len().max(1),
        };
        events::record(
            &self.settings.directory,
            stack_id,
            PipelineEvent::DeployCompleted {
                stack: stack_id.to_string(),
                run_id: run_id.clone(),
                failed: failed as u32,
                total_seconds: start.elapsed().as_secs_f64(),
            },
        );
        match &result {
            Ok(report) => tracing::info!(stack = stack_id, run_id = %run_id, "{}", report.msg),
            Err(e) => tracing::error!(stack = stack_id, run_id = %run_id, error = %e, "deploy failed"),
        }
        result
    }

    async fn run_deploy(
        &self,
        stack_id: &str,
        declaration: &Value,
        run_id: &str,
    ) -> Result<Report, PipelineError> {
        let config = resolver::resolve_declaration(declaration)?;
        let stacks = self.stacks();
        let mut stack = load_or_create(&stacks, stack_id)?;
        stack.config = config;

        events::record(
            &self.settings.directory,
            stack_id,
            PipelineEvent::DeployStarted {
                stack: stack_id.to_string(),
                run_id: run_id.to_string(),
                instances: stack.config.instances.len() as u32,
            },
        );
        tracing::info!(
            stack = stack_id,
            instances = stack.config.instances.len(),
            "deploy started"
        );

        let prepared = self.prepare(&stack).await?;
        warn_changed_configs(&stack, &prepared);
        // The stored config only ever holds a declaration that prepared cleanly.
        ensure(stacks.update(stack_id, &stack), STACKS_STORE, "update")?;

        let mut run = DeployRun {
            stacks,
            stack,
            prepared,
            run_id: run_id.to_string(),
            report: Report::new(stack_id),
        };
        for stage in [Stage::Initialize, Stage::Configure, Stage::Provision] {
            self.run_stage(&mut run, stage).await?;
        }

        self.register_pools(&run.stack)?;

        let provisioned = run.stack.instances.values().filter(|r| r.provisioned).count();
        run.report.msg = format!(
            "stack '{}' deployed: {} of {} instance(s) provisioned",
            stack_id,
            provisioned,
            run.stack.config.instances.len()
        );
        Ok(run.report)
    }

    /// Resolve every instance's effective blocks and load its plugins.
    ///
    /// Any failure aborts the deploy before the stack's runtime record is touched.
    async fn prepare(
        &self,
        stack: &Stack,
    ) -> Result<IndexMap<String, Arc<PreparedInstance>>, PipelineError> {
        let mut set = JoinSet::new();
        for (name, config) in &stack.config.instances {
            let registry = Arc::clone(&self.registry);
            let directory = self.settings.directory.clone();
            let name = name.clone();
            let config = config.clone();
            set.spawn(async move {
                let plans = Plans::open(&directory);
                prepare_instance(&registry, &plans, &name, &config)
            });
        }

        let mut prepared = Vec::with_capacity(stack.config.instances.len());
        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(instance)) => prepared.push(instance),
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(stage_error(
                    Stage::Prepare,
                    "<task>",
                    format!("prepare task aborted: {}", e),
                    None,
                )),
            }
        }

        if !errors.is_empty() {
            for e in &errors {
                tracing::warn!(stack = %stack.id, instance = %e.instance, error = %e.message, "prepare failed");
            }
            return Err(PipelineError::Prepare { errors });
        }

        // Keep declaration order regardless of completion order.
        let mut by_name: IndexMap<String, Arc<PreparedInstance>> = prepared
            .into_iter()
            .map(|p| (p.name.clone(), Arc::new(p)))
            .collect();
        Ok(stack
            .config
            .instances
            .keys()
            .filter_map(|name| by_name.shift_remove_entry(name))
            .collect())
    }

    /// Fan out one stage over its candidates and settle every task.
    async fn run_stage(&self, run: &mut DeployRun, stage: Stage) -> Result<(), PipelineError> {
        let candidates = run.candidates(stage);
        if candidates.is_empty() {
            tracing::debug!(stack = %run.stack.id, stage = %stage, "no candidates");
            return Ok(());
        }
        tracing::info!(stack = %run.stack.id, stage = %stage, count = candidates.len(), "stage started");

        let limit = self.settings.plugin_timeout;
        let names: Vec<String> = candidates.iter().map(|c| c.name.clone()).collect();
        let mut set: JoinSet<TaskResult> = JoinSet::new();

        match stage {
            Stage::Initialize => {
                for instance in candidates {
                    set.spawn(async move {
                        let result = match &instance.initializer {
                            Some(action) => invoke(action, limit).await,
                            None => Err(not_declared(&instance.name, "initializer")),
                        };
                        (instance.name.clone(), result)
                    });
                }
            }
            Stage::Configure => {
                let workers = Arc::new(Semaphore::new(self.settings.configure_workers));
                for instance in candidates {
                    let workers = Arc::clone(&workers);
                    set.spawn(async move {
                        let permit = workers.acquire_owned().await.ok();
                        let name = instance.name.clone();
                        let plugin = instance
                            .configurer
                            .as_ref()
                            .map_or_else(String::new, |a| a.block.provider.name.clone());
                        let handle = tokio::runtime::Handle::current();
                        // The permit lives as long as the worker thread, even one abandoned on timeout.
                        let worker = tokio::task::spawn_blocking(move || {
                            let _permit = permit;
                            handle.block_on(async {
                                match &instance.configurer {
                                    Some(action) => invoke(action, limit).await,
                                    None => Err(not_declared(&instance.name, "configurer")),
                                }
                            })
                        });
                        let result = match bounded(limit, &plugin, "configure", async { Ok(worker.await) }).await {
                            Ok(Ok(result)) => result,
                            Ok(Err(e)) => Err(format!("configure worker aborted: {}", e)),
                            Err(e) => Err(e.to_string()),
                        };
                        (name, result)
                    });
                }
            }
            Stage::Provision => {
                for instance in candidates {
                    set.spawn(async move {
                        let result = match &instance.orchestrator {
                            Some(action) => invoke(action, limit).await,
                            None => Err(not_declared(&instance.name, "orchestrator")),
                        };
                        (instance.name.clone(), result)
                    });
                }
            }
            Stage::Prepare | Stage::Destroy => return Ok(()),
        }

        let errors = run.settle(&self.settings.directory, stage, set, names).await;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Stage {
                stage: stage.to_string(),
                errors,
            })
        }
    }

    /// Record provisioned members of every declared pool.
    fn register_pools(&self, stack: &Stack) -> Result<(), PipelineError> {
        if stack.config.pools.is_empty() {
            return Ok(());
        }
        let pools = Pools::open(&self.settings.directory);
        for (pool_name, declaration) in &stack.config.pools {
            pools.create(pool_name)?;
            for member in resolver::pool_members(declaration, &stack.config.instances)? {
                let record = stack.instances.get(&member);
                let state = match record {
                    Some(r) if r.provisioned => MemberState::Provisioned,
                    _ => MemberState::Declared,
                };
                let config = serde_json::json!({
                    "resource_id": record.and_then(InstanceRecord::resource_id),
                });
                pools.add_instance(pool_name, &stack.id, &member, state, config)?;
            }
        }
        Ok(())
    }
}

/// State of one deploy run, owned by the coordinator.
struct DeployRun {
    stacks: DocumentStore<Stack>,
    stack: Stack,
    prepared: IndexMap<String, Arc<PreparedInstance>>,
    run_id: String,
    report: Report,
}

impl DeployRun {
    fn record(&self, name: &str) -> Option<&InstanceRecord> {
        self.stack.instances.get(name)
    }

    /// Initialized, or nothing to initialize.
    fn ready(&self, instance: &PreparedInstance) -> bool {
        instance.initializer.is_none() || self.record(&instance.name).is_some_and(|r| r.initialized)
    }

    fn candidates(&self, stage: Stage) -> Vec<Arc<PreparedInstance>> {
        self.prepared
            .values()
            .filter(|instance| {
                let record = self.record(&instance.name);
                match stage {
                    Stage::Initialize => {
                        instance.initializer.is_some() && !record.is_some_and(|r| r.initialized)
                    }
                    Stage::Configure => {
                        instance.configurer.is_some()
                            && !record.is_some_and(|r| r.configured)
                            && self.ready(instance)
                    }
                    Stage::Provision => {
                        instance.orchestrator.is_some()
                            && !record.is_some_and(|r| r.provisioned)
                            && self.ready(instance)
                    }
                    Stage::Prepare | Stage::Destroy => false,
                }
            })
            .cloned()
            .collect()
    }

    /// Drain a stage's tasks, persisting each success as it arrives.
    async fn settle(
        &mut self,
        directory: &Path,
        stage: Stage,
        mut set: JoinSet<TaskResult>,
        names: Vec<String>,
    ) -> Vec<StageError> {
        let mut pending: HashSet<String> = names.into_iter().collect();
        let mut aborted = Vec::new();
        let mut errors = Vec::new();

        while let Some(joined) = set.join_next().await {
            let (name, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    aborted.push(e.to_string());
                    continue;
                }
            };
            pending.remove(&name);
            match result {
                Ok(outcome) if outcome.success => match self.commit(stage, &name, outcome.response) {
                    Ok(()) => {
                        tracing::info!(stack = %self.stack.id, instance = %name, stage = %stage, "instance completed");
                        let hash = self.prepared.get(&name).map(|p| p.config_hash.clone());
                        events::record(
                            directory,
                            &self.stack.id,
                            PipelineEvent::StageCompleted {
                                stack: self.stack.id.clone(),
                                run_id: self.run_id.clone(),
                                stage: stage.to_string(),
                                instance: name,
                                hash,
                            },
                        );
                    }
                    Err(e) => errors.push(stage_error(stage, &name, format!("cannot persist: {}", e), None)),
                },
                Ok(outcome) => errors.push(stage_error(
                    stage,
                    &name,
                    "plugin reported failure".to_string(),
                    Some(outcome.response),
                )),
                Err(message) => errors.push(stage_error(stage, &name, message, None)),
            }
        }

        let mut leftovers: Vec<String> = pending.into_iter().collect();
        leftovers.sort();
        for name in leftovers {
            errors.push(stage_error(
                stage,
                &name,
                format!("task aborted: {}", aborted.join("; ")),
                None,
            ));
        }

        for e in &errors {
            tracing::warn!(stack = %self.stack.id, instance = %e.instance, stage = %stage, error = %e.message, "instance failed");
            events::record(
                directory,
                &self.stack.id,
                PipelineEvent::StageFailed {
                    stack: self.stack.id.clone(),
                    run_id: self.run_id.clone(),
                    stage: stage.to_string(),
                    instance: e.instance.clone(),
                    error: e.message.clone(),
                },
            );
        }
        errors
    }

    /// Apply one instance transition and write the stack back immediately.
    fn commit(&mut self, stage: Stage, name: &str, response: Value) -> Result<(), PersistenceError> {
        let hash = self.prepared.get(name).map(|p| p.config_hash.clone());
        let record = self.stack.instances.entry(name.to_string()).or_default();
        record
            .plugin_response
            .insert(stage.as_str().to_string(), response);
        match stage {
            Stage::Initialize => {
                record.initialized = true;
                record.configured = false;
            }
            Stage::Configure => record.configured = true,
            Stage::Provision => record.provisioned = true,
            Stage::Prepare | Stage::Destroy => {}
        }
        record.config_hash = hash;
        record.updated_at = Some(now_iso8601());

        ensure(
            self.stacks.update(&self.stack.id, &self.stack),
            STACKS_STORE,
            "update",
        )?;
        self.report.record(stage, name);
        Ok(())
    }
}

/// The stored stack `id`, created with an empty config if missing.
fn load_or_create(stacks: &DocumentStore<Stack>, id: &str) -> Result<Stack, PipelineError> {
    if stacks.get(id).is_none() {
        ensure(
            stacks.add(&Stack::new(id, StackConfig::default())),
            STACKS_STORE,
            "add",
        )?;
    }
    stacks
        .get(id)
        .ok_or_else(|| PipelineError::StackNotFound(id.to_string()))
}

fn warn_changed_configs(stack: &Stack, prepared: &IndexMap<String, Arc<PreparedInstance>>) {
    for (name, instance) in prepared {
        let Some(record) = stack.instances.get(name) else {
            continue;
        };
        if !record.provisioned {
            continue;
        }
        if record.config_hash.as_deref() != Some(instance.config_hash.as_str()) {
            tracing::warn!(
                stack = %stack.id,
                instance = %name,
                "config changed since provision; redeploy does not update live instances"
            );
        }
    }
}

/// Inline blocks over the referenced plan's blocks, rendered for `name`.
pub(crate) fn effective_blocks(
    plans: &Plans,
    name: &str,
    config: &InstanceConfig,
) -> Result<StageBlocks, ConfigError> {
    let blocks = match &config.plan {
        Some(plan_name) => {
            let plan = plans.get(plan_name).ok_or_else(|| ConfigError::PlanNotFound {
                instance: name.to_string(),
                plan: plan_name.clone(),
            })?;
            config
                .blocks
                .overlay(&resolver::render_blocks(&plan.config, name)?)
        }
        None => config.blocks.clone(),
    };
    if blocks.is_empty() {
        return Err(ConfigError::MissingProvider {
            instance: name.to_string(),
        });
    }
    Ok(blocks)
}

/// Merge the plan, load capabilities, hash the result.
pub(crate) fn prepare_instance(
    registry: &PluginRegistry,
    plans: &Plans,
    name: &str,
    config: &InstanceConfig,
) -> Result<PreparedInstance, StageError> {
    let fail = |message: String| stage_error(Stage::Prepare, name, message, None);
    let blocks = effective_blocks(plans, name, config).map_err(|e| fail(e.to_string()))?;

    let load = |block: &StageBlock| -> Result<LoadedPlugin, StageError> {
        registry
            .load(&block.provider.name)
            .map_err(|e| fail(e.to_string()))
    };

    let initializer = match &blocks.initializer {
        Some(block) => Some(Action {
            capability: load(block)?.initializer().map_err(|e| fail(e.to_string()))?,
            block: block.clone(),
        }),
        None => None,
    };
    let configurer = match &blocks.configurer {
        Some(block) => Some(Action {
            capability: load(block)?.configurer().map_err(|e| fail(e.to_string()))?,
            block: block.clone(),
        }),
        None => None,
    };
    let orchestrator = match &blocks.orchestrator {
        Some(block) => Some(Action {
            capability: load(block)?.orchestrator().map_err(|e| fail(e.to_string()))?,
            block: block.clone(),
        }),
        None => None,
    };

    let config_hash = serde_json::to_value(&blocks)
        .map(|v| hash_value(&v))
        .map_err(|e| fail(e.to_string()))?;

    Ok(PreparedInstance {
        name: name.to_string(),
        initializer,
        configurer,
        orchestrator,
        config_hash,
    })
}

/// Await a plugin call, giving up after `limit`.
pub(crate) async fn bounded<T, F>(
    limit: Option<Duration>,
    plugin: &str,
    function: &str,
    call: F,
) -> Result<T, PluginError>
where
    F: Future<Output = Result<T, PluginError>>,
{
    let Some(limit) = limit else {
        return call.await;
    };
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(PluginError::Timeout {
            plugin: plugin.to_string(),
            function: function.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}

/// The `new_client` and `create` pair every stage capability exposes.
#[async_trait]
pub(crate) trait StageCall: Send + Sync {
    async fn client(&self, driver: &str, args: &[Value], kwargs: &Kwargs) -> Result<Driver, PluginError>;

    async fn run(&self, driver: &Driver, args: &[Value], kwargs: &Kwargs) -> Result<Outcome, PluginError>;
}

#[async_trait]
impl StageCall for dyn Initializer {
    async fn client(&self, driver: &str, args: &[Value], kwargs: &Kwargs) -> Result<Driver, PluginError> {
        self.new_client(driver, args, kwargs).await
    }

    async fn run(&self, driver: &Driver, args: &[Value], kwargs: &Kwargs) -> Result<Outcome, PluginError> {
        self.create(driver, args, kwargs).await
    }
}

#[async_trait]
impl StageCall for dyn Configurer {
    async fn client(&self, driver: &str, args: &[Value], kwargs: &Kwargs) -> Result<Driver, PluginError> {
        self.new_client(driver, args, kwargs).await
    }

    async fn run(&self, driver: &Driver, args: &[Value], kwargs: &Kwargs) -> Result<Outcome, PluginError> {
        self.create(driver, args, kwargs).await
    }
}

#[async_trait]
impl StageCall for dyn Orchestrator {
    async fn client(&self, driver: &str, args: &[Value], kwargs: &Kwargs) -> Result<Driver, PluginError> {
        self.new_client(driver, args, kwargs).await
    }

    async fn run(&self, driver: &Driver, args: &[Value], kwargs: &Kwargs) -> Result<Outcome, PluginError> {
        self.create(driver, args, kwargs).await
    }
}

/// Open a client for the block's provider and run its settings through `create`.
async fn invoke<C: StageCall + ?Sized>(
    action: &Action<C>,
    limit: Option<Duration>,
) -> Result<Outcome, String> {
    let (provider, settings) = (&action.block.provider, &action.block.settings);
    let call = async {
        let driver = bounded(
            limit,
            &provider.name,
            "new_client",
            action
                .capability
                .client(&provider.driver, &provider.args, &provider.kwargs),
        )
        .await?;
        bounded(
            limit,
            &provider.name,
            "create",
            action.capability.run(&driver, &settings.args, &settings.kwargs),
        )
        .await
    };
    call.await.map_err(|e| e.to_string())
}

fn not_declared(instance: &str, block: &str) -> String {
    format!("instance '{}' declares no {}", instance, block)
}

pub(crate) fn stage_error(
    stage: Stage,
    instance: &str,
    message: String,
    response: Option<Value>,
) -> StageError {
    StageError {
        stage: stage.to_string(),
        instance: instance.to_string(),
        message,
        response,
    }
}
