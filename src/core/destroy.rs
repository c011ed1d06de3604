//! CR-013: Destroy pipeline.
//!
//! Removes every instance that is both declared and live, concurrently and
//! best-effort. Each removal is persisted as it completes, the same way deploy
//! persists each transition. Afterwards pools lose the removed members and
//! anything left empty (pools, the stack, the stores) is deleted.

use super::error::{PersistenceError, PipelineError, StageError};
use super::executor::{bounded, effective_blocks, stage_error, Action, Pipeline, TaskResult, STACKS_STORE};
use super::plans::Plans;
use super::pool::Pools;
use super::store::{ensure, DocumentStore};
use super::types::*;
use crate::journal::events::{self, generate_run_id, PipelineEvent};
use crate::plugins::{Orchestrator, Outcome};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// An instance queued for removal, with the orchestrator that created it.
struct Removal {
    name: String,
    resource_id: String,
    action: Action<dyn Orchestrator>,
}

impl Pipeline {
    /// Tear down stack `stack_id`.
    ///
    /// A failed removal is reported but does not stop the others; the stack
    /// keeps only the instances that could not be removed.
    pub async fn destroy(&self, stack_id: &str) -> Result<Report, PipelineError> {
        let start = Instant::now();
        let run_id = generate_run_id();
        let mut removed = 0u32;
        let result = self.run_destroy(stack_id, &run_id, &mut removed).await;

        if !matches!(result, Err(PipelineError::StackNotFound(_))) {
            events::record(
                &self.settings.directory,
                stack_id,
                PipelineEvent::DestroyCompleted {
                    stack: stack_id.to_string(),
                    run_id: run_id.clone(),
                    removed,
                    failed: result.as_ref().err().map_or(0, |e| e.errors().len()) as u32,
                    total_seconds: start.elapsed().as_secs_f64(),
                },
            );
        }
        match &result {
            Ok(report) => tracing::info!(stack = stack_id, run_id = %run_id, "{}", report.msg),
            Err(e) => tracing::error!(stack = stack_id, run_id = %run_id, error = %e, "destroy failed"),
        }
        result
    }

    async fn run_destroy(
        &self,
        stack_id: &str,
        run_id: &str,
        removed_count: &mut u32,
    ) -> Result<Report, PipelineError> {
        let stacks = self.stacks();
        let mut stack = stacks
            .get(stack_id)
            .ok_or_else(|| PipelineError::StackNotFound(stack_id.to_string()))?;

        let targets: Vec<String> = stack
            .instances
            .keys()
            .filter(|name| stack.config.instances.contains_key(*name))
            .cloned()
            .collect();
        events::record(
            &self.settings.directory,
            stack_id,
            PipelineEvent::DestroyStarted {
                stack: stack_id.to_string(),
                run_id: run_id.to_string(),
                instances: targets.len() as u32,
            },
        );
        tracing::info!(stack = stack_id, instances = targets.len(), "destroy started");

        let mut report = Report::new(stack_id);
        let mut errors = Vec::new();
        let mut removed = Vec::new();

        // Instances with nothing to remove are dropped without a plugin call.
        let plans = Plans::open(&self.settings.directory);
        let mut removals = Vec::new();
        for name in &targets {
            match self.removal_for(&plans, &stack, name) {
                Ok(Some(removal)) => removals.push(removal),
                Ok(None) => {
                    drop_instance(&stacks, &mut stack, name)?;
                    report.record(Stage::Destroy, name);
                    removed.push(name.clone());
                }
                Err(e) => errors.push(e),
            }
        }

        let limit = self.settings.plugin_timeout;
        let names: Vec<String> = removals.iter().map(|r| r.name.clone()).collect();
        let mut set: JoinSet<TaskResult> = JoinSet::new();
        for removal in removals {
            set.spawn(async move {
                let result = remove_one(&removal, limit).await;
                (removal.name, result)
            });
        }
        let mut pending: HashSet<String> = names.into_iter().collect();
        let mut aborted = Vec::new();
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
                Ok(outcome) if outcome.success => match drop_instance(&stacks, &mut stack, &name) {
                    Ok(()) => {
                        tracing::info!(stack = stack_id, instance = %name, "instance removed");
                        events::record(
                            &self.settings.directory,
                            stack_id,
                            PipelineEvent::StageCompleted {
                                stack: stack_id.to_string(),
                                run_id: run_id.to_string(),
                                stage: Stage::Destroy.to_string(),
                                instance: name.clone(),
                                hash: None,
                            },
                        );
                        report.record(Stage::Destroy, &name);
                        removed.push(name);
                    }
                    Err(e) => errors.push(stage_error(
                        Stage::Destroy,
                        &name,
                        format!("cannot persist: {}", e),
                        None,
                    )),
                },
                Ok(outcome) => errors.push(stage_error(
                    Stage::Destroy,
                    &name,
                    "plugin reported failure".to_string(),
                    Some(outcome.response),
                )),
                Err(message) => errors.push(stage_error(Stage::Destroy, &name, message, None)),
            }
        }
        let mut leftovers: Vec<String> = pending.into_iter().collect();
        leftovers.sort();
        for name in leftovers {
            errors.push(stage_error(
                Stage::Destroy,
                &name,
                format!("task aborted: {}", aborted.join("; ")),
                None,
            ));
        }
        *removed_count = removed.len() as u32;

        let pools = Pools::open(&self.settings.directory);
        for pool in pools.reconcile_removed(stack_id, &removed)? {
            tracing::debug!(stack = stack_id, pool = %pool, "pool reconciled");
        }

        let remaining = stack.instances.len();
        if remaining == 0 {
            ensure(stacks.remove(stack_id), STACKS_STORE, "remove")?;
            stacks.remove_persistence_if_empty();
        }

        if !errors.is_empty() {
            for e in &errors {
                tracing::warn!(stack = stack_id, instance = %e.instance, error = %e.message, "removal failed");
                events::record(
                    &self.settings.directory,
                    stack_id,
                    PipelineEvent::StageFailed {
                        stack: stack_id.to_string(),
                        run_id: run_id.to_string(),
                        stage: Stage::Destroy.to_string(),
                        instance: e.instance.clone(),
                        error: e.message.clone(),
                    },
                );
            }
            return Err(PipelineError::Stage {
                stage: Stage::Destroy.to_string(),
                errors,
            });
        }

        report.msg = if remaining == 0 {
            format!("stack '{}' destroyed", stack_id)
        } else {
            format!(
                "stack '{}': {} instance(s) removed, {} undeclared instance(s) kept",
                stack_id,
                removed.len(),
                remaining
            )
        };
        Ok(report)
    }

    /// The orchestrator call that removes `name`, or `None` if there is nothing to remove.
    fn removal_for(
        &self,
        plans: &Plans,
        stack: &Stack,
        name: &str,
    ) -> Result<Option<Removal>, StageError> {
        let fail = |message: String| stage_error(Stage::Destroy, name, message, None);
        let record = stack.instances.get(name);
        if !record.is_some_and(|r| r.provisioned) {
            return Ok(None);
        }
        let Some(config) = stack.config.instances.get(name) else {
            return Ok(None);
        };
        let blocks = effective_blocks(plans, name, config).map_err(|e| fail(e.to_string()))?;
        let Some(block) = blocks.orchestrator else {
            return Ok(None);
        };
        let capability = self
            .registry
            .load(&block.provider.name)
            .and_then(|loaded| loaded.orchestrator())
            .map_err(|e| fail(e.to_string()))?;
        let resource_id = record
            .and_then(InstanceRecord::resource_id)
            .unwrap_or(name)
            .to_string();
        Ok(Some(Removal {
            name: name.to_string(),
            resource_id,
            action: Action { capability, block },
        }))
    }
}

/// Forget `name` and write the stack back immediately.
fn drop_instance(
    stacks: &DocumentStore<Stack>,
    stack: &mut Stack,
    name: &str,
) -> Result<(), PersistenceError> {
    stack.instances.shift_remove(name);
    ensure(stacks.update(&stack.id, stack), STACKS_STORE, "update")
}

async fn remove_one(removal: &Removal, limit: Option<Duration>) -> Result<Outcome, String> {
    let provider = &removal.action.block.provider;
    let orchestrator = &removal.action.capability;
    let call = async {
        let driver = bounded(
            limit,
            &provider.name,
            "new_client",
            orchestrator.new_client(&provider.driver, &provider.args, &provider.kwargs),
        )
        .await?;
        bounded(
            limit,
            &provider.name,
            "remove",
            orchestrator.remove(&driver, &removal.resource_id),
        )
        .await
    };
    call.await.map_err(|e| e.to_string())
}
