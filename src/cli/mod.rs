//! CR-017: CLI subcommands: deploy, destroy, show, ls, plan, pool, plugin.
//!
//! Every command prints one JSON object `{status, msg, errors?, data?}` on
//! stdout; logs go to stderr.

use crate::core::error::{PipelineError, StageError};
use crate::core::executor::Pipeline;
use crate::core::plans::Plans;
use crate::core::pool::Pools;
use crate::core::settings::Settings;
use crate::plugins::{PluginRegistry, PluginType};
use clap::Subcommand;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Deploy a stack from a declaration file
    Deploy {
        /// Stack name
        name: String,

        /// Path to the deploy file (YAML)
        file: PathBuf,

        /// Persistence directory
        #[arg(long)]
        directory: Option<PathBuf>,
    },

    /// Remove every live instance of a stack
    Destroy {
        name: String,

        #[arg(long)]
        directory: Option<PathBuf>,
    },

    /// Show a stored stack
    Show {
        name: String,

        #[arg(long)]
        directory: Option<PathBuf>,
    },

    /// List stored stacks
    Ls {
        #[arg(long)]
        directory: Option<PathBuf>,
    },

    /// Manage plans
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },

    /// Inspect pools
    Pool {
        #[command(subcommand)]
        command: PoolCommands,
    },

    /// Install and remove plugins
    Plugin {
        #[command(subcommand)]
        command: PluginCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum PlanCommands {
    /// Store a plan from a YAML file
    Add {
        name: String,
        file: PathBuf,

        #[arg(long)]
        directory: Option<PathBuf>,
    },

    /// Delete a plan
    Rm {
        name: String,

        #[arg(long)]
        directory: Option<PathBuf>,
    },

    /// List plans
    Ls {
        #[arg(long)]
        directory: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum PoolCommands {
    /// List pools
    Ls {
        #[arg(long)]
        directory: Option<PathBuf>,
    },

    /// Show one pool and its members
    Show {
        name: String,

        #[arg(long)]
        directory: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum PluginCommands {
    /// Install one capability of a plugin (orchestrator, initializer, configurer)
    Install {
        plugin_type: PluginType,
        name: String,

        #[arg(long)]
        directory: Option<PathBuf>,
    },

    /// Remove one capability of a plugin
    Remove {
        plugin_type: PluginType,
        name: String,

        #[arg(long)]
        directory: Option<PathBuf>,
    },

    /// List installed plugins
    Ls {
        #[arg(long)]
        directory: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// JSON payload printed for every command.
#[derive(Debug, Serialize)]
pub struct Response {
    pub status: Status,
    pub msg: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StageError>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn ok(msg: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            status: Status::Ok,
            msg: msg.into(),
            errors: Vec::new(),
            data,
        }
    }

    pub fn error(msg: impl Display) -> Self {
        Self {
            status: Status::Error,
            msg: msg.to_string(),
            errors: Vec::new(),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self)
            .unwrap_or_else(|e| format!(r#"{{"status":"error","msg":"cannot encode response: {}"}}"#, e))
    }
}

impl From<PipelineError> for Response {
    fn from(e: PipelineError) -> Self {
        let errors = e.errors().to_vec();
        Self {
            errors,
            ..Self::error(e)
        }
    }
}

fn settings(directory: Option<PathBuf>) -> Settings {
    let settings = Settings::from_env();
    match directory {
        Some(dir) => settings.with_directory(&dir),
        None => settings,
    }
}

fn pipeline(settings: Settings) -> Pipeline {
    let registry = PluginRegistry::with_builtins(&settings);
    Pipeline::new(settings, Arc::new(registry))
}

fn to_data<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok()
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Response {
    match cmd {
        Commands::Deploy {
            name,
            file,
            directory,
        } => cmd_deploy(&name, &file, settings(directory)).await,
        Commands::Destroy { name, directory } => cmd_destroy(&name, settings(directory)).await,
        Commands::Show { name, directory } => cmd_show(&name, settings(directory)),
        Commands::Ls { directory } => cmd_ls(settings(directory)),
        Commands::Plan { command } => dispatch_plan(command),
        Commands::Pool { command } => dispatch_pool(command),
        Commands::Plugin { command } => dispatch_plugin(command),
    }
}

async fn cmd_deploy(name: &str, file: &Path, settings: Settings) -> Response {
    match pipeline(settings).deploy_file(name, file).await {
        Ok(report) => Response::ok(report.msg.clone(), to_data(&report)),
        Err(e) => e.into(),
    }
}

async fn cmd_destroy(name: &str, settings: Settings) -> Response {
    match pipeline(settings).destroy(name).await {
        Ok(report) => Response::ok(report.msg.clone(), to_data(&report)),
        Err(e) => e.into(),
    }
}

fn cmd_show(name: &str, settings: Settings) -> Response {
    match pipeline(settings).show(name) {
        Ok(stack) => Response::ok(format!("stack '{}'", name), to_data(&stack)),
        Err(e) => e.into(),
    }
}

fn cmd_ls(settings: Settings) -> Response {
    let ids: Vec<String> = pipeline(settings).list().into_iter().map(|s| s.id).collect();
    Response::ok(format!("{} stack(s)", ids.len()), to_data(&ids))
}

fn dispatch_plan(cmd: PlanCommands) -> Response {
    match cmd {
        PlanCommands::Add {
            name,
            file,
            directory,
        } => match Plans::open(&settings(directory).directory).add_file(&name, &file) {
            Ok(plan) => Response::ok(format!("plan '{}' added", name), to_data(&plan)),
            Err(e) => e.into(),
        },
        PlanCommands::Rm { name, directory } => {
            match Plans::open(&settings(directory).directory).remove(&name) {
                Ok(()) => Response::ok(format!("plan '{}' removed", name), None),
                Err(e) => Response::error(format!("plan '{}': {}", name, e)),
            }
        }
        PlanCommands::Ls { directory } => {
            let plans = Plans::open(&settings(directory).directory).list();
            Response::ok(format!("{} plan(s)", plans.len()), to_data(&plans))
        }
    }
}

fn dispatch_pool(cmd: PoolCommands) -> Response {
    match cmd {
        PoolCommands::Ls { directory } => {
            let pools = Pools::open(&settings(directory).directory).list();
            let summary: Vec<Value> = pools
                .iter()
                .map(|p| serde_json::json!({"name": p.name, "members": p.len()}))
                .collect();
            Response::ok(format!("{} pool(s)", pools.len()), Some(Value::Array(summary)))
        }
        PoolCommands::Show { name, directory } => {
            match Pools::open(&settings(directory).directory).get(&name) {
                Some(pool) => Response::ok(format!("pool '{}'", name), to_data(&pool)),
                None => Response::error(format!("pool '{}' not found", name)),
            }
        }
    }
}

fn dispatch_plugin(cmd: PluginCommands) -> Response {
    match cmd {
        PluginCommands::Install {
            plugin_type,
            name,
            directory,
        } => {
            let registry = PluginRegistry::with_builtins(&settings(directory));
            match registry.install(plugin_type, &name) {
                Ok(plugin) => Response::ok(
                    format!("installed {} '{}'", plugin_type, name),
                    to_data(&plugin),
                ),
                Err(e) => Response::error(e),
            }
        }
        PluginCommands::Remove {
            plugin_type,
            name,
            directory,
        } => {
            let registry = PluginRegistry::with_builtins(&settings(directory));
            match registry.remove(plugin_type, &name) {
                Ok(()) => Response::ok(format!("removed {} '{}'", plugin_type, name), None),
                Err(e) => Response::error(e),
            }
        }
        PluginCommands::Ls { directory } => {
            let registry = PluginRegistry::with_builtins(&settings(directory));
            let installed = registry.ls();
            Response::ok(
                format!(
                    "{} plugin(s) installed, available: {}",
                    installed.len(),
                    registry.available().join(", ")
                ),
                to_data(&installed),
            )
        }
    }
}
