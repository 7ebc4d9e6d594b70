//! `agentflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `migrate`: run pending database migrations.
//! - `validate`: check a workflow JSON file without storing it.
//! - `workflow`: create, list, show, delete or archive workflows.
//! - `run`: execute a workflow and wait for the result.
//! - `executions`: list executions, optionally for one workflow.
//! - `execution`: show one execution with its task rows.
//! - `cancel`: cancel an execution.
//! - `recover`: fail executions left unfinished by a previous process.
//! - `agents`: list registered agents.
//!
//! Every command prints a JSON envelope on stdout:
//! `{"success": true, "data": ...}` or `{"success": false, "error": "..."}`.

mod config;
mod logging;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use agents::{AgentRegistry, EchoAgent};
use engine::{Engine, ExecutionRequest, NewWorkflow};

#[derive(Parser)]
#[command(name = "agentflow", about = "Sequential agent workflow engine", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `database.url` from the configuration file.
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations.
    Migrate,
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Manage stored workflows.
    #[command(subcommand)]
    Workflow(WorkflowCommand),
    /// Execute a workflow.
    Run {
        workflow_id: Uuid,
        /// Trigger variable as `key=value`; JSON values are parsed, anything else is a string.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
        /// Print the execution id as soon as the run starts, then wait for it quietly.
        #[arg(long)]
        detach: bool,
    },
    /// List executions, newest first.
    Executions {
        #[arg(long)]
        workflow: Option<Uuid>,
    },
    /// Show an execution and its tasks.
    Execution { id: Uuid },
    /// Cancel a pending or running execution.
    Cancel { id: Uuid },
    /// Mark executions interrupted by a previous process as failed.
    Recover,
    /// List registered agents and their actions.
    Agents,
}

#[derive(Subcommand)]
enum WorkflowCommand {
    /// Store a workflow from a JSON file.
    Create { path: PathBuf },
    List {
        #[arg(long)]
        owner: Option<String>,
    },
    Show { id: Uuid },
    Delete { id: Uuid },
    Archive { id: Uuid },
}

fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}

fn emit(result: &anyhow::Result<Value>) {
    let envelope = match result {
        Ok(data) => json!({ "success": true, "data": data }),
        Err(err) => json!({ "success": false, "error": format!("{err:#}") }),
    };
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{envelope}");
    let _ = stdout.flush();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(None) => ExitCode::SUCCESS,
        Ok(Some(data)) => {
            emit(&Ok(data));
            ExitCode::SUCCESS
        }
        Err(err) => {
            emit(&Err(err));
            ExitCode::FAILURE
        }
    }
}

/// `Ok(None)` means the envelope was already printed.
async fn run(cli: Cli) -> anyhow::Result<Option<Value>> {
    let config = config::load_config(cli.config.as_deref())
        .await?
        .with_database_url(cli.database_url);
    logging::init_tracing(&config.logging)?;

    if let Command::Validate { path } = &cli.command {
        return validate_file(path).await.map(Some);
    }

    let pool = db::pool::create_pool(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;
    db::pool::run_migrations(&pool).await.context("migration failed")?;
    if let Command::Migrate = cli.command {
        info!("Migrations applied successfully");
        return Ok(Some(json!({ "migrated": true })));
    }

    let registry = Arc::new(AgentRegistry::new().with_agent("echo", Arc::new(EchoAgent)));
    registry.init_all().await?;
    let engine = Arc::new(Engine::new(pool, Arc::clone(&registry), config.engine.clone()));

    let result = dispatch(&engine, cli.command).await;

    engine.shutdown(Duration::from_secs(10)).await;
    registry.cleanup_all().await;
    result
}

async fn read_workflow_file(path: &Path) -> anyhow::Result<NewWorkflow> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid workflow JSON in {}", path.display()))
}

async fn validate_file(path: &Path) -> anyhow::Result<Value> {
    let workflow = read_workflow_file(path).await?;
    workflow.validate()?;
    let tasks: Vec<&str> = workflow.definition.tasks.iter().map(|t| t.name.as_str()).collect();
    Ok(json!({ "valid": true, "name": workflow.name, "tasks": tasks }))
}

async fn dispatch(engine: &Arc<Engine>, command: Command) -> anyhow::Result<Option<Value>> {
    let data = match command {
        Command::Migrate | Command::Validate { .. } => {
            anyhow::bail!("command does not run through the engine")
        }
        Command::Workflow(WorkflowCommand::Create { path }) => {
            let new = read_workflow_file(&path).await?;
            serde_json::to_value(engine.create_workflow(new).await?)?
        }
        Command::Workflow(WorkflowCommand::List { owner }) => {
            serde_json::to_value(engine.list_workflows(owner.as_deref()).await?)?
        }
        Command::Workflow(WorkflowCommand::Show { id }) => serde_json::to_value(engine.get_workflow(id).await?)?,
        Command::Workflow(WorkflowCommand::Delete { id }) => {
            engine.delete_workflow(id).await?;
            json!({ "deleted": id })
        }
        Command::Workflow(WorkflowCommand::Archive { id }) => {
            serde_json::to_value(engine.archive_workflow(id).await?)?
        }
        Command::Run { workflow_id, vars, detach } => {
            let variables: Map<String, Value> = vars.into_iter().collect();
            let request = ExecutionRequest::manual(variables).triggered_by("cli");
            let execution_id = engine.start_workflow(workflow_id, request).await?;
            if detach {
                emit(&Ok(json!({ "execution_id": execution_id })));
            }
            let execution = wait_for_execution(engine, execution_id).await?;
            if detach {
                return Ok(None);
            }
            serde_json::to_value(execution)?
        }
        Command::Executions { workflow } => serde_json::to_value(engine.list_executions(workflow).await?)?,
        Command::Execution { id } => {
            let execution = engine.get_execution(id).await?;
            let tasks = engine.list_tasks(id).await?;
            json!({ "execution": execution, "tasks": tasks })
        }
        Command::Cancel { id } => json!({ "cancelled": engine.cancel_execution(id).await? }),
        Command::Recover => json!({ "recovered": engine.recover_interrupted().await? }),
        Command::Agents => serde_json::to_value(engine.registry().list_capabilities())?,
    };
    Ok(Some(data))
}

/// Wait for a run started in this process. Ctrl-C requests cancellation
/// once; a second Ctrl-C stops waiting.
async fn wait_for_execution(engine: &Engine, id: Uuid) -> anyhow::Result<engine::ExecutionRow> {
    let mut interval = tokio::time::interval(Duration::from_millis(100));
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if !engine.active_executions().contains(&id) {
                    return Ok(engine.get_execution(id).await?);
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                if cancel_requested {
                    warn!(execution_id = %id, "stopped waiting; interrupting the run");
                    engine.shutdown(Duration::from_secs(5)).await;
                    return Ok(engine.get_execution(id).await?);
                }
                warn!(execution_id = %id, "Ctrl-C received, cancelling after the current task");
                engine.cancel_execution(id).await?;
                cancel_requested = true;
            }
        }
    }
}
