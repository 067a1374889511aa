mod agent;
mod cli;
mod config;
mod logging;
mod store;
mod template;
mod workflow;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::{DefinitionStore, ExecutionStore, MemoryStore, SqliteStore};
use workflow::{EngineSettings, WorkflowEngine, WorkflowRegistry};

#[derive(Parser)]
#[command(name = "agentflow")]
#[command(about = "Run multi-step agent workflows with retries, conditions and durable state")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,

    /// Emit JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Write logs to a timestamped file under the user config directory
    #[arg(long, global = true, conflicts_with = "log_file")]
    log: bool,

    /// Keep executions in memory only
    #[arg(long, global = true)]
    ephemeral: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow and follow it to the end
    Run {
        /// Workflow id
        workflow: String,

        /// Workflow parameters as key=value
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Show an execution
    Status {
        execution_id: String,

        /// Require the execution to belong to this workflow
        #[arg(long)]
        workflow: Option<String>,
    },

    /// List recent executions of a workflow
    List {
        workflow_id: String,

        /// Maximum number of executions to show
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Cancel an execution
    Cancel { execution_id: String },

    /// Resume an interrupted execution
    Resume { execution_id: String },

    /// List available workflows
    Workflows,

    /// Validate a workflow file or registered workflow
    Validate {
        /// Workflow file path or workflow id
        workflow: String,
    },

    /// List configured agents and check availability
    Agents,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Status { .. } => "status",
            Self::List { .. } => "list",
            Self::Cancel { .. } => "cancel",
            Self::Resume { .. } => "resume",
            Self::Workflows => "workflows",
            Self::Validate { .. } => "validate",
            Self::Agents => "agents",
        }
    }
}

/// Wire stores, registry and agents into an engine
async fn build_engine(
    config: &config::EngineConfig,
    project_dir: Option<&Path>,
    ephemeral: bool,
) -> Result<WorkflowEngine> {
    let (executions, definitions): (Arc<dyn ExecutionStore>, Arc<dyn DefinitionStore>) =
        if ephemeral || config.store.in_memory {
            let store = Arc::new(MemoryStore::new());
            (store.clone() as Arc<dyn ExecutionStore>, store as Arc<dyn DefinitionStore>)
        } else {
            let path = config.store.resolved_path()?;
            let store = Arc::new(
                SqliteStore::open(&path)
                    .with_context(|| format!("opening execution store {}", path.display()))?,
            );
            tracing::debug!(path = %path.display(), "Opened execution store");
            (store.clone() as Arc<dyn ExecutionStore>, store as Arc<dyn DefinitionStore>)
        };

    let registry = Arc::new(WorkflowRegistry::with_store(definitions));
    let restored = registry.load_from_store().await?;
    for definition in config::load_workflows(project_dir)? {
        registry.register(definition).await?;
    }
    tracing::debug!(
        restored,
        workflows = registry.list().len(),
        "Workflow registry ready"
    );

    let agents = agent::AgentRegistry::from_config(config)?;
    tracing::debug!(agents = agents.len(), "Agents configured");

    Ok(WorkflowEngine::new(
        registry,
        executions,
        Arc::new(agents),
        EngineSettings::from_config(config),
    ))
}

async fn run(cli: Cli) -> Result<i32> {
    let project_dir = cli.dir.as_deref();
    let config = config::EngineConfig::load(project_dir)?;
    let handler = cli::create_handler(cli::OutputMode::from_flags(cli.json, cli.quiet), cli.debug);

    if let Commands::Agents = cli.command {
        return Ok(cli::list_agents(&config, &*handler).await);
    }

    let engine = build_engine(&config, project_dir, cli.ephemeral).await?;

    match cli.command {
        Commands::Run { workflow, args } => {
            cli::run_workflow(&engine, &workflow, &args, &*handler).await
        }
        Commands::Status {
            execution_id,
            workflow,
        } => cli::show_status(&engine, &execution_id, workflow.as_deref(), &*handler).await,
        Commands::List { workflow_id, limit } => {
            cli::list_executions(&engine, &workflow_id, limit, &*handler).await
        }
        Commands::Cancel { execution_id } => {
            cli::cancel_execution(&engine, &execution_id, &*handler).await
        }
        Commands::Resume { execution_id } => {
            cli::resume_execution(&engine, &execution_id, &*handler).await
        }
        Commands::Workflows => {
            cli::list_workflows(&engine, &*handler);
            Ok(0)
        }
        Commands::Validate { workflow } => Ok(cli::validate_workflow(&engine, &workflow, &*handler)),
        Commands::Agents => Ok(cli::list_agents(&config, &*handler).await),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = match cli.log_file.clone() {
        Some(path) => Some(path),
        None if cli.log => Some(logging::default_log_path(cli.command.name())?),
        None => None,
    };
    let guard = logging::init_logging(cli.debug, cli.quiet, log_file)?;

    let code = run(cli).await?;
    if code != 0 {
        drop(guard);
        std::process::exit(code);
    }
    Ok(())
}
