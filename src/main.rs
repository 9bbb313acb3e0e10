//! NecroCode CLI
//!
//! - `run` — start the dispatcher (signal-driven shutdown)
//! - `runner` — internal: execute one task from `NECROCODE_CONTEXT`
//! - `create` / `sync` / `status` — operator access to the task registry
//! - `check-config` — validate the TOML config and exit

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::error;
use tracing_subscriber::EnvFilter;

use necrocode::config::NecroConfig;
use necrocode::dispatcher::launcher::DefaultLauncher;
use necrocode::dispatcher::monitor::RunnerMonitor;
use necrocode::dispatcher::Dispatcher;
use necrocode::error::Result;
use necrocode::registry::task::TaskDefinition;
use necrocode::registry::TaskRegistry;
use necrocode::runner::codegen::{CodeGenerator, HttpCodeGenerator, MockCodeGenerator};
use necrocode::runner::context::RunnerContext;
use necrocode::runner::AgentRunner;
use necrocode::workspace::WorkspacePool;

#[derive(Parser)]
#[command(name = "necrocode", version, about = "Task-execution engine for code-generation runners")]
struct Cli {
    /// Config file (defaults to ./necrocode.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dispatcher and run until SIGINT/SIGTERM
    Run,
    /// Execute one task in an allocated slot (internal; launched by `run`)
    #[command(hide = true)]
    Runner,
    /// Create a taskset from a JSON definitions file
    Create {
        spec: String,
        definitions: PathBuf,
    },
    /// Sync a taskset from a tasks.md checklist
    Sync {
        spec: String,
        tasks_md: PathBuf,
    },
    /// Show task states for a spec
    Status { spec: String },
    /// Validate the configuration and exit
    CheckConfig,
}

fn config_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.config {
        return path.clone();
    }
    let local = PathBuf::from("necrocode.toml");
    if local.exists() {
        local
    } else {
        NecroConfig::default_path()
    }
}

fn load_config(cli: &Cli) -> Result<NecroConfig> {
    Ok(NecroConfig::load(&config_path(cli))?.with_env())
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::from(2)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match &cli.command {
        Commands::Run => {
            let config = load_config(&cli)?;
            config.validate()?;
            run_dispatcher(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Runner => {
            let config = load_config(&cli)?;
            Ok(run_single_task(config).await)
        }
        Commands::Create { spec, definitions } => {
            let config = load_config(&cli)?;
            let registry = TaskRegistry::open(config.registry)?;
            let content = std::fs::read_to_string(definitions)?;
            let definitions: Vec<TaskDefinition> = serde_json::from_str(&content)?;
            let taskset = registry.create_taskset(spec, definitions)?;
            println!(
                "{} taskset '{}' created with {} tasks",
                "✓".green(),
                spec,
                taskset.tasks.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync { spec, tasks_md } => {
            let config = load_config(&cli)?;
            let registry = TaskRegistry::open(config.registry)?;
            let content = std::fs::read_to_string(tasks_md)?;
            let report = registry.sync_from_tasks_md(spec, &content)?;
            println!(
                "{} synced '{}': {} added, {} updated, {} unchanged",
                "✓".green(),
                spec,
                report.added.len(),
                report.updated.len(),
                report.unchanged.len()
            );
            for removed in &report.removed {
                println!(
                    "  {} task {} is in the registry but missing from tasks.md",
                    "!".yellow(),
                    removed
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { spec } => {
            let config = load_config(&cli)?;
            let registry = TaskRegistry::open(config.registry)?;
            let taskset = registry.get_taskset(spec)?;
            println!("{} v{}", spec.bold(), taskset.version);
            for task in &taskset.tasks {
                println!("  [{:>7}] {} {}", task.state.to_string(), task.id, task.title);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckConfig => {
            let path = config_path(&cli);
            let config = NecroConfig::load(&path)?.with_env();
            config.validate()?;
            println!("{} {} is valid", "✓".green(), path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Wire registry + workspace pools + launcher + dispatcher and run until a
/// shutdown signal. Fatal wiring errors exit non-zero before the loop starts.
async fn run_dispatcher(config: NecroConfig) -> Result<()> {
    let registry = Arc::new(TaskRegistry::open(config.registry.clone())?);
    let workspace = Arc::new(WorkspacePool::new(config.workspace.clone()));

    // Bootstrap workspace pools for agent pools that declare a repository.
    for pool in &config.agent_pools {
        let name = pool
            .type_specific
            .get("workspace_pool")
            .unwrap_or(&pool.name);
        if workspace.get_pool(name).is_ok() {
            continue;
        }
        if let Some(repo_url) = pool.type_specific.get("repo_url") {
            workspace
                .create_pool(name, repo_url, config.workspace.num_slots_per_pool)
                .await?;
        }
    }

    let monitor = Arc::new(RunnerMonitor::new(config.dispatcher.heartbeat_timeout()));
    let (completion_tx, completion_rx) = Dispatcher::completion_channel();
    let launcher = Arc::new(DefaultLauncher::new(
        completion_tx,
        Arc::clone(&monitor),
        config.registry.base_path.join("contexts"),
    ));

    let dispatcher = Dispatcher::new(
        config,
        registry,
        workspace,
        launcher,
        monitor,
        completion_rx,
    )?;
    dispatcher.run_until_signal().await
}

/// The `runner` subcommand: one task, one slot, exit code is the contract.
async fn run_single_task(config: NecroConfig) -> ExitCode {
    let ctx = match RunnerContext::from_env() {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("runner context unavailable: {e}");
            return ExitCode::from(2);
        }
    };

    let generator: Arc<dyn CodeGenerator> = match &config.runner.codegen_endpoint {
        Some(endpoint) => Arc::new(HttpCodeGenerator::new(
            endpoint.clone(),
            config.credentials.codegen_token.clone(),
            config.runner.codegen_rate_per_second,
            config.runner.codegen_burst,
        )),
        None => {
            // No endpoint configured: deterministic mock keeps dry runs and
            // fixtures working end to end.
            tracing::warn!("no codegen endpoint configured; using the mock generator");
            Arc::new(MockCodeGenerator::new())
        }
    };

    let mut runner = match AgentRunner::new(
        ctx,
        config.runner.clone(),
        config.credentials.clone(),
        generator,
    ) {
        Ok(runner) => runner,
        Err(e) => {
            error!("runner init failed: {e}");
            return ExitCode::from(2);
        }
    };

    let outcome = runner.execute().await;
    if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
