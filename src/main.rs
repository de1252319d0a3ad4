mod builtins;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobline_core::config::{default_config_path, AppConfig};
use jobline_core::event::EventBus;
use jobline_core::graph::JobDefinition;
use jobline_core::records::JobExecution;
use jobline_core::status::BatchStatus;
use jobline_core::traits::PersistenceService;
use jobline_runtime::{BatchKernel, ExecutionServices, RunLogger, RunTarget, ShellHookListener};
use jobline_store::{MemoryStore, SqliteStore};

#[derive(Parser)]
#[command(name = "jobline", version, about = "Batch job runner for step/flow/split job graphs")]
struct Cli {
    /// Path to config file (defaults to ~/.jobline/jobline.toml)
    #[arg(short, long, env = "JOBLINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job definition file (.toml or .json)
    Run {
        /// Job definition file
        file: PathBuf,
        /// Job parameter as key=value (repeatable)
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Restart a stopped or failed execution
    Restart {
        execution_id: u64,
        /// Job parameter as key=value (repeatable)
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Show an execution and its step executions
    Status { execution_id: u64 },
    /// List every execution of a job
    Executions { job: String },
    /// Mark a finished execution as abandoned
    Abandon { execution_id: u64 },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("jobline=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "jobline", &mut std::io::stdout());
        return Ok(());
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = AppConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let (kernel, events) = build_kernel(&config)?;

    match cli.command {
        Commands::Run { file, params } => {
            let definition = load_definition(&file)?;
            let parameters: HashMap<_, _> = params.into_iter().collect();
            let job_name = definition.id.clone();

            // Subscribe before starting so the run log sees JobStarted
            let rx = events.subscribe();
            let execution_id = kernel.start(definition, parameters)?;
            info!(job = %job_name, execution_id, "Job started");
            let status = supervise(&kernel, &config, rx, execution_id).await?;
            exit_with(status);
        }
        Commands::Restart {
            execution_id,
            params,
        } => {
            let parameters: HashMap<_, _> = params.into_iter().collect();
            let job_name = kernel.job_execution(execution_id)?.job_name;

            let rx = events.subscribe();
            let restarted = kernel.restart(execution_id, parameters)?;
            info!(job = %job_name, previous_execution_id = execution_id, execution_id = restarted, "Job restarted");
            let status = supervise(&kernel, &config, rx, restarted).await?;
            exit_with(status);
        }
        Commands::Status { execution_id } => {
            let execution = kernel.job_execution(execution_id)?;
            print_execution(&execution);
            for step in kernel.step_executions(execution_id)? {
                println!(
                    "  {:<24} {:<10} {:<16} read={} write={} commit={}",
                    step.step_name,
                    step.batch_status,
                    step.exit_status_or_default(),
                    step.metrics.read_count,
                    step.metrics.write_count,
                    step.metrics.commit_count,
                );
            }
        }
        Commands::Executions { job } => {
            let persistence = &kernel.services().persistence;
            let instances = persistence.job_instances(&job)?;
            if instances.is_empty() {
                println!("No executions for job '{}'.", job);
            }
            for instance in instances {
                for execution in kernel.job_executions(instance.instance_id)? {
                    print_execution(&execution);
                }
            }
        }
        Commands::Abandon { execution_id } => {
            kernel.abandon(execution_id)?;
            println!("Execution {} abandoned.", execution_id);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Wire the store, registry, event bus and hooks into a kernel.
fn build_kernel(config: &AppConfig) -> anyhow::Result<(Arc<BatchKernel>, Arc<EventBus>)> {
    let persistence: Arc<dyn PersistenceService> = match config.database_path() {
        Some(db_path) => Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("opening {}", db_path.display()))?,
        ),
        None => {
            warn!("No [engine] database configured; records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let events = Arc::new(EventBus::new(config.engine.event_capacity));
    let services = ExecutionServices::new(persistence, Arc::new(builtins::registry()))
        .with_events(events.clone());

    let mut kernel = BatchKernel::new(services);
    if !config.hooks.is_empty() {
        kernel = kernel.with_listener(Arc::new(ShellHookListener::new(config.hooks.clone())));
    }
    Ok((Arc::new(kernel), events))
}

/// Parse a job file, choosing the format by extension.
fn load_definition(path: &Path) -> anyhow::Result<JobDefinition> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let definition = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => JobDefinition::from_json(&text)?,
        _ => JobDefinition::from_toml(&text)?,
    };
    Ok(definition)
}

/// Wait for an execution, with an optional run log and Ctrl-C as a
/// cooperative stop.
async fn supervise(
    kernel: &Arc<BatchKernel>,
    config: &AppConfig,
    rx: tokio::sync::broadcast::Receiver<jobline_core::event::BatchEvent>,
    execution_id: u64,
) -> anyhow::Result<BatchStatus> {
    let cancel = CancellationToken::new();
    let logger = match config.log_dir() {
        Some(dir) => {
            let target = RunTarget::of(&kernel.job_execution(execution_id)?);
            let logger = RunLogger::new(dir, config.log.level);
            Some(tokio::spawn(logger.run(rx, target, cancel.clone())))
        }
        None => None,
    };

    let stopper = {
        let kernel = kernel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!(execution_id, "Stopping job...");
            if let Err(e) = kernel.stop(execution_id).await {
                warn!(execution_id, error = %e, "Stop request failed");
            }
        })
    };

    let execution = kernel.wait_for(execution_id).await?;
    stopper.abort();
    if let Some(logger) = logger {
        // The logger exits on its own after JobFinished
        if tokio::time::timeout(std::time::Duration::from_secs(2), logger)
            .await
            .is_err()
        {
            cancel.cancel();
        }
    }

    print_execution(&execution);
    Ok(execution.batch_status)
}

fn print_execution(execution: &JobExecution) {
    let duration = match (execution.start_time, execution.end_time) {
        (Some(start), Some(end)) => format!("{}ms", (end - start).num_milliseconds()),
        _ => "-".to_string(),
    };
    println!(
        "{:>6}  {:<24} {:<10} {:<16} {}",
        execution.execution_id,
        execution.job_name,
        execution.batch_status,
        execution.exit_status_or_default(),
        duration,
    );
}

fn exit_with(status: BatchStatus) {
    if status != BatchStatus::Completed {
        std::process::exit(1);
    }
}
