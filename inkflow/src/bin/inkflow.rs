//! Inkflow CLI
//!
//! The `inkflow` command starts, resumes and inspects generation runs.
//!
//! ## Commands
//!
//! - `start`: Create a run from a config file and drive it
//! - `resume`: Continue a paused, interrupted or failed run
//! - `status`: Print a run's persisted state
//!
//! The process exit code reflects the run outcome: 0 completed, 6 paused,
//! otherwise the code of the failure kind.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use inkflow::backend::ProviderConfig;
use inkflow::config::RunConfig;
use inkflow::core::{RunStatus, StageStatus};
use inkflow::errors::{ExitCode, InkflowError};
use inkflow::observability::init_tracing;
use inkflow::pipeline::{Orchestrator, ResumeOptions, RunState};
use inkflow::utils::parse_timestamp;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "inkflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resumable, budget-aware generation pipelines", long_about = None)]
struct Cli {
    /// Directory holding run state
    #[arg(long, global = true, default_value = "runs")]
    root: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new run and drive it until it completes, pauses or fails
    Start {
        /// Path to the run config (JSON)
        config: PathBuf,

        /// Fixed run id (generated if omitted)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Resume a run from its latest checkpoint
    Resume {
        /// Run to resume
        run_id: String,

        /// Replacement config; changed stages and their dependents re-run
        #[arg(long)]
        config: Option<PathBuf>,

        /// Reopen a failed run with the same config
        #[arg(long)]
        retry_failed: bool,
    },

    /// Show a run's persisted state
    Status {
        /// Run to inspect
        run_id: String,

        /// Print the full state as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Fills `api_key` from `api_key_env` for HTTP providers.
fn resolve_credentials(config: &mut RunConfig) {
    for (name, provider) in &mut config.providers {
        if let ProviderConfig::Http {
            api_key,
            api_key_env: Some(var),
            ..
        } = provider
        {
            if api_key.is_none() {
                match std::env::var(var.as_str()) {
                    Ok(value) => *api_key = Some(value),
                    Err(_) => warn!(provider = %name, env = %var, "API key variable is not set"),
                }
            }
        }
    }
}

fn load_config(path: &Path) -> Result<RunConfig> {
    let mut config = RunConfig::from_file(path)
        .map_err(InkflowError::from)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    resolve_credentials(&mut config);
    Ok(config)
}

fn exit_code(state: &RunState) -> ExitCode {
    match state.status {
        RunStatus::Paused => ExitCode::RUN_PAUSED,
        RunStatus::Failed => state
            .failure
            .as_ref()
            .map_or(ExitCode::INTERNAL, |f| f.kind.exit_code()),
        _ => ExitCode::SUCCESS,
    }
}

fn print_summary(state: &RunState) {
    println!("run {} ({}): {}", state.run_id, state.name, state.status);
    println!(
        "  spent {:.4} of {:.4}, checkpoint v{}",
        state.ledger_total, state.budget_cap, state.checkpoint_version
    );
    if let (Ok(created), Ok(updated)) = (
        parse_timestamp(&state.created_at),
        parse_timestamp(&state.updated_at),
    ) {
        println!("  last activity {}s after creation", (updated - created).num_seconds());
    }
    for stage in &state.stages {
        let mut line = format!("  {:<20} {}", stage.name, stage.status);
        if stage.executions > 1 {
            line.push_str(&format!(" after {} executions", stage.executions));
        }
        if let Some(error) = stage.error.as_deref().filter(|_| stage.status != StageStatus::Completed) {
            line.push_str(&format!(": {error}"));
        }
        println!("{line}");
    }
    if let Some(reason) = &state.pause_reason {
        println!("  paused: {reason}");
    }
    if let Some(failure) = &state.failure {
        println!("  failed ({}): {}", failure.kind, failure.message);
    }
}

async fn cmd_start(orchestrator: &Orchestrator, path: &Path, run_id: Option<String>) -> Result<ExitCode> {
    let mut config = load_config(path)?;
    if let Some(run_id) = run_id {
        config = config.with_run_id(run_id);
    }
    let mut run = orchestrator.start(config).context("Failed to start run")?;
    info!(run_id = %run.run_id(), "Starting run");
    let state = run.run_to_completion().await.context("Run aborted")?;
    print_summary(&state);
    Ok(exit_code(&state))
}

async fn cmd_resume(
    orchestrator: &Orchestrator,
    run_id: &str,
    config: Option<&Path>,
    retry_failed: bool,
) -> Result<ExitCode> {
    // Stored configs never hold credentials, so they are resolved again here.
    let mut config = match config {
        Some(path) => load_config(path)?,
        None => orchestrator
            .store()
            .load_config(run_id)
            .with_context(|| format!("Failed to load config of run {run_id}"))?,
    };
    resolve_credentials(&mut config);

    let mut options = ResumeOptions::default();
    if retry_failed {
        options = options.retry_failed();
    }
    let mut run = orchestrator
        .resume_with(run_id, Some(config), options)
        .with_context(|| format!("Failed to resume run {run_id}"))?;
    let state = run.run_to_completion().await.context("Run aborted")?;
    print_summary(&state);
    Ok(exit_code(&state))
}

fn cmd_status(orchestrator: &Orchestrator, run_id: &str, json: bool) -> Result<ExitCode> {
    let state = orchestrator.status(run_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print_summary(&state);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let orchestrator = Orchestrator::new(&cli.root);
    match cli.command {
        Commands::Start { config, run_id } => cmd_start(&orchestrator, &config, run_id).await,
        Commands::Resume {
            run_id,
            config,
            retry_failed,
        } => cmd_resume(&orchestrator, &run_id, config.as_deref(), retry_failed).await,
        Commands::Status { run_id, json } => cmd_status(&orchestrator, &run_id, json),
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            err.chain()
                .find_map(|cause| cause.downcast_ref::<InkflowError>())
                .map_or(ExitCode::INTERNAL, InkflowError::exit_code)
        }
    };
    std::process::ExitCode::from(u8::try_from(code.as_i32()).unwrap_or(1))
}
