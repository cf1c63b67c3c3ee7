//! Arbor CLI - run a bounded supervisor tree over an interactive program
//!
//! Usage:
//!   arbor init                          Write .arbor/config.toml
//!   arbor run <request> --program <bin> Run a request to completion
//!   arbor runs                          List Run Records
//!   arbor status <run_id>               Show one run's progress
//!   arbor events <run_id>               Print a run's Monitor events

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use arbor_agent::{Pattern, ProcessSpec, PtyExecutor, ResilienceLayer};
use arbor_core::{ArborConfig, FileStateStore, RunId, RunStatus, StateReader};
use arbor_orchestrator::{
    Coordinator, EventLog, LineSplit, MultiLine, RunRequest, RunResult, RunService,
};

#[derive(Parser)]
#[command(name = "arbor")]
#[command(author, version, about = "Bounded-depth process supervision tree")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Project root holding .arbor/
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Init,

    /// Run a request through the supervisor tree
    Run {
        /// Request text; top-level lines become subtasks, indented lines
        /// their bodies. Use @FILE to read it from a file.
        request: String,

        /// Program each worker drives on a pseudo-terminal
        #[arg(long)]
        program: String,

        /// Arguments for the program (repeatable)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Working directory for the program
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// Regex the program prints when ready for input
        #[arg(long)]
        ready: Option<String>,

        /// Regex that marks a subtask as done
        #[arg(long)]
        success: Option<String>,

        /// Regex that marks a subtask as failed
        #[arg(long)]
        failure: Option<String>,

        /// Lower the configured recursion ceiling for this run
        #[arg(long)]
        max_depth: Option<u32>,

        /// Hard limit per worker process, in seconds
        #[arg(long, default_value = "600")]
        timeout: u64,

        /// Print the final result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List Run Records
    Runs,

    /// Show status and worker counts for a run
    Status {
        run_id: String,
    },

    /// Print a run's Monitor events
    Events {
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging (stderr, so --json output stays clean)
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("ARBOR_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init => cmd_init(&cli.root),
        Commands::Run {
            request,
            program,
            args,
            workdir,
            ready,
            success,
            failure,
            max_depth,
            timeout,
            json,
        } => {
            let spec = ProcessSpec::new(program)
                .with_args(args)
                .with_timeout(Duration::from_secs(timeout));
            let spec = match workdir {
                Some(dir) => spec.with_workdir(dir),
                None => spec,
            };
            let patterns = Patterns {
                ready,
                success,
                failure,
            };
            cmd_run(&cli.root, request, spec, patterns, max_depth, json).await
        }
        Commands::Runs => cmd_runs(&cli.root).await,
        Commands::Status { run_id } => cmd_status(&cli.root, run_id).await,
        Commands::Events { run_id } => cmd_events(&cli.root, run_id).await,
    }
}

struct Patterns {
    ready: Option<String>,
    success: Option<String>,
    failure: Option<String>,
}

/// Config from `.arbor/config.toml` plus `ARBOR_*` overrides, with the
/// state dir resolved against the project root
fn load_config(root: &Path) -> Result<ArborConfig> {
    let mut config = ArborConfig::load_or_default(root)
        .context("Failed to load .arbor/config.toml")?
        .with_env_overrides()?;
    config.validate()?;
    if config.state_dir.is_relative() {
        config.state_dir = root.join(&config.state_dir);
    }
    Ok(config)
}

fn cmd_init(root: &Path) -> Result<()> {
    let path = ArborConfig::write_default(root).context("Failed to write config")?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn cmd_run(
    root: &Path,
    request: String,
    spec: ProcessSpec,
    patterns: Patterns,
    max_depth: Option<u32>,
    json: bool,
) -> Result<()> {
    let config = load_config(root)?;
    let request = match request.strip_prefix('@') {
        Some(file) => tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("Failed to read request file {}", file))?,
        None => request,
    };

    let store = Arc::new(FileStateStore::open(&config.state_dir).await?);
    let log = Arc::new(EventLog::new(&config.state_dir));
    let resilience = Arc::new(ResilienceLayer::new(config.resilience.clone()));

    let mut executor = PtyExecutor::new(spec, Arc::clone(&resilience)).with_close_input();
    if let Some(expr) = &patterns.ready {
        executor = executor.with_ready(Pattern::regex(expr)?);
    }
    if let Some(expr) = &patterns.success {
        executor = executor.with_success(Pattern::regex(expr)?);
    }
    if let Some(expr) = &patterns.failure {
        executor = executor.with_failure(Pattern::regex(expr)?);
    }

    let coordinator = Coordinator::new(config, store, Arc::new(executor))
        .with_decomposer(Arc::new(LineSplit))
        .with_judge(Arc::new(MultiLine::default()))
        .with_resilience(resilience)
        .with_event_log(Arc::clone(&log));
    let service = RunService::new(coordinator).with_event_log(log);

    let mut req = RunRequest::new(request);
    req.max_depth = max_depth;
    let accepted = service.submit(req)?;
    info!(run_id = %accepted.run_id, "Run accepted");

    let result = tokio::select! {
        result = service.wait(&accepted.run_id) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; cancelling run tree");
            service.cancel(&accepted.run_id);
            service.wait(&accepted.run_id).await?
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result, 0);
    }
    if result.status != RunStatus::Completed {
        bail!("run {} {}", result.run_id, result.status);
    }
    Ok(())
}

fn print_result(result: &RunResult, indent: usize) {
    let pad = "  ".repeat(indent);
    println!(
        "{}{} depth={} {}{}",
        pad,
        result.run_id,
        result.depth,
        result.status,
        if result.degraded { " (degraded)" } else { "" }
    );
    for worker in &result.workers {
        let error = worker
            .error
            .as_deref()
            .map(|e| format!(": {}", e))
            .unwrap_or_default();
        println!(
            "{}  {} #{} {}{}",
            pad, worker.title, worker.attempt, worker.status, error
        );
    }
    for warning in &result.warnings {
        println!("{}  ! {}", pad, warning);
    }
    for child in &result.children {
        print_result(child, indent + 1);
    }
    if indent == 0 && !result.summary.is_empty() {
        println!("{}", result.summary);
    }
}

async fn cmd_runs(root: &Path) -> Result<()> {
    let config = load_config(root)?;
    let store = FileStateStore::open(&config.state_dir).await?;
    let mut runs = store.list_runs().await?;
    runs.sort_by_key(|r| r.created_at);

    if runs.is_empty() {
        println!("No runs");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  depth={}  {:<10}  {}{}",
            run.run_id,
            run.depth,
            run.status.to_string(),
            run.request,
            if run.degraded { "  (degraded)" } else { "" }
        );
    }
    Ok(())
}

async fn cmd_status(root: &Path, run_id: String) -> Result<()> {
    let config = load_config(root)?;
    let store = FileStateStore::open(&config.state_dir).await?;
    let run_id = RunId::from(run_id);
    let run = store
        .get_run(&run_id)
        .await?
        .with_context(|| format!("No such run: {}", run_id))?;

    println!("{}  depth={}  {}", run.run_id, run.depth, run.status);
    if let Some(error) = &run.error {
        println!("error: {}", error);
    }
    for worker in store.list_workers(&run_id).await? {
        println!(
            "  {}  {:<10}  #{}  {}",
            worker.worker_id,
            worker.status.to_string(),
            worker.attempt,
            worker.task_summary
        );
    }
    Ok(())
}

async fn cmd_events(root: &Path, run_id: String) -> Result<()> {
    let config = load_config(root)?;
    let log = EventLog::new(&config.state_dir);
    for line in log.replay(&RunId::from(run_id)).await? {
        println!("{}", line.to_line()?);
    }
    Ok(())
}
