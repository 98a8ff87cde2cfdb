//! Run a batch of tasks on one worker process per core.
//!
//! # Usage
//!
//! ```bash
//! # Default demonstration batch, one worker per core
//! drover run
//!
//! # Explicit config, pool size and worker binary
//! drover run --config drover.toml --workers 4 --worker-program ./target/debug/drover-worker
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use drover_core::{load_dotenv, DroverConfig, TaskStatus};
use drover_scheduler::{Controller, RunReport};

#[derive(Parser, Debug)]
#[command(name = "drover", version, about = "Distribute a task batch across local worker processes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn the worker pool, run every task, and shut the pool down.
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Path to the config file. `drover.toml` is used when present.
    #[arg(long, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,

    /// Number of workers (default: one per detected core).
    #[arg(long, env = "DROVER_POOL_CORES")]
    workers: Option<usize>,

    /// Port of the first worker.
    #[arg(long, env = "DROVER_POOL_BASE_PORT")]
    base_port: Option<u16>,

    /// Worker executable.
    #[arg(long, env = "DROVER_POOL_WORKER_PROGRAM")]
    worker_program: Option<PathBuf>,

    /// Print the run report as JSON instead of one line per task.
    #[arg(long)]
    json: bool,
}

const DEFAULT_CONFIG: &str = "drover.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    load_dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config.pool.cores = Some(workers);
    }
    if let Some(port) = args.base_port {
        config.pool.base_port = port;
    }
    if let Some(program) = args.worker_program {
        config.pool.worker_program = program;
    }
    config.pool.worker_program = resolve_worker_program(&config.pool.worker_program);
    config.validate().context("invalid configuration")?;
    config.log_summary();

    let batch = config.batch();
    let mut controller = Controller::launch(config);
    controller.submit(batch);

    let report = controller.start().await.context("run failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<DroverConfig> {
    match path {
        Some(path) => DroverConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => DroverConfig::from_file(DEFAULT_CONFIG)
            .with_context(|| format!("failed to load {DEFAULT_CONFIG}")),
        None => {
            info!("no {DEFAULT_CONFIG}, using defaults");
            let mut config = DroverConfig::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }
}

/// A bare program name resolves to the binary next to this one, if it exists.
fn resolve_worker_program(program: &Path) -> PathBuf {
    let bare = program.components().count() == 1;
    if bare {
        if let Ok(exe) = std::env::current_exe() {
            let sibling = exe.with_file_name(program);
            if sibling.exists() {
                return sibling;
            }
        }
    }
    program.to_path_buf()
}

fn print_report(report: &RunReport) {
    for task in &report.tasks {
        match (task.status(), task.output(), task.error()) {
            (TaskStatus::Completed, Some(output), _) => println!("{}: {output}", task.name),
            (TaskStatus::Failed, _, Some(error)) => println!("{}: failed: {error}", task.name),
            (status, _, _) => println!("{}: {status}", task.name),
        }
    }
    println!(
        "{} completed, {} failed on {} workers in {:.2?}",
        report.completed(),
        report.failed(),
        report.workers,
        report.elapsed
    );
}
