//! Worker process: serves `run`, `status` and `terminate` on one port.
//!
//! Launched by the controller as `drover-worker <port> --host <host> --grace-ms <ms>`.
//! Exits after acknowledging `terminate`, or on SIGINT/SIGTERM.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use drover_rpc::{Transport, WorkerServer};

#[derive(Parser, Debug)]
#[command(name = "drover-worker", version, about = "Drover worker process")]
struct Cli {
    /// Port to listen on.
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Worker name used in status replies (default: `worker-<port>`).
    #[arg(long)]
    name: Option<String>,

    /// Milliseconds to linger after acknowledging terminate.
    #[arg(long, env = "DROVER_TIMING_TERMINATE_GRACE_MS", default_value_t = 500)]
    grace_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let name = cli.name.unwrap_or_else(|| format!("worker-{}", cli.port));
    let transport = Transport::tcp(&cli.host, cli.port);

    let server = WorkerServer::bind(&transport, &name, Duration::from_millis(cli.grace_ms))
        .await
        .with_context(|| format!("failed to bind {transport}"))?;
    info!(worker = %name, address = %transport, pid = std::process::id(), "worker started");

    server.serve().await.context("worker failed")?;
    info!(worker = %name, "worker exited");
    Ok(())
}
