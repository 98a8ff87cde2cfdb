//! Launching worker processes and watching them exit.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use drover_rpc::Transport;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reported once per worker process when it is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub port: u16,
    /// Exit code, `None` when killed by a signal or on request.
    pub code: Option<i32>,
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "worker process on port {} exited with code {code}", self.port),
            None => write!(f, "worker process on port {} was killed", self.port),
        }
    }
}

/// A launched worker: its pid plus the task watching it.
///
/// The watcher kills the process when asked, or when this value is dropped.
pub struct SpawnedWorker {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl SpawnedWorker {
    /// `monitor` must finish once the process is gone and must treat a
    /// message (or a closed channel) on the receiving end of `kill` as a
    /// request to kill the process.
    pub fn new(pid: Option<u32>, kill: oneshot::Sender<()>, monitor: JoinHandle<()>) -> Self {
        Self {
            pid,
            kill: Some(kill),
            monitor: Some(monitor),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn kill(&mut self) {
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the process to be gone. Returns immediately on later calls.
    pub(crate) async fn wait(&mut self) {
        if let Some(monitor) = self.monitor.as_mut() {
            let _ = monitor.await;
            self.monitor = None;
        }
    }
}

/// Launches one worker process listening on `transport`.
///
/// Failure to launch is reported synchronously. Once running, the process's
/// exit must be reported on `exits`.
pub trait Spawner: Send + Sync {
    fn spawn(
        &self,
        transport: &Transport,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> std::io::Result<SpawnedWorker>;
}

/// Spawns `drover-worker` style executables:
/// `<program> [args..] <port> --host <host> --grace-ms <ms>`.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    grace: Duration,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, grace: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            grace,
        }
    }

    /// Arguments placed before the port, for launcher-style programs.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(
        &self,
        transport: &Transport,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> std::io::Result<SpawnedWorker> {
        let port = transport.port;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(port.to_string())
            .arg("--host")
            .arg(&transport.host)
            .arg("--grace-ms")
            .arg(self.grace.as_millis().to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        info!(program = %self.program.display(), port, pid = ?pid, "spawned worker process");

        pipe_output(&mut child, port);

        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(watch(child, port, kill_rx, exits));
        Ok(SpawnedWorker::new(pid, kill_tx, monitor))
    }
}

/// Forward the child's stdout/stderr line by line under a `worker:<port>` prefix.
fn pipe_output(child: &mut Child, port: u16) {
    let prefix = format!("worker:{port} │ ");

    if let Some(stdout) = child.stdout.take() {
        let prefix = prefix.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                println!("{prefix}{line}");
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                eprintln!("{prefix}{line}");
            }
        });
    }
}

async fn watch(
    mut child: Child,
    port: u16,
    kill_rx: oneshot::Receiver<()>,
    exits: mpsc::UnboundedSender<WorkerExit>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };

    let code = match exited {
        Some(Ok(status)) => {
            debug!(port, status = %status, "worker process exited");
            status.code()
        }
        Some(Err(e)) => {
            warn!(port, error = %e, "failed to wait on worker process");
            None
        }
        None => {
            if let Err(e) = child.kill().await {
                warn!(port, error = %e, "failed to kill worker process");
            }
            debug!(port, "worker process killed");
            None
        }
    };

    let _ = exits.send(WorkerExit { port, code });
}
