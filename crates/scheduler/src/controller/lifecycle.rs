use std::sync::Arc;
use std::time::Instant;

use drover_core::{DroverConfig, Payload, Task, TaskId};
use drover_rpc::{Connector, ZmqConnector};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{ControllerState, RunEvent, RunReport};
use crate::error::SchedulerError;
use crate::pool::{ProcessSpawner, Spawner, WorkerExit, WorkerPool};

/// Assigns a batch of tasks to a pool of worker processes.
///
/// All bookkeeping (task status, handle status) is mutated only from the
/// controller's own control flow. Remote calls run as spawned tasks that
/// report back over a channel, and each report triggers one scheduling pass.
pub struct Controller {
    pub(super) config: DroverConfig,
    pub(super) spawner: Arc<dyn Spawner>,
    pub(super) connector: Arc<dyn Connector>,
    pub(super) tasks: Vec<Task>,
    pub(super) pool: WorkerPool,
    pub(super) state: ControllerState,
    pub(super) events_tx: mpsc::UnboundedSender<RunEvent>,
    pub(super) events_rx: mpsc::UnboundedReceiver<RunEvent>,
    pub(super) exits_tx: mpsc::UnboundedSender<WorkerExit>,
    pub(super) exits_rx: mpsc::UnboundedReceiver<WorkerExit>,
    pub(super) probe: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new(
        config: DroverConfig,
        spawner: Arc<dyn Spawner>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            config,
            spawner,
            connector,
            tasks: Vec::new(),
            pool: WorkerPool::default(),
            state: ControllerState::Disconnected,
            events_tx,
            events_rx,
            exits_tx,
            exits_rx,
            probe: None,
        }
    }

    /// Controller over real worker processes and ZeroMQ channels.
    pub fn launch(config: DroverConfig) -> Self {
        let spawner = ProcessSpawner::new(
            config.pool.worker_program.clone(),
            config.timing.terminate_grace(),
        )
        .with_args(config.pool.worker_args.clone());
        let connector = ZmqConnector::new(config.timing.connect_timeout());
        Self::new(config, Arc::new(spawner), Arc::new(connector))
    }

    /// Append tasks to the batch. Ids continue in submission order.
    pub fn submit<I, S>(&mut self, batch: I) -> Vec<TaskId>
    where
        I: IntoIterator<Item = (S, Payload)>,
        S: Into<String>,
    {
        let mut ids = Vec::new();
        for (name, payload) in batch {
            let id = TaskId(self.tasks.len());
            let task = Task::new(id, name, payload);
            debug!(task = %id, name = %task.name, "submitted");
            self.tasks.push(task);
            ids.push(id);
        }
        ids
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Ready, or in the middle of a run. False again once terminated.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ControllerState::Ready | ControllerState::Dispatching | ControllerState::Draining
        )
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Connect (if not already Ready), run the batch to the end, and shut the
    /// workers down.
    ///
    /// The first fatal error kills every worker process and is returned.
    pub async fn start(&mut self) -> Result<RunReport, SchedulerError> {
        let started = Instant::now();

        if self.state == ControllerState::Disconnected {
            self.connect().await?;
        }
        if self.state != ControllerState::Ready {
            return Err(SchedulerError::State(format!(
                "{}, expected ready to start",
                self.state
            )));
        }

        info!(tasks = self.tasks.len(), workers = self.pool.len(), "starting run");
        if let Err(e) = self.run_to_completion().await {
            self.abort(&e).await;
            return Err(e);
        }

        let report = RunReport {
            tasks: self.tasks.clone(),
            workers: self.pool.len(),
            elapsed: started.elapsed(),
        };
        info!(
            completed = report.completed(),
            failed = report.failed(),
            elapsed = ?report.elapsed,
            "run finished"
        );
        Ok(report)
    }

    pub(super) fn set_state(&mut self, next: ControllerState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "controller state");
            self.state = next;
        }
    }

    /// Fatal path: stop scheduling and kill every worker process.
    pub(super) async fn abort(&mut self, cause: &SchedulerError) {
        error!(error = %cause, "run aborted, killing workers");
        self.set_state(ControllerState::Terminated);
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
        self.pool.detach_all();
        self.pool.kill_all().await;
    }
}
