//! The fixed, ordered set of worker processes a controller drives.
//!
//! - [`handle`]: per-worker record (address, pid, Idle/Busy/Unreachable, channel)
//! - [`spawn`]: process launching and exit monitoring

pub mod handle;
pub mod spawn;

use std::sync::Arc;
use std::time::Duration;

use drover_core::TaskId;
use drover_rpc::{Transport, WorkerClient};
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;

pub use handle::{WorkerHandle, WorkerStatus};
pub use spawn::{ProcessSpawner, SpawnedWorker, Spawner, WorkerExit};

/// Number of cores the pool sizes itself to. Falls back to 1.
pub fn detect_core_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// The override when given, otherwise the detected core count.
pub fn resolve_pool_size(cores: Option<usize>) -> usize {
    cores.unwrap_or_else(detect_core_count)
}

/// Handles in ascending port order, plus the processes behind them.
///
/// Pool order is the allocation tie-break: the lowest idle port wins.
#[derive(Default)]
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
    processes: Vec<SpawnedWorker>,
}

impl WorkerPool {
    /// Launch `count` workers on `base_port`, `base_port + 1`, ...
    ///
    /// If any launch fails, the workers already started are killed and the
    /// error names the port that failed.
    pub async fn spawn(
        spawner: &dyn Spawner,
        host: &str,
        base_port: u16,
        count: usize,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<Self, SchedulerError> {
        let mut pool = WorkerPool::default();

        for offset in 0..count {
            let port = match u16::try_from(offset)
                .ok()
                .and_then(|o| base_port.checked_add(o))
            {
                Some(port) => port,
                None => {
                    pool.kill_all().await;
                    return Err(SchedulerError::Spawn {
                        port: base_port,
                        reason: format!("worker {offset} would need a port above {}", u16::MAX),
                    });
                }
            };

            let transport = Transport::tcp(host, port);
            match spawner.spawn(&transport, exits.clone()) {
                Ok(process) => {
                    pool.handles.push(WorkerHandle::new(transport, process.pid()));
                    pool.processes.push(process);
                }
                Err(e) => {
                    warn!(port, error = %e, "worker spawn failed, killing the rest");
                    pool.kill_all().await;
                    return Err(SchedulerError::Spawn {
                        port,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(workers = count, base_port, "worker pool spawned");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    pub fn handle(&self, slot: usize) -> Option<&WorkerHandle> {
        self.handles.get(slot)
    }

    pub fn transports(&self) -> Vec<Transport> {
        self.handles.iter().map(|h| h.transport().clone()).collect()
    }

    pub fn slot_of_port(&self, port: u16) -> Option<usize> {
        self.handles.iter().position(|h| h.port() == port)
    }

    /// Connected channels, paired with the worker address.
    pub fn channels(&self) -> Vec<(String, Arc<dyn WorkerClient>)> {
        self.handles
            .iter()
            .filter_map(|h| h.channel().map(|c| (h.address(), Arc::clone(c))))
            .collect()
    }

    pub(crate) fn attach(&mut self, slot: usize, channel: Arc<dyn WorkerClient>) {
        if let Some(handle) = self.handles.get_mut(slot) {
            handle.attach(channel);
        }
    }

    /// First Idle handle in pool order, marked Busy with `task`. `None` when
    /// every handle is Busy or Unreachable.
    pub fn allocate(&mut self, task: TaskId) -> Option<usize> {
        let slot = self
            .handles
            .iter()
            .position(|h| h.status() == WorkerStatus::Idle)?;
        self.handles[slot].occupy(task);
        debug!(worker = %self.handles[slot].address(), task = %task, "allocated");
        Some(slot)
    }

    /// Mark the handle Idle. Releasing an Idle handle is a no-op.
    pub fn release(&mut self, slot: usize) {
        if let Some(handle) = self.handles.get_mut(slot) {
            handle.vacate();
        }
    }

    /// Forget every channel so nothing talks to workers that are going away.
    pub(crate) fn detach_all(&mut self) {
        for handle in self.handles.iter_mut() {
            handle.detach();
        }
    }

    /// Returns the task the worker was running, if any.
    pub(crate) fn mark_unreachable(&mut self, slot: usize) -> Option<TaskId> {
        self.handles.get_mut(slot).and_then(|h| h.mark_unreachable())
    }

    pub fn idle_count(&self) -> usize {
        self.count(WorkerStatus::Idle)
    }

    pub fn busy_count(&self) -> usize {
        self.count(WorkerStatus::Busy)
    }

    fn count(&self, status: WorkerStatus) -> usize {
        self.handles.iter().filter(|h| h.status() == status).count()
    }

    /// Wait up to `timeout` for every worker to exit, then kill the rest.
    pub async fn shutdown(&mut self, timeout: Duration) {
        let exited = tokio::time::timeout(
            timeout,
            join_all(self.processes.iter_mut().map(|p| p.wait())),
        )
        .await;

        match exited {
            Ok(_) => info!(workers = self.processes.len(), "all worker processes exited"),
            Err(_) => {
                warn!(timeout = ?timeout, "workers still running after shutdown timeout, killing");
                self.kill_all().await;
            }
        }
    }

    /// Kill every worker process now and wait for them to go.
    pub async fn kill_all(&mut self) {
        for process in self.processes.iter_mut() {
            process.kill();
        }
        join_all(self.processes.iter_mut().map(|p| p.wait())).await;
    }
}
