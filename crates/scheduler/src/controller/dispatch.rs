use std::sync::Arc;

use drover_core::{TaskId, TaskOutput, TaskStatus};
use drover_rpc::RpcError;
use tracing::{debug, info, warn};

use super::{Controller, ControllerState, RunEvent};
use crate::error::SchedulerError;
use crate::pool::{WorkerExit, WorkerStatus};

enum Next {
    Event(RunEvent),
    Exit(WorkerExit),
    Closed,
}

impl Controller {
    /// Kick off the first pass, then run one pass per completion until the
    /// terminate broadcast.
    pub(super) async fn run_to_completion(&mut self) -> Result<(), SchedulerError> {
        self.schedule_pass().await?;

        while self.state != ControllerState::Terminated {
            let next = tokio::select! {
                Some(event) = self.events_rx.recv() => Next::Event(event),
                Some(exit) = self.exits_rx.recv() => Next::Exit(exit),
                else => Next::Closed,
            };

            match next {
                Next::Event(RunEvent::Finished { slot, task, result }) => {
                    self.on_finished(slot, task, result)?;
                    self.schedule_pass().await?;
                }
                Next::Event(RunEvent::StatusChecked(result)) => {
                    for (worker, status) in result? {
                        info!(worker = %worker, status = %status, "worker status");
                    }
                }
                Next::Exit(exit) => self.on_exit(exit)?,
                Next::Closed => {
                    return Err(SchedulerError::State(
                        "running, but its event channels closed".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// One scheduling pass.
    ///
    /// Terminates when nothing is pending or running; otherwise pairs pending
    /// tasks (submission order) with idle workers (pool order) and dispatches
    /// `min(pending, idle)` runs.
    pub(super) async fn schedule_pass(&mut self) -> Result<(), SchedulerError> {
        let pending: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.status() == TaskStatus::Created)
            .map(|t| t.id)
            .collect();
        let running = self.running_count();

        if pending.is_empty() && running == 0 {
            return self.terminate().await;
        }

        let idle = self.pool.idle_count();
        if pending.is_empty() || idle == 0 {
            debug!(pending = pending.len(), running, idle, "nothing to assign this pass");
            self.set_state(ControllerState::Draining);
            return self.verify_assignments();
        }

        self.set_state(ControllerState::Dispatching);
        let pairs = pending.len().min(idle);
        for &id in pending.iter().take(pairs) {
            self.dispatch(id)?;
        }
        debug!(assigned = pairs, pending = pending.len() - pairs, "scheduling pass done");

        self.set_state(ControllerState::Draining);
        self.verify_assignments()
    }

    fn dispatch(&mut self, id: TaskId) -> Result<(), SchedulerError> {
        let slot = self
            .pool
            .allocate(id)
            .ok_or_else(|| SchedulerError::Allocation {
                reason: format!("no idle worker for {id} although the pass counted one"),
            })?;
        let handle = &self.pool.handles()[slot];
        let client = handle
            .channel()
            .map(Arc::clone)
            .ok_or_else(|| SchedulerError::Allocation {
                reason: format!("worker {} allocated without a channel", handle.address()),
            })?;
        let worker = handle.address();

        let task = &mut self.tasks[id.0];
        task.start(slot)?;
        let payload = task.payload.clone();
        info!(task = %id, name = %task.name, worker = %worker, "dispatched");

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = client.run(id, &payload).await;
            let _ = events.send(RunEvent::Finished {
                slot,
                task: id,
                result,
            });
        });
        Ok(())
    }

    /// Record a resolved `run`. A failed run fails the batch.
    fn on_finished(
        &mut self,
        slot: usize,
        id: TaskId,
        result: Result<TaskOutput, RpcError>,
    ) -> Result<(), SchedulerError> {
        let worker = self.worker_address(slot);
        let task = self
            .tasks
            .get_mut(id.0)
            .ok_or_else(|| SchedulerError::Allocation {
                reason: format!("completion for unknown {id}"),
            })?;

        let outcome = match result {
            Ok(output) => {
                info!(task = %id, worker = %worker, output = %output, "task completed");
                task.complete(output)?;
                Ok(())
            }
            Err(e) => {
                warn!(task = %id, worker = %worker, error = %e, "task failed");
                task.fail(e.to_string())?;
                Err(SchedulerError::RemoteExecution {
                    worker,
                    task: Some(id),
                    reason: e.to_string(),
                })
            }
        };

        self.pool.release(slot);
        self.verify_assignments()?;
        outcome
    }

    /// A worker process went away before it was told to: its channel is
    /// broken, and any task it was running fails.
    fn on_exit(&mut self, exit: WorkerExit) -> Result<(), SchedulerError> {
        let Some(slot) = self.pool.slot_of_port(exit.port) else {
            debug!(port = exit.port, "exit from a process outside the pool");
            return Ok(());
        };
        let worker = self.worker_address(slot);

        let lost = self.pool.mark_unreachable(slot);
        if let Some(id) = lost {
            if let Some(task) = self.tasks.get_mut(id.0) {
                task.fail(format!("channel broke: {exit}"))?;
            }
        }
        warn!(worker = %worker, task = ?lost, %exit, "worker process exited unexpectedly");

        Err(SchedulerError::RemoteExecution {
            worker,
            task: lost,
            reason: format!("channel broke: {exit}"),
        })
    }

    /// Busy handles and Running tasks must pair up one to one.
    pub(super) fn verify_assignments(&self) -> Result<(), SchedulerError> {
        let running = self.running_count();
        let busy = self.pool.busy_count();
        if busy != running {
            return Err(SchedulerError::Allocation {
                reason: format!("{busy} busy workers but {running} running tasks"),
            });
        }

        for (slot, handle) in self.pool.handles().iter().enumerate() {
            if handle.status() != WorkerStatus::Busy {
                continue;
            }
            let paired = handle
                .current_task()
                .and_then(|id| self.tasks.get(id.0))
                .is_some_and(|t| t.status() == TaskStatus::Running && t.assigned_to() == Some(slot));
            if !paired {
                return Err(SchedulerError::Allocation {
                    reason: format!(
                        "worker {} is busy with {:?}, which is not running there",
                        handle.address(),
                        handle.current_task()
                    ),
                });
            }
        }
        Ok(())
    }

    fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status() == TaskStatus::Running)
            .count()
    }

    fn worker_address(&self, slot: usize) -> String {
        self.pool
            .handle(slot)
            .map(|h| h.address())
            .unwrap_or_else(|| format!("slot {slot}"))
    }
}
