//! The controller: owns the batch and the pool and drives a run to the end.
//!
//! Split into focused submodules:
//! - `lifecycle`: Controller struct, construction, submission, `start`
//! - `connect`: spawning the pool and the connection barrier
//! - `dispatch`: the scheduling pass and completion/exit handling
//! - `broadcast`: status probes and the terminate broadcast

mod broadcast;
mod connect;
mod dispatch;
mod lifecycle;
#[cfg(test)]
mod tests;

use std::time::Duration;

use drover_core::{Task, TaskId, TaskOutput, TaskStatus};
use drover_rpc::RpcError;
use serde::Serialize;

use crate::error::SchedulerError;

pub use self::lifecycle::Controller;

/// `Disconnected -> Connecting -> Ready -> Dispatching <-> Draining -> Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Disconnected,
    Connecting,
    Ready,
    /// A scheduling pass is assigning tasks.
    Dispatching,
    /// Tasks are running and nothing can be assigned until one finishes.
    Draining,
    Terminated,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControllerState::Disconnected => "disconnected",
            ControllerState::Connecting => "connecting",
            ControllerState::Ready => "ready",
            ControllerState::Dispatching => "dispatching",
            ControllerState::Draining => "draining",
            ControllerState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Every submitted task, in submission order, with its final status.
    pub tasks: Vec<Task>,
    pub workers: usize,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.count(TaskStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status() == status).count()
    }
}

/// Something the scheduling loop reacts to, other than a process exit.
enum RunEvent {
    /// A dispatched `run` call resolved.
    Finished {
        slot: usize,
        task: TaskId,
        result: Result<TaskOutput, RpcError>,
    },
    /// The delayed status probe came back.
    StatusChecked(Result<Vec<(String, String)>, SchedulerError>),
}
