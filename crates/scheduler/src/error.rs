use drover_core::{DroverError, TaskId};
use thiserror::Error;

/// Fatal outcomes of a scheduling run. None is recovered locally.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("failed to spawn worker on port {port}: {reason}")]
    Spawn { port: u16, reason: String },

    #[error("failed to connect to worker {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("remote execution failed on worker {worker}{}: {reason}", task_suffix(.task))]
    RemoteExecution {
        worker: String,
        task: Option<TaskId>,
        reason: String,
    },

    /// Scheduler bookkeeping went wrong. Always a bug.
    #[error("allocation invariant violated: {reason}")]
    Allocation { reason: String },

    #[error("controller is {0}")]
    State(String),

    #[error(transparent)]
    Task(#[from] DroverError),
}

fn task_suffix(task: &Option<TaskId>) -> String {
    task.map(|t| format!(" ({t})")).unwrap_or_default()
}
