use serde::{Deserialize, Serialize};

use crate::error::{DroverError, Result};
use crate::payload::{Payload, TaskOutput};

/// Position of a task in its batch, assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub usize);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and Failed are final; nothing leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Created => write!(f, "created"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of submitted work.
///
/// The status only moves forward: `Created -> Running -> {Completed | Failed}`.
/// The transition methods reject anything else and leave the task untouched,
/// so the owner can treat a rejected transition as a bookkeeping bug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub payload: Payload,
    status: TaskStatus,
    /// Pool position of the worker the task was dispatched to, kept after completion.
    assigned_to: Option<usize>,
    output: Option<TaskOutput>,
    error: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, name: impl Into<String>, payload: Payload) -> Self {
        Self {
            id,
            name: name.into(),
            payload,
            status: TaskStatus::Created,
            assigned_to: None,
            output: None,
            error: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn assigned_to(&self) -> Option<usize> {
        self.assigned_to
    }

    pub fn output(&self) -> Option<&TaskOutput> {
        self.output.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the task as dispatched to the worker at pool position `slot`.
    pub fn start(&mut self, slot: usize) -> Result<()> {
        self.transition(TaskStatus::Created, TaskStatus::Running)?;
        self.assigned_to = Some(slot);
        Ok(())
    }

    pub fn complete(&mut self, output: TaskOutput) -> Result<()> {
        self.transition(TaskStatus::Running, TaskStatus::Completed)?;
        self.output = Some(output);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Running, TaskStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    fn transition(&mut self, expected: TaskStatus, to: TaskStatus) -> Result<()> {
        if self.status != expected {
            return Err(DroverError::InvalidTransition {
                task: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}
