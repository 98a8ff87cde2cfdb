use std::sync::Arc;

use drover_core::TaskId;
use drover_rpc::{Transport, WorkerClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
    /// The backing process exited before it was told to. Never allocated again.
    Unreachable,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Controller-side record of one worker process.
///
/// Busy exactly while `current_task` is set.
pub struct WorkerHandle {
    transport: Transport,
    pid: Option<u32>,
    status: WorkerStatus,
    current_task: Option<TaskId>,
    channel: Option<Arc<dyn WorkerClient>>,
}

impl WorkerHandle {
    pub(crate) fn new(transport: Transport, pid: Option<u32>) -> Self {
        Self {
            transport,
            pid,
            status: WorkerStatus::Idle,
            current_task: None,
            channel: None,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn port(&self) -> u16 {
        self.transport.port
    }

    /// `host:port`, as used in diagnostics.
    pub fn address(&self) -> String {
        self.transport.address()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current_task
    }

    pub fn channel(&self) -> Option<&Arc<dyn WorkerClient>> {
        self.channel.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub(crate) fn attach(&mut self, channel: Arc<dyn WorkerClient>) {
        self.channel = Some(channel);
    }

    pub(crate) fn occupy(&mut self, task: TaskId) {
        self.status = WorkerStatus::Busy;
        self.current_task = Some(task);
    }

    /// Back to Idle. Leaves Idle and Unreachable handles as they are.
    pub(crate) fn vacate(&mut self) {
        if self.status == WorkerStatus::Busy {
            self.status = WorkerStatus::Idle;
        }
        self.current_task = None;
    }

    /// Drop the channel. The worker is about to exit or already has.
    pub(crate) fn detach(&mut self) {
        self.channel = None;
    }

    /// Returns the task that was running on the worker, if any.
    pub(crate) fn mark_unreachable(&mut self) -> Option<TaskId> {
        self.status = WorkerStatus::Unreachable;
        self.channel = None;
        self.current_task.take()
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("address", &self.address())
            .field("pid", &self.pid)
            .field("status", &self.status)
            .field("current_task", &self.current_task)
            .field("connected", &self.is_connected())
            .finish()
    }
}
