//! The typed contract a worker process serves.
//!
//! Three operations, each a request topic with a `.reply` counterpart:
//! `run` executes a payload, `status` probes liveness, `terminate` asks the
//! worker to exit after acknowledging.

use drover_core::{Payload, TaskId, TaskOutput};
use serde::{Deserialize, Serialize};

/// Topic constants. Requests follow `drover.worker.<op>`.
pub mod topics {
    pub const RUN: &str = "drover.worker.run";
    pub const STATUS: &str = "drover.worker.status";
    pub const TERMINATE: &str = "drover.worker.terminate";

    /// Reply topic for a request topic.
    pub fn reply(topic: &str) -> String {
        format!("{topic}.reply")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Execute `payload` and answer with its output.
    Run { task_id: TaskId, payload: Payload },
    Status,
    Terminate,
}

impl WorkerRequest {
    pub fn topic(&self) -> &'static str {
        match self {
            WorkerRequest::Run { .. } => topics::RUN,
            WorkerRequest::Status => topics::STATUS,
            WorkerRequest::Terminate => topics::TERMINATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ran { output: TaskOutput },
    Status { message: String },
    /// Sent before the worker stops serving.
    Terminating { message: String },
    /// The request could not be decoded or the payload failed.
    Error { message: String },
}
