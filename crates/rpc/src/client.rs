//! Controller-side view of a worker.
//!
//! [`WorkerClient`] and [`Connector`] are the seams the scheduler talks to;
//! [`ZmqWorkerClient`] and [`ZmqConnector`] are the real implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drover_core::{Payload, TaskId, TaskOutput};
use tracing::{debug, instrument};

use crate::envelope::Envelope;
use crate::error::RpcError;
use crate::protocol::{WorkerRequest, WorkerResponse};
use crate::reqrep::ZmqRequestClient;
use crate::transport::Transport;

/// Remote operations exposed by one worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Execute `payload` on the worker. Waits as long as the payload runs.
    async fn run(&self, task_id: TaskId, payload: &Payload) -> Result<TaskOutput, RpcError>;

    /// Liveness probe; returns the worker's status string.
    async fn status(&self) -> Result<String, RpcError>;

    /// Ask the worker to exit; returns its acknowledgement.
    async fn terminate(&self) -> Result<String, RpcError>;
}

/// Opens a [`WorkerClient`] to a worker address.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, transport: &Transport) -> Result<Arc<dyn WorkerClient>, RpcError>;
}

pub struct ZmqWorkerClient {
    transport: Transport,
    inner: ZmqRequestClient,
}

impl ZmqWorkerClient {
    pub async fn connect(transport: &Transport) -> Result<Self, RpcError> {
        let inner = ZmqRequestClient::connect(transport).await?;
        Ok(Self {
            transport: transport.clone(),
            inner,
        })
    }

    async fn exchange(&self, request: WorkerRequest) -> Result<WorkerResponse, RpcError> {
        let envelope = Envelope::request(request.topic(), &request)?;
        let reply = self.inner.call(envelope).await?;
        match reply.decode_body::<WorkerResponse>()? {
            WorkerResponse::Error { message } => Err(RpcError::Remote(message)),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl WorkerClient for ZmqWorkerClient {
    #[instrument(skip(self, payload), fields(worker = %self.transport, task = %task_id))]
    async fn run(&self, task_id: TaskId, payload: &Payload) -> Result<TaskOutput, RpcError> {
        let request = WorkerRequest::Run {
            task_id,
            payload: payload.clone(),
        };
        match self.exchange(request).await? {
            WorkerResponse::Ran { output } => {
                debug!(output = %output, "run reply");
                Ok(output)
            }
            other => Err(RpcError::UnexpectedReply(format!("{other:?} to run"))),
        }
    }

    async fn status(&self) -> Result<String, RpcError> {
        match self.exchange(WorkerRequest::Status).await? {
            WorkerResponse::Status { message } => Ok(message),
            other => Err(RpcError::UnexpectedReply(format!("{other:?} to status"))),
        }
    }

    async fn terminate(&self) -> Result<String, RpcError> {
        match self.exchange(WorkerRequest::Terminate).await? {
            WorkerResponse::Terminating { message } => Ok(message),
            other => Err(RpcError::UnexpectedReply(format!("{other:?} to terminate"))),
        }
    }
}

/// Connects over ZeroMQ, giving up after `connect_timeout`.
///
/// A DEALER connect retries silently while nothing listens on the port, so
/// the deadline is what turns a missing worker into an error.
#[derive(Debug, Clone)]
pub struct ZmqConnector {
    connect_timeout: Duration,
}

impl ZmqConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for ZmqConnector {
    async fn connect(&self, transport: &Transport) -> Result<Arc<dyn WorkerClient>, RpcError> {
        match tokio::time::timeout(self.connect_timeout, ZmqWorkerClient::connect(transport)).await
        {
            Ok(Ok(client)) => Ok(Arc::new(client)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::Timeout(self.connect_timeout)),
        }
    }
}
