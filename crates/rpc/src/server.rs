//! The serving loop a worker process runs.

use std::future::Future;
use std::time::Duration;

use drover_core::Execute;
use tracing::{debug, error, info, warn};

use crate::envelope::Envelope;
use crate::error::RpcError;
use crate::protocol::{topics, WorkerRequest, WorkerResponse};
use crate::reqrep::ZmqRequestServer;
use crate::transport::Transport;

/// Answers `run` / `status` / `terminate` on one ROUTER socket.
///
/// Requests are handled one at a time in arrival order, so a status probe
/// sent while a payload runs is answered after the payload finishes.
pub struct WorkerServer {
    name: String,
    transport: Transport,
    grace: Duration,
    socket: ZmqRequestServer,
}

impl WorkerServer {
    /// Bind the worker's socket. `grace` is how long the worker lingers after
    /// acknowledging a terminate, so the reply leaves before the socket closes.
    pub async fn bind(
        transport: &Transport,
        name: impl Into<String>,
        grace: Duration,
    ) -> Result<Self, RpcError> {
        let socket = ZmqRequestServer::bind(transport).await?;
        Ok(Self {
            name: name.into(),
            transport: transport.clone(),
            grace,
            socket,
        })
    }

    /// Serve until a terminate request or SIGINT/SIGTERM.
    pub async fn serve(self) -> Result<(), RpcError> {
        self.serve_until(async {
            if let Err(e) = os_signal().await {
                warn!(error = %e, "could not install signal handlers; serving until terminated");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until a terminate request or until `shutdown` resolves.
    pub async fn serve_until<F>(mut self, shutdown: F) -> Result<(), RpcError>
    where
        F: Future<Output = ()>,
    {
        info!(worker = %self.name, address = %self.transport, "worker serving");
        tokio::pin!(shutdown);

        loop {
            let (token, request) = tokio::select! {
                _ = &mut shutdown => {
                    info!(worker = %self.name, "shutdown signal received");
                    return Ok(());
                }
                received = self.socket.recv_request() => match received {
                    Ok(pair) => pair,
                    Err(RpcError::Zmq(e)) => {
                        error!(worker = %self.name, error = %e, "socket failed");
                        return Err(RpcError::Zmq(e));
                    }
                    Err(e) => {
                        warn!(worker = %self.name, error = %e, "dropping malformed message");
                        continue;
                    }
                },
            };

            let (response, stop) = handle(&self.name, &request).await;
            let reply = request.reply(topics::reply(&request.topic), &response)?;
            self.socket.send_reply(token, reply).await?;

            if stop {
                tokio::time::sleep(self.grace).await;
                info!(worker = %self.name, "worker stopped");
                return Ok(());
            }
        }
    }
}

/// Produce the response for one request; `true` means stop serving.
async fn handle(name: &str, envelope: &Envelope) -> (WorkerResponse, bool) {
    let request = match envelope.decode_body::<WorkerRequest>() {
        Ok(r) => r,
        Err(e) => {
            warn!(worker = %name, topic = %envelope.topic, error = %e, "undecodable request");
            let message = format!("invalid request on {}: {e}", envelope.topic);
            return (WorkerResponse::Error { message }, false);
        }
    };

    match request {
        WorkerRequest::Run { task_id, payload } => {
            debug!(worker = %name, task = %task_id, label = payload.label(), "running payload");
            let outcome = tokio::task::spawn_blocking(move || payload.execute()).await;
            let response = match outcome {
                Ok(Ok(output)) => {
                    info!(worker = %name, task = %task_id, output = %output, "payload finished");
                    WorkerResponse::Ran { output }
                }
                Ok(Err(e)) => {
                    warn!(worker = %name, task = %task_id, error = %e, "payload failed");
                    WorkerResponse::Error {
                        message: e.to_string(),
                    }
                }
                Err(e) => {
                    error!(worker = %name, task = %task_id, error = %e, "payload panicked");
                    WorkerResponse::Error {
                        message: format!("{task_id} aborted: {e}"),
                    }
                }
            };
            (response, false)
        }
        WorkerRequest::Status => (
            WorkerResponse::Status {
                message: format!("worker {} operational", name),
            },
            false,
        ),
        WorkerRequest::Terminate => {
            info!(worker = %name, "terminate requested");
            (
                WorkerResponse::Terminating {
                    message: format!("worker {} terminating...", name),
                },
                true,
            )
        }
    }
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C elsewhere.
async fn os_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
