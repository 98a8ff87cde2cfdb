use std::sync::Arc;
use std::time::Duration;

use drover_rpc::{Connector, Transport, WorkerClient};
use futures::future::join_all;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info};

use super::{Controller, ControllerState};
use crate::error::SchedulerError;
use crate::pool::{resolve_pool_size, WorkerPool};

type BarrierResult = Result<Vec<Arc<dyn WorkerClient>>, SchedulerError>;

impl Controller {
    /// Spawn the pool and open a channel to every worker.
    ///
    /// Returns once the controller is Ready. Any spawn or connection failure
    /// kills the workers and is returned; no task is dispatched in that case.
    pub async fn connect(&mut self) -> Result<(), SchedulerError> {
        match self.state {
            ControllerState::Disconnected => {}
            ControllerState::Ready => return Ok(()),
            other => {
                return Err(SchedulerError::State(format!(
                    "{other}, expected disconnected to connect"
                )))
            }
        }

        if let Err(e) = self.connect_pool().await {
            self.abort(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn connect_pool(&mut self) -> Result<(), SchedulerError> {
        let pool_config = &self.config.pool;
        let size = resolve_pool_size(pool_config.cores);
        self.pool = WorkerPool::spawn(
            self.spawner.as_ref(),
            &pool_config.host,
            pool_config.base_port,
            size,
            self.exits_tx.clone(),
        )
        .await?;
        self.set_state(ControllerState::Connecting);

        let (tx, rx) = oneshot::channel();
        let connector = Arc::clone(&self.connector);
        let transports = self.pool.transports();
        let startup_delay = self.config.timing.startup_delay();
        let barrier = tokio::spawn(async move {
            let _ = tx.send(join_barrier(connector, transports, startup_delay).await);
        });

        let outcome = self.poll_barrier(rx).await;
        barrier.abort();
        let clients = outcome?;

        for (slot, client) in clients.into_iter().enumerate() {
            self.pool.attach(slot, client);
        }
        self.set_state(ControllerState::Ready);
        info!(workers = self.pool.len(), "all workers connected");

        self.schedule_status_probe();
        Ok(())
    }

    /// Check for the barrier's result every `start_poll` instead of blocking
    /// on it, so a worker dying during startup is noticed.
    async fn poll_barrier(
        &mut self,
        mut rx: oneshot::Receiver<BarrierResult>,
    ) -> BarrierResult {
        let poll = self.config.timing.start_poll();
        loop {
            match rx.try_recv() {
                Ok(result) => return result,
                Err(TryRecvError::Closed) => {
                    return Err(SchedulerError::State(
                        "connecting, but the connection barrier vanished".into(),
                    ))
                }
                Err(TryRecvError::Empty) => {}
            }

            if let Ok(exit) = self.exits_rx.try_recv() {
                let address = self
                    .pool
                    .slot_of_port(exit.port)
                    .and_then(|slot| self.pool.handle(slot))
                    .map(|h| h.address())
                    .unwrap_or_else(|| exit.port.to_string());
                return Err(SchedulerError::Connect {
                    address,
                    reason: exit.to_string(),
                });
            }

            debug!(poll = ?poll, "workers not connected yet");
            tokio::time::sleep(poll).await;
        }
    }
}

/// Wait `startup_delay`, then connect to every worker at once.
///
/// Fails as a whole if any single connection fails, naming the first failed
/// worker in pool order.
async fn join_barrier(
    connector: Arc<dyn Connector>,
    transports: Vec<Transport>,
    startup_delay: Duration,
) -> BarrierResult {
    tokio::time::sleep(startup_delay).await;

    let attempts = transports.iter().map(|t| connector.connect(t));
    let results = join_all(attempts).await;

    let mut clients = Vec::with_capacity(results.len());
    for (transport, result) in transports.iter().zip(results) {
        match result {
            Ok(client) => {
                debug!(worker = %transport, "connected");
                clients.push(client);
            }
            Err(e) => {
                return Err(SchedulerError::Connect {
                    address: transport.address(),
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok(clients)
}
