use std::sync::Arc;

use drover_rpc::WorkerClient;
use futures::future::join_all;
use tracing::{debug, info};

use super::{Controller, ControllerState, RunEvent};
use crate::error::SchedulerError;

impl Controller {
    /// Ask every connected worker for its status, all at once.
    ///
    /// Returns `(address, status)` in pool order. Any failed probe is a
    /// remote execution error naming the worker. Outside Ready and a running
    /// batch there is nobody to ask, which is a state error.
    pub async fn check_status(&self) -> Result<Vec<(String, String)>, SchedulerError> {
        if !self.is_connected() {
            return Err(SchedulerError::State(format!(
                "{}, expected connected to check status",
                self.state
            )));
        }
        probe_all(self.pool.channels()).await
    }

    /// Probe every worker once, `status_check_delay` after Ready.
    pub(super) fn schedule_status_probe(&mut self) {
        let Some(delay) = self.config.timing.status_check_delay() else {
            return;
        };
        let channels = self.pool.channels();
        let events = self.events_tx.clone();
        debug!(delay = ?delay, "status probe scheduled");
        self.probe = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(RunEvent::StatusChecked(probe_all(channels).await));
        }));
    }

    /// Tell every worker to exit, then wait for the processes to go.
    pub(super) async fn terminate(&mut self) -> Result<(), SchedulerError> {
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
        self.set_state(ControllerState::Terminated);

        let channels = self.pool.channels();
        info!(workers = channels.len(), "broadcasting terminate");
        let acks = join_all(channels.iter().map(|(_, client)| client.terminate())).await;
        for ((worker, _), ack) in channels.iter().zip(acks) {
            match ack {
                Ok(message) => debug!(worker = %worker, ack = %message, "terminate acknowledged"),
                Err(e) => {
                    return Err(SchedulerError::RemoteExecution {
                        worker: worker.clone(),
                        task: None,
                        reason: format!("terminate failed: {e}"),
                    })
                }
            }
        }

        self.pool.detach_all();
        self.pool
            .shutdown(self.config.timing.shutdown_timeout())
            .await;
        Ok(())
    }
}

async fn probe_all(
    channels: Vec<(String, Arc<dyn WorkerClient>)>,
) -> Result<Vec<(String, String)>, SchedulerError> {
    let replies = join_all(channels.iter().map(|(_, client)| client.status())).await;
    channels
        .into_iter()
        .zip(replies)
        .map(|((worker, _), reply)| match reply {
            Ok(status) => Ok((worker, status)),
            Err(e) => Err(SchedulerError::RemoteExecution {
                worker,
                task: None,
                reason: format!("status failed: {e}"),
            }),
        })
        .collect()
}
