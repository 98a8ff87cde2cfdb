//! Request/reply over ZeroMQ DEALER/ROUTER sockets.
//!
//! ## Framing (zeromq-rs 0.4)
//!
//! ROUTER pushes the peer identity as the first frame on recv and pops it on
//! send. DEALER sends and receives raw application frames. So:
//! - DEALER sends: `[topic, envelope]`
//! - ROUTER receives: `[identity, topic, envelope]`
//! - ROUTER sends: `[identity, topic, envelope]`
//! - DEALER receives: `[topic, envelope]`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::{DealerSocket, RouterSocket, ZmqMessage};

use crate::envelope::Envelope;
use crate::error::RpcError;
use crate::transport::Transport;

/// Carries the ROUTER identity of the peer a reply must go back to.
#[derive(Debug, Clone)]
pub struct ReplyToken {
    identity: Vec<u8>,
}

type PendingReplies = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>>;

/// An outbound request plus the correlation id its caller waits on.
type Outbound = (Uuid, ZmqMessage);

/// DEALER-socket client.
///
/// A background task owns the socket and multiplexes outbound requests with
/// inbound replies; replies are handed to callers by correlation id. Any
/// number of requests may be in flight at once. A request the socket fails
/// to send, or any request still waiting when the socket dies, resolves as a
/// closed channel.
pub struct ZmqRequestClient {
    endpoint: String,
    send_tx: mpsc::Sender<Outbound>,
    pending: PendingReplies,
    loop_handle: JoinHandle<()>,
}

impl ZmqRequestClient {
    /// Connect a DEALER socket. Resolves once the peer handshake is done.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, RpcError> {
        let mut socket = DealerSocket::new();
        let endpoint = transport.endpoint();
        debug!(endpoint = %endpoint, "connecting DEALER socket");
        socket.connect(&endpoint).await?;
        info!(endpoint = %endpoint, "connected");

        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let (send_tx, send_rx) = mpsc::channel::<Outbound>(64);

        let loop_pending = Arc::clone(&pending);
        let loop_handle = tokio::spawn(async move {
            Self::event_loop(socket, send_rx, loop_pending).await;
        });

        Ok(Self {
            endpoint,
            send_tx,
            pending,
            loop_handle,
        })
    }

    async fn event_loop(
        mut socket: DealerSocket,
        mut send_rx: mpsc::Receiver<Outbound>,
        pending: PendingReplies,
    ) {
        loop {
            tokio::select! {
                outbound = send_rx.recv() => match outbound {
                    Some((correlation_id, zmq_msg)) => {
                        if let Err(e) = socket.send(zmq_msg).await {
                            warn!(%correlation_id, error = %e, "DEALER send failed");
                            pending.lock().await.remove(&correlation_id);
                        }
                    }
                    None => break,
                },
                inbound = socket.recv() => match inbound {
                    Ok(zmq_msg) => Self::dispatch_reply(&pending, zmq_msg).await,
                    Err(e) => {
                        debug!(error = %e, "DEALER recv loop ending");
                        break;
                    }
                },
            }
        }
        // Dropping the senders wakes every waiter with a closed channel.
        pending.lock().await.clear();
    }

    async fn dispatch_reply(
        pending: &Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>,
        zmq_msg: ZmqMessage,
    ) {
        let frames: Vec<_> = zmq_msg.iter().collect();
        // Skip empty delimiter frames some ROUTER peers prepend.
        let data: Vec<_> = frames
            .iter()
            .skip_while(|f| f.as_ref().is_empty())
            .collect();
        if data.len() < 2 {
            warn!(frame_count = frames.len(), "unexpected frame count on DEALER recv");
            return;
        }

        let reply = match Envelope::from_bytes(data[1].as_ref()) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to decode reply envelope");
                return;
            }
        };

        match pending.lock().await.remove(&reply.correlation_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => {
                debug!(correlation_id = %reply.correlation_id, "reply for unknown correlation_id");
            }
        }
    }

    /// Register the request as pending and hand it to the event loop.
    async fn enqueue(
        &self,
        request: &Envelope,
    ) -> Result<oneshot::Receiver<Envelope>, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request.correlation_id, tx);

        let mut zmq_msg = ZmqMessage::from(request.topic.as_str());
        zmq_msg.push_back(request.to_bytes()?.into());

        if self
            .send_tx
            .send((request.correlation_id, zmq_msg))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&request.correlation_id);
            return Err(RpcError::Transport(format!(
                "{}: client event loop closed",
                self.endpoint
            )));
        }
        debug!(correlation_id = %request.correlation_id, topic = %request.topic, "sent request");
        Ok(rx)
    }

    /// Send a request and wait for its reply with no deadline.
    pub async fn call(&self, request: Envelope) -> Result<Envelope, RpcError> {
        let rx = self.enqueue(&request).await?;
        rx.await.map_err(|_| {
            RpcError::Transport(format!("{}: reply channel closed", self.endpoint))
        })
    }

    /// Send a request and wait at most `timeout` for its reply.
    pub async fn request(
        &self,
        request: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, RpcError> {
        let cid = request.correlation_id;
        let rx = self.enqueue(&request).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RpcError::Transport(format!(
                "{}: reply channel closed",
                self.endpoint
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&cid);
                Err(RpcError::Timeout(timeout))
            }
        }
    }
}

impl Drop for ZmqRequestClient {
    fn drop(&mut self) {
        self.loop_handle.abort();
    }
}

/// ROUTER-socket server. Owned by a single serving loop, so no locking.
pub struct ZmqRequestServer {
    socket: RouterSocket,
}

impl ZmqRequestServer {
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(transport: &Transport) -> Result<Self, RpcError> {
        let mut socket = RouterSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "binding ROUTER socket");
        socket.bind(&endpoint).await?;
        Ok(Self { socket })
    }

    /// Receive the next request from any connected client.
    ///
    /// A socket failure is [`RpcError::Zmq`]; a garbled message is
    /// [`RpcError::Transport`] or [`RpcError::Deserialization`] and leaves the
    /// socket usable.
    pub async fn recv_request(&mut self) -> Result<(ReplyToken, Envelope), RpcError> {
        let zmq_msg = self.socket.recv().await?;
        let frames: Vec<_> = zmq_msg.iter().collect();
        if frames.len() < 2 {
            return Err(RpcError::Transport(format!(
                "expected at least 2 frames from ROUTER, got {}",
                frames.len()
            )));
        }

        let identity = frames[0].as_ref().to_vec();
        let data: Vec<_> = frames[1..]
            .iter()
            .skip_while(|f| f.as_ref().is_empty())
            .collect();
        if data.len() < 2 {
            return Err(RpcError::Transport(format!(
                "expected [topic, envelope] after identity, got {} frames",
                data.len()
            )));
        }

        let request = Envelope::from_bytes(data[1].as_ref())?;
        debug!(correlation_id = %request.correlation_id, topic = %request.topic, "received request");
        Ok((ReplyToken { identity }, request))
    }

    pub async fn send_reply(
        &mut self,
        token: ReplyToken,
        reply: Envelope,
    ) -> Result<(), RpcError> {
        let mut zmq_msg = ZmqMessage::from(token.identity);
        zmq_msg.push_back(reply.topic.as_bytes().to_vec().into());
        zmq_msg.push_back(reply.to_bytes()?.into());
        self.socket.send(zmq_msg).await?;
        debug!(correlation_id = %reply.correlation_id, topic = %reply.topic, "sent reply");
        Ok(())
    }
}
