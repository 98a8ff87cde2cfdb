//! Remote-call channel between the controller and its worker processes.
//!
//! - [`envelope`]: MessagePack wire envelope with correlation ids
//! - [`reqrep`]: DEALER/ROUTER request/reply sockets
//! - [`protocol`]: the typed `run` / `status` / `terminate` contract
//! - [`client`]: controller-side [`WorkerClient`] and [`Connector`]
//! - [`server`]: the [`WorkerServer`] each worker process runs

pub mod client;
pub mod envelope;
pub mod error;
pub mod protocol;
pub mod reqrep;
pub mod server;
pub mod transport;

pub use client::{Connector, WorkerClient, ZmqConnector, ZmqWorkerClient};
pub use envelope::Envelope;
pub use error::RpcError;
pub use protocol::{WorkerRequest, WorkerResponse};
pub use reqrep::{ReplyToken, ZmqRequestClient, ZmqRequestServer};
pub use server::WorkerServer;
pub use transport::Transport;
