use thiserror::Error;

/// Errors raised on the controller/worker channel.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The worker answered, but with a failure.
    #[error("remote failure: {0}")]
    Remote(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}
