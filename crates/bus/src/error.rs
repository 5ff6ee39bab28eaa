use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the messaging layer.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no reply after {0:?}")]
    Timeout(Duration),

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("unsupported message version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },

    #[error("bulk frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
