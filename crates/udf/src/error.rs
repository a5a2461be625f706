use std::time::Duration;

use thiserror::Error;

/// Errors from the UDF transport and worker supervision.
#[derive(Debug, Error)]
pub enum UdfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("worker missed keepalive deadline of {0:?}")]
    KeepaliveTimeout(Duration),

    #[error("udf server aborted")]
    Aborted,

    #[error("failed to spawn worker {command:?}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
}
