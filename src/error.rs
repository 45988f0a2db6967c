//! Error types for the pipeline.

use thiserror::Error;

/// Errors from the `Transport` contract (§4.H). Classified as retryable or
/// not so the flush worker's retry loop knows when to give up early.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("server error: {status}")]
    Server { status: u16 },

    #[error("client error: {status} - {message}")]
    Client { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    pub fn from_status(status: u16, body: &str) -> Self {
        if status >= 500 {
            TransportError::Server { status }
        } else {
            TransportError::Client {
                status,
                message: body.to_string(),
            }
        }
    }

    /// Whether the flush worker should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connect(_) | TransportError::Timeout | TransportError::Server { .. }
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Connect(err)
        }
    }
}

/// Errors from the disk spool (§4.E). These never propagate to a producer;
/// the worker converts them into a dropped-event counter bump and a log line.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize spool record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("spool capacity exceeded")]
    CapacityExceeded,
}

/// Errors surfaced only from fallible constructors -- never from the
/// producer-facing hot path, which always returns a plain `bool`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to initialize spool directory: {0}")]
    Spool(#[from] SpoolError),

    #[error("failed to build HTTP transport: {0}")]
    Transport(#[from] reqwest::Error),
}
