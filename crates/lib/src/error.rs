//! Error taxonomy shared by the store, codec, sessions, and the gateway service.
//!
//! Every variant maps to a stable `kind()` string that the RPC front end sends back to
//! callers, so clients can branch on the kind rather than parse messages.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, PushError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PushError {
    #[error("application {0:?} is not provisioned")]
    NotProvisioned(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error("connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("feedback read failed: {0}")]
    FeedbackReadFailed(String),
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("notification {index}: {source}")]
    Batch {
        index: usize,
        #[source]
        source: Box<PushError>,
    },
}

impl PushError {
    /// Stable error code carried over RPC.
    pub fn kind(&self) -> &'static str {
        match self {
            PushError::NotProvisioned(_) => "NotProvisioned",
            PushError::InvalidArgument(_) => "InvalidArgument",
            PushError::PayloadTooLarge { .. } => "PayloadTooLarge",
            PushError::ConnectTimeout { .. } => "ConnectTimeout",
            PushError::ConnectFailed { .. } => "ConnectFailed",
            PushError::SendFailed(_) => "SendFailed",
            PushError::FeedbackReadFailed(_) => "FeedbackReadFailed",
            PushError::Timeout { .. } => "Timeout",
            PushError::Batch { source, .. } => source.kind(),
        }
    }

    /// Index of the failing notification for batch errors.
    pub fn index(&self) -> Option<usize> {
        match self {
            PushError::Batch { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Attach a batch index (no-op wrapping is avoided for already indexed errors).
    pub fn at_index(self, index: usize) -> Self {
        match self {
            PushError::Batch { .. } => self,
            other => PushError::Batch {
                index,
                source: Box::new(other),
            },
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        PushError::InvalidArgument(msg.into())
    }
}
