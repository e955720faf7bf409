use std::any::Any;
use std::time::Duration;

use thiserror::Error;

use crate::ConnectionId;
use crate::admission::Pool;

pub type Result<T, E = RemotingError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RemotingError {
    #[error("No response to request {correlation_id} within {timeout:?}")]
    Timeout { correlation_id: i32, timeout: Duration },

    #[error("Too many outstanding {pool} requests; no permit available after waiting {waited:?}")]
    TooManyRequests { pool: Pool, waited: Duration },

    #[error("Failed to send request {correlation_id} on connection {connection_id}: {reason}")]
    SendFailure {
        connection_id: ConnectionId,
        correlation_id: i32,
        reason: String,
    },

    /// The remark names the request code the peer had no processor for
    #[error("Remote peer does not support the request: {remark}")]
    RequestCodeNotSupported { remark: String },

    #[error("Remote peer is too busy to process request: {remark}")]
    ServerBusy { remark: String },

    #[error("Remote processor failed with response code {code}: {remark}")]
    HandlerFailure { code: i32, remark: String },

    #[error("A call with correlation id {correlation_id} is already outstanding")]
    DuplicateCorrelationId { correlation_id: i32 },

    #[error("Transport error")]
    Transport {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("Error decoding remoting frame: {message}")]
    Codec { message: String },

    #[error("Error serializing or deserializing a command header")]
    Header {
        #[from]
        source: serde_json::Error,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("BUG: {message}")]
    Bug { message: String },
}

impl RemotingError {
    /// Convenience constructor for the connection-level failure reported to calls that were
    /// waiting on a connection that went away.
    pub(crate) fn send_failure(
        connection_id: ConnectionId,
        correlation_id: i32,
        reason: impl Into<String>,
    ) -> Self {
        Self::SendFailure {
            connection_id,
            correlation_id,
            reason: reason.into(),
        }
    }

    /// True for the error kinds that mean the request never got a usable answer because of the
    /// connection rather than the remote processor.
    pub fn is_send_failure(&self) -> bool {
        matches!(self, Self::SendFailure { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for RemotingError {
    fn from(e: std::io::Error) -> Self {
        RemotingError::Transport { source: Box::new(e) }
    }
}

/// Render the payload of a caught panic as a string, for logging and for reporting back to the
/// remote peer in an error response.
pub(crate) fn panic_err_to_string(err: Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
