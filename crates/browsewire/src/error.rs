//! Error taxonomy for the automation-server client.

use std::time::Duration;

/// Errors surfaced to callers of the client.
///
/// Every variant is cheap to clone so batch outcomes can carry the failure
/// alongside the partial results.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// The server process could not be started (or failed its handshake).
    #[error("failed to launch automation server: {0}")]
    Launch(String),

    /// The server process is gone, or the session has been closed.
    #[error("automation server transport is down")]
    TransportDown,

    /// No response arrived within the caller's bound. Safe to retry.
    #[error("request '{method}' timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    /// The server answered with an error payload.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// An inbound frame could not be decoded. Only ever logged by the reader loop.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Tool arguments failed schema validation; nothing was sent.
    #[error("invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Timeouts are the only failure a caller can expect to clear by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Whether the failure means the underlying connection is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Launch(_) | Self::TransportDown)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
