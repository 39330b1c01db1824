//! Transport errors.

use blindpost_core::ProtocolError;
use thiserror::Error;

/// Errors that can occur during transport operations.
///
/// Nothing here is retried by this crate. The caller decides.
#[derive(Debug, Error)]
pub enum TransportError {
    // --- Connection & Setup ---
    /// Failed to reach the anonymous network client.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// The inbound stream ended.
    #[error("transport closed")]
    Closed,

    // --- Delivery ---
    /// No endpoint with that address.
    #[error("destination unreachable")]
    Unreachable,
    /// The reply handle has no single-use reply blocks left.
    #[error("reply handle exhausted")]
    ReplyHandleExhausted,

    // --- Protocol ---
    /// Protocol-level error from blindpost-core.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The directory answered with a negative result.
    #[error("rejected by directory")]
    Rejected,
    /// A wait for a directory reply or inbound message ran out.
    #[error("operation timed out")]
    Timeout,
}

impl From<tokio::time::error::Elapsed> for TransportError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}
