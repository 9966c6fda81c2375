//! Error types for the client engine.

use pulse_protocol::{CorrelationId, ProtocolError};
use thiserror::Error;

/// Errors surfaced by the client engine.
///
/// Transport faults are not represented here once a connection exists: they
/// are recovered by the reconnect loop and observed through lifecycle events.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Wire or cryptographic error, including missing recipient keys.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No live transport session to send on.
    #[error("not connected")]
    NotConnected,

    /// The client was shut down while the operation was outstanding.
    #[error("client closed")]
    Closed,

    /// A caller-supplied correlation id is still awaiting its answer.
    #[error("correlation id {0} is already pending")]
    IdInUse(CorrelationId),

    /// The transport could not be opened.
    #[error("transport failed: {0}")]
    Transport(String),

    /// WebSocket protocol or I/O failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The relay endpoint could not be formed into a valid URL.
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
