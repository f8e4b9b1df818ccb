//! Error types for the link layer.

use crate::framing::FramingError;
use crate::tcp::ConnectionState;

/// Errors surfaced by connections and servers.
///
/// Configuration and state errors are returned synchronously from the
/// offending call. Transport failures seen by the receive and send pipelines
/// never reach a caller as an `Err`; they end in the disconnect path and are
/// reported to the owner through `on_disconnected`.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Host, port or buffer settings are unusable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The operation is not allowed in the connection's current state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the connection was in.
        state: ConnectionState,
    },

    /// Socket-level failure (reset, abort, refused).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A packet was submitted after the transport closed.
    #[error("Connection is closed")]
    SendOnClosedConnection,

    /// The packet serialized to zero bytes.
    #[error("Packet encodes to an empty buffer")]
    EmptyPacket,

    /// The framing strategy rejected a packet or a byte stream.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Connecting took longer than the configured timeout.
    #[error("Connect timed out")]
    Timeout,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a state error for `operation` attempted in `state`.
    pub fn invalid_state(operation: &'static str, state: ConnectionState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Whether this is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Whether this is a state error.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

/// A specialized Result type for link operations.
pub type Result<T> = std::result::Result<T, LinkError>;
