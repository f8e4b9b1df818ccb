//! State enums for connections and servers.

/// Lifecycle of a [`Connection`](super::Connection).
///
/// Transitions run `Unconnected → Connecting → Connected → Disconnected`.
/// A failed connect falls back to `Unconnected`; `Disconnected` is terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, no connect issued yet (or the last connect failed).
    #[default]
    Unconnected,
    /// A connect is in flight.
    Connecting,
    /// The transport is open and the receive pipeline is running.
    Connected,
    /// Closed locally or by the peer. The connection cannot be reused.
    Disconnected,
}

impl ConnectionState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unconnected => write!(f, "Unconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Current state of a [`TcpServer`](super::TcpServer).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TcpServerState {
    /// Server is not running.
    #[default]
    Stopped,
    /// Server is listening for connections.
    Listening,
    /// Server is shutting down.
    Stopping,
}

impl std::fmt::Display for TcpServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Listening => write!(f, "Listening"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}
