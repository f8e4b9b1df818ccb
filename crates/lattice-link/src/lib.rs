//! Packet-framed asynchronous TCP connections.
//!
//! This crate provides the connection core Horizon Lattice applications use
//! to talk to packet-oriented TCP services:
//!
//! - **Connection lifecycle**: `Unconnected → Connecting → Connected →
//!   Disconnected`, with owner hooks for each transition
//! - **Receive pipeline**: one outstanding read into a fixed buffer, split
//!   into packets by a pluggable [`Framing`]
//! - **Send pipeline**: a multi-producer FIFO queue drained by one writer task,
//!   so packets from many threads never interleave on the wire
//! - **Acceptor**: a [`TcpServer`](tcp::TcpServer) that wraps every accepted
//!   socket in the same connection core
//!
//! # Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use lattice_link::tcp::{Connection, ConnectionConfig, ConnectionHandler};
//!
//! struct Chat;
//!
//! impl ConnectionHandler<Bytes> for Chat {
//!     fn on_connected(&self) {
//!         println!("connected");
//!     }
//!
//!     fn on_disconnected(&self) {
//!         println!("disconnected");
//!     }
//!
//!     fn handle_message(&self, packet: Bytes) {
//!         println!("{}", String::from_utf8_lossy(&packet));
//!     }
//! }
//!
//! let connection = Connection::new(ConnectionConfig::new("chat.example.com", 7000), Chat)?;
//! connection.connect().await?;
//! connection.send(&Bytes::from_static(b"hello"))?;
//! ```
//!
//! # Framing
//!
//! Packets default to [`LengthPrefixed`] framing: a big-endian length header
//! (one byte unless configured otherwise) followed by the payload. Other wire
//! formats implement [`Framing`] and pass it to
//! [`Connection::with_framing`](tcp::Connection::with_framing).
//!
//! # Logging
//!
//! The crate logs through `tracing` and installs no subscriber. See
//! [`targets`] for the targets used by each subsystem.

mod error;
pub mod framing;
pub mod tcp;

pub use error::{LinkError, Result};
pub use framing::{Framing, FramingError, LengthPrefixed, LengthWidth};

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Connection lifecycle target.
    pub const CONNECTION: &str = "lattice_link::connection";
    /// Completion dispatch target.
    pub const COMPLETION: &str = "lattice_link::completion";
    /// Receive pipeline target.
    pub const RECEIVER: &str = "lattice_link::receiver";
    /// Send pipeline target.
    pub const SENDER: &str = "lattice_link::sender";
    /// Acceptor target.
    pub const SERVER: &str = "lattice_link::server";
}

// Re-export commonly used types at the crate root
pub use tcp::{
    Connection, ConnectionConfig, ConnectionHandler, ConnectionId, ConnectionState, PacketSender,
    ServerConfig, SocketConfig, TcpServer, TcpServerState,
};
