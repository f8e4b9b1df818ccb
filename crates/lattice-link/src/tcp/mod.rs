//! Packet-framed TCP connections and the acceptor built on them.
//!
//! This module provides:
//! - **Connection**: Connect to a server, receive framed packets, send through
//!   a serialized queue
//! - **TcpServer**: Accept incoming connections, each wrapped in a `Connection`
//! - **ConnectionHandler**: The owner hooks both of them call
//!
//! # Client Example
//!
//! ```ignore
//! use lattice_link::tcp::{Connection, ConnectionConfig, ConnectionHandler};
//!
//! let config = ConnectionConfig::new("127.0.0.1", 8080).no_delay(true);
//! let connection = Connection::new(config, MyHandler::default())?;
//!
//! connection.connect().await?;
//! connection.send(&Bytes::from_static(b"Hello, Server!"))?;
//! ```
//!
//! # Server Example
//!
//! ```ignore
//! use lattice_link::tcp::{ServerConfig, TcpServer};
//!
//! let server = TcpServer::new(ServerConfig::new("0.0.0.0", 8080), |sender| Echo(sender));
//! let addr = server.start().await?;
//! println!("listening on {addr}");
//! ```

mod completion;
mod config;
mod connection;
mod handler;
mod receiver;
mod sender;
mod server;
mod state;

pub use config::{ConnectionConfig, ServerConfig, SocketConfig};
pub use connection::{Connection, ConnectionId, PacketSender};
pub use handler::ConnectionHandler;
pub use server::TcpServer;
pub use state::{ConnectionState, TcpServerState};
