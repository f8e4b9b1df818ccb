//! Configuration types for connections and servers.
//!
//! All types deserialize with defaults for missing fields, so applications can
//! embed them in their own configuration files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Socket-level options for TCP connections.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Enable TCP_NODELAY (disable Nagle's algorithm).
    pub no_delay: bool,
    /// Capacity of the per-connection read buffer in bytes.
    pub read_buffer_size: usize,
    /// Connection timeout. `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            no_delay: false,
            read_buffer_size: 8192,
            connect_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl SocketConfig {
    /// Create a new socket configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// Set the read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Disable connection timeout.
    pub fn no_connect_timeout(mut self) -> Self {
        self.connect_timeout = None;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(LinkError::configuration(
                "read buffer size must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Configuration for an outbound connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// The host to connect to. Resolved at connect time.
    pub host: String,
    /// The port to connect to. Must be non-zero.
    pub port: u16,
    /// Socket-level options.
    pub socket: SocketConfig,
}

impl ConnectionConfig {
    /// Create a new connection configuration.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            socket: SocketConfig::default(),
        }
    }

    /// Set socket options.
    pub fn socket_config(mut self, config: SocketConfig) -> Self {
        self.socket = config;
        self
    }

    /// Enable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.socket.no_delay = enabled;
        self
    }

    /// Set the read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.socket.read_buffer_size = size;
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.socket.connect_timeout = Some(timeout);
        self
    }

    /// Get the address string (host:port).
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the target before resolving it.
    pub(crate) fn validate_target(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(LinkError::configuration("host must not be empty"));
        }
        if self.port == 0 {
            return Err(LinkError::configuration("port must be a positive integer"));
        }
        Ok(())
    }
}

/// Configuration for a [`TcpServer`](super::TcpServer).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The address to bind to.
    pub bind_address: String,
    /// The port to listen on. `0` picks an ephemeral port.
    pub port: u16,
    /// Socket-level options for accepted connections.
    pub socket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 0)
    }
}

impl ServerConfig {
    /// Create a new server configuration.
    pub fn new(bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
            socket: SocketConfig::default(),
        }
    }

    /// Set socket options for accepted connections.
    pub fn socket_config(mut self, config: SocketConfig) -> Self {
        self.socket = config;
        self
    }

    /// Enable TCP_NODELAY for accepted connections.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.socket.no_delay = enabled;
        self
    }

    /// Get the bind address string (address:port).
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
