//! TCP acceptor built on the per-connection core.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::config::{ConnectionConfig, ServerConfig, SocketConfig};
use super::connection::{Connection, ConnectionId, PacketSender};
use super::handler::ConnectionHandler;
use super::state::TcpServerState;
use crate::error::{LinkError, Result};
use crate::framing::{Framing, LengthPrefixed};

/// Builds the handler for one accepted connection.
type HandlerFactory<H, F> = Arc<dyn Fn(PacketSender<F>) -> H + Send + Sync>;

/// Internal state for the TCP server.
struct TcpServerInner<H, F> {
    state: TcpServerState,
    connections: HashMap<ConnectionId, Arc<Connection<H, F>>>,
    local_addr: Option<SocketAddr>,
}

/// Command sent to the server's accept task.
enum ServerCommand {
    Stop,
}

/// A TCP server that wraps every accepted socket in a [`Connection`].
///
/// Each accepted connection gets its own handler from the factory passed to
/// [`new`](Self::new). The factory receives the connection's
/// [`PacketSender`], so handlers can reply to their peer. The server keeps
/// the live set of connections and drops each one after its
/// `on_disconnected` hook has run.
///
/// # Example
///
/// ```ignore
/// struct Echo(PacketSender<LengthPrefixed>);
///
/// impl ConnectionHandler<Bytes> for Echo {
///     fn on_connected(&self) {}
///     fn on_disconnected(&self) {}
///     fn handle_message(&self, packet: Bytes) {
///         let _ = self.0.send(&packet);
///     }
/// }
///
/// let server = TcpServer::new(ServerConfig::new("127.0.0.1", 0), Echo);
/// let addr = server.start().await?;
/// ```
pub struct TcpServer<H, F = LengthPrefixed> {
    config: ServerConfig,
    framing: Arc<F>,
    factory: HandlerFactory<H, F>,
    inner: Arc<Mutex<TcpServerInner<H, F>>>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<ServerCommand>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl<H> TcpServer<H, LengthPrefixed>
where
    H: ConnectionHandler<Bytes>,
{
    /// Create a server using the default length-prefixed framing.
    pub fn new(
        config: ServerConfig,
        factory: impl Fn(PacketSender<LengthPrefixed>) -> H + Send + Sync + 'static,
    ) -> Self {
        Self::with_framing(config, LengthPrefixed::default(), factory)
    }
}

impl<H, F> TcpServer<H, F>
where
    F: Framing,
    H: ConnectionHandler<F::Packet>,
{
    /// Create a server with a custom framing shared by all its connections.
    pub fn with_framing(
        config: ServerConfig,
        framing: F,
        factory: impl Fn(PacketSender<F>) -> H + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            framing: Arc::new(framing),
            factory: Arc::new(factory),
            inner: Arc::new(Mutex::new(TcpServerInner {
                state: TcpServerState::Stopped,
                connections: HashMap::new(),
                local_addr: None,
            })),
            command_tx: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the bound address, which is useful when binding to port 0.
    /// Calling this on a listening server returns its address. After
    /// [`stop`](Self::stop), waits for the previous accept task to wind down
    /// before binding again.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.command_tx.lock().is_some() {
            let inner = self.inner.lock();
            if inner.state == TcpServerState::Listening
                && let Some(addr) = inner.local_addr
            {
                return Ok(addr);
            }
        }

        let previous = self.accept_task.lock().take();
        if let Some(task) = previous
            && let Err(e) = task.await
        {
            tracing::warn!(target: "lattice_link::server", error = %e, "previous accept task failed");
        }

        self.config.socket.validate()?;
        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| LinkError::Transport(format!("failed to bind {bind_addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.command_tx.lock() = Some(tx);
        {
            let mut inner = self.inner.lock();
            inner.state = TcpServerState::Listening;
            inner.local_addr = Some(local_addr);
        }
        tracing::info!(target: "lattice_link::server", %local_addr, "listening");

        let task = tokio::spawn(accept_loop(
            listener,
            rx,
            Arc::clone(&self.inner),
            self.config.socket.clone(),
            Arc::clone(&self.framing),
            Arc::clone(&self.factory),
        ));
        *self.accept_task.lock() = Some(task);

        Ok(local_addr)
    }

    /// Queue `packet` on every live connection.
    ///
    /// Returns the number of connections it was queued on.
    pub fn broadcast(&self, packet: &F::Packet) -> usize {
        let connections: Vec<Arc<Connection<H, F>>> =
            self.inner.lock().connections.values().cloned().collect();
        connections
            .iter()
            .filter(|conn| conn.send(packet).is_ok())
            .count()
    }

    /// Queue `packet` on one connection.
    pub fn send_to(&self, id: ConnectionId, packet: &F::Packet) -> Result<()> {
        match self.get_connection(id) {
            Some(conn) => conn.send(packet),
            None => Err(LinkError::SendOnClosedConnection),
        }
    }

    /// Disconnect a specific client, including one whose accept is still
    /// being dispatched.
    pub fn disconnect_client(&self, id: ConnectionId) {
        if let Some(conn) = self.get_connection(id) {
            conn.abort();
        }
    }
}

impl<H, F> TcpServer<H, F> {
    /// Get the current server state.
    pub fn state(&self) -> TcpServerState {
        self.inner.lock().state
    }

    /// Check if the server is listening.
    pub fn is_listening(&self) -> bool {
        self.inner.lock().state == TcpServerState::Listening
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Get a list of all active connection IDs.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.inner.lock().connections.keys().copied().collect()
    }

    /// Get a connection by ID.
    pub fn get_connection(&self, id: ConnectionId) -> Option<Arc<Connection<H, F>>> {
        self.inner.lock().connections.get(&id).cloned()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> String {
        self.config.bind_addr()
    }

    /// Get the actual local address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().local_addr
    }

    /// Stop accepting and disconnect every live connection.
    ///
    /// The server reports `Stopping` as soon as this returns and `Stopped`
    /// once the accept task has closed its connections.
    pub fn stop(&self) {
        if let Some(tx) = self.command_tx.lock().take() {
            self.inner.lock().state = TcpServerState::Stopping;
            let _ = tx.send(ServerCommand::Stop);
        }
    }
}

impl<H, F> Drop for TcpServer<H, F> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<H, F> std::fmt::Debug for TcpServer<H, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("bind_addr", &self.config.bind_addr())
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}

async fn accept_loop<H, F>(
    listener: TcpListener,
    mut commands: mpsc::UnboundedReceiver<ServerCommand>,
    inner: Arc<Mutex<TcpServerInner<H, F>>>,
    socket: SocketConfig,
    framing: Arc<F>,
    factory: HandlerFactory<H, F>,
) where
    F: Framing,
    H: ConnectionHandler<F::Packet>,
{
    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel::<ConnectionId>();

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(ServerCommand::Stop) | None => break,
                }
            }

            // Removal happens on this task, after the insert below.
            Some(id) = disconnect_rx.recv() => {
                let removed = inner.lock().connections.remove(&id);
                if removed.is_some() {
                    tracing::debug!(target: "lattice_link::server", %id, "connection closed");
                }
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let config = ConnectionConfig {
                            host: peer_addr.ip().to_string(),
                            port: peer_addr.port(),
                            socket: socket.clone(),
                        };
                        let connection = Connection::accepted(
                            stream,
                            config,
                            Arc::clone(&framing),
                            disconnect_tx.clone(),
                            |sender| factory(sender),
                        );
                        let id = connection.id();
                        inner.lock().connections.insert(id, Arc::new(connection));
                        tracing::debug!(target: "lattice_link::server", %id, %peer_addr, "accepted connection");
                    }
                    Err(e) => {
                        tracing::warn!(target: "lattice_link::server", error = %e, "accept failed");
                    }
                }
            }
        }
    }

    inner.lock().state = TcpServerState::Stopping;
    let connections: Vec<Arc<Connection<H, F>>> = inner
        .lock()
        .connections
        .drain()
        .map(|(_, conn)| conn)
        .collect();
    for conn in &connections {
        conn.abort();
    }
    drop(connections);

    {
        let mut guard = inner.lock();
        guard.state = TcpServerState::Stopped;
        guard.local_addr = None;
    }
    tracing::info!(target: "lattice_link::server", "stopped");
}
