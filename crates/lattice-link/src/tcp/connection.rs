//! Connection lifecycle and shared per-connection state.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc, watch};

use super::completion::{self, Completion, Flow};
use super::config::ConnectionConfig;
use super::handler::ConnectionHandler;
use super::state::ConnectionState;
use super::{receiver, sender};
use crate::error::{LinkError, Result};
use crate::framing::{Framing, LengthPrefixed};

/// Unique identifier for a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Socket halves and addresses, present once the transport is open.
#[derive(Default)]
struct Socket {
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

/// State shared by the handle and the connection's tasks.
pub(crate) struct Shared<H, F> {
    pub(crate) id: ConnectionId,
    pub(crate) config: ConnectionConfig,
    pub(crate) handler: H,
    pub(crate) framing: Arc<F>,
    state: watch::Sender<ConnectionState>,
    socket: Mutex<Socket>,
    close_requested: Notify,
    disconnect_reported: AtomicBool,
    disconnect_notifier: Option<mpsc::UnboundedSender<ConnectionId>>,
}

impl<H, F> Shared<H, F> {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move to `to` if the current state satisfies `allowed`.
    ///
    /// Returns the state it moved from, or the rejecting state.
    fn transition(
        &self,
        allowed: impl FnOnce(ConnectionState) -> bool,
        to: ConnectionState,
    ) -> std::result::Result<ConnectionState, ConnectionState> {
        let mut outcome = Err(ConnectionState::Unconnected);
        self.state.send_if_modified(|state| {
            if allowed(*state) {
                outcome = Ok(*state);
                *state = to;
                true
            } else {
                outcome = Err(*state);
                false
            }
        });
        outcome
    }

    /// Begin a local close of an open connection.
    ///
    /// The state flips to `Disconnected` under the socket lock, so no write
    /// can start once this returns; the receive task is woken and runs the
    /// terminal path.
    pub(crate) fn request_close(&self) -> bool {
        self.close_from(|s| s == ConnectionState::Connected)
    }

    /// Like [`request_close`](Self::request_close), but also abandons an
    /// accept whose completion has not been dispatched yet.
    pub(crate) fn abort(&self) -> bool {
        self.close_from(|s| matches!(s, ConnectionState::Connecting | ConnectionState::Connected))
    }

    fn close_from(&self, allowed: impl FnOnce(ConnectionState) -> bool) -> bool {
        let previous = {
            let _socket = self.socket.lock();
            self.transition(allowed, ConnectionState::Disconnected)
        };
        match previous {
            Ok(ConnectionState::Connected) => {
                self.close_requested.notify_one();
                true
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Close from any state. Used when the owning handle goes away.
    fn shutdown(&self) {
        let previous = {
            let _socket = self.socket.lock();
            self.state.send_replace(ConnectionState::Disconnected)
        };
        if previous == ConnectionState::Connected {
            self.close_requested.notify_one();
        }
    }

    /// Tell the owning server, if any, that this connection is gone.
    fn release(&self) {
        if let Some(notifier) = &self.disconnect_notifier {
            let _ = notifier.send(self.id);
        }
    }

    /// Resolves once a local close has been requested.
    pub(crate) async fn closed(&self) {
        self.close_requested.notified().await;
    }

    pub(crate) fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.socket.lock().reader.take()
    }

    /// Borrow the write half for one write. `None` unless connected.
    pub(crate) fn take_writer(&self) -> Option<OwnedWriteHalf> {
        let mut socket = self.socket.lock();
        if self.state() != ConnectionState::Connected {
            return None;
        }
        socket.writer.take()
    }

    /// Return the write half after a write.
    ///
    /// If the connection closed meanwhile the half is dropped, which shuts
    /// down the write direction.
    pub(crate) fn restore_writer(&self, writer: OwnedWriteHalf) {
        let mut socket = self.socket.lock();
        if self.state() == ConnectionState::Connected {
            socket.writer = Some(writer);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().peer_addr
    }
}

impl<H, F> Shared<H, F>
where
    F: Framing,
    H: ConnectionHandler<F::Packet>,
{
    /// Terminal path of the receive pipeline.
    ///
    /// Runs at most one `on_disconnected` no matter how many close
    /// conditions race.
    pub(crate) fn finish(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
        let writer = self.socket.lock().writer.take();
        drop(writer);

        if self.disconnect_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target: "lattice_link::connection", id = %self.id, "disconnected");
        self.handler.on_disconnected();
        self.release();
    }
}

/// Handle the completion of a connect or accept.
pub(crate) fn on_connect_complete<H, F>(shared: &Shared<H, F>, result: io::Result<TcpStream>) -> Flow
where
    F: Framing,
    H: ConnectionHandler<F::Packet>,
{
    let stream = match result {
        Ok(stream) => stream,
        Err(e) => {
            let error = if e.kind() == io::ErrorKind::TimedOut {
                LinkError::Timeout
            } else {
                LinkError::Transport(e.to_string())
            };
            tracing::warn!(
                target: "lattice_link::connection",
                id = %shared.id,
                address = %shared.config.address(),
                %error,
                "connect failed"
            );
            let reverted = shared
                .transition(|s| s == ConnectionState::Connecting, ConnectionState::Unconnected)
                .is_ok();
            if reverted {
                shared.handler.on_connect_failed(&error);
            }
            return Flow::Stop;
        }
    };

    if let Err(e) = stream.set_nodelay(shared.config.socket.no_delay) {
        tracing::warn!(target: "lattice_link::connection", id = %shared.id, error = %e, "failed to set TCP_NODELAY");
    }
    let local_addr = stream.local_addr().ok();
    let peer_addr = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();

    {
        let mut socket = shared.socket.lock();
        if let Err(state) =
            shared.transition(|s| s == ConnectionState::Connecting, ConnectionState::Connected)
        {
            tracing::debug!(
                target: "lattice_link::connection",
                id = %shared.id,
                %state,
                "dropping stream for abandoned connect"
            );
            drop(socket);
            shared.release();
            return Flow::Stop;
        }
        socket.reader = Some(reader);
        socket.writer = Some(writer);
        socket.local_addr = local_addr;
        socket.peer_addr = peer_addr;
    }

    tracing::debug!(
        target: "lattice_link::connection",
        id = %shared.id,
        peer = ?peer_addr,
        "connected"
    );
    shared.handler.on_connected();
    Flow::Continue
}

/// A cloneable handle that queues packets on a connection.
///
/// Handlers built with [`Connection::from_factory`] receive one, so they can
/// reply from inside their hooks.
pub struct PacketSender<F> {
    id: ConnectionId,
    framing: Arc<F>,
    state: watch::Receiver<ConnectionState>,
    queue: mpsc::UnboundedSender<Bytes>,
}

impl<F> Clone for PacketSender<F> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            framing: Arc::clone(&self.framing),
            state: self.state.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<F: Framing> PacketSender<F> {
    /// The connection this sender writes to.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Encode `packet` and queue it for sending.
    ///
    /// Never blocks. Packets queued before the connection is established are
    /// written once it is. Fails once the connection has closed.
    pub fn send(&self, packet: &F::Packet) -> Result<()> {
        if self.state.borrow().is_terminal() {
            return Err(LinkError::SendOnClosedConnection);
        }

        let mut buf = BytesMut::new();
        self.framing.encode(packet, &mut buf)?;
        if buf.is_empty() {
            return Err(LinkError::EmptyPacket);
        }

        let len = buf.len();
        self.queue
            .send(buf.freeze())
            .map_err(|_| LinkError::SendOnClosedConnection)?;
        tracing::trace!(target: "lattice_link::sender", id = %self.id, bytes = len, "queued packet");
        Ok(())
    }
}

/// A packet-framed TCP connection.
///
/// The connection owns three pipelines:
///
/// - **connect**: [`connect`](Self::connect) resolves the target, then a task
///   opens the socket and reports back through the completion dispatcher.
/// - **receive**: one read at a time into a fixed buffer; bytes are split into
///   packets by the framing and handed to
///   [`ConnectionHandler::handle_message`] in order.
/// - **send**: [`send`](Self::send) queues encoded packets; a dedicated task
///   writes them one at a time in FIFO order.
///
/// Connections are single-use: once `Disconnected`, create a new one to
/// reconnect. Construction spawns the sender task and therefore must happen
/// inside a Tokio runtime.
///
/// # Example
///
/// ```ignore
/// struct Printer;
///
/// impl ConnectionHandler<Bytes> for Printer {
///     fn on_connected(&self) {
///         println!("connected");
///     }
///     fn on_disconnected(&self) {
///         println!("disconnected");
///     }
///     fn handle_message(&self, packet: Bytes) {
///         println!("received {} bytes", packet.len());
///     }
/// }
///
/// let connection = Connection::new(ConnectionConfig::new("127.0.0.1", 7000), Printer)?;
/// connection.connect().await?;
/// connection.send(&Bytes::from_static(b"hello"))?;
/// ```
pub struct Connection<H, F = LengthPrefixed> {
    shared: Arc<Shared<H, F>>,
    outbox: PacketSender<F>,
}

impl<H> Connection<H, LengthPrefixed>
where
    H: ConnectionHandler<Bytes>,
{
    /// Create an unconnected connection with the default length-prefixed
    /// framing.
    pub fn new(config: ConnectionConfig, handler: H) -> Result<Self> {
        Self::with_framing(config, handler, LengthPrefixed::default())
    }
}

impl<H, F> Connection<H, F>
where
    F: Framing,
    H: ConnectionHandler<F::Packet>,
{
    /// Create an unconnected connection with a custom framing.
    pub fn with_framing(config: ConnectionConfig, handler: H, framing: F) -> Result<Self> {
        Self::from_factory(config, framing, move |_| handler)
    }

    /// Create an unconnected connection whose handler needs a
    /// [`PacketSender`] for replies.
    pub fn from_factory(
        config: ConnectionConfig,
        framing: F,
        make_handler: impl FnOnce(PacketSender<F>) -> H,
    ) -> Result<Self> {
        config.socket.validate()?;
        Ok(Self::build(
            config,
            Arc::new(framing),
            ConnectionState::Unconnected,
            None,
            make_handler,
        ))
    }

    /// Wrap a socket accepted by a server.
    ///
    /// The connection starts in `Connecting`; the accept is routed through the
    /// dispatcher exactly like a finished connect.
    pub(crate) fn accepted(
        stream: TcpStream,
        config: ConnectionConfig,
        framing: Arc<F>,
        disconnect_notifier: mpsc::UnboundedSender<ConnectionId>,
        make_handler: impl FnOnce(PacketSender<F>) -> H,
    ) -> Self {
        let connection = Self::build(
            config,
            framing,
            ConnectionState::Connecting,
            Some(disconnect_notifier),
            make_handler,
        );

        let shared = Arc::clone(&connection.shared);
        tokio::spawn(async move {
            if completion::dispatch(&shared, Completion::Connect(Ok(stream))) == Flow::Continue {
                receiver::run(shared).await;
            }
        });

        connection
    }

    fn build(
        config: ConnectionConfig,
        framing: Arc<F>,
        initial: ConnectionState,
        disconnect_notifier: Option<mpsc::UnboundedSender<ConnectionId>>,
        make_handler: impl FnOnce(PacketSender<F>) -> H,
    ) -> Self {
        let id = ConnectionId::new();
        let (state, state_rx) = watch::channel(initial);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let outbox = PacketSender {
            id,
            framing: Arc::clone(&framing),
            state: state_rx,
            queue: queue_tx,
        };
        let handler = make_handler(outbox.clone());

        let shared = Arc::new(Shared {
            id,
            config,
            handler,
            framing,
            state,
            socket: Mutex::new(Socket::default()),
            close_requested: Notify::new(),
            disconnect_reported: AtomicBool::new(false),
            disconnect_notifier,
        });

        tokio::spawn(sender::run(Arc::clone(&shared), queue_rx));
        tracing::debug!(
            target: "lattice_link::connection",
            %id,
            address = %shared.config.address(),
            "connection created"
        );

        Self { shared, outbox }
    }

    /// Connect to the configured host.
    ///
    /// Returns once the connect has been issued; the outcome is reported
    /// through [`ConnectionHandler::on_connected`] or
    /// [`ConnectionHandler::on_connect_failed`].
    ///
    /// # Errors
    ///
    /// - [`LinkError::InvalidState`] unless the connection is `Unconnected`.
    /// - [`LinkError::Configuration`] for an empty host, port 0, or a host
    ///   that does not resolve to any address.
    pub async fn connect(&self) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Unconnected {
            return Err(LinkError::invalid_state("connect", state));
        }

        let config = &self.shared.config;
        config.validate_target()?;
        let addrs = resolve(config).await?;

        self.shared
            .transition(|s| s == ConnectionState::Unconnected, ConnectionState::Connecting)
            .map_err(|state| LinkError::invalid_state("connect", state))?;

        tracing::debug!(
            target: "lattice_link::connection",
            id = %self.shared.id,
            address = %config.address(),
            candidates = addrs.len(),
            "connecting"
        );

        let shared = Arc::clone(&self.shared);
        let timeout = config.socket.connect_timeout;
        tokio::spawn(async move {
            let result = open_stream(&addrs, timeout).await;
            if completion::dispatch(&shared, Completion::Connect(result)) == Flow::Continue {
                receiver::run(shared).await;
            }
        });

        Ok(())
    }

    /// Close the connection.
    ///
    /// No-op unless connected. [`ConnectionHandler::on_disconnected`] fires
    /// from the receive pipeline once it has observed the close.
    pub fn disconnect(&self) {
        if !self.shared.request_close() {
            tracing::trace!(
                target: "lattice_link::connection",
                id = %self.shared.id,
                state = %self.state(),
                "disconnect ignored"
            );
        }
    }

    /// Close the connection even if its accept is still being dispatched.
    pub(crate) fn abort(&self) {
        self.shared.abort();
    }

    /// Encode `packet` and queue it for sending. See [`PacketSender::send`].
    pub fn send(&self, packet: &F::Packet) -> Result<()> {
        self.outbox.send(packet)
    }

    /// A cloneable handle for sending from other tasks or threads.
    pub fn sender(&self) -> PacketSender<F> {
        self.outbox.clone()
    }
}

impl<H, F> Connection<H, F> {
    /// Get the unique connection ID.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Check if the transport is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.shared.peer_addr().is_some()
    }

    /// The owner hooks.
    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// Get the configured host.
    pub fn host(&self) -> &str {
        &self.shared.config.host
    }

    /// Get the configured port.
    pub fn port(&self) -> u16 {
        self.shared.config.port
    }

    /// Get the full address (host:port).
    pub fn address(&self) -> String {
        self.shared.config.address()
    }

    /// Get the local socket address once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }

    /// Get the peer socket address once connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr()
    }
}

impl<H, F> Drop for Connection<H, F> {
    fn drop(&mut self) {
        // Zero-length entry stops the sender task.
        let _ = self.outbox.queue.send(Bytes::new());
        self.shared.shutdown();
    }
}

impl<H, F> std::fmt::Debug for Connection<H, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("address", &self.shared.config.address())
            .field("state", &self.state())
            .finish()
    }
}

async fn resolve(config: &ConnectionConfig) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(|e| {
            LinkError::configuration(format!("cannot resolve '{}': {e}", config.host))
        })?
        .collect();

    if addrs.is_empty() {
        return Err(LinkError::configuration(format!(
            "'{}' resolved to no addresses",
            config.host
        )));
    }
    Ok(addrs)
}

async fn open_stream(addrs: &[SocketAddr], timeout: Option<Duration>) -> io::Result<TcpStream> {
    match timeout {
        Some(duration) => tokio::time::timeout(duration, TcpStream::connect(addrs))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?,
        None => TcpStream::connect(addrs).await,
    }
}
