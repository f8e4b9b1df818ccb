//! Tests for connections and the TCP server.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use lattice_link::tcp::{
    Connection, ConnectionConfig, ConnectionHandler, ConnectionState, PacketSender, ServerConfig,
    TcpServer, TcpServerState,
};
use lattice_link::{Framing, FramingError, LengthPrefixed, LengthWidth, LinkError};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Event {
    Connected,
    Message(Vec<u8>),
    Disconnected,
    ConnectFailed,
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn messages(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Message(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, wanted: &Event) -> usize {
        self.events.lock().iter().filter(|e| *e == wanted).count()
    }
}

impl ConnectionHandler<Bytes> for Recorder {
    fn on_connected(&self) {
        self.events.lock().push(Event::Connected);
    }

    fn on_disconnected(&self) {
        self.events.lock().push(Event::Disconnected);
    }

    fn handle_message(&self, packet: Bytes) {
        self.events.lock().push(Event::Message(packet.to_vec()));
    }

    fn on_connect_failed(&self, _error: &LinkError) {
        self.events.lock().push(Event::ConnectFailed);
    }
}

/// Server-side handler that sends every packet back.
struct Echo {
    sender: PacketSender<LengthPrefixed>,
}

impl ConnectionHandler<Bytes> for Echo {
    fn on_connected(&self) {}

    fn on_disconnected(&self) {}

    fn handle_message(&self, packet: Bytes) {
        let _ = self.sender.send(&packet);
    }
}

/// Newline-delimited framing.
struct Lines;

impl Framing for Lines {
    type Packet = Bytes;

    fn split(&self, buffer: &mut BytesMut) -> Result<Vec<Bytes>, FramingError> {
        let mut lines = Vec::new();
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line = buffer.split_to(pos + 1).freeze();
            lines.push(line.slice(..pos));
        }
        Ok(lines)
    }

    fn encode(&self, packet: &Bytes, dst: &mut BytesMut) -> Result<(), FramingError> {
        if packet.contains(&b'\n') {
            return Err(FramingError::Malformed("line contains a newline".into()));
        }
        dst.extend_from_slice(packet);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn local_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn accept(listener: &TcpListener) -> TcpStream {
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
        .unwrap();
    stream
}

/// A connected client plus the raw peer socket on the other end.
async fn connected_pair() -> (Connection<Arc<Recorder>>, Arc<Recorder>, TcpStream) {
    let (listener, port) = local_listener().await;
    let recorder = Arc::new(Recorder::default());
    let connection = Connection::new(
        ConnectionConfig::new("127.0.0.1", port).no_delay(true),
        recorder.clone(),
    )
    .unwrap();

    connection.connect().await.unwrap();
    let peer = accept(&listener).await;
    assert!(wait_until(|| connection.is_connected()).await);
    (connection, recorder, peer)
}

async fn read_exactly(peer: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_secs(5), peer.read_exact(&mut buf))
        .await
        .expect("peer read timed out")
        .unwrap();
    buf
}

#[tokio::test]
async fn test_initial_state() {
    let recorder = Arc::new(Recorder::default());
    let connection = Connection::new(ConnectionConfig::new("127.0.0.1", 8080), recorder).unwrap();

    assert_eq!(connection.state(), ConnectionState::Unconnected);
    assert!(!connection.is_connected());
    assert_eq!(connection.host(), "127.0.0.1");
    assert_eq!(connection.port(), 8080);
    assert_eq!(connection.address(), "127.0.0.1:8080");
    assert!(connection.peer_addr().is_none());
}

#[tokio::test]
async fn test_connection_ids_are_unique() {
    let config = ConnectionConfig::new("127.0.0.1", 8080);
    let a = Connection::new(config.clone(), Arc::new(Recorder::default())).unwrap();
    let b = Connection::new(config, Arc::new(Recorder::default())).unwrap();

    assert_ne!(a.id(), b.id());
    assert_eq!(a.id(), a.id());
}

#[tokio::test]
async fn test_zero_read_buffer_is_rejected() {
    let config = ConnectionConfig::new("127.0.0.1", 8080).read_buffer_size(0);
    let result = Connection::new(config, Arc::new(Recorder::default()));

    assert!(matches!(result, Err(LinkError::Configuration(_))));
}

#[tokio::test]
async fn test_connect_with_port_zero_fails() {
    let connection =
        Connection::new(ConnectionConfig::new("127.0.0.1", 0), Arc::new(Recorder::default()))
            .unwrap();

    let err = connection.connect().await.unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(connection.state(), ConnectionState::Unconnected);
}

#[tokio::test]
async fn test_connect_unresolvable_host_fails() {
    let recorder = Arc::new(Recorder::default());
    let connection = Connection::new(
        ConnectionConfig::new("no-such-host.invalid", 7000),
        recorder.clone(),
    )
    .unwrap();

    let err = connection.connect().await.unwrap_err();
    assert!(err.is_configuration(), "unexpected error: {err}");
    assert_eq!(connection.state(), ConnectionState::Unconnected);
    assert!(recorder.events().is_empty());
}

#[tokio::test]
async fn test_connect_refused_reports_failure() {
    let (listener, port) = local_listener().await;
    drop(listener);

    let recorder = Arc::new(Recorder::default());
    let connection =
        Connection::new(ConnectionConfig::new("127.0.0.1", port), recorder.clone()).unwrap();

    connection.connect().await.unwrap();
    assert!(wait_until(|| recorder.count(&Event::ConnectFailed) == 1).await);
    assert_eq!(connection.state(), ConnectionState::Unconnected);
    assert_eq!(recorder.count(&Event::Connected), 0);
    assert_eq!(recorder.count(&Event::Disconnected), 0);
}

#[tokio::test]
async fn test_connect_twice_is_invalid() {
    let (connection, recorder, _peer) = connected_pair().await;

    let err = connection.connect().await.unwrap_err();
    assert!(err.is_invalid_state());
    assert_eq!(recorder.count(&Event::Connected), 1);
}

#[tokio::test]
async fn test_send_ten_byte_packet() {
    let (connection, _recorder, mut peer) = connected_pair().await;

    connection
        .send(&Bytes::from_static(b"0123456789"))
        .unwrap();

    let wire = read_exactly(&mut peer, 11).await;
    assert_eq!(wire[0], 0x0A);
    assert_eq!(&wire[1..], b"0123456789");
}

#[tokio::test]
async fn test_packets_queued_before_connect_are_sent() {
    let (listener, port) = local_listener().await;
    let connection =
        Connection::new(ConnectionConfig::new("127.0.0.1", port), Arc::new(Recorder::default()))
            .unwrap();

    connection.send(&Bytes::from_static(b"early")).unwrap();
    connection.connect().await.unwrap();
    let mut peer = accept(&listener).await;

    assert_eq!(read_exactly(&mut peer, 6).await, b"\x05early");
}

#[tokio::test]
async fn test_burst_split_across_reads() {
    let (_connection, recorder, mut peer) = connected_pair().await;

    // Three packets; the first write ends in the middle of the second.
    peer.write_all(&[3, b'a', b'b', b'c', 2, b'd']).await.unwrap();
    peer.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    peer.write_all(&[b'e', 4, b'f', b'g', b'h', b'i']).await.unwrap();

    assert!(wait_until(|| recorder.messages().len() == 3).await);
    assert_eq!(
        recorder.messages(),
        vec![b"abc".to_vec(), b"de".to_vec(), b"fghi".to_vec()]
    );
}

#[tokio::test]
async fn test_connected_precedes_messages() {
    let (_connection, recorder, mut peer) = connected_pair().await;

    peer.write_all(&[1, b'x']).await.unwrap();
    assert!(wait_until(|| recorder.messages().len() == 1).await);

    let events = recorder.events();
    assert_eq!(events[0], Event::Connected);
    assert_eq!(events[1], Event::Message(b"x".to_vec()));
}

#[tokio::test]
async fn test_remote_close_disconnects_once() {
    let (connection, recorder, mut peer) = connected_pair().await;

    peer.write_all(&[2, b'h', b'i']).await.unwrap();
    assert!(wait_until(|| recorder.messages().len() == 1).await);
    drop(peer);

    assert!(wait_until(|| recorder.count(&Event::Disconnected) == 1).await);
    assert!(!connection.is_connected());
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(&Event::Disconnected), 1);
    assert_eq!(recorder.events().last(), Some(&Event::Disconnected));
}

#[tokio::test]
async fn test_local_disconnect() {
    let (connection, recorder, mut peer) = connected_pair().await;

    connection.disconnect();
    assert!(!connection.is_connected());
    assert!(wait_until(|| recorder.count(&Event::Disconnected) == 1).await);

    // The peer sees an orderly close and no data.
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), peer.read_to_end(&mut rest))
        .await
        .expect("peer did not observe close")
        .unwrap();
    assert!(rest.is_empty());

    // Further calls are harmless.
    connection.disconnect();
    assert!(matches!(
        connection.send(&Bytes::from_static(b"late")),
        Err(LinkError::SendOnClosedConnection)
    ));
    assert!(connection.connect().await.unwrap_err().is_invalid_state());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(&Event::Disconnected), 1);
}

#[tokio::test]
async fn test_disconnect_before_connect_is_noop() {
    let recorder = Arc::new(Recorder::default());
    let connection =
        Connection::new(ConnectionConfig::new("127.0.0.1", 8080), recorder.clone()).unwrap();

    connection.disconnect();
    assert_eq!(connection.state(), ConnectionState::Unconnected);
    assert!(recorder.events().is_empty());
}

#[tokio::test]
async fn test_drop_runs_disconnect_hook() {
    let (connection, recorder, mut peer) = connected_pair().await;

    drop(connection);
    assert!(wait_until(|| recorder.count(&Event::Disconnected) == 1).await);

    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), peer.read_to_end(&mut rest))
        .await
        .expect("peer did not observe close")
        .unwrap();
}

#[tokio::test]
async fn test_oversized_packet_disconnects() {
    let (listener, port) = local_listener().await;
    let recorder = Arc::new(Recorder::default());
    let framing = LengthPrefixed::new(LengthWidth::U16).max_packet_size(4);
    let connection = Connection::with_framing(
        ConnectionConfig::new("127.0.0.1", port),
        recorder.clone(),
        framing,
    )
    .unwrap();

    connection.connect().await.unwrap();
    let mut peer = accept(&listener).await;
    peer.write_all(&[0, 9, 1, 2, 3]).await.unwrap();

    assert!(wait_until(|| recorder.count(&Event::Disconnected) == 1).await);
    assert!(recorder.messages().is_empty());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_oversized_outbound_packet_is_rejected() {
    let (connection, _recorder, _peer) = connected_pair().await;

    let err = connection.send(&Bytes::from(vec![0u8; 300])).unwrap_err();
    assert!(matches!(
        err,
        LinkError::Framing(FramingError::PayloadTooLong { len: 300, max: 255 })
    ));
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_custom_framing() {
    let (listener, port) = local_listener().await;
    let recorder = Arc::new(Recorder::default());
    let connection = Connection::with_framing(
        ConnectionConfig::new("127.0.0.1", port),
        recorder.clone(),
        Lines,
    )
    .unwrap();

    connection.connect().await.unwrap();
    let mut peer = accept(&listener).await;

    connection.send(&Bytes::from_static(b"ping")).unwrap();
    assert_eq!(read_exactly(&mut peer, 5).await, b"ping\n");

    peer.write_all(b"one\ntw").await.unwrap();
    peer.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.write_all(b"o\n").await.unwrap();

    assert!(wait_until(|| recorder.messages().len() == 2).await);
    assert_eq!(recorder.messages(), vec![b"one".to_vec(), b"two".to_vec()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sends_from_many_threads_keep_per_thread_order() {
    const THREADS: u8 = 4;
    const PER_THREAD: u8 = 50;

    let (connection, _recorder, mut peer) = connected_pair().await;

    std::thread::scope(|scope| {
        for thread in 0..THREADS {
            let sender = connection.sender();
            scope.spawn(move || {
                for seq in 0..PER_THREAD {
                    sender.send(&Bytes::from(vec![thread, seq])).unwrap();
                }
            });
        }
    });

    let total = THREADS as usize * PER_THREAD as usize;
    let wire = read_exactly(&mut peer, total * 3).await;

    let mut next = vec![0u8; THREADS as usize];
    for frame in wire.chunks(3) {
        assert_eq!(frame[0], 2, "frames must not interleave");
        let (thread, seq) = (frame[1] as usize, frame[2]);
        assert_eq!(seq, next[thread], "thread {thread} out of order");
        next[thread] += 1;
    }
    assert!(next.iter().all(|&n| n == PER_THREAD));
}

#[tokio::test]
async fn test_server_initial_state() {
    let server = TcpServer::new(ServerConfig::new("127.0.0.1", 0), |sender| Echo { sender });

    assert_eq!(server.state(), TcpServerState::Stopped);
    assert!(!server.is_listening());
    assert_eq!(server.connection_count(), 0);
    assert!(server.connections().is_empty());
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn test_client_server_echo() {
    let server = TcpServer::new(ServerConfig::new("127.0.0.1", 0), |sender| Echo { sender });
    let addr = server.start().await.unwrap();
    assert!(server.is_listening());
    assert_eq!(server.local_addr(), Some(addr));

    let recorder = Arc::new(Recorder::default());
    let client = Connection::new(
        ConnectionConfig::new("127.0.0.1", addr.port()).no_delay(true),
        recorder.clone(),
    )
    .unwrap();
    client.connect().await.unwrap();
    assert!(wait_until(|| client.is_connected()).await);
    assert!(wait_until(|| server.connection_count() == 1).await);

    client.send(&Bytes::from_static(b"Hello, TCP Server!")).unwrap();
    client.send(&Bytes::from_static(b"again")).unwrap();

    assert!(wait_until(|| recorder.messages().len() == 2).await);
    assert_eq!(
        recorder.messages(),
        vec![b"Hello, TCP Server!".to_vec(), b"again".to_vec()]
    );

    // Closing the client removes it from the server's live set.
    client.disconnect();
    assert!(wait_until(|| server.connection_count() == 0).await);

    server.stop();
    assert!(wait_until(|| server.state() == TcpServerState::Stopped).await);
}

#[tokio::test]
async fn test_server_broadcast() {
    let server = TcpServer::new(ServerConfig::new("127.0.0.1", 0), |sender| Echo { sender });
    let addr = server.start().await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let recorder = Arc::new(Recorder::default());
        let client = Connection::new(
            ConnectionConfig::new("127.0.0.1", addr.port()),
            recorder.clone(),
        )
        .unwrap();
        client.connect().await.unwrap();
        clients.push((client, recorder));
    }

    assert!(wait_until(|| server.connection_count() == 3).await);
    assert_eq!(server.broadcast(&Bytes::from_static(b"news")), 3);

    for (_client, recorder) in &clients {
        assert!(wait_until(|| recorder.messages() == vec![b"news".to_vec()]).await);
    }

    let id = server.connections()[0];
    assert!(server.send_to(id, &Bytes::from_static(b"direct")).is_ok());

    server.stop();
}

#[tokio::test]
async fn test_server_stop_disconnects_clients() {
    let server = TcpServer::new(ServerConfig::new("127.0.0.1", 0), |sender| Echo { sender });
    let addr = server.start().await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let client =
        Connection::new(ConnectionConfig::new("127.0.0.1", addr.port()), recorder.clone())
            .unwrap();
    client.connect().await.unwrap();
    assert!(wait_until(|| server.connection_count() == 1).await);

    server.stop();
    assert!(wait_until(|| server.state() == TcpServerState::Stopped).await);
    assert_eq!(server.connection_count(), 0);
    assert!(server.local_addr().is_none());

    assert!(wait_until(|| recorder.count(&Event::Disconnected) == 1).await);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_server_disconnect_client() {
    let server = TcpServer::new(ServerConfig::new("127.0.0.1", 0), |sender| Echo { sender });
    let addr = server.start().await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let client =
        Connection::new(ConnectionConfig::new("127.0.0.1", addr.port()), recorder.clone())
            .unwrap();
    client.connect().await.unwrap();
    assert!(wait_until(|| server.connection_count() == 1).await);

    let id = server.connections()[0];
    assert!(server.get_connection(id).is_some());
    server.disconnect_client(id);

    assert!(wait_until(|| recorder.count(&Event::Disconnected) == 1).await);
    assert!(wait_until(|| server.connection_count() == 0).await);
    assert!(server.get_connection(id).is_none());
    assert!(server.send_to(id, &Bytes::from_static(b"gone")).is_err());

    server.stop();
}

#[tokio::test]
async fn test_queued_packets_discarded_after_disconnect() {
    let (connection, recorder, mut peer) = connected_pair().await;

    // On the current-thread runtime the sender task cannot run until this
    // task yields, so every entry is still queued when the close lands.
    let payload = Bytes::from(vec![0x5A; 200]);
    for _ in 0..5000 {
        connection.send(&payload).unwrap();
    }
    connection.disconnect();

    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), peer.read_to_end(&mut rest))
        .await
        .expect("peer did not observe close")
        .unwrap();
    assert!(rest.is_empty(), "{} bytes written after disconnect", rest.len());

    assert!(wait_until(|| recorder.count(&Event::Disconnected) == 1).await);
    assert!(connection.send(&payload).is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(&Event::Disconnected), 1);
}

#[tokio::test]
#[allow(deprecated)]
async fn test_peer_reset_while_sending() {
    let (connection, recorder, peer) = connected_pair().await;

    // Closing with a zero linger sends RST instead of FIN.
    peer.set_linger(Some(Duration::ZERO)).unwrap();
    drop(peer);

    let payload = Bytes::from(vec![0xA5; 128]);
    let mut rejected = false;
    for _ in 0..400 {
        if connection.send(&payload).is_err() {
            rejected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(rejected, "sends kept succeeding after the peer reset");
    assert!(wait_until(|| recorder.count(&Event::Disconnected) == 1).await);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!connection.is_connected());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(&Event::Disconnected), 1);
}

#[tokio::test]
async fn test_connect_timeout_reports_failure() {
    let (_listener, port) = local_listener().await;
    let recorder = Arc::new(Recorder::default());
    let connection = Connection::new(
        ConnectionConfig::new("127.0.0.1", port).connect_timeout(Duration::ZERO),
        recorder.clone(),
    )
    .unwrap();

    connection.connect().await.unwrap();
    assert!(wait_until(|| recorder.count(&Event::ConnectFailed) == 1).await);
    assert_eq!(connection.state(), ConnectionState::Unconnected);
    assert_eq!(recorder.count(&Event::Connected), 0);
}

#[tokio::test]
async fn test_server_restart() {
    let server = TcpServer::new(ServerConfig::new("127.0.0.1", 0), |sender| Echo { sender });
    server.start().await.unwrap();

    server.stop();
    assert_eq!(server.state(), TcpServerState::Stopping);
    assert!(!server.is_listening());

    let second = server.start().await.unwrap();
    assert_eq!(server.state(), TcpServerState::Listening);
    assert_eq!(server.local_addr(), Some(second));

    // The old accept task must not reset the new listener's state.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.state(), TcpServerState::Listening);
    assert_eq!(server.local_addr(), Some(second));

    let recorder = Arc::new(Recorder::default());
    let client = Connection::new(
        ConnectionConfig::new("127.0.0.1", second.port()),
        recorder.clone(),
    )
    .unwrap();
    client.connect().await.unwrap();
    assert!(wait_until(|| recorder.count(&Event::Connected) == 1).await);
    assert!(wait_until(|| server.connection_count() == 1).await);

    client.send(&Bytes::from_static(b"back")).unwrap();
    assert!(wait_until(|| recorder.messages() == vec![b"back".to_vec()]).await);

    server.stop();
}
