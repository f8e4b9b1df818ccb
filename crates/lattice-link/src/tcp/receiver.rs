//! Receive pipeline.
//!
//! One task per connection keeps exactly one read outstanding. Each read
//! lands in a fixed buffer sized by `SocketConfig::read_buffer_size`; the
//! received region is appended to a carry-over buffer and split into packets
//! before the next read is issued.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;

use super::completion::{self, Completion, Flow};
use super::connection::Shared;
use super::handler::ConnectionHandler;
use super::state::ConnectionState;
use crate::framing::Framing;

/// Run the receive loop until the connection closes.
pub(crate) async fn run<H, F>(shared: Arc<Shared<H, F>>)
where
    F: Framing,
    H: ConnectionHandler<F::Packet>,
{
    let Some(mut reader) = shared.take_reader() else {
        shared.finish();
        return;
    };

    let mut buffer = vec![0u8; shared.config.socket.read_buffer_size];
    let mut carry = BytesMut::with_capacity(buffer.len());

    loop {
        let read = tokio::select! {
            biased;
            () = shared.closed() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed locally",
            )),
            read = reader.read(&mut buffer) => read,
        };

        let completion = Completion::Receive {
            read,
            buffer: &buffer,
            carry: &mut carry,
        };
        if completion::dispatch(&shared, completion) == Flow::Stop {
            break;
        }
    }
}

/// Handle one finished read.
pub(crate) fn on_receive_complete<H, F>(
    shared: &Shared<H, F>,
    read: io::Result<usize>,
    buffer: &[u8],
    carry: &mut BytesMut,
) -> Flow
where
    F: Framing,
    H: ConnectionHandler<F::Packet>,
{
    let n = match read {
        Ok(0) => {
            tracing::debug!(target: "lattice_link::receiver", id = %shared.id, "peer closed the connection");
            shared.finish();
            return Flow::Stop;
        }
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
            tracing::debug!(target: "lattice_link::receiver", id = %shared.id, reason = %e, "receive aborted");
            shared.finish();
            return Flow::Stop;
        }
        Err(e) => {
            tracing::warn!(target: "lattice_link::receiver", id = %shared.id, error = %e, "read failed");
            shared.finish();
            return Flow::Stop;
        }
    };

    carry.extend_from_slice(&buffer[..n]);
    let packets = match shared.framing.split(carry) {
        Ok(packets) => packets,
        Err(e) => {
            tracing::warn!(target: "lattice_link::receiver", id = %shared.id, error = %e, "framing failed");
            shared.finish();
            return Flow::Stop;
        }
    };

    tracing::trace!(
        target: "lattice_link::receiver",
        id = %shared.id,
        bytes = n,
        packets = packets.len(),
        pending = carry.len(),
        "read complete"
    );

    for packet in packets {
        if shared.state() != ConnectionState::Connected {
            break;
        }
        shared.handler.handle_message(packet);
    }

    Flow::Continue
}
