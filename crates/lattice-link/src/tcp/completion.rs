//! Routing of finished I/O operations to their pipeline.
//!
//! Every asynchronous operation a connection issues ends in a [`Completion`].
//! The task that awaited the operation hands it to [`dispatch`], which routes
//! it to the connect, receive or send handler and tells the task whether its
//! loop goes on. Each category is produced by exactly one task, so handlers of
//! one category never overlap; different categories may run concurrently
//! because they touch disjoint buffers.

use std::io;

use bytes::BytesMut;
use tokio::net::TcpStream;

use super::connection::{self, Shared};
use super::handler::ConnectionHandler;
use super::{receiver, sender};
use crate::error::Result;
use crate::framing::Framing;

/// Outcome of one asynchronous operation.
pub(crate) enum Completion<'a> {
    /// A connect (or accept) finished.
    Connect(io::Result<TcpStream>),
    /// A read into the receive buffer finished.
    Receive {
        /// Bytes transferred, `Ok(0)` on orderly close.
        read: io::Result<usize>,
        /// The fixed read buffer the bytes landed in.
        buffer: &'a [u8],
        /// Bytes left over from earlier reads.
        carry: &'a mut BytesMut,
    },
    /// A write of one queue entry finished.
    Send(Result<usize>),
}

impl Completion<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Receive { .. } => "receive",
            Self::Send(_) => "send",
        }
    }
}

/// Whether the issuing loop keeps running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Route `completion` to the handler for its category.
pub(crate) fn dispatch<H, F>(shared: &Shared<H, F>, completion: Completion<'_>) -> Flow
where
    F: Framing,
    H: ConnectionHandler<F::Packet>,
{
    tracing::trace!(
        target: "lattice_link::completion",
        id = %shared.id,
        kind = completion.kind(),
        "dispatching completion"
    );

    match completion {
        Completion::Connect(result) => connection::on_connect_complete(shared, result),
        Completion::Receive {
            read,
            buffer,
            carry,
        } => receiver::on_receive_complete(shared, read, buffer, carry),
        Completion::Send(result) => sender::on_send_complete(shared, result),
    }
}
