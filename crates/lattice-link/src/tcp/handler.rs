//! Owner hooks invoked by the connection pipelines.

use std::sync::Arc;

use crate::error::LinkError;

/// Callbacks a connection owner supplies.
///
/// Hooks run synchronously on the Tokio worker that completed the
/// corresponding I/O. A hook that blocks stalls its pipeline, so long work
/// should be handed off to another task.
///
/// Ordering guarantees:
/// - [`on_connected`](Self::on_connected) runs before the first
///   [`handle_message`](Self::handle_message).
/// - [`handle_message`](Self::handle_message) sees packets in wire order.
/// - [`on_disconnected`](Self::on_disconnected) runs exactly once per
///   connection that reached the connected state, whether the close was
///   local, remote, or caused by a transport error.
pub trait ConnectionHandler<P>: Send + Sync + 'static {
    /// The transport is open. The receive pipeline starts after this returns.
    fn on_connected(&self);

    /// The connection has closed. No hook runs after this one.
    fn on_disconnected(&self);

    /// One complete inbound packet.
    fn handle_message(&self, packet: P);

    /// A connect attempt failed; the connection is back to `Unconnected`.
    fn on_connect_failed(&self, error: &LinkError) {
        let _ = error;
    }
}

impl<P, T> ConnectionHandler<P> for Arc<T>
where
    T: ConnectionHandler<P> + ?Sized,
{
    fn on_connected(&self) {
        (**self).on_connected();
    }

    fn on_disconnected(&self) {
        (**self).on_disconnected();
    }

    fn handle_message(&self, packet: P) {
        (**self).handle_message(packet);
    }

    fn on_connect_failed(&self, error: &LinkError) {
        (**self).on_connect_failed(error);
    }
}
