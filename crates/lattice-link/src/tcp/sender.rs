//! Send pipeline.
//!
//! Callers on any thread push encoded packets into an unbounded channel; one
//! task per connection drains it and performs one write at a time, waiting
//! for each write to finish before taking the next entry. A zero-length entry
//! stops the task.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};

use super::completion::{self, Completion, Flow};
use super::connection::Shared;
use super::handler::ConnectionHandler;
use super::state::ConnectionState;
use crate::error::{LinkError, Result};
use crate::framing::Framing;

/// Drain `queue` until the poison pill, the end of the channel, or a fatal
/// transport error.
pub(crate) async fn run<H, F>(shared: Arc<Shared<H, F>>, mut queue: mpsc::UnboundedReceiver<Bytes>)
where
    F: Framing,
    H: ConnectionHandler<F::Packet>,
{
    let mut state = shared.subscribe();

    while let Some(entry) = queue.recv().await {
        if entry.is_empty() {
            tracing::trace!(target: "lattice_link::sender", id = %shared.id, "sender stopped");
            return;
        }

        let result = match settled(&mut state).await {
            ConnectionState::Connected => write(&shared, &entry).await,
            _ => Err(LinkError::SendOnClosedConnection),
        };

        if completion::dispatch(&shared, Completion::Send(result)) == Flow::Stop {
            break;
        }
    }

    queue.close();
    let mut discarded = 0usize;
    while let Ok(entry) = queue.try_recv() {
        if !entry.is_empty() {
            discarded += 1;
        }
    }
    if discarded > 0 {
        tracing::debug!(target: "lattice_link::sender", id = %shared.id, discarded, "discarded queued packets");
    }
}

/// Wait until the connection is either open or closed for good.
async fn settled(state: &mut watch::Receiver<ConnectionState>) -> ConnectionState {
    let current = state
        .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected))
        .await
        .map(|s| *s);
    current.unwrap_or(ConnectionState::Disconnected)
}

async fn write<H, F>(shared: &Shared<H, F>, entry: &Bytes) -> Result<usize> {
    let Some(mut writer) = shared.take_writer() else {
        return Err(LinkError::SendOnClosedConnection);
    };

    let result = writer.write_all(entry).await;
    shared.restore_writer(writer);

    result
        .map(|()| entry.len())
        .map_err(|e| LinkError::Transport(e.to_string()))
}

/// Handle one finished write.
pub(crate) fn on_send_complete<H, F>(shared: &Shared<H, F>, result: Result<usize>) -> Flow
where
    F: Framing,
    H: ConnectionHandler<F::Packet>,
{
    match result {
        Ok(bytes) => {
            tracing::trace!(target: "lattice_link::sender", id = %shared.id, bytes, "write complete");
            Flow::Continue
        }
        Err(LinkError::SendOnClosedConnection) => {
            tracing::warn!(
                target: "lattice_link::sender",
                id = %shared.id,
                "packet dequeued after the connection closed"
            );
            shared.request_close();
            Flow::Stop
        }
        Err(e) => {
            tracing::warn!(target: "lattice_link::sender", id = %shared.id, error = %e, "write failed");
            shared.request_close();
            Flow::Stop
        }
    }
}
