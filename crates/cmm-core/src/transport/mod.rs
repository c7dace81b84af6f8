//! The ring transport: one incoming connection (Lobby) and one outgoing
//! connection (RingSender) per node.
//!
//! The Lobby accepts the predecessor, answers the registration handshake,
//! keeps the predecessor alive with heartbeats and routes every received
//! frame inward (Stack) or onward (ring-forward queue). The RingSender scans
//! for the nearest reachable successor, registers with it and drains the two
//! outbound queues onto that connection.

pub mod lobby;
pub mod sender;

pub use lobby::Lobby;
pub use sender::RingSender;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use cmm_api::{Frame, codec};

/// Read frames off one connection half into a channel until the peer goes
/// away. Reading in a dedicated task keeps the session loops cancel-safe:
/// `recv_frame` must never be dropped mid-frame inside a `select!`.
pub(crate) fn spawn_reader<R>(mut reader: R, tx: mpsc::UnboundedSender<Frame>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match codec::recv_frame(&mut reader, None).await {
                Ok(frame) => {
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "connection reader finished");
                    return;
                }
            }
        }
    })
}
