use crate::error::{RelayError, WriteFailure};
use bytes::Bytes;
use log::{debug, warn};
use shared::write_frame;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Relay-assigned identifier for one accepted stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocates a process-unique id
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Write side of a client connection.
///
/// Cloning is cheap; every clone feeds the same bounded outbound queue,
/// which a single writer task drains in order.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    sender: mpsc::Sender<Bytes>,
}

impl Connection {
    pub fn new(id: ConnectionId, addr: SocketAddr, sender: mpsc::Sender<Bytes>) -> Self {
        Connection { id, addr, sender }
    }

    /// Queues a frame without waiting. A full or closed queue is reported
    /// as a `PeerWriteFailure` and the frame is dropped for this peer.
    pub fn send(&self, frame: Bytes) -> Result<(), RelayError> {
        self.sender.try_send(frame).map_err(|e| {
            let reason = match e {
                TrySendError::Full(_) => WriteFailure::QueueFull,
                TrySendError::Closed(_) => WriteFailure::Closed,
            };
            RelayError::PeerWriteFailure {
                connection: self.id,
                reason,
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Spawns the task that owns the socket's write half.
///
/// Frames are written in queue order, each bounded by `write_timeout`. The
/// task stops on the first failed or stalled write, or once every
/// `Connection` handle feeding the queue has been dropped.
pub fn spawn_writer<W>(
    id: ConnectionId,
    addr: SocketAddr,
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    write_timeout: Duration,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match timeout(write_timeout, write_frame(&mut writer, &frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Write to connection {} ({}) failed: {}", id, addr, e);
                    break;
                }
                Err(_) => {
                    warn!(
                        "Write to connection {} ({}) stalled for {:?}, dropping writer",
                        id, addr, write_timeout
                    );
                    break;
                }
            }
        }
        debug!("Writer for connection {} stopped", id);
    })
}
