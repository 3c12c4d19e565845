use log::{error, info, warn};
use shared::{read_frame, write_frame, Message, ProtocolError, DEFAULT_MAX_FRAME_SIZE};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to relay at {addr}: {source}")]
    ConnectFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connection to relay is closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => ClientError::Closed,
            _ => ClientError::Protocol(ProtocolError::Io(e)),
        }
    }
}

/// Framed connection to the relay.
///
/// Inbound frames are decoded by a background task and queued, so
/// [`RelayClient::recv`] is safe to use inside `tokio::select!`.
pub struct RelayClient {
    writer: OwnedWriteHalf,
    incoming: mpsc::UnboundedReceiver<Message>,
    reader_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl RelayClient {
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::ConnectFailure {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr().map_err(ProtocolError::from)?;

        let (read_half, writer) = stream.into_split();
        let (sender, incoming) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_loop(read_half, sender));

        info!("Connected to relay at {} from {}", addr, local_addr);

        Ok(RelayClient {
            writer,
            incoming,
            reader_task,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        let frame = message.to_frame()?;
        write_frame(&mut self.writer, &frame).await?;
        Ok(())
    }

    /// Next message from the relay, or `None` once the connection is gone
    /// and everything received has been consumed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.incoming.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.incoming.try_recv().ok()
    }

    /// Closes the write side so the relay sees an orderly shutdown.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(read_half: OwnedReadHalf, sender: mpsc::UnboundedSender<Message>) {
    let mut reader = BufReader::new(read_half);

    loop {
        match read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await {
            Ok(Some(payload)) => match Message::decode(&payload) {
                Ok(message) => {
                    if sender.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Skipping malformed message from relay: {}", e),
            },
            Ok(None) => {
                info!("Relay closed the connection");
                break;
            }
            Err(e) => {
                error!("Lost connection to relay: {}", e);
                break;
            }
        }
    }
}
