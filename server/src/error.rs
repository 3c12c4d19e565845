//! Error types for the relay.
//!
//! Only [`RelayError::Bind`] is fatal. Everything else is scoped to one
//! connection or one peer and is logged and recovered where it happens.

use crate::connection::ConnectionId;
use shared::ProtocolError;
use std::fmt;

/// Why a frame could not be queued for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    /// The peer's outbound queue is at capacity
    QueueFull,
    /// The peer's writer has stopped
    Closed,
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteFailure::QueueFull => f.write_str("outbound queue full"),
            WriteFailure::Closed => f.write_str("writer closed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed message: {0}")]
    MalformedMessage(#[source] ProtocolError),

    #[error("could not deliver to connection {connection}: {reason}")]
    PeerWriteFailure {
        connection: ConnectionId,
        reason: WriteFailure,
    },

    #[error("connection lost: {0}")]
    ConnectionLost(#[source] ProtocolError),
}
