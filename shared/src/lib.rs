//! Wire protocol shared by the relay and its clients.
//!
//! Every message is a JSON object with a `type` discriminator, carried in a
//! length-prefixed frame (see [`framing`]). The relay only inspects enough of
//! a message to keep its registry current; payloads are forwarded verbatim.

pub mod framing;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use framing::{encode_frame, read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};

/// Errors raised while encoding, framing or decoding messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque, client-generated player token
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        PlayerId(id.to_string())
    }
}

impl From<String> for PlayerId {
    fn from(id: String) -> Self {
        PlayerId(id)
    }
}

/// Last self-reported pose of one player
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerState {
    pub id: PlayerId,
    pub x: f64,
    pub y: f64,
    /// Orientation in degrees. Clients that never send one face 0.
    #[serde(default)]
    pub angle: f64,
}

impl PlayerState {
    pub fn new(id: impl Into<PlayerId>, x: f64, y: f64, angle: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            angle,
        }
    }
}

/// A fired projectile. Relayed once, never stored.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProjectileEvent {
    pub x: f64,
    pub y: f64,
    pub dx: f64,
    pub dy: f64,
}

impl ProjectileEvent {
    /// Builds a projectile leaving `(x, y)` towards `(target_x, target_y)`.
    /// The direction is unit length, or zero when the target is the origin.
    pub fn aimed(x: f64, y: f64, target_x: f64, target_y: f64) -> Self {
        let (dx, dy) = normalize_vector(target_x - x, target_y - y);
        Self { x, y, dx, dy }
    }
}

/// Messages exchanged over a relay connection
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Player(PlayerState),
    Bullet(ProjectileEvent),
    /// Sent by the relay only, when the named player's connection closes
    Disconnect { id: PlayerId },
}

impl Message {
    /// Parses one JSON payload. Unknown extra fields are ignored.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Encodes and frames the message in one step.
    pub fn to_frame(&self) -> Result<Bytes, ProtocolError> {
        self.to_frame_within(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Like [`Message::to_frame`], with an explicit payload limit.
    pub fn to_frame_within(&self, max_size: usize) -> Result<Bytes, ProtocolError> {
        encode_frame(&self.encode()?, max_size)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Player(_) => "player",
            Message::Bullet(_) => "bullet",
            Message::Disconnect { .. } => "disconnect",
        }
    }
}

impl From<PlayerState> for Message {
    fn from(state: PlayerState) -> Self {
        Message::Player(state)
    }
}

impl From<ProjectileEvent> for Message {
    fn from(event: ProjectileEvent) -> Self {
        Message::Bullet(event)
    }
}

/// Scales `(x, y)` to unit length; the zero vector stays zero.
pub fn normalize_vector(x: f64, y: f64) -> (f64, f64) {
    let magnitude = (x * x + y * y).sqrt();
    if magnitude > 0.0 {
        (x / magnitude, y / magnitude)
    } else {
        (0.0, 0.0)
    }
}
