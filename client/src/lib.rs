//! # Relay Client Library
//!
//! A headless client for the relay. It speaks the wire protocol from the
//! `shared` crate and keeps a picture of the other players from the messages
//! it receives, but does no rendering and captures no input. The bundled
//! `client` binary uses it to drive a scripted bot, which is handy for load
//! testing and for watching a relay from the terminal.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! - TCP connection to the relay with length-prefixed framing
//! - Background decoding of inbound frames into a cancel-safe queue
//! - Connection failures surfaced as `ClientError::ConnectFailure`
//!
//! ### World Module (`world`)
//! - Latest pose of every remote player, keyed by identity
//! - Removal of players when the relay announces their departure
//! - Counters for projectile events seen
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::RelayClient;
//! use client::world::RemoteWorld;
//! use shared::{Message, PlayerId, PlayerState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut relay = RelayClient::connect("127.0.0.1:5555").await?;
//!     let mut world = RemoteWorld::new(PlayerId::from("me"));
//!
//!     relay
//!         .send(&Message::Player(PlayerState::new("me", 400.0, 300.0, 0.0)))
//!         .await?;
//!
//!     while let Some(message) = relay.recv().await {
//!         world.apply(&message);
//!         println!("{} other players", world.player_count());
//!     }
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod world;
