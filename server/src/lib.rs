//! # Relay Server Library
//!
//! This library implements the relay that keeps connected game clients in
//! sync. It does not simulate the game: each client reports its own pose and
//! fires its own projectiles, and the relay forwards those messages to every
//! other client as they arrive.
//!
//! ## Core Responsibilities
//!
//! ### Connection Lifecycle
//! Every accepted TCP stream moves through `Connected` (accepted, no identity
//! yet), `Identified` (its first `player` message named the player it
//! controls) and `Closed`. On close the player's entry is removed and the
//! remaining clients receive a `disconnect` notice naming it.
//!
//! ### State Tracking
//! The registry keeps the latest pose reported by each identity. New
//! connections receive those poses straight away, so a joining player sees
//! everybody already in the game before their next update arrives.
//!
//! ### Fan-out
//! Inbound `player` and `bullet` messages are forwarded verbatim to every
//! other connection. Delivery is best effort and at most once: a peer that
//! cannot keep up loses frames, and nobody else is affected.
//!
//! ## Architecture Design
//!
//! ### Task per Connection
//! An acceptor task owns the listener and spawns one receive task per
//! connection, plus a writer task that owns the socket's write half. Receive
//! tasks never talk to each other directly; they meet only in the
//! [`registry::Registry`], whose maps are guarded by a single lock.
//!
//! ### Bounded Outbound Queues
//! Broadcasts copy the target list out of the registry, release the lock and
//! push frames onto each target's bounded queue without waiting. Socket
//! writes happen in the writer task under a timeout, so a stalled peer can
//! neither block registry updates nor hold up the sender.
//!
//! ### Framing
//! Messages travel as length-prefixed JSON frames (see [`shared::framing`]),
//! so several messages in one read, or one message split over several reads,
//! decode correctly.
//!
//! ## Module Organization
//!
//! - [`connection`]: connection ids, outbound handles and writer tasks
//! - [`registry`]: the shared connection/identity/state table
//! - [`network`]: listener, receive loop, dispatch and broadcast
//! - [`error`]: the relay's error taxonomy
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{RelayConfig, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(RelayConfig {
//!         port: 5555,
//!         ..RelayConfig::default()
//!     })
//!     .await?;
//!
//!     // Accepts clients and relays their messages until the process exits
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod network;
pub mod registry;
