//! Shared table of live connections, player identities and player states
//!
//! This module is the only mutable state shared between connection tasks:
//! - Which connections are currently accepted and can receive broadcasts
//! - Which player identity each connection has announced
//! - The last pose each identity reported
//!
//! All three maps sit behind a single lock and are changed together, so no
//! caller ever observes an identity without its state or a state without an
//! owning connection.

use crate::connection::{Connection, ConnectionId};
use log::{debug, error, info, warn};
use shared::{Message, PlayerId, PlayerState};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct RegistryTable {
    connections: HashMap<ConnectionId, Connection>,
    identities: HashMap<ConnectionId, PlayerId>,
    states: HashMap<PlayerId, PlayerState>,
}

impl RegistryTable {
    fn is_claimed(&self, identity: &PlayerId) -> bool {
        self.identities.values().any(|claimed| claimed == identity)
    }

    /// Drops the connection's identity, and its state once nobody else
    /// claims that identity.
    fn release_identity(&mut self, connection: ConnectionId) -> Option<PlayerId> {
        let identity = self.identities.remove(&connection)?;
        if !self.is_claimed(&identity) {
            self.states.remove(&identity);
        }
        Some(identity)
    }
}

/// Point-in-time copy of the whole registry table
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub connections: Vec<ConnectionId>,
    pub identities: HashMap<ConnectionId, PlayerId>,
    pub states: HashMap<PlayerId, PlayerState>,
}

impl RegistrySnapshot {
    /// True when every identity belongs to a live connection and has a state,
    /// and every state is claimed by at least one identity.
    pub fn is_consistent(&self) -> bool {
        let identities_backed = self.identities.iter().all(|(connection, identity)| {
            self.connections.contains(connection) && self.states.contains_key(identity)
        });
        let states_owned = self
            .states
            .iter()
            .all(|(identity, state)| {
                state.id == *identity && self.identities.values().any(|id| id == identity)
            });

        identities_backed && states_owned
    }
}

/// Connection registry shared by every relay task
///
/// Wrap it in an `Arc` and hand a clone to each connection task. Methods take
/// the lock for the duration of a map update only; none of them perform I/O
/// while holding it.
#[derive(Debug, Default)]
pub struct Registry {
    table: RwLock<RegistryTable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly accepted connection
    ///
    /// The connection has no identity yet but is immediately a broadcast
    /// target, so it hears other players before it announces itself.
    pub async fn attach(&self, connection: Connection) {
        let mut table = self.table.write().await;
        info!("Connection {} attached from {}", connection.id, connection.addr);
        table.connections.insert(connection.id, connection);
    }

    /// Attaches a new connection and queues a `player` frame for every known
    /// state before releasing the lock.
    ///
    /// Anything broadcast afterwards, such as the `disconnect` for one of
    /// those players, is queued behind the snapshot. Queuing never waits, so
    /// the lock is held for map access and encoding only. Returns how many
    /// states were queued.
    pub async fn attach_and_sync(&self, connection: Connection, max_frame_size: usize) -> usize {
        let mut table = self.table.write().await;
        let mut sent = 0;

        for state in table.states.values() {
            let frame = match Message::Player(state.clone()).to_frame_within(max_frame_size) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to encode join snapshot for {}: {}", state.id, e);
                    continue;
                }
            };
            match connection.send(frame) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!("{}", e);
                    break;
                }
            }
        }

        info!(
            "Connection {} attached from {}, synced {} players",
            connection.id, connection.addr, sent
        );
        table.connections.insert(connection.id, connection);
        sent
    }

    /// Binds `state.id` to the connection and stores the state
    ///
    /// Both maps are written under one lock. Calling it again for the same
    /// connection and identity just refreshes the state. A different
    /// identity replaces the previous one, whose state is dropped if no other
    /// connection claims it. Returns false, recording nothing, when the
    /// connection is not attached.
    pub async fn register(&self, connection: ConnectionId, state: PlayerState) -> bool {
        let mut table = self.table.write().await;
        if !table.connections.contains_key(&connection) {
            debug!("Ignoring registration for detached connection {}", connection);
            return false;
        }

        let identity = state.id.clone();
        if let Some(previous) = table.identities.insert(connection, identity.clone()) {
            if previous != identity && !table.is_claimed(&previous) {
                table.states.remove(&previous);
            }
        } else {
            info!("Connection {} identified as player {}", connection, identity);
        }
        table.states.insert(identity, state);
        true
    }

    /// Overwrites the stored pose for an already registered identity.
    /// Unknown identities are left alone and reported with `false`.
    pub async fn update_state(&self, state: PlayerState) -> bool {
        let mut table = self.table.write().await;
        match table.states.get_mut(&state.id) {
            Some(stored) => {
                *stored = state;
                true
            }
            None => false,
        }
    }

    /// Removes a connection together with its identity and state
    ///
    /// Returns the identity the connection had announced so the caller can
    /// tell the remaining peers. Connections that never identified, or were
    /// already removed, yield `None`.
    pub async fn unregister(&self, connection: ConnectionId) -> Option<PlayerId> {
        let mut table = self.table.write().await;
        let attached = table.connections.remove(&connection).is_some();
        let identity = table.release_identity(connection);

        if attached {
            match &identity {
                Some(id) => info!("Connection {} (player {}) unregistered", connection, id),
                None => info!("Connection {} unregistered before identifying", connection),
            }
        }
        identity
    }

    /// Copies out every attached connection except `exclude`
    ///
    /// The lock is released before returning, so callers can write to the
    /// targets without blocking registry updates.
    pub async fn broadcast_targets(&self, exclude: ConnectionId) -> Vec<Connection> {
        let table = self.table.read().await;
        table
            .connections
            .values()
            .filter(|connection| connection.id != exclude)
            .cloned()
            .collect()
    }

    /// All known player states
    pub async fn players(&self) -> Vec<PlayerState> {
        let table = self.table.read().await;
        table.states.values().cloned().collect()
    }

    pub async fn state_of(&self, identity: &PlayerId) -> Option<PlayerState> {
        let table = self.table.read().await;
        table.states.get(identity).cloned()
    }

    pub async fn identity_of(&self, connection: ConnectionId) -> Option<PlayerId> {
        let table = self.table.read().await;
        table.identities.get(&connection).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.table.read().await.connections.len()
    }

    pub async fn player_count(&self) -> usize {
        self.table.read().await.states.len()
    }

    /// Copies the full table under a single read lock
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let table = self.table.read().await;
        RegistrySnapshot {
            connections: table.connections.keys().copied().collect(),
            identities: table.identities.clone(),
            states: table.states.clone(),
        }
    }
}
