use log::debug;
use shared::{Message, PlayerId, PlayerState};
use std::collections::HashMap;

/// What one client knows about everybody else, built from relay traffic
#[derive(Debug, Clone)]
pub struct RemoteWorld {
    local_id: PlayerId,
    players: HashMap<PlayerId, PlayerState>,
    bullets_seen: u64,
    departures: u64,
}

impl RemoteWorld {
    pub fn new(local_id: PlayerId) -> Self {
        Self {
            local_id,
            players: HashMap::new(),
            bullets_seen: 0,
            departures: 0,
        }
    }

    /// Applies one inbound message. Echoes of the local player are ignored.
    pub fn apply(&mut self, message: &Message) {
        match message {
            Message::Player(state) => {
                if state.id == self.local_id {
                    return;
                }
                if self.players.insert(state.id.clone(), state.clone()).is_none() {
                    debug!("Player {} appeared", state.id);
                }
            }
            Message::Bullet(_) => {
                self.bullets_seen += 1;
            }
            Message::Disconnect { id } => {
                if self.players.remove(id).is_some() {
                    self.departures += 1;
                    debug!("Player {} left", id);
                }
            }
        }
    }

    pub fn player(&self, id: &PlayerId) -> Option<&PlayerState> {
        self.players.get(id)
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.values()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn bullets_seen(&self) -> u64 {
        self.bullets_seen
    }

    pub fn departures(&self) -> u64 {
        self.departures
    }
}
