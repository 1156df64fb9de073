pub mod batch;
pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod phase;
pub mod rules;
pub mod state;

use serde::{Deserialize, Serialize};

pub use error::GameError;
pub use events::{Broadcast, GameEvent, Intent, ServerEvent};
pub use phase::GamePhase;
pub use state::GameState;

pub type PlayerId = String;

pub const MIN_PLAYERS: usize = 5;
pub const MAX_PLAYERS: usize = 10;
pub const MAX_ROUNDS: u8 = 5;

/// Bumped whenever the packet layout changes
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest datagram either side will read
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect {
        client_version: u32,
        room_code: String,
        player_id: PlayerId,
        player_name: String,
        /// Present when resuming an earlier session
        recovery_token: Option<String>,
    },
    Action(GameEvent),
    Heartbeat {
        timestamp: u64,
    },
    SyncRequest {
        known_version: u64,
    },
    Disconnect,

    Connected {
        player_id: PlayerId,
        session_id: String,
        recovery_token: String,
        version: u64,
    },
    Ack {
        event_id: u64,
        version: u64,
    },
    Reject {
        event_id: u64,
        code: String,
        reason: String,
    },
    State(Broadcast),
    HeartbeatAck {
        timestamp: u64,
    },
    Disconnected {
        reason: String,
    },
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn reject(event_id: u64, err: &GameError) -> Self {
        Packet::Reject {
            event_id,
            code: err.code().to_string(),
            reason: err.to_string(),
        }
    }
}
