//! Checksummed captures of a room and its player sessions

use super::RecoveryError;
use serde::{Deserialize, Serialize};
use shared::events::ConnectionState;
use shared::state::Player;
use shared::{GameEvent, GameState, PlayerId};

/// Per-player recovery unit
///
/// Owned by the recovery layer; `game_data` is a copy of the player's roster
/// entry taken at snapshot time, never the live entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStateSnapshot {
    pub player_id: PlayerId,
    pub session_id: String,
    pub connection_state: ConnectionState,
    pub last_activity: u64,
    pub game_data: Option<Player>,
    /// Actions received while the room could not apply them
    pub pending_actions: Vec<GameEvent>,
    pub recovery_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStateSnapshot {
    pub room_code: String,
    pub sequence: u64,
    pub timestamp: u64,
    pub version: u64,
    pub game_state: GameState,
    /// Sorted by player id
    pub players: Vec<PlayerStateSnapshot>,
    pub checksum: String,
}

impl GameStateSnapshot {
    pub fn capture(
        sequence: u64,
        timestamp: u64,
        game_state: &GameState,
        mut players: Vec<PlayerStateSnapshot>,
    ) -> Result<Self, RecoveryError> {
        players.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        for player in &mut players {
            player.game_data = game_state.player(&player.player_id).cloned();
        }
        Ok(Self {
            room_code: game_state.room_code.clone(),
            sequence,
            timestamp,
            version: game_state.version,
            checksum: game_state.checksum()?,
            game_state: game_state.clone(),
            players,
        })
    }

    /// Storage key; the zero-padded sequence keeps lexical and numeric order aligned
    pub fn key(room_code: &str, sequence: u64) -> String {
        format!("{}{:010}", Self::prefix(room_code), sequence)
    }

    pub fn prefix(room_code: &str) -> String {
        format!("snapshot/{}/", room_code)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RecoveryError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecoveryError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Recomputes the checksum and runs the structural validator
    pub fn validate(&self) -> Result<(), RecoveryError> {
        let actual = self.game_state.checksum()?;
        if actual != self.checksum {
            return Err(RecoveryError::ChecksumMismatch {
                sequence: self.sequence,
                expected: self.checksum.clone(),
                actual,
            });
        }
        if self.version != self.game_state.version {
            return Err(RecoveryError::Corrupt(vec![format!(
                "snapshot version {} does not match state version {}",
                self.version, self.game_state.version
            )]));
        }
        self.game_state
            .validate()
            .map_err(|e| match e {
                shared::GameError::CorruptState(issues) => RecoveryError::Corrupt(issues),
                other => RecoveryError::Corrupt(vec![other.to_string()]),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> GameState {
        let mut state = GameState::new("ROOM");
        for i in 0..5 {
            state.players.push(Player::new(format!("p{}", i), format!("P{}", i)));
        }
        state.version = 7;
        state
    }

    fn session(id: &str) -> PlayerStateSnapshot {
        PlayerStateSnapshot {
            player_id: id.to_string(),
            session_id: format!("s-{}", id),
            connection_state: ConnectionState::Connected,
            last_activity: 10,
            game_data: None,
            pending_actions: Vec::new(),
            recovery_token: String::new(),
        }
    }

    #[test]
    fn test_capture_copies_roster_entry() {
        let state = sample_state();
        let snapshot = GameStateSnapshot::capture(1, 100, &state, vec![session("p3"), session("p1")]).unwrap();
        assert_eq!(snapshot.players[0].player_id, "p1");
        assert_eq!(snapshot.players[0].game_data.as_ref().map(|p| p.name.as_str()), Some("P1"));
        assert_eq!(snapshot.version, 7);
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let snapshot = GameStateSnapshot::capture(3, 100, &sample_state(), vec![session("p0")]).unwrap();
        let bytes = snapshot.encode().unwrap();
        let decoded = GameStateSnapshot::decode(&bytes).unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.encode().unwrap(), bytes);
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn test_tampered_field_fails_validation() {
        let mut snapshot = GameStateSnapshot::capture(3, 100, &sample_state(), vec![]).unwrap();
        snapshot.game_state.leader_index = 2;
        assert!(matches!(
            snapshot.validate(),
            Err(RecoveryError::ChecksumMismatch { sequence: 3, .. })
        ));
    }

    #[test]
    fn test_keys_sort_by_sequence() {
        let a = GameStateSnapshot::key("ROOM", 9);
        let b = GameStateSnapshot::key("ROOM", 10);
        assert!(a < b);
        assert!(a.starts_with(&GameStateSnapshot::prefix("ROOM")));
    }
}
