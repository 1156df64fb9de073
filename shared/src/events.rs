//! Game events exchanged between clients and the authoritative room
//!
//! Clients send [`GameEvent`]s wrapping an [`Intent`]; the room answers with
//! acknowledgements and [`Broadcast`]s of [`ServerEvent`]s stamped with the
//! authoritative version.

use crate::phase::GamePhase;
use crate::state::{GameSettings, GameState, MissionVote, Player, VoteChoice};
use crate::PlayerId;
use serde::{Deserialize, Serialize};

/// What a player wants to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    JoinRoom { player_name: String },
    LeaveRoom,
    PlayerReadyChanged { ready: bool },
    UpdateSettings { settings: GameSettings },
    StartGame,
    MissionTeamSelected { team: Vec<PlayerId> },
    VoteCast { choice: VoteChoice },
    MissionVoteCast { vote: MissionVote },
    Assassinate { target_id: PlayerId },
}

/// How quickly an event must reach its audience
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryClass {
    /// Applied or forwarded as soon as it is received
    Immediate,
    /// Coalesced inside a short window
    Batched,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::JoinRoom { .. } => "join_room",
            Intent::LeaveRoom => "leave_room",
            Intent::PlayerReadyChanged { .. } => "player_ready_changed",
            Intent::UpdateSettings { .. } => "update_settings",
            Intent::StartGame => "start_game",
            Intent::MissionTeamSelected { .. } => "mission_team_selected",
            Intent::VoteCast { .. } => "vote_cast",
            Intent::MissionVoteCast { .. } => "mission_vote_cast",
            Intent::Assassinate { .. } => "assassinate",
        }
    }

    /// Whether a client may apply this intent locally before confirmation
    ///
    /// Intents whose effect depends on information the client lacks (role
    /// deals, roster changes) wait for the authoritative answer.
    pub fn is_speculative(&self) -> bool {
        matches!(
            self,
            Intent::PlayerReadyChanged { .. }
                | Intent::MissionTeamSelected { .. }
                | Intent::VoteCast { .. }
                | Intent::MissionVoteCast { .. }
        )
    }

    /// Intents that change game progress trigger a snapshot once applied
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Intent::StartGame
                | Intent::VoteCast { .. }
                | Intent::MissionVoteCast { .. }
                | Intent::Assassinate { .. }
        )
    }
}

/// Envelope for an intent on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEvent {
    pub id: u64,
    pub player_id: PlayerId,
    pub room_code: String,
    pub timestamp: u64,
    /// Authoritative version the sender had seen when creating the event
    pub version: u64,
    pub intent: Intent,
}

impl GameEvent {
    /// True when the receiver has moved past the version this event was based on
    pub fn is_stale(&self, current_version: u64) -> bool {
        self.version < current_version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryStatus {
    Paused,
    Resumed,
    Restored,
}

/// State events the UI renders against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    RoomStateSync { state: GameState },
    PlayerJoined { player: Player },
    PlayerLeft { player_id: PlayerId },
    GamePhaseChanged { from: GamePhase, to: GamePhase },
    VotingProgressUpdated { votes_cast: usize, total: usize },
    GameStateUpdated { state: GameState },
    SettingsChanged { settings: GameSettings },
    PlayerPresenceChanged { player_id: PlayerId, connection: ConnectionState },
    RecoveryStatusChanged { status: RecoveryStatus },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::RoomStateSync { .. } => "room_state_sync",
            ServerEvent::PlayerJoined { .. } => "player_joined",
            ServerEvent::PlayerLeft { .. } => "player_left",
            ServerEvent::GamePhaseChanged { .. } => "game_phase_changed",
            ServerEvent::VotingProgressUpdated { .. } => "voting_progress_updated",
            ServerEvent::GameStateUpdated { .. } => "game_state_updated",
            ServerEvent::SettingsChanged { .. } => "settings_changed",
            ServerEvent::PlayerPresenceChanged { .. } => "player_presence_changed",
            ServerEvent::RecoveryStatusChanged { .. } => "recovery_status_changed",
        }
    }

    pub fn delivery_class(&self) -> DeliveryClass {
        match self {
            ServerEvent::PlayerPresenceChanged { .. } => DeliveryClass::Batched,
            _ => DeliveryClass::Immediate,
        }
    }

    /// Key under which batched events coalesce; the newest event per key wins
    pub fn coalesce_key(&self) -> Option<String> {
        match self {
            ServerEvent::PlayerPresenceChanged { player_id, .. } => {
                Some(format!("presence:{}", player_id))
            }
            _ => None,
        }
    }
}

/// Versioned batch of server events
///
/// Every broadcast produced by a mutation ends with a state-bearing event
/// (`GameStateUpdated` or `RoomStateSync`) already redacted for the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    pub version: u64,
    pub timestamp: u64,
    pub events: Vec<ServerEvent>,
}

impl Broadcast {
    /// The last full state carried by this broadcast
    pub fn latest_state(&self) -> Option<&GameState> {
        self.events.iter().rev().find_map(|event| match event {
            ServerEvent::GameStateUpdated { state } | ServerEvent::RoomStateSync { state } => {
                Some(state)
            }
            _ => None,
        })
    }
}
