use crate::phase::GamePhase;
use crate::PlayerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating or applying a game action
///
/// Every variant is recoverable: the action is refused and the state it was
/// checked against is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GameError {
    #[error("illegal phase transition from {from} to {to}")]
    IllegalTransition { from: GamePhase, to: GamePhase },

    #[error("action requires phase {expected}, game is in {actual}")]
    WrongPhase {
        expected: GamePhase,
        actual: GamePhase,
    },

    #[error("team must have exactly {required} players, got {actual}")]
    TeamSizeMismatch { required: usize, actual: usize },

    #[error("player {0} is not in this room")]
    InvalidPlayer(PlayerId),

    #[error("player {0} appears more than once in the team")]
    DuplicatePlayer(PlayerId),

    #[error("only the current leader can propose a team")]
    NotLeader,

    #[error("only the host can do that")]
    NotHost,

    #[error("player {0} is not on the mission team")]
    NotOnTeam(PlayerId),

    #[error("player {0} has already voted")]
    AlreadyVoted(PlayerId),

    #[error("no team has been proposed yet")]
    NoTeamProposed,

    #[error("a team has already been proposed this round")]
    TeamAlreadyProposed,

    #[error("loyal players must vote for mission success")]
    LoyalMustSucceed,

    #[error("only the assassin may pick a target")]
    NotAssassin,

    #[error("invalid assassination target {0}")]
    InvalidTarget(PlayerId),

    #[error("room is full ({0} players)")]
    RoomFull(usize),

    #[error("game already in progress")]
    GameInProgress,

    #[error("game cannot start: {}", .0.join("; "))]
    CannotStart(Vec<String>),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("game is paused while players reconnect")]
    Paused,

    #[error("game is over")]
    GameOver,

    #[error("corrupted game state: {}", .0.join("; "))]
    CorruptState(Vec<String>),
}

impl GameError {
    /// Short machine-readable code sent alongside rejections
    pub fn code(&self) -> &'static str {
        match self {
            GameError::IllegalTransition { .. } => "illegal_transition",
            GameError::WrongPhase { .. } => "wrong_phase",
            GameError::TeamSizeMismatch { .. } => "team_size_mismatch",
            GameError::InvalidPlayer(_) => "invalid_player",
            GameError::DuplicatePlayer(_) => "duplicate_player",
            GameError::NotLeader => "not_leader",
            GameError::NotHost => "not_host",
            GameError::NotOnTeam(_) => "not_on_team",
            GameError::AlreadyVoted(_) => "already_voted",
            GameError::NoTeamProposed => "no_team_proposed",
            GameError::TeamAlreadyProposed => "team_already_proposed",
            GameError::LoyalMustSucceed => "loyal_must_succeed",
            GameError::NotAssassin => "not_assassin",
            GameError::InvalidTarget(_) => "invalid_target",
            GameError::RoomFull(_) => "room_full",
            GameError::GameInProgress => "game_in_progress",
            GameError::CannotStart(_) => "cannot_start",
            GameError::InvalidSettings(_) => "invalid_settings",
            GameError::Paused => "paused",
            GameError::GameOver => "game_over",
            GameError::CorruptState(_) => "corrupt_state",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = GameError::TeamSizeMismatch {
            required: 3,
            actual: 2,
        };
        assert_eq!(err.to_string(), "team must have exactly 3 players, got 2");
        assert_eq!(err.code(), "team_size_mismatch");

        let err = GameError::CannotStart(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "game cannot start: a; b");
    }
}
