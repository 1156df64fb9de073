//! Legal game-phase graph
//!
//! ```text
//! lobby -> roleReveal -> voting -> missionSelect -> missionVote -> missionResult
//! missionResult -> voting | assassinAttempt | gameOver
//! assassinAttempt -> gameOver
//! ```
//!
//! `missionResult -> voting` is the only back edge; `gameOver` is terminal.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GamePhase {
    Lobby,
    RoleReveal,
    Voting,
    MissionSelect,
    MissionVote,
    MissionResult,
    AssassinAttempt,
    GameOver,
}

impl GamePhase {
    pub const ALL: [GamePhase; 8] = [
        GamePhase::Lobby,
        GamePhase::RoleReveal,
        GamePhase::Voting,
        GamePhase::MissionSelect,
        GamePhase::MissionVote,
        GamePhase::MissionResult,
        GamePhase::AssassinAttempt,
        GamePhase::GameOver,
    ];

    /// Phases reachable in one step from this one
    pub fn valid_next_phases(self) -> &'static [GamePhase] {
        match self {
            GamePhase::Lobby => &[GamePhase::RoleReveal],
            GamePhase::RoleReveal => &[GamePhase::Voting],
            GamePhase::Voting => &[GamePhase::MissionSelect],
            GamePhase::MissionSelect => &[GamePhase::MissionVote],
            GamePhase::MissionVote => &[GamePhase::MissionResult],
            GamePhase::MissionResult => &[
                GamePhase::Voting,
                GamePhase::AssassinAttempt,
                GamePhase::GameOver,
            ],
            GamePhase::AssassinAttempt => &[GamePhase::GameOver],
            GamePhase::GameOver => &[],
        }
    }

    pub fn can_transition_to(self, target: GamePhase) -> bool {
        self.valid_next_phases().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        self == GamePhase::GameOver
    }

    /// True for every phase between leaving the lobby and the end of the game
    pub fn is_in_game(self) -> bool {
        !matches!(self, GamePhase::Lobby | GamePhase::GameOver)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GamePhase::Lobby => "lobby",
            GamePhase::RoleReveal => "roleReveal",
            GamePhase::Voting => "voting",
            GamePhase::MissionSelect => "missionSelect",
            GamePhase::MissionVote => "missionVote",
            GamePhase::MissionResult => "missionResult",
            GamePhase::AssassinAttempt => "assassinAttempt",
            GamePhase::GameOver => "gameOver",
        }
    }
}

impl fmt::Display for GamePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
