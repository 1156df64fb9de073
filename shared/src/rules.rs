//! Mission and team rules derived from player count
//!
//! All lookups are table driven. The one context-sensitive rule, mission 4
//! needing two failure votes once seven or more people play, is special-cased
//! in [`get_mission_requirements`] rather than encoded in the table.

use crate::error::GameError;
use crate::state::{MissionOutcome, MissionVote, Role};
use crate::{PlayerId, MAX_PLAYERS, MAX_ROUNDS, MIN_PLAYERS};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Team sizes per mission, indexed by `[player_count - 5][round - 1]`
const TEAM_SIZES: [[usize; MAX_ROUNDS as usize]; 6] = [
    [2, 3, 2, 3, 3], // 5 players
    [2, 3, 4, 3, 4], // 6
    [2, 3, 3, 4, 4], // 7
    [3, 4, 4, 5, 5], // 8
    [3, 4, 4, 5, 5], // 9
    [3, 4, 4, 5, 5], // 10
];

/// Good/evil split, indexed by `player_count - 5`
const ALIGNMENT_SPLIT: [(usize, usize); 6] = [(3, 2), (4, 2), (4, 3), (5, 3), (6, 3), (6, 4)];

/// Proposals rejected in a row before evil wins outright
pub const MAX_CONSECUTIVE_REJECTIONS: u8 = 5;

/// Missions one side must win to settle the mission stage
pub const MISSIONS_TO_WIN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionRequirements {
    pub required_team_size: usize,
    pub required_fail_votes: usize,
}

/// Looks up team size and failure threshold for a round
///
/// Returns `None` outside `round ∈ [1, 5]` or `total_players ∈ [5, 10]`.
pub fn get_mission_requirements(round: u8, total_players: usize) -> Option<MissionRequirements> {
    if !(1..=MAX_ROUNDS).contains(&round) || !(MIN_PLAYERS..=MAX_PLAYERS).contains(&total_players) {
        return None;
    }

    let required_team_size = TEAM_SIZES[total_players - MIN_PLAYERS][(round - 1) as usize];
    let required_fail_votes = if round == 4 && total_players >= 7 {
        2
    } else {
        1
    };

    Some(MissionRequirements {
        required_team_size,
        required_fail_votes,
    })
}

/// Single problem found in a team selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeamSelectionError {
    TeamSizeMismatch { required: usize, actual: usize },
    InvalidPlayer(PlayerId),
    DuplicatePlayer(PlayerId),
}

impl From<TeamSelectionError> for GameError {
    fn from(err: TeamSelectionError) -> Self {
        match err {
            TeamSelectionError::TeamSizeMismatch { required, actual } => {
                GameError::TeamSizeMismatch { required, actual }
            }
            TeamSelectionError::InvalidPlayer(id) => GameError::InvalidPlayer(id),
            TeamSelectionError::DuplicatePlayer(id) => GameError::DuplicatePlayer(id),
        }
    }
}

/// Outcome of checking a team selection; never an `Err`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeamValidation {
    pub errors: Vec<TeamSelectionError>,
    pub warnings: Vec<String>,
}

impl TeamValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks a selection against the required size and the available players
///
/// All problems are collected so the UI can show them together.
pub fn validate_team_selection(
    selected: &[PlayerId],
    required: usize,
    available: &[PlayerId],
) -> TeamValidation {
    let mut result = TeamValidation::default();

    if selected.len() != required {
        result.errors.push(TeamSelectionError::TeamSizeMismatch {
            required,
            actual: selected.len(),
        });
        if selected.len() < required {
            result.warnings.push(format!(
                "select {} more player(s)",
                required - selected.len()
            ));
        }
    }

    let mut seen = HashSet::new();
    for id in selected {
        if !available.contains(id) {
            result
                .errors
                .push(TeamSelectionError::InvalidPlayer(id.clone()));
        }
        if !seen.insert(id) {
            result
                .errors
                .push(TeamSelectionError::DuplicatePlayer(id.clone()));
        }
    }

    result
}

/// Authoritative re-check of a submitted team against the room roster
pub fn validate_mission_team(
    team: &[PlayerId],
    required: usize,
    roster: &[PlayerId],
) -> Result<(), GameError> {
    match validate_team_selection(team, required, roster)
        .errors
        .into_iter()
        .next()
    {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// A mission fails exactly when failure votes reach the threshold
pub fn resolve_mission_outcome(votes: &[MissionVote], fails_required: usize) -> MissionOutcome {
    let failures = votes.iter().filter(|v| **v == MissionVote::Failure).count();
    if failures >= fails_required {
        MissionOutcome::Failure
    } else {
        MissionOutcome::Success
    }
}

/// Round-robin leader rotation
pub fn next_leader_index(current: usize, total_players: usize) -> usize {
    if total_players == 0 {
        return 0;
    }
    (current + 1) % total_players
}

/// Strict majority approves; ties reject
pub fn is_proposal_approved(approvals: usize, rejections: usize) -> bool {
    approvals > rejections
}

/// Roles dealt for a player count, good roles first
pub fn role_lineup(total_players: usize) -> Option<Vec<Role>> {
    if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&total_players) {
        return None;
    }
    let (good, evil) = ALIGNMENT_SPLIT[total_players - MIN_PLAYERS];
    let mut roles = Vec::with_capacity(total_players);

    roles.push(Role::Merlin);
    if total_players >= 7 {
        roles.push(Role::Percival);
    }
    while roles.len() < good {
        roles.push(Role::LoyalServant);
    }

    roles.push(Role::Assassin);
    if total_players >= 7 {
        roles.push(Role::Morgana);
    }
    while roles.len() < good + evil {
        roles.push(Role::Minion);
    }

    Some(roles)
}
