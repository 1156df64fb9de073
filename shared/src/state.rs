//! Authoritative game state and the phase state machine operating on it
//!
//! `GameState` is the single shared object per room. Only the server's room
//! actor mutates the authoritative copy; clients hold mirrors. All collections
//! are ordered (`Vec`) so the bincode encoding, and therefore the checksum, is
//! deterministic.

use crate::error::GameError;
use crate::phase::GamePhase;
use crate::rules::{self, MissionRequirements, MISSIONS_TO_WIN};
use crate::{PlayerId, MAX_PLAYERS, MAX_ROUNDS, MIN_PLAYERS};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Alignment {
    Good,
    Evil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Merlin,
    Percival,
    LoyalServant,
    Assassin,
    Morgana,
    Minion,
}

impl Role {
    pub fn alignment(self) -> Alignment {
        match self {
            Role::Merlin | Role::Percival | Role::LoyalServant => Alignment::Good,
            Role::Assassin | Role::Morgana | Role::Minion => Alignment::Evil,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VoteChoice {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MissionVote {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MissionOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub ready: bool,
    pub connected: bool,
    pub role: Option<Role>,
}

impl Player {
    pub fn new(id: impl Into<PlayerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ready: false,
            connected: true,
            role: None,
        }
    }
}

/// Ballot on the current team proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub player_id: PlayerId,
    pub choice: VoteChoice,
    pub round: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionVoteRecord {
    pub player_id: PlayerId,
    pub vote: MissionVote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mission {
    pub id: u32,
    pub round: u8,
    pub team_size: usize,
    pub fails_required: usize,
    pub team_members: Vec<PlayerId>,
    pub votes: Vec<MissionVoteRecord>,
    pub fail_count: usize,
    pub result: Option<MissionOutcome>,
    pub completed_at: Option<u64>,
}

impl Mission {
    pub fn new(id: u32, round: u8, requirements: MissionRequirements, team: Vec<PlayerId>) -> Self {
        Self {
            id,
            round,
            team_size: requirements.required_team_size,
            fails_required: requirements.required_fail_votes,
            team_members: team,
            votes: Vec::new(),
            fail_count: 0,
            result: None,
            completed_at: None,
        }
    }

    pub fn has_voted(&self, player_id: &str) -> bool {
        self.votes.iter().any(|v| v.player_id == player_id)
    }

    pub fn is_member(&self, player_id: &str) -> bool {
        self.team_members.iter().any(|m| m == player_id)
    }

    pub fn all_votes_in(&self) -> bool {
        self.votes.len() == self.team_members.len()
    }

    /// Tallies the votes and stamps the result
    pub fn resolve(&mut self, now: u64) -> MissionOutcome {
        let votes: Vec<MissionVote> = self.votes.iter().map(|v| v.vote).collect();
        let outcome = rules::resolve_mission_outcome(&votes, self.fails_required);
        self.fail_count = votes.iter().filter(|v| **v == MissionVote::Failure).count();
        self.result = Some(outcome);
        self.completed_at = Some(now);
        outcome
    }
}

/// Archived outcome of one team proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub round: u8,
    pub leader_id: PlayerId,
    pub team: Vec<PlayerId>,
    pub approvals: usize,
    pub rejections: usize,
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssassinAttempt {
    pub assassin_id: PlayerId,
    pub target_id: PlayerId,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WinReason {
    ThreeSuccessfulMissions,
    ThreeFailedMissions,
    FiveRejections,
    MerlinAssassinated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOutcome {
    pub winner: Alignment,
    pub reason: WinReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSettings {
    pub min_players: usize,
    pub max_players: usize,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            min_players: MIN_PLAYERS,
            max_players: MAX_PLAYERS,
        }
    }
}

impl GameSettings {
    pub fn validate(&self) -> Result<(), GameError> {
        if self.min_players < MIN_PLAYERS || self.max_players > MAX_PLAYERS {
            return Err(GameError::InvalidSettings(format!(
                "player bounds must stay within {}-{}",
                MIN_PLAYERS, MAX_PLAYERS
            )));
        }
        if self.min_players > self.max_players {
            return Err(GameError::InvalidSettings(
                "minimum players exceeds maximum".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of the lobby exit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCheck {
    pub can_start: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    pub room_code: String,
    pub phase: GamePhase,
    pub round: u8,
    pub leader_index: usize,
    pub players: Vec<Player>,
    pub votes: Vec<Vote>,
    pub proposed_team: Vec<PlayerId>,
    pub proposals: Vec<ProposalRecord>,
    pub consecutive_rejections: u8,
    pub missions: Vec<Mission>,
    pub assassin_attempt: Option<AssassinAttempt>,
    pub outcome: Option<GameOutcome>,
    pub settings: GameSettings,
    pub started_at: Option<u64>,
    pub paused: bool,
    pub version: u64,
}

impl GameState {
    pub fn new(room_code: impl Into<String>) -> Self {
        Self {
            room_code: room_code.into(),
            phase: GamePhase::Lobby,
            round: 0,
            leader_index: 0,
            players: Vec::new(),
            votes: Vec::new(),
            proposed_team: Vec::new(),
            proposals: Vec::new(),
            consecutive_rejections: 0,
            missions: Vec::new(),
            assassin_attempt: None,
            outcome: None,
            settings: GameSettings::default(),
            started_at: None,
            paused: false,
            version: 0,
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.players.iter().map(|p| p.id.clone()).collect()
    }

    pub fn player(&self, id: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    pub fn player_mut(&mut self, id: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.id == id)
    }

    pub fn has_player(&self, id: &str) -> bool {
        self.player(id).is_some()
    }

    pub fn host(&self) -> Option<&Player> {
        self.players.first()
    }

    pub fn leader(&self) -> Option<&Player> {
        self.players.get(self.leader_index)
    }

    pub fn is_leader(&self, id: &str) -> bool {
        self.leader().map(|p| p.id == id).unwrap_or(false)
    }

    pub fn role_of(&self, id: &str) -> Option<Role> {
        self.player(id).and_then(|p| p.role)
    }

    pub fn rotate_leader(&mut self) {
        self.leader_index = rules::next_leader_index(self.leader_index, self.player_count());
    }

    /// Requirements of the mission for the current round
    pub fn current_requirements(&self) -> Option<MissionRequirements> {
        rules::get_mission_requirements(self.round, self.player_count())
    }

    /// The mission that has a team but no result yet
    pub fn current_mission(&self) -> Option<&Mission> {
        self.missions.last().filter(|m| m.result.is_none())
    }

    pub fn current_mission_mut(&mut self) -> Option<&mut Mission> {
        self.missions.last_mut().filter(|m| m.result.is_none())
    }

    pub fn mission_count(&self, outcome: MissionOutcome) -> usize {
        self.missions
            .iter()
            .filter(|m| m.result == Some(outcome))
            .count()
    }

    pub fn current_votes(&self) -> impl Iterator<Item = &Vote> {
        let round = self.round;
        self.votes.iter().filter(move |v| v.round == round)
    }

    pub fn has_cast_vote(&self, id: &str) -> bool {
        self.current_votes().any(|v| v.player_id == id)
    }

    /// Checks the lobby exit conditions and lists every reason it fails
    pub fn can_start_game(&self) -> StartCheck {
        let mut reasons = Vec::new();
        let count = self.player_count();

        if self.phase != GamePhase::Lobby {
            reasons.push("game has already started".to_string());
        }
        if count < self.settings.min_players {
            reasons.push(format!(
                "need at least {} players to start (have {})",
                self.settings.min_players, count
            ));
        }
        if count > self.settings.max_players {
            reasons.push(format!(
                "at most {} players can play (have {})",
                self.settings.max_players, count
            ));
        }
        let not_ready: Vec<&str> = self
            .players
            .iter()
            .filter(|p| !p.ready)
            .map(|p| p.name.as_str())
            .collect();
        if !not_ready.is_empty() {
            reasons.push(format!("waiting for players to ready up: {}", not_ready.join(", ")));
        }

        StartCheck {
            can_start: reasons.is_empty(),
            reasons,
        }
    }

    pub fn can_transition_to(&self, target: GamePhase) -> bool {
        self.phase.can_transition_to(target)
    }

    pub fn valid_next_phases(&self) -> &'static [GamePhase] {
        self.phase.valid_next_phases()
    }

    /// Moves to `target` if the edge is legal, updating phase-derived fields
    ///
    /// An illegal edge leaves the state untouched.
    pub fn transition_to(&mut self, target: GamePhase, now: u64) -> Result<(), GameError> {
        if !self.can_transition_to(target) {
            return Err(GameError::IllegalTransition {
                from: self.phase,
                to: target,
            });
        }

        match target {
            GamePhase::RoleReveal => {
                self.started_at = Some(now);
                self.round = 1;
                self.leader_index = 0;
                self.consecutive_rejections = 0;
                for player in &mut self.players {
                    player.ready = false;
                }
            }
            GamePhase::Voting => {
                let round = self.round;
                self.proposed_team.clear();
                self.votes.retain(|v| v.round != round);
            }
            _ => {}
        }

        self.phase = target;
        Ok(())
    }

    /// Terminates the game outside the transition graph
    ///
    /// Used for outcomes that end play immediately regardless of phase, such
    /// as the five-rejections rule.
    pub fn end_game(&mut self, winner: Alignment, reason: WinReason) -> Result<(), GameError> {
        if self.phase.is_terminal() {
            return Err(GameError::GameOver);
        }
        if self.phase == GamePhase::Lobby {
            return Err(GameError::WrongPhase {
                expected: GamePhase::Voting,
                actual: self.phase,
            });
        }
        self.phase = GamePhase::GameOver;
        self.outcome = Some(GameOutcome { winner, reason });
        Ok(())
    }

    /// True once one side has won the mission stage
    pub fn mission_stage_decided(&self) -> Option<MissionOutcome> {
        if self.mission_count(MissionOutcome::Failure) >= MISSIONS_TO_WIN {
            Some(MissionOutcome::Failure)
        } else if self.mission_count(MissionOutcome::Success) >= MISSIONS_TO_WIN {
            Some(MissionOutcome::Success)
        } else {
            None
        }
    }

    /// Structural checks applied to any persisted or received state
    pub fn validation_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.round > MAX_ROUNDS {
            issues.push(format!("round {} exceeds {}", self.round, MAX_ROUNDS));
        }
        if !self.players.is_empty() && self.leader_index >= self.players.len() {
            issues.push(format!(
                "leader index {} out of range for {} players",
                self.leader_index,
                self.players.len()
            ));
        }
        if self.phase != GamePhase::Lobby && self.started_at.is_none() {
            issues.push(format!("phase {} requires a start time", self.phase));
        }
        if self.missions.len() > MAX_ROUNDS as usize {
            issues.push(format!("{} missions recorded", self.missions.len()));
        }
        for mission in &self.missions {
            if mission.team_members.len() != mission.team_size {
                issues.push(format!(
                    "mission {} has {} members, expected {}",
                    mission.id,
                    mission.team_members.len(),
                    mission.team_size
                ));
            }
            if mission.votes.len() > mission.team_members.len() {
                issues.push(format!("mission {} has more votes than members", mission.id));
            }
            let mut voters: Vec<&str> = mission.votes.iter().map(|v| v.player_id.as_str()).collect();
            voters.sort_unstable();
            if voters.windows(2).any(|w| w[0] == w[1]) {
                issues.push(format!("mission {} has duplicate voters", mission.id));
            }
        }
        let mut ids: Vec<&str> = self.players.iter().map(|p| p.id.as_str()).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            issues.push("duplicate player ids in roster".to_string());
        }

        issues
    }

    pub fn validate(&self) -> Result<(), GameError> {
        let issues = self.validation_issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(GameError::CorruptState(issues))
        }
    }

    /// Hex SHA-256 over the bincode encoding
    pub fn checksum(&self) -> Result<String, bincode::Error> {
        let bytes = bincode::serialize(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Copy of the state with hidden information removed for one viewer
    ///
    /// Viewers always see their own role. Evil players see each other, Merlin
    /// sees evil players as generic minions. Other players' mission ballots are
    /// hidden; only the tally survives. Everything is revealed at game over.
    pub fn redacted_for(&self, viewer: &str) -> GameState {
        let mut view = self.clone();
        if self.phase.is_terminal() {
            return view;
        }

        let viewer_role = self.role_of(viewer);
        for player in &mut view.players {
            if player.id == viewer {
                continue;
            }
            player.role = match (viewer_role, player.role) {
                (Some(own), Some(theirs))
                    if own.alignment() == Alignment::Evil
                        && theirs.alignment() == Alignment::Evil =>
                {
                    Some(theirs)
                }
                (Some(Role::Merlin), Some(theirs)) if theirs.alignment() == Alignment::Evil => {
                    Some(Role::Minion)
                }
                _ => None,
            };
        }
        for mission in &mut view.missions {
            mission.votes.retain(|v| v.player_id == viewer);
        }
        view
    }
}
