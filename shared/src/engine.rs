//! Pure game reducer: `(state, player, intent) -> state'`
//!
//! The authoritative room feeds every validated event through [`reduce`]; the
//! client uses [`speculate`] to preview its own pending actions. Neither
//! function performs I/O and neither mutates its input, so a refused action
//! can never leave a half-applied state behind.

use crate::error::GameError;
use crate::events::{ConnectionState, Intent, ServerEvent};
use crate::phase::GamePhase;
use crate::rules::{self, MAX_CONSECUTIVE_REJECTIONS};
use crate::state::{
    Alignment, AssassinAttempt, GameOutcome, GameState, Mission, MissionOutcome, MissionVote,
    MissionVoteRecord, Player, ProposalRecord, Role, Vote, VoteChoice, WinReason,
};
use rand::seq::SliceRandom;
use rand::Rng;

/// Result of a successful authoritative apply
#[derive(Debug, Clone)]
pub struct Applied {
    pub state: GameState,
    pub events: Vec<ServerEvent>,
    /// Phase changed or a mission/assassination resolved
    pub critical: bool,
}

/// Applies an intent authoritatively and bumps the version
pub fn reduce<R: Rng + ?Sized>(
    state: &GameState,
    player_id: &str,
    intent: &Intent,
    now: u64,
    rng: &mut R,
) -> Result<Applied, GameError> {
    let mut next = state.clone();
    let mut events = Vec::new();

    if next.paused && !matches!(intent, Intent::JoinRoom { .. } | Intent::LeaveRoom) {
        return Err(GameError::Paused);
    }

    match intent {
        Intent::JoinRoom { player_name } => join(&mut next, player_id, player_name, &mut events)?,
        Intent::LeaveRoom => leave(&mut next, player_id, &mut events)?,
        Intent::PlayerReadyChanged { ready } => {
            set_ready(&mut next, player_id, *ready)?;
            if next.phase == GamePhase::RoleReveal && next.players.iter().all(|p| p.ready) {
                change_phase(&mut next, GamePhase::Voting, now, &mut events)?;
            }
        }
        Intent::UpdateSettings { settings } => {
            require_phase(&next, GamePhase::Lobby)?;
            require_host(&next, player_id)?;
            settings.validate()?;
            if settings.max_players < next.player_count() {
                return Err(GameError::InvalidSettings(format!(
                    "{} players already joined",
                    next.player_count()
                )));
            }
            next.settings = *settings;
            events.push(ServerEvent::SettingsChanged {
                settings: *settings,
            });
        }
        Intent::StartGame => {
            require_phase(&next, GamePhase::Lobby)?;
            require_host(&next, player_id)?;
            let check = next.can_start_game();
            if !check.can_start {
                return Err(GameError::CannotStart(check.reasons));
            }
            change_phase(&mut next, GamePhase::RoleReveal, now, &mut events)?;
            deal_roles(&mut next, rng)?;
        }
        Intent::MissionTeamSelected { team } => {
            propose_team(&mut next, player_id, team)?;
            events.push(ServerEvent::VotingProgressUpdated {
                votes_cast: 0,
                total: next.player_count(),
            });
        }
        Intent::VoteCast { choice } => {
            cast_vote(&mut next, player_id, *choice)?;
            let votes_cast = next.current_votes().count();
            events.push(ServerEvent::VotingProgressUpdated {
                votes_cast,
                total: next.player_count(),
            });
            if votes_cast == next.player_count() {
                resolve_proposal(&mut next, now, &mut events)?;
            }
        }
        Intent::MissionVoteCast { vote } => {
            cast_mission_vote(&mut next, player_id, *vote)?;
            let (votes_cast, total, complete) = match next.current_mission() {
                Some(m) => (m.votes.len(), m.team_members.len(), m.all_votes_in()),
                None => (0, 0, false),
            };
            events.push(ServerEvent::VotingProgressUpdated { votes_cast, total });
            if complete {
                resolve_mission(&mut next, now, &mut events)?;
            }
        }
        Intent::Assassinate { target_id } => {
            assassinate(&mut next, player_id, target_id, now, &mut events)?
        }
    }

    let critical = events
        .iter()
        .any(|e| matches!(e, ServerEvent::GamePhaseChanged { .. }));
    next.version = state.version + 1;

    Ok(Applied {
        state: next,
        events,
        critical,
    })
}

/// Applies the local, unresolved effect of a speculative intent
///
/// Records the player's own ready flag, ballot or team proposal without
/// resolving anything that depends on other players. Re-applying an intent
/// whose effect is already present is a no-op, so pending updates can be
/// replayed on top of a newer authoritative state.
pub fn speculate(state: &GameState, player_id: &str, intent: &Intent) -> Result<GameState, GameError> {
    let mut next = state.clone();
    if next.paused {
        return Err(GameError::Paused);
    }

    match intent {
        Intent::PlayerReadyChanged { ready } => set_ready(&mut next, player_id, *ready)?,
        Intent::MissionTeamSelected { team } => {
            if next.proposed_team != *team {
                propose_team(&mut next, player_id, team)?;
            }
        }
        Intent::VoteCast { choice } => {
            let already = next
                .current_votes()
                .any(|v| v.player_id == player_id && v.choice == *choice);
            if !already {
                cast_vote(&mut next, player_id, *choice)?;
            }
        }
        Intent::MissionVoteCast { vote } => {
            let already = next
                .current_mission()
                .map(|m| {
                    m.votes
                        .iter()
                        .any(|v| v.player_id == player_id && v.vote == *vote)
                })
                .unwrap_or(false);
            if !already {
                cast_mission_vote(&mut next, player_id, *vote)?;
            }
        }
        _ => {}
    }

    Ok(next)
}

/// Pass action submitted for a player whose timeout window has elapsed
pub fn auto_action(state: &GameState, player_id: &str) -> Option<Intent> {
    match state.phase {
        GamePhase::RoleReveal => {
            let player = state.player(player_id)?;
            (!player.ready).then_some(Intent::PlayerReadyChanged { ready: true })
        }
        GamePhase::Voting => {
            if state.proposed_team.is_empty() {
                if !state.is_leader(player_id) {
                    return None;
                }
                let size = state.current_requirements()?.required_team_size;
                let team = state.players.iter().take(size).map(|p| p.id.clone()).collect();
                Some(Intent::MissionTeamSelected { team })
            } else if !state.has_cast_vote(player_id) && state.has_player(player_id) {
                Some(Intent::VoteCast {
                    choice: VoteChoice::Approve,
                })
            } else {
                None
            }
        }
        GamePhase::MissionVote => {
            let mission = state.current_mission()?;
            (mission.is_member(player_id) && !mission.has_voted(player_id)).then_some(
                Intent::MissionVoteCast {
                    vote: MissionVote::Success,
                },
            )
        }
        GamePhase::AssassinAttempt => {
            if state.role_of(player_id) != Some(Role::Assassin) {
                return None;
            }
            let target = state.players.iter().find(|p| {
                p.id != player_id && p.role.map(|r| r.alignment()) == Some(Alignment::Evil)
            })?;
            Some(Intent::Assassinate {
                target_id: target.id.clone(),
            })
        }
        _ => None,
    }
}

fn require_phase(state: &GameState, expected: GamePhase) -> Result<(), GameError> {
    if state.phase == expected {
        Ok(())
    } else if state.phase.is_terminal() {
        Err(GameError::GameOver)
    } else {
        Err(GameError::WrongPhase {
            expected,
            actual: state.phase,
        })
    }
}

fn require_host(state: &GameState, player_id: &str) -> Result<(), GameError> {
    match state.host() {
        Some(host) if host.id == player_id => Ok(()),
        _ => Err(GameError::NotHost),
    }
}

fn require_player(state: &GameState, player_id: &str) -> Result<(), GameError> {
    if state.has_player(player_id) {
        Ok(())
    } else {
        Err(GameError::InvalidPlayer(player_id.to_string()))
    }
}

fn change_phase(
    state: &mut GameState,
    target: GamePhase,
    now: u64,
    events: &mut Vec<ServerEvent>,
) -> Result<(), GameError> {
    let from = state.phase;
    state.transition_to(target, now)?;
    events.push(ServerEvent::GamePhaseChanged { from, to: target });
    Ok(())
}

fn join(
    state: &mut GameState,
    player_id: &str,
    player_name: &str,
    events: &mut Vec<ServerEvent>,
) -> Result<(), GameError> {
    if let Some(existing) = state.player_mut(player_id) {
        existing.name = player_name.to_string();
        existing.connected = true;
        events.push(ServerEvent::PlayerPresenceChanged {
            player_id: player_id.to_string(),
            connection: ConnectionState::Connected,
        });
        return Ok(());
    }
    if state.phase != GamePhase::Lobby {
        return Err(GameError::GameInProgress);
    }
    if state.player_count() >= state.settings.max_players {
        return Err(GameError::RoomFull(state.settings.max_players));
    }

    let player = Player::new(player_id, player_name);
    state.players.push(player.clone());
    events.push(ServerEvent::PlayerJoined { player });
    Ok(())
}

fn leave(state: &mut GameState, player_id: &str, events: &mut Vec<ServerEvent>) -> Result<(), GameError> {
    require_player(state, player_id)?;
    if state.phase == GamePhase::Lobby || state.phase.is_terminal() {
        state.players.retain(|p| p.id != player_id);
        if state.leader_index >= state.player_count() {
            state.leader_index = 0;
        }
        events.push(ServerEvent::PlayerLeft {
            player_id: player_id.to_string(),
        });
    } else if let Some(player) = state.player_mut(player_id) {
        // Seats stay occupied mid-game so mission tables keep their shape
        player.connected = false;
        events.push(ServerEvent::PlayerPresenceChanged {
            player_id: player_id.to_string(),
            connection: ConnectionState::Disconnected,
        });
    }
    Ok(())
}

fn set_ready(state: &mut GameState, player_id: &str, ready: bool) -> Result<(), GameError> {
    if !matches!(state.phase, GamePhase::Lobby | GamePhase::RoleReveal) {
        return Err(GameError::WrongPhase {
            expected: GamePhase::Lobby,
            actual: state.phase,
        });
    }
    let player = state
        .player_mut(player_id)
        .ok_or_else(|| GameError::InvalidPlayer(player_id.to_string()))?;
    player.ready = ready;
    Ok(())
}

fn deal_roles<R: Rng + ?Sized>(state: &mut GameState, rng: &mut R) -> Result<(), GameError> {
    let mut roles = rules::role_lineup(state.player_count()).ok_or_else(|| {
        GameError::CannotStart(vec![format!(
            "no role lineup for {} players",
            state.player_count()
        )])
    })?;
    roles.shuffle(rng);
    for (player, role) in state.players.iter_mut().zip(roles) {
        player.role = Some(role);
    }
    Ok(())
}

fn propose_team(state: &mut GameState, player_id: &str, team: &[String]) -> Result<(), GameError> {
    require_phase(state, GamePhase::Voting)?;
    if !state.is_leader(player_id) {
        return Err(GameError::NotLeader);
    }
    if !state.proposed_team.is_empty() && state.current_votes().next().is_some() {
        return Err(GameError::TeamAlreadyProposed);
    }
    let requirements = state.current_requirements().ok_or_else(|| {
        GameError::CorruptState(vec![format!("no mission for round {}", state.round)])
    })?;
    rules::validate_mission_team(team, requirements.required_team_size, &state.player_ids())?;
    state.proposed_team = team.to_vec();
    Ok(())
}

fn cast_vote(state: &mut GameState, player_id: &str, choice: VoteChoice) -> Result<(), GameError> {
    require_phase(state, GamePhase::Voting)?;
    require_player(state, player_id)?;
    if state.proposed_team.is_empty() {
        return Err(GameError::NoTeamProposed);
    }
    if state.has_cast_vote(player_id) {
        return Err(GameError::AlreadyVoted(player_id.to_string()));
    }
    let round = state.round;
    state.votes.push(Vote {
        player_id: player_id.to_string(),
        choice,
        round,
    });
    Ok(())
}

fn cast_mission_vote(state: &mut GameState, player_id: &str, vote: MissionVote) -> Result<(), GameError> {
    require_phase(state, GamePhase::MissionVote)?;
    let role = state.role_of(player_id);
    let mission = state
        .current_mission_mut()
        .ok_or_else(|| GameError::CorruptState(vec!["no mission in progress".to_string()]))?;
    if !mission.is_member(player_id) {
        return Err(GameError::NotOnTeam(player_id.to_string()));
    }
    if mission.has_voted(player_id) {
        return Err(GameError::AlreadyVoted(player_id.to_string()));
    }
    if vote == MissionVote::Failure && role.map(|r| r.alignment()) == Some(Alignment::Good) {
        return Err(GameError::LoyalMustSucceed);
    }
    mission.votes.push(MissionVoteRecord {
        player_id: player_id.to_string(),
        vote,
    });
    Ok(())
}

fn resolve_proposal(state: &mut GameState, now: u64, events: &mut Vec<ServerEvent>) -> Result<(), GameError> {
    let approvals = state
        .current_votes()
        .filter(|v| v.choice == VoteChoice::Approve)
        .count();
    let rejections = state.current_votes().count() - approvals;
    let approved = rules::is_proposal_approved(approvals, rejections);
    let leader_id = state.leader().map(|p| p.id.clone()).unwrap_or_default();
    let team = std::mem::take(&mut state.proposed_team);

    state.proposals.push(ProposalRecord {
        round: state.round,
        leader_id,
        team: team.clone(),
        approvals,
        rejections,
        approved,
    });
    let round = state.round;
    state.votes.retain(|v| v.round != round);
    state.rotate_leader();

    if !approved {
        state.consecutive_rejections += 1;
        if state.consecutive_rejections >= MAX_CONSECUTIVE_REJECTIONS {
            let from = state.phase;
            state.end_game(Alignment::Evil, WinReason::FiveRejections)?;
            events.push(ServerEvent::GamePhaseChanged {
                from,
                to: GamePhase::GameOver,
            });
        }
        return Ok(());
    }

    state.consecutive_rejections = 0;
    change_phase(state, GamePhase::MissionSelect, now, events)?;

    let requirements = state.current_requirements().ok_or_else(|| {
        GameError::CorruptState(vec![format!("no mission for round {}", state.round)])
    })?;
    rules::validate_mission_team(&team, requirements.required_team_size, &state.player_ids())?;
    let id = state.missions.len() as u32 + 1;
    state
        .missions
        .push(Mission::new(id, state.round, requirements, team));

    change_phase(state, GamePhase::MissionVote, now, events)
}

fn resolve_mission(state: &mut GameState, now: u64, events: &mut Vec<ServerEvent>) -> Result<(), GameError> {
    change_phase(state, GamePhase::MissionResult, now, events)?;
    if let Some(mission) = state.current_mission_mut() {
        mission.resolve(now);
    }
    state.rotate_leader();

    match state.mission_stage_decided() {
        Some(MissionOutcome::Failure) => {
            change_phase(state, GamePhase::GameOver, now, events)?;
            state.outcome = Some(GameOutcome {
                winner: Alignment::Evil,
                reason: WinReason::ThreeFailedMissions,
            });
        }
        Some(MissionOutcome::Success) => {
            change_phase(state, GamePhase::AssassinAttempt, now, events)?;
        }
        None => {
            state.round += 1;
            change_phase(state, GamePhase::Voting, now, events)?;
        }
    }
    Ok(())
}

fn assassinate(
    state: &mut GameState,
    player_id: &str,
    target_id: &str,
    now: u64,
    events: &mut Vec<ServerEvent>,
) -> Result<(), GameError> {
    require_phase(state, GamePhase::AssassinAttempt)?;
    if state.role_of(player_id) != Some(Role::Assassin) {
        return Err(GameError::NotAssassin);
    }
    if target_id == player_id || !state.has_player(target_id) {
        return Err(GameError::InvalidTarget(target_id.to_string()));
    }

    let success = state.role_of(target_id) == Some(Role::Merlin);
    state.assassin_attempt = Some(AssassinAttempt {
        assassin_id: player_id.to_string(),
        target_id: target_id.to_string(),
        success,
    });
    change_phase(state, GamePhase::GameOver, now, events)?;
    state.outcome = Some(if success {
        GameOutcome {
            winner: Alignment::Evil,
            reason: WinReason::MerlinAssassinated,
        }
    } else {
        GameOutcome {
            winner: Alignment::Good,
            reason: WinReason::ThreeSuccessfulMissions,
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn apply(state: &GameState, player: &str, intent: Intent) -> Result<GameState, GameError> {
        reduce(state, player, &intent, 1_000, &mut rng()).map(|a| a.state)
    }

    fn lobby(count: usize) -> GameState {
        let mut state = GameState::new("ROOM");
        for i in 0..count {
            let id = format!("p{}", i);
            state = apply(&state, &id, Intent::JoinRoom { player_name: id.clone() }).unwrap();
            state = apply(&state, &id, Intent::PlayerReadyChanged { ready: true }).unwrap();
        }
        state
    }

    /// Lobby -> voting with every role dealt
    fn started(count: usize) -> GameState {
        let mut state = apply(&lobby(count), "p0", Intent::StartGame).unwrap();
        for i in 0..count {
            state = apply(&state, &format!("p{}", i), Intent::PlayerReadyChanged { ready: true }).unwrap();
        }
        assert_eq!(state.phase, GamePhase::Voting);
        state
    }

    fn ids(state: &GameState, n: usize) -> Vec<String> {
        state.players.iter().take(n).map(|p| p.id.clone()).collect()
    }

    fn vote_all(mut state: GameState, choice: VoteChoice) -> GameState {
        for id in state.player_ids() {
            state = apply(&state, &id, Intent::VoteCast { choice }).unwrap();
        }
        state
    }

    fn leader_id(state: &GameState) -> String {
        state.leader().unwrap().id.clone()
    }

    #[test]
    fn test_join_and_room_full() {
        let mut state = lobby(10);
        assert_eq!(state.player_count(), 10);
        assert_eq!(state.version, 20);

        let err = apply(&state, "extra", Intent::JoinRoom { player_name: "x".into() }).unwrap_err();
        assert_eq!(err, GameError::RoomFull(10));

        state.settings.max_players = 10;
        let rejoin = apply(&state, "p3", Intent::JoinRoom { player_name: "again".into() }).unwrap();
        assert_eq!(rejoin.player_count(), 10);
        assert_eq!(rejoin.player("p3").unwrap().name, "again");
    }

    #[test]
    fn test_start_requires_host_and_players() {
        let state = lobby(4);
        assert_eq!(apply(&state, "p1", Intent::StartGame).unwrap_err(), GameError::NotHost);
        match apply(&state, "p0", Intent::StartGame).unwrap_err() {
            GameError::CannotStart(reasons) => {
                assert!(reasons.iter().any(|r| r.contains("need at least 5 players")))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_start_deals_roles() {
        let state = lobby(7);
        let applied = reduce(&state, "p0", &Intent::StartGame, 55, &mut rng()).unwrap();
        assert!(applied.critical);
        let next = applied.state;
        assert_eq!(next.phase, GamePhase::RoleReveal);
        assert_eq!(next.started_at, Some(55));
        assert!(next.players.iter().all(|p| p.role.is_some()));
        let evil = next
            .players
            .iter()
            .filter(|p| p.role.unwrap().alignment() == Alignment::Evil)
            .count();
        assert_eq!(evil, 3);
    }

    #[test]
    fn test_role_reveal_waits_for_everyone() {
        let mut state = apply(&lobby(5), "p0", Intent::StartGame).unwrap();
        for i in 0..4 {
            state = apply(&state, &format!("p{}", i), Intent::PlayerReadyChanged { ready: true }).unwrap();
            assert_eq!(state.phase, GamePhase::RoleReveal);
        }
        state = apply(&state, "p4", Intent::PlayerReadyChanged { ready: true }).unwrap();
        assert_eq!(state.phase, GamePhase::Voting);
    }

    #[test]
    fn test_only_leader_proposes() {
        let state = started(5);
        let team = ids(&state, 2);
        assert_eq!(
            apply(&state, "p1", Intent::MissionTeamSelected { team: team.clone() }).unwrap_err(),
            GameError::NotLeader
        );
        let bad = vec!["p0".to_string(), "p0".to_string()];
        assert_eq!(
            apply(&state, "p0", Intent::MissionTeamSelected { team: bad }).unwrap_err(),
            GameError::DuplicatePlayer("p0".into())
        );
        let next = apply(&state, "p0", Intent::MissionTeamSelected { team: team.clone() }).unwrap();
        assert_eq!(next.proposed_team, team);
    }

    #[test]
    fn test_vote_requires_team_and_is_single() {
        let state = started(5);
        assert_eq!(
            apply(&state, "p1", Intent::VoteCast { choice: VoteChoice::Approve }).unwrap_err(),
            GameError::NoTeamProposed
        );
        let state = apply(&state, "p0", Intent::MissionTeamSelected { team: ids(&state, 2) }).unwrap();
        let state = apply(&state, "p1", Intent::VoteCast { choice: VoteChoice::Approve }).unwrap();
        assert_eq!(
            apply(&state, "p1", Intent::VoteCast { choice: VoteChoice::Reject }).unwrap_err(),
            GameError::AlreadyVoted("p1".into())
        );
    }

    #[test]
    fn test_approved_proposal_opens_mission() {
        let state = started(5);
        let team = ids(&state, 2);
        let state = apply(&state, "p0", Intent::MissionTeamSelected { team: team.clone() }).unwrap();
        let state = vote_all(state, VoteChoice::Approve);

        assert_eq!(state.phase, GamePhase::MissionVote);
        assert_eq!(state.missions.len(), 1);
        assert_eq!(state.missions[0].team_members, team);
        assert_eq!(state.leader_index, 1);
        assert_eq!(state.consecutive_rejections, 0);
        assert!(state.proposals[0].approved);
        assert!(state.votes.is_empty());
    }

    #[test]
    fn test_rejected_proposal_rotates_leader() {
        let state = started(5);
        let state = apply(&state, "p0", Intent::MissionTeamSelected { team: ids(&state, 2) }).unwrap();
        let state = vote_all(state, VoteChoice::Reject);

        assert_eq!(state.phase, GamePhase::Voting);
        assert_eq!(state.leader_index, 1);
        assert_eq!(state.consecutive_rejections, 1);
        assert!(state.proposed_team.is_empty());
    }

    #[test]
    fn test_five_rejections_evil_wins() {
        let mut state = started(5);
        for _ in 0..5 {
            let leader = leader_id(&state);
            state = apply(&state, &leader, Intent::MissionTeamSelected { team: ids(&state, 2) }).unwrap();
            state = vote_all(state, VoteChoice::Reject);
        }
        assert_eq!(state.phase, GamePhase::GameOver);
        assert_eq!(
            state.outcome,
            Some(GameOutcome {
                winner: Alignment::Evil,
                reason: WinReason::FiveRejections
            })
        );
        assert!(state.missions.is_empty());
    }

    #[test]
    fn test_approval_resets_rejection_counter() {
        let mut state = started(5);
        for _ in 0..4 {
            let leader = leader_id(&state);
            state = apply(&state, &leader, Intent::MissionTeamSelected { team: ids(&state, 2) }).unwrap();
            state = vote_all(state, VoteChoice::Reject);
        }
        assert_eq!(state.consecutive_rejections, 4);
        let leader = leader_id(&state);
        state = apply(&state, &leader, Intent::MissionTeamSelected { team: ids(&state, 2) }).unwrap();
        state = vote_all(state, VoteChoice::Approve);
        assert_eq!(state.consecutive_rejections, 0);
        assert_eq!(state.phase, GamePhase::MissionVote);
    }

    fn evil_ids(state: &GameState) -> Vec<String> {
        state
            .players
            .iter()
            .filter(|p| p.role.map(|r| r.alignment()) == Some(Alignment::Evil))
            .map(|p| p.id.clone())
            .collect()
    }

    #[test]
    fn test_loyal_players_cannot_fail() {
        let state = started(5);
        let good = state
            .players
            .iter()
            .find(|p| p.role.map(|r| r.alignment()) == Some(Alignment::Good))
            .unwrap()
            .id
            .clone();
        let other = state.players.iter().find(|p| p.id != good).unwrap().id.clone();
        let leader = leader_id(&state);
        let state = apply(&state, &leader, Intent::MissionTeamSelected { team: vec![good.clone(), other] }).unwrap();
        let state = vote_all(state, VoteChoice::Approve);

        assert_eq!(
            apply(&state, &good, Intent::MissionVoteCast { vote: MissionVote::Failure }).unwrap_err(),
            GameError::LoyalMustSucceed
        );
    }

    /// Runs one approved mission with the given team, evil members voting `evil_vote`
    fn run_mission(state: GameState, team: Vec<String>, evil_vote: MissionVote) -> GameState {
        let leader = leader_id(&state);
        let mut state = apply(&state, &leader, Intent::MissionTeamSelected { team: team.clone() }).unwrap();
        state = vote_all(state, VoteChoice::Approve);
        let evil = evil_ids(&state);
        for member in team {
            let vote = if evil.contains(&member) {
                evil_vote
            } else {
                MissionVote::Success
            };
            state = apply(&state, &member, Intent::MissionVoteCast { vote }).unwrap();
        }
        state
    }

    fn team_with_evil(state: &GameState, size: usize, evil_count: usize) -> Vec<String> {
        let evil = evil_ids(state);
        let mut team: Vec<String> = evil.into_iter().take(evil_count).collect();
        for p in &state.players {
            if team.len() == size {
                break;
            }
            if !team.contains(&p.id) && p.role.unwrap().alignment() == Alignment::Good {
                team.push(p.id.clone());
            }
        }
        team
    }

    #[test]
    fn test_three_failed_missions() {
        let mut state = started(5);
        for round in 1..=3u8 {
            let size = state.current_requirements().unwrap().required_team_size;
            let team = team_with_evil(&state, size, 1);
            state = run_mission(state, team, MissionVote::Failure);
            assert_eq!(state.missions[(round - 1) as usize].result, Some(MissionOutcome::Failure));
        }
        assert_eq!(state.phase, GamePhase::GameOver);
        assert_eq!(state.outcome.unwrap().reason, WinReason::ThreeFailedMissions);
    }

    #[test]
    fn test_three_successes_then_assassination() {
        let mut state = started(5);
        for _ in 0..3 {
            let size = state.current_requirements().unwrap().required_team_size;
            let team = team_with_evil(&state, size, 0);
            state = run_mission(state, team, MissionVote::Success);
        }
        assert_eq!(state.phase, GamePhase::AssassinAttempt);
        assert_eq!(state.round, 3);

        let assassin = state
            .players
            .iter()
            .find(|p| p.role == Some(Role::Assassin))
            .unwrap()
            .id
            .clone();
        let merlin = state
            .players
            .iter()
            .find(|p| p.role == Some(Role::Merlin))
            .unwrap()
            .id
            .clone();
        let not_assassin = state.players.iter().find(|p| p.id != assassin).unwrap().id.clone();
        assert_eq!(
            apply(&state, &not_assassin, Intent::Assassinate { target_id: merlin.clone() }).unwrap_err(),
            GameError::NotAssassin
        );

        let done = apply(&state, &assassin, Intent::Assassinate { target_id: merlin }).unwrap();
        assert_eq!(done.phase, GamePhase::GameOver);
        assert_eq!(done.outcome.unwrap().reason, WinReason::MerlinAssassinated);
        assert!(done.assassin_attempt.unwrap().success);
    }

    #[test]
    fn test_double_fail_rule_at_mission_four() {
        let mut state = started(7);
        // Alternate outcomes so neither side reaches three before round 4
        for evil_count in [1usize, 0, 0] {
            let size = state.current_requirements().unwrap().required_team_size;
            let vote = if evil_count > 0 { MissionVote::Failure } else { MissionVote::Success };
            let team = team_with_evil(&state, size, evil_count);
            state = run_mission(state, team, vote);
        }
        assert_eq!(state.round, 4);
        let req = state.current_requirements().unwrap();
        assert_eq!(req.required_fail_votes, 2);

        let team = team_with_evil(&state, req.required_team_size, 1);
        let state = run_mission(state, team, MissionVote::Failure);
        let mission = &state.missions[3];
        assert_eq!(mission.fail_count, 1);
        assert_eq!(mission.result, Some(MissionOutcome::Success));
    }

    #[test]
    fn test_rejected_intent_leaves_state_untouched() {
        let state = started(5);
        let before = state.clone();
        assert!(reduce(&state, "p3", &Intent::StartGame, 1, &mut rng()).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn test_paused_blocks_progress() {
        let mut state = started(5);
        state.paused = true;
        assert_eq!(
            apply(&state, "p0", Intent::MissionTeamSelected { team: ids(&state, 2) }).unwrap_err(),
            GameError::Paused
        );
        assert!(apply(&state, "p1", Intent::LeaveRoom).is_ok());
    }

    #[test]
    fn test_leave_mid_game_keeps_seat() {
        let state = started(5);
        let next = apply(&state, "p2", Intent::LeaveRoom).unwrap();
        assert_eq!(next.player_count(), 5);
        assert!(!next.player("p2").unwrap().connected);

        let lobby_state = lobby(5);
        let next = apply(&lobby_state, "p2", Intent::LeaveRoom).unwrap();
        assert_eq!(next.player_count(), 4);
    }

    #[test]
    fn test_speculate_records_without_resolving() {
        let state = started(5);
        let state = apply(&state, "p0", Intent::MissionTeamSelected { team: ids(&state, 2) }).unwrap();
        let mut local = state.clone();
        for id in state.player_ids() {
            local = speculate(&local, &id, &Intent::VoteCast { choice: VoteChoice::Approve }).unwrap();
        }
        assert_eq!(local.phase, GamePhase::Voting);
        assert_eq!(local.current_votes().count(), 5);
        assert_eq!(local.version, state.version);

        let again = speculate(&local, "p1", &Intent::VoteCast { choice: VoteChoice::Approve }).unwrap();
        assert_eq!(again, local);
    }

    #[test]
    fn test_auto_actions_follow_phase() {
        let state = apply(&lobby(5), "p0", Intent::StartGame).unwrap();
        assert_eq!(
            auto_action(&state, "p3"),
            Some(Intent::PlayerReadyChanged { ready: true })
        );

        let state = started(5);
        match auto_action(&state, "p0") {
            Some(Intent::MissionTeamSelected { team }) => assert_eq!(team.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(auto_action(&state, "p1"), None);

        let state = apply(&state, "p0", Intent::MissionTeamSelected { team: ids(&state, 2) }).unwrap();
        assert_eq!(
            auto_action(&state, "p1"),
            Some(Intent::VoteCast { choice: VoteChoice::Approve })
        );
    }

    #[test]
    fn test_settings_update_in_lobby() {
        let state = lobby(6);
        let settings = crate::state::GameSettings {
            min_players: 6,
            max_players: 8,
        };
        let next = apply(&state, "p0", Intent::UpdateSettings { settings }).unwrap();
        assert_eq!(next.settings, settings);

        let too_small = crate::state::GameSettings {
            min_players: 5,
            max_players: 5,
        };
        assert!(matches!(
            apply(&state, "p0", Intent::UpdateSettings { settings: too_small }),
            Err(GameError::InvalidSettings(_))
        ));
        assert_eq!(
            apply(&state, "p1", Intent::UpdateSettings { settings }).unwrap_err(),
            GameError::NotHost
        );
    }
}
