//! Resolution of actions queued for a player while they could not be applied
//!
//! Several queued actions may answer the same decision (two ballots for one
//! proposal, a ready toggle flipped twice). Each action type picks one
//! strategy for collapsing its group before replay.

use shared::{GameEvent, Intent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStrategy {
    /// Earliest submission wins
    Timestamp,
    /// The newest proposal supersedes older ones
    Priority,
    /// Later values overwrite earlier ones field by field
    Merge,
    /// Exact duplicates are dropped, everything else kept
    Discard,
}

pub fn strategy_for(intent: &Intent) -> PendingStrategy {
    match intent {
        Intent::VoteCast { .. } | Intent::MissionVoteCast { .. } => PendingStrategy::Timestamp,
        Intent::MissionTeamSelected { .. } => PendingStrategy::Priority,
        Intent::PlayerReadyChanged { .. } | Intent::UpdateSettings { .. } => PendingStrategy::Merge,
        _ => PendingStrategy::Discard,
    }
}

/// Collapses one player's queue into the actions that should be replayed
///
/// The result keeps submission order.
pub fn resolve_pending(mut actions: Vec<GameEvent>) -> Vec<GameEvent> {
    actions.sort_by_key(|e| (e.timestamp, e.id));

    let mut kept: Vec<GameEvent> = Vec::with_capacity(actions.len());
    for action in actions {
        let name = action.intent.name();
        let existing = kept.iter().position(|k| k.intent.name() == name);
        match (strategy_for(&action.intent), existing) {
            (_, None) => kept.push(action),
            (PendingStrategy::Timestamp, Some(_)) => {}
            (PendingStrategy::Priority, Some(index)) | (PendingStrategy::Merge, Some(index)) => {
                kept.remove(index);
                kept.push(action);
            }
            (PendingStrategy::Discard, Some(_)) => {
                if !kept.iter().any(|k| k.intent == action.intent) {
                    kept.push(action);
                }
            }
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::state::{GameSettings, VoteChoice};

    fn event(id: u64, timestamp: u64, intent: Intent) -> GameEvent {
        GameEvent {
            id,
            player_id: "p1".into(),
            room_code: "ROOM".into(),
            timestamp,
            version: 0,
            intent,
        }
    }

    #[test]
    fn test_strategy_per_type() {
        assert_eq!(
            strategy_for(&Intent::VoteCast { choice: VoteChoice::Approve }),
            PendingStrategy::Timestamp
        );
        assert_eq!(
            strategy_for(&Intent::MissionTeamSelected { team: vec![] }),
            PendingStrategy::Priority
        );
        assert_eq!(
            strategy_for(&Intent::PlayerReadyChanged { ready: true }),
            PendingStrategy::Merge
        );
        assert_eq!(strategy_for(&Intent::StartGame), PendingStrategy::Discard);
    }

    #[test]
    fn test_earliest_vote_wins() {
        let resolved = resolve_pending(vec![
            event(2, 200, Intent::VoteCast { choice: VoteChoice::Reject }),
            event(1, 100, Intent::VoteCast { choice: VoteChoice::Approve }),
        ]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, 1);
    }

    #[test]
    fn test_newest_team_and_latest_ready_win() {
        let resolved = resolve_pending(vec![
            event(1, 100, Intent::MissionTeamSelected { team: vec!["a".into()] }),
            event(2, 110, Intent::PlayerReadyChanged { ready: true }),
            event(3, 120, Intent::MissionTeamSelected { team: vec!["b".into()] }),
            event(4, 130, Intent::PlayerReadyChanged { ready: false }),
        ]);
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            resolved[0].intent,
            Intent::MissionTeamSelected { team: vec!["b".into()] }
        );
        assert_eq!(resolved[1].intent, Intent::PlayerReadyChanged { ready: false });
    }

    #[test]
    fn test_settings_merge_keeps_latest() {
        let small = GameSettings { min_players: 5, max_players: 6 };
        let large = GameSettings { min_players: 5, max_players: 9 };
        let resolved = resolve_pending(vec![
            event(1, 100, Intent::UpdateSettings { settings: small }),
            event(2, 200, Intent::UpdateSettings { settings: large }),
        ]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].intent, Intent::UpdateSettings { settings: large });
    }

    #[test]
    fn test_duplicates_discarded() {
        let resolved = resolve_pending(vec![
            event(1, 100, Intent::StartGame),
            event(2, 150, Intent::StartGame),
            event(3, 200, Intent::LeaveRoom),
        ]);
        let ids: Vec<u64> = resolved.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
