use crate::connection::{ConnectionQuality, ConnectionStatus};
use crate::optimistic::{Notice, SyncConflict};
use shared::state::{MissionOutcome, Player};
use shared::{GamePhase, GameState};
use std::fmt::Write;

#[derive(Debug, Clone)]
pub struct RenderConfig<'a> {
    pub player_id: &'a str,
    pub status: ConnectionStatus,
    pub ping_ms: Option<u64>,
    pub quality: Option<ConnectionQuality>,
    pub fake_ping_ms: u64,
    pub pending_updates: usize,
    pub unresolved_conflicts: usize,
}

/// Plain-text view of a room for the terminal client
#[derive(Debug, Default)]
pub struct Renderer;

impl Renderer {
    pub fn new() -> Self {
        Renderer
    }

    pub fn render(&self, state: Option<&GameState>, config: &RenderConfig) -> String {
        let mut out = String::new();
        self.draw_status_line(&mut out, config);

        let Some(state) = state else {
            out.push_str("waiting for room state...\n");
            return out;
        };

        let _ = writeln!(
            out,
            "room {} | {} | round {} | v{}{}",
            state.room_code,
            state.phase,
            state.round,
            state.version,
            if state.paused { " | PAUSED" } else { "" }
        );

        for (index, player) in state.players.iter().enumerate() {
            self.draw_player(&mut out, state, index, player, config.player_id);
        }

        self.draw_missions(&mut out, state);
        self.draw_phase_prompt(&mut out, state, config.player_id);
        out
    }

    fn draw_status_line(&self, out: &mut String, config: &RenderConfig) {
        let connection = match config.status {
            ConnectionStatus::Disconnected => "offline".to_string(),
            ConnectionStatus::Connecting => "connecting".to_string(),
            ConnectionStatus::Connected => "online".to_string(),
            ConnectionStatus::Reconnecting { attempt } => format!("reconnecting (attempt {})", attempt),
        };
        let ping = match config.ping_ms {
            Some(ms) => format!("{}ms", ms + config.fake_ping_ms),
            None => "-".to_string(),
        };
        let quality = config.quality.map(|q| q.as_str()).unwrap_or("unknown");
        let _ = write!(out, "[{} | ping {} ({})", connection, ping, quality);
        if config.pending_updates > 0 {
            let _ = write!(out, " | {} pending", config.pending_updates);
        }
        if config.unresolved_conflicts > 0 {
            let _ = write!(out, " | {} conflict(s)", config.unresolved_conflicts);
        }
        out.push_str("]\n");
    }

    fn draw_player(&self, out: &mut String, state: &GameState, index: usize, player: &Player, me: &str) {
        let mut tags = Vec::new();
        if index == 0 {
            tags.push("host".to_string());
        }
        if state.phase.is_in_game() && index == state.leader_index {
            tags.push("leader".to_string());
        }
        if player.ready && matches!(state.phase, GamePhase::Lobby | GamePhase::RoleReveal) {
            tags.push("ready".to_string());
        }
        if !player.connected {
            tags.push("away".to_string());
        }
        if state.proposed_team.contains(&player.id) {
            tags.push("team".to_string());
        }
        if state.has_cast_vote(&player.id) {
            tags.push("voted".to_string());
        }
        if let Some(role) = player.role {
            tags.push(format!("{:?}", role));
        }

        let marker = if player.id == me { ">" } else { " " };
        let _ = writeln!(out, "{} {:<12} {:<10} {}", marker, player.name, player.id, tags.join(", "));
    }

    fn draw_missions(&self, out: &mut String, state: &GameState) {
        if state.missions.is_empty() && state.consecutive_rejections == 0 {
            return;
        }
        let track: Vec<&str> = state
            .missions
            .iter()
            .map(|m| match m.result {
                Some(MissionOutcome::Success) => "S",
                Some(MissionOutcome::Failure) => "F",
                None => "?",
            })
            .collect();
        let _ = writeln!(
            out,
            "missions [{}] | rejections in a row: {}",
            track.join(" "),
            state.consecutive_rejections
        );
    }

    fn draw_phase_prompt(&self, out: &mut String, state: &GameState, me: &str) {
        let prompt = match state.phase {
            GamePhase::Lobby => "waiting for players; 'ready' then host 'start'".to_string(),
            GamePhase::RoleReveal => "check your role, then 'ready'".to_string(),
            GamePhase::Voting if state.proposed_team.is_empty() => {
                if state.is_leader(me) {
                    let size = state
                        .current_requirements()
                        .map(|r| r.required_team_size)
                        .unwrap_or(0);
                    format!("you lead: 'team' with {} player ids", size)
                } else {
                    "waiting for the leader to propose a team".to_string()
                }
            }
            GamePhase::Voting => format!(
                "team {} | 'approve' or 'reject' ({} voted)",
                state.proposed_team.join(" "),
                state.current_votes().count()
            ),
            GamePhase::MissionVote => match state.current_mission() {
                Some(m) if m.is_member(me) && !m.has_voted(me) => "'success' or 'fail'".to_string(),
                Some(m) => format!("mission under way ({}/{} votes)", m.votes.len(), m.team_members.len()),
                None => String::new(),
            },
            GamePhase::AssassinAttempt => "the assassin picks a target: 'assassinate <id>'".to_string(),
            GamePhase::GameOver => match state.outcome {
                Some(outcome) => format!("game over: {:?} wins ({:?})", outcome.winner, outcome.reason),
                None => "game over".to_string(),
            },
            GamePhase::MissionSelect | GamePhase::MissionResult => String::new(),
        };
        if !prompt.is_empty() {
            let _ = writeln!(out, "> {}", prompt);
        }
    }

    pub fn render_notice(&self, notice: &Notice) -> String {
        match notice {
            Notice::Rejected { action, reason, .. } => format!("! {} was rejected: {}", action, reason),
            Notice::TimedOut { action, .. } => {
                format!("! {} got no answer from the server and was undone", action)
            }
            Notice::Conflict { conflict_id, action } => format!(
                "! {} conflicts with a newer server state; 'resolve {} <strategy>'",
                action, conflict_id
            ),
            Notice::Reconnecting { attempt } => format!("! connection lost, reconnecting (attempt {})", attempt),
            Notice::Reconnected => "! reconnected".to_string(),
            Notice::Disconnected { reason } => format!("! disconnected: {}", reason),
            Notice::Restored => "! room restored from a snapshot".to_string(),
            Notice::Paused => "! too many players dropped; game paused".to_string(),
            Notice::Resumed => "! game resumed".to_string(),
        }
    }

    pub fn render_conflicts<'a>(&self, conflicts: impl Iterator<Item = &'a SyncConflict>) -> String {
        let mut out = String::new();
        for conflict in conflicts {
            let _ = writeln!(
                out,
                "#{} {} (yours v{}, server v{})",
                conflict.id,
                conflict.intent.name(),
                conflict.local_version,
                conflict.server_version
            );
        }
        if out.is_empty() {
            out.push_str("no open conflicts\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(status: ConnectionStatus) -> RenderConfig<'static> {
        RenderConfig {
            player_id: "p1",
            status,
            ping_ms: Some(40),
            quality: Some(ConnectionQuality::Excellent),
            fake_ping_ms: 10,
            pending_updates: 1,
            unresolved_conflicts: 0,
        }
    }

    #[test]
    fn test_render_lobby() {
        let mut state = GameState::new("ROOM");
        state.players.push(Player::new("p1", "Alice"));
        state.players.push(Player::new("p2", "Bob"));
        state.players[1].ready = true;

        let text = Renderer::new().render(Some(&state), &config(ConnectionStatus::Connected));
        assert!(text.starts_with("[online | ping 50ms (excellent) | 1 pending]"));
        assert!(text.contains("room ROOM"));
        let alice = text.lines().find(|l| l.contains("Alice")).unwrap();
        assert!(alice.starts_with('>'));
        assert!(alice.contains("host"));
        let bob = text.lines().find(|l| l.contains("Bob")).unwrap();
        assert!(bob.contains("ready"));
    }

    #[test]
    fn test_render_without_state() {
        let text = Renderer::new().render(None, &config(ConnectionStatus::Reconnecting { attempt: 2 }));
        assert!(text.contains("reconnecting (attempt 2)"));
        assert!(text.contains("waiting for room state"));
    }

    #[test]
    fn test_notice_text() {
        let renderer = Renderer::new();
        let text = renderer.render_notice(&Notice::TimedOut {
            event_id: 1,
            action: "vote_cast",
        });
        assert!(text.contains("vote_cast"));
        assert!(renderer.render_notice(&Notice::Paused).contains("paused"));
    }
}
