//! Integration tests across the shared rules, the room actor and the client
//!
//! These tests validate cross-component interactions and real network behavior.

use client::config::ClientConfig;
use client::game::ClientGame;
use client::optimistic::Notice;
use rand::rngs::StdRng;
use rand::SeedableRng;
use server::config::{RecoveryConfig, ServerConfig};
use server::recovery::persistence::{FileAdapter, MemoryAdapter, PersistenceAdapter};
use server::recovery::snapshot::GameStateSnapshot;
use server::recovery::{RecoveryError, RecoveryManager};
use server::room::{Outbound, Room, RoomCommand};
use shared::engine::reduce;
use shared::state::{Alignment, MissionOutcome, MissionVote, VoteChoice, WinReason};
use shared::{GameEvent, GamePhase, GameState, Intent, Packet};
use std::net::SocketAddr;
use std::sync::Arc;

fn apply(state: &GameState, player: &str, intent: Intent) -> GameState {
    let mut rng = StdRng::seed_from_u64(42);
    reduce(state, player, &intent, 0, &mut rng)
        .unwrap_or_else(|e| panic!("{} by {} failed: {}", intent.name(), player, e))
        .state
}

fn lobby(count: usize) -> GameState {
    let mut state = GameState::new("ROOM");
    for i in 0..count {
        state = apply(&state, &format!("p{}", i), Intent::JoinRoom { player_name: format!("P{}", i) });
    }
    for i in 0..count {
        state = apply(&state, &format!("p{}", i), Intent::PlayerReadyChanged { ready: true });
    }
    state
}

fn started(count: usize) -> GameState {
    let mut state = apply(&lobby(count), "p0", Intent::StartGame);
    for i in 0..count {
        state = apply(&state, &format!("p{}", i), Intent::PlayerReadyChanged { ready: true });
    }
    assert_eq!(state.phase, GamePhase::Voting);
    state
}

fn by_alignment(state: &GameState, alignment: Alignment) -> Vec<String> {
    state
        .players
        .iter()
        .filter(|p| p.role.map(|r| r.alignment()) == Some(alignment))
        .map(|p| p.id.clone())
        .collect()
}

/// Proposes a team with `fails` evil members who sabotage, approves it and
/// collects every mission vote
fn play_mission(mut state: GameState, fails: usize) -> GameState {
    let size = state.current_requirements().unwrap().required_team_size;
    let evil = by_alignment(&state, Alignment::Evil);
    let good = by_alignment(&state, Alignment::Good);
    let mut team: Vec<String> = evil.iter().take(fails).cloned().collect();
    team.extend(good.iter().take(size - fails).cloned());

    let leader = state.leader().unwrap().id.clone();
    state = apply(&state, &leader, Intent::MissionTeamSelected { team: team.clone() });
    for id in state.player_ids() {
        state = apply(&state, &id, Intent::VoteCast { choice: VoteChoice::Approve });
    }
    assert_eq!(state.phase, GamePhase::MissionVote);

    for id in &team {
        let vote = if evil.contains(id) {
            MissionVote::Failure
        } else {
            MissionVote::Success
        };
        state = apply(&state, id, Intent::MissionVoteCast { vote });
    }
    state
}

/// END-TO-END GAME SCENARIOS
mod scenario_tests {
    use super::*;

    fn round_four_of_seven() -> GameState {
        let mut state = started(7);
        state = play_mission(state, 0);
        state = play_mission(state, 1);
        state = play_mission(state, 0);
        assert_eq!(state.round, 4);
        assert_eq!(state.phase, GamePhase::Voting);
        let requirements = state.current_requirements().unwrap();
        assert_eq!(requirements.required_team_size, 4);
        assert_eq!(requirements.required_fail_votes, 2);
        state
    }

    /// Seven players, round four: two sabotage votes are needed to fail
    #[test]
    fn double_fail_rule_at_round_four() {
        let failed = play_mission(round_four_of_seven(), 2);
        assert_eq!(failed.missions[3].result, Some(MissionOutcome::Failure));
        assert_eq!(failed.missions[3].fail_count, 2);

        let survived = play_mission(round_four_of_seven(), 1);
        assert_eq!(survived.missions[3].result, Some(MissionOutcome::Success));
        assert_eq!(survived.missions[3].fail_count, 1);
        // Third success hands the game to the assassin
        assert_eq!(survived.phase, GamePhase::AssassinAttempt);
    }

    /// Four players cannot leave the lobby
    #[test]
    fn four_players_cannot_start() {
        let state = lobby(4);
        let check = state.can_start_game();
        assert!(!check.can_start);
        assert!(check
            .reasons
            .iter()
            .any(|r| r.contains("need at least 5 players")));
    }

    /// Five rejected proposals in a row end the game for evil
    #[test]
    fn five_rejections_evil_wins() {
        let mut state = started(5);
        for _ in 0..5 {
            let size = state.current_requirements().unwrap().required_team_size;
            let team: Vec<String> = state.player_ids().into_iter().take(size).collect();
            let leader = state.leader().unwrap().id.clone();
            state = apply(&state, &leader, Intent::MissionTeamSelected { team });
            for id in state.player_ids() {
                state = apply(&state, &id, Intent::VoteCast { choice: VoteChoice::Reject });
            }
        }

        assert_eq!(state.phase, GamePhase::GameOver);
        let outcome = state.outcome.unwrap();
        assert_eq!(outcome.winner, Alignment::Evil);
        assert_eq!(outcome.reason, WinReason::FiveRejections);
        assert!(state.missions.is_empty());
    }

    /// A vote nobody confirms is rolled back with a notice
    #[test]
    fn unconfirmed_vote_rolls_back() {
        let mut state = started(5);
        let team: Vec<String> = state.player_ids().into_iter().take(2).collect();
        state = apply(&state, "p0", Intent::MissionTeamSelected { team });

        let config = ClientConfig {
            player_id: "p1".into(),
            room_code: "ROOM".into(),
            optimistic_timeout_ms: 3_000,
            ..ClientConfig::default()
        };
        let mut game = ClientGame::new(&config, 0).with_rng(StdRng::seed_from_u64(1));
        game.start(0);
        game.handle_packet(
            Packet::Connected {
                player_id: "p1".into(),
                session_id: "s".into(),
                recovery_token: "t".into(),
                version: state.version,
            },
            0,
        );
        game.handle_packet(
            Packet::State(shared::Broadcast {
                version: state.version,
                timestamp: 0,
                events: vec![shared::ServerEvent::RoomStateSync {
                    state: state.redacted_for("p1"),
                }],
            }),
            0,
        );
        let before = game.state().cloned().unwrap();

        game.submit(Intent::VoteCast { choice: VoteChoice::Approve }, 100).unwrap();
        assert!(game.state().unwrap().has_cast_vote("p1"));

        // Keep the link alive so only the update itself expires
        game.handle_packet(Packet::HeartbeatAck { timestamp: 2_000 }, 2_000);
        game.tick(3_100);

        assert_eq!(game.state(), Some(&before));
        assert!(game.layer().pending().is_empty());
        assert!(game
            .take_notices()
            .iter()
            .any(|n| matches!(n, Notice::TimedOut { action: "vote_cast", .. })));
    }
}

/// SNAPSHOT PERSISTENCE TESTS
mod persistence_tests {
    use super::*;

    fn manager(store: Arc<dyn PersistenceAdapter>) -> RecoveryManager {
        RecoveryManager::new("ROOM", RecoveryConfig::default(), store, 0)
    }

    /// A saved snapshot loads back byte-identical and valid
    #[test]
    fn file_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn PersistenceAdapter> = Arc::new(FileAdapter::new(dir.path()).unwrap());
        let state = started(5);

        let snapshot = manager(Arc::clone(&store)).take_snapshot(&state, 10).unwrap();
        let key = GameStateSnapshot::key("ROOM", snapshot.sequence);
        let bytes = store.load(&key).unwrap().unwrap();
        let loaded = GameStateSnapshot::decode(&bytes).unwrap();

        assert!(loaded.validate().is_ok());
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.encode().unwrap(), bytes);

        // A fresh process over the same directory gets the same state back
        let reopened: Arc<dyn PersistenceAdapter> = Arc::new(FileAdapter::new(dir.path()).unwrap());
        assert_eq!(manager(reopened).restore_latest(50).unwrap(), state);
    }

    /// Corrupting one field after the save makes validation fail
    #[test]
    fn corrupted_snapshot_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn PersistenceAdapter> = Arc::new(FileAdapter::new(dir.path()).unwrap());
        let snapshot = manager(Arc::clone(&store)).take_snapshot(&started(5), 10).unwrap();

        let key = GameStateSnapshot::key("ROOM", snapshot.sequence);
        let mut tampered = GameStateSnapshot::decode(&store.load(&key).unwrap().unwrap()).unwrap();
        tampered.game_state.consecutive_rejections = 4;
        store.save(&key, &tampered.encode().unwrap()).unwrap();

        let reloaded = GameStateSnapshot::decode(&store.load(&key).unwrap().unwrap()).unwrap();
        assert!(matches!(
            reloaded.validate(),
            Err(RecoveryError::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            manager(Arc::clone(&store)).restore_latest(20),
            Err(RecoveryError::NoValidSnapshot(_))
        ));
    }

    /// The newest snapshot is corrupt, so the one before it is used
    #[test]
    fn restore_falls_back_to_older_snapshot() {
        let store: Arc<dyn PersistenceAdapter> = Arc::new(MemoryAdapter::new());
        let mut recovery = manager(Arc::clone(&store));
        let older = started(5);
        recovery.take_snapshot(&older, 10).unwrap();
        let mut newer = older.clone();
        newer.version += 1;
        let latest = recovery.take_snapshot(&newer, 20).unwrap();

        let key = GameStateSnapshot::key("ROOM", latest.sequence);
        let mut bytes = store.load(&key).unwrap().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        store.save(&key, &bytes).unwrap();

        assert_eq!(manager(Arc::clone(&store)).restore_latest(30).unwrap(), older);
        assert!(!store.exists(&key).unwrap());
    }
}

/// SECURITY GATE TESTS
mod security_tests {
    use server::security::RateLimiter;

    /// Exactly `limit` requests pass per window
    #[test]
    fn rate_limiter_window() {
        let mut limiter = RateLimiter::new(3, 1_000);
        for expected_remaining in [2, 1, 0] {
            let result = limiter.check("p1", 100);
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
            assert_eq!(result.reset_at, 1_100);
        }
        assert!(!limiter.check("p1", 500).allowed);
        // Other identifiers have their own budget
        assert!(limiter.check("p2", 500).allowed);

        for _ in 0..3 {
            assert!(limiter.check("p1", 1_100).allowed);
        }
        assert!(!limiter.check("p1", 1_200).allowed);
    }
}

/// CLIENT-SERVER INTEGRATION TESTS
mod client_server_tests {
    use super::*;

    fn addr(i: usize) -> SocketAddr {
        format!("127.0.0.1:{}", 9100 + i).parse().unwrap()
    }

    fn client(i: usize) -> ClientGame {
        let config = ClientConfig {
            player_id: format!("p{}", i),
            room_code: "ROOM".into(),
            ..ClientConfig::default()
        };
        ClientGame::new(&config, 0).with_rng(StdRng::seed_from_u64(i as u64))
    }

    /// Hands room output to the client it is addressed to; returns the client's replies
    fn deliver(out: Vec<Outbound>, clients: &mut [ClientGame], now: u64) -> Vec<(usize, Packet)> {
        let mut replies = Vec::new();
        for outbound in out {
            let i = (outbound.addr.port() - 9100) as usize;
            for reply in clients[i].handle_packet(outbound.packet, now) {
                replies.push((i, reply));
            }
        }
        replies
    }

    fn to_room(room: &mut Room, i: usize, packet: Packet, now: u64) -> Vec<Outbound> {
        match packet {
            Packet::Action(event) => room.handle(RoomCommand::Action { event, addr: addr(i) }, now),
            Packet::SyncRequest { .. } => room.handle(
                RoomCommand::Sync {
                    player_id: format!("p{}", i),
                    addr: addr(i),
                },
                now,
            ),
            other => panic!("unexpected client packet {:?}", other),
        }
    }

    fn join(room: &mut Room, clients: &mut [ClientGame], i: usize, now: u64) {
        clients[i].start(now);
        let out = room.handle(
            RoomCommand::Connect {
                player_id: format!("p{}", i),
                player_name: format!("P{}", i),
                addr: addr(i),
                recovery_token: None,
            },
            now,
        );
        deliver(out, clients, now);
    }

    /// Actions travel client -> room -> every client and converge
    #[test]
    fn clients_converge_on_room_state() {
        let store: Arc<dyn PersistenceAdapter> = Arc::new(MemoryAdapter::new());
        let mut room = Room::new("ROOM", &ServerConfig::default(), store, 0).with_rng(StdRng::seed_from_u64(9));
        let mut clients: Vec<ClientGame> = (0..3).map(client).collect();
        for i in 0..3 {
            join(&mut room, &mut clients, i, 10);
        }

        let packet = clients[1]
            .submit(Intent::PlayerReadyChanged { ready: true }, 20)
            .unwrap()
            .unwrap();
        // Shown locally before the server has seen it
        assert!(clients[1].state().unwrap().player("p1").unwrap().ready);
        assert!(!clients[2].state().unwrap().player("p1").unwrap().ready);

        let out = to_room(&mut room, 1, packet, 30);
        assert!(out.iter().any(|o| matches!(o.packet, Packet::Ack { .. })));
        deliver(out, &mut clients, 40);

        for game in &clients {
            let confirmed = game.layer().confirmed().unwrap();
            assert_eq!(confirmed.version, room.state().version);
            assert!(confirmed.player("p1").unwrap().ready);
            assert!(game.layer().pending().is_empty());
        }
    }

    /// An action the room refuses is undone on the sender only
    #[test]
    fn rejected_action_rolls_back_sender() {
        let store: Arc<dyn PersistenceAdapter> = Arc::new(MemoryAdapter::new());
        let mut room = Room::new("ROOM", &ServerConfig::default(), store, 0).with_rng(StdRng::seed_from_u64(9));
        let mut clients: Vec<ClientGame> = (0..2).map(client).collect();
        for i in 0..2 {
            join(&mut room, &mut clients, i, 10);
        }

        // The client thinks it may start, but only two players have joined
        let event = GameEvent {
            id: 77,
            player_id: "p0".into(),
            room_code: "ROOM".into(),
            timestamp: 20,
            version: room.state().version,
            intent: Intent::StartGame,
        };
        let out = to_room(&mut room, 0, Packet::Action(event), 20);
        assert!(out
            .iter()
            .any(|o| matches!(&o.packet, Packet::Reject { event_id: 77, .. })));
        assert_eq!(room.state().phase, GamePhase::Lobby);
        deliver(out, &mut clients, 30);
        assert!(clients[0]
            .take_notices()
            .iter()
            .any(|n| matches!(n, Notice::Rejected { event_id: 77, .. })));
    }
}

/// NETWORK PROTOCOL TESTS
mod network_tests {
    use super::*;
    use client::network::Client;
    use server::network::{Server, ServerMessage};
    use shared::clock::SystemClock;
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};
    use tokio::time::sleep;

    /// A real client joins a real server over UDP and its ready flag is confirmed
    #[tokio::test]
    async fn udp_join_and_ready() {
        let server_config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let store: Arc<dyn PersistenceAdapter> = Arc::new(MemoryAdapter::new());
        let mut server = Server::with_store(server_config, store, Arc::new(SystemClock))
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();

        let config = ClientConfig {
            server_addr: server_addr.to_string(),
            room_code: "UDP".into(),
            player_id: "alice".into(),
            player_name: "Alice".into(),
            ..ClientConfig::default()
        };
        let mut client = Client::new(config).await.unwrap();
        let (command_tx, command_rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let typing = async move {
            sleep(Duration::from_millis(300)).await;
            command_tx.send("ready".to_string()).await.unwrap();
            sleep(Duration::from_millis(300)).await;
            command_tx.send("quit".to_string()).await.unwrap();
        };
        let session = async {
            let (result, _) = tokio::join!(client.run(command_rx, stop_rx), typing);
            shutdown.send(ServerMessage::Shutdown).unwrap();
            result.map_err(|e| e.to_string())
        };

        let (server_result, client_result) = tokio::join!(server.run(), session);
        assert!(server_result.is_ok());
        assert!(client_result.is_ok());

        let confirmed = client.game().layer().confirmed().unwrap();
        assert_eq!(confirmed.room_code, "UDP");
        assert!(confirmed.player("alice").unwrap().ready);
        assert!(client.game().layer().pending().is_empty());
    }
}
