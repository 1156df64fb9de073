use crate::channel::SyncChannel;
use crate::config::ClientConfig;
use crate::connection::ConnectionStatus;
use crate::optimistic::{ConflictStrategy, Notice, OptimisticLayer, ResolveError};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::events::RecoveryStatus;
use shared::{Broadcast, GameError, GameState, Intent, Packet, ServerEvent};

/// Client-side mirror of one room
///
/// Owns the sync channel and the optimistic layer and routes packets between
/// them. Every method takes the current time and returns the packets to send,
/// so the whole client can be driven without a socket.
pub struct ClientGame {
    channel: SyncChannel,
    layer: OptimisticLayer,
    rng: StdRng,
    /// Accept the next full sync even if its version is not newer
    awaiting_sync: bool,
}

impl ClientGame {
    pub fn new(config: &ClientConfig, now: u64) -> Self {
        Self {
            channel: SyncChannel::new(config, now),
            layer: OptimisticLayer::new(
                config.player_id.clone(),
                config.conflict_strategy,
                config.auto_resolve,
                config.optimistic_timeout_ms,
            ),
            rng: StdRng::from_entropy(),
            awaiting_sync: true,
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// What the player sees: confirmed state plus their own pending updates
    pub fn state(&self) -> Option<&GameState> {
        self.layer.working()
    }

    pub fn layer(&self) -> &OptimisticLayer {
        &self.layer
    }

    pub fn channel(&self) -> &SyncChannel {
        &self.channel
    }

    pub fn status(&self) -> ConnectionStatus {
        self.channel.status()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.layer.take_notices()
    }

    pub fn start(&mut self, now: u64) -> Packet {
        self.channel.begin_connect(now)
    }

    /// Applies an intent locally and hands it to the channel
    ///
    /// Local validation failures are returned without sending anything.
    pub fn submit(&mut self, intent: Intent, now: u64) -> Result<Option<Packet>, GameError> {
        let preview = self.layer.preview(&intent)?;
        let version = self.layer.confirmed_version();
        let (event, packet) = self.channel.submit(intent.clone(), version, now);
        if let Some(local) = preview {
            self.layer.apply_local(event.id, intent, local, now);
        }
        Ok(packet)
    }

    pub fn request_sync(&self) -> Packet {
        Packet::SyncRequest {
            known_version: self.layer.confirmed_version(),
        }
    }

    pub fn resolve_conflict(&mut self, conflict_id: u64, strategy: ConflictStrategy, now: u64) -> Result<(), ResolveError> {
        let dropped = self.layer.resolve_conflict(conflict_id, strategy, now)?;
        for event_id in dropped {
            self.channel.abandon(event_id);
        }
        Ok(())
    }

    pub fn handle_packet(&mut self, packet: Packet, now: u64) -> Vec<Packet> {
        self.channel.on_server_contact(now);

        match packet {
            Packet::Connected {
                player_id,
                session_id,
                recovery_token,
                version,
            } => {
                debug!("Session {} for {} at v{}", session_id, player_id, version);
                let resumed = matches!(self.channel.status(), ConnectionStatus::Reconnecting { .. });
                let flushed = self.channel.on_connected(session_id, recovery_token, now);
                self.layer.restart_timers(now);
                self.awaiting_sync = true;
                if resumed {
                    self.layer.notify(Notice::Reconnected);
                }
                flushed
            }

            Packet::Ack { event_id, version } => {
                if let Some(latency) = self.channel.on_ack(event_id, now) {
                    debug!("Event {} acknowledged at v{} after {}ms", event_id, version, latency);
                }
                self.layer.confirm(event_id);
                Vec::new()
            }

            Packet::Reject {
                event_id,
                code,
                reason,
            } => {
                let action = self.channel.on_reject(event_id, now).unwrap_or("unknown");
                if self.layer.reject(event_id, &reason).is_none() {
                    warn!("Event {} ({}) rejected ({}): {}", event_id, action, code, reason);
                    self.layer.notify(Notice::Rejected {
                        event_id,
                        action,
                        reason,
                    });
                }
                Vec::new()
            }

            Packet::State(broadcast) => self.apply_broadcast(broadcast, now).into_iter().collect(),

            Packet::HeartbeatAck { timestamp } => {
                self.channel.on_heartbeat_ack(timestamp, now);
                Vec::new()
            }

            Packet::Disconnected { reason } => {
                if self.channel.on_disconnected(&reason, now, &mut self.rng) {
                    if let ConnectionStatus::Reconnecting { attempt } = self.channel.status() {
                        self.layer.notify(Notice::Reconnecting { attempt });
                    }
                } else {
                    self.layer.notify(Notice::Disconnected { reason });
                }
                Vec::new()
            }

            other => {
                warn!("Unexpected packet from server: {:?}", other);
                Vec::new()
            }
        }
    }

    /// Applies a broadcast; returns a sync request when one is needed
    pub fn apply_broadcast(&mut self, broadcast: Broadcast, now: u64) -> Option<Packet> {
        let full_sync = broadcast
            .events
            .iter()
            .any(|e| matches!(e, ServerEvent::RoomStateSync { .. }));
        let forced = full_sync && self.awaiting_sync;

        if !forced && self.layer.confirmed().is_some() && broadcast.version <= self.layer.confirmed_version() {
            debug!("Discarding broadcast v{} (have v{})", broadcast.version, self.layer.confirmed_version());
            return None;
        }

        for event in &broadcast.events {
            if let ServerEvent::RecoveryStatusChanged { status } = event {
                info!("Room recovery status: {:?}", status);
                self.layer.notify(match status {
                    RecoveryStatus::Paused => Notice::Paused,
                    RecoveryStatus::Resumed => Notice::Resumed,
                    RecoveryStatus::Restored => Notice::Restored,
                });
            }
        }

        let Some(state) = broadcast.latest_state().cloned() else {
            warn!("Broadcast v{} carried no state; requesting a sync", broadcast.version);
            return Some(self.request_sync());
        };

        let dropped = if forced {
            self.awaiting_sync = false;
            self.layer.reset(state, broadcast.timestamp, now)
        } else {
            self.layer.on_authoritative(state, broadcast.timestamp, now)
        };
        for event_id in dropped {
            self.channel.abandon(event_id);
        }
        None
    }

    /// Timers: optimistic expiry, resends, heartbeats, silence and reconnects
    pub fn tick(&mut self, now: u64) -> Vec<Packet> {
        let mut packets = Vec::new();

        if self.channel.status().is_connected() {
            for event_id in self.layer.expire(now) {
                self.channel.abandon(event_id);
            }
        }

        if self.channel.is_server_silent(now) {
            self.channel.on_connection_lost(now, &mut self.rng);
            match self.channel.status() {
                ConnectionStatus::Reconnecting { attempt } => self.layer.notify(Notice::Reconnecting { attempt }),
                _ => self.layer.notify(Notice::Disconnected {
                    reason: "server stopped responding".to_string(),
                }),
            }
        }

        let was_reconnecting = matches!(self.channel.status(), ConnectionStatus::Reconnecting { .. });
        if let Some(connect) = self.channel.reconnect_due(now, &mut self.rng) {
            packets.push(connect);
        }
        if was_reconnecting && self.channel.status() == ConnectionStatus::Disconnected {
            self.layer.notify(Notice::Disconnected {
                reason: "gave up reconnecting".to_string(),
            });
        }

        packets.extend(self.channel.due_resends(now));
        packets.extend(self.channel.heartbeat_due(now));
        packets
    }

    /// Stops reconnecting and returns the goodbye packet if still connected
    pub fn shutdown(&mut self) -> Option<Packet> {
        self.channel.disconnect_packet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::state::VoteChoice;

    fn config() -> ClientConfig {
        ClientConfig {
            player_id: "p1".into(),
            room_code: "ROOM".into(),
            backoff_jitter_ms: 0,
            ..ClientConfig::default()
        }
    }

    fn game() -> ClientGame {
        ClientGame::new(&config(), 1).with_rng(StdRng::seed_from_u64(3))
    }

    fn lobby(version: u64) -> GameState {
        let mut state = GameState::new("ROOM");
        state.players.push(shared::state::Player::new("p1", "P1"));
        state.version = version;
        state
    }

    fn broadcast(state: GameState, full: bool) -> Packet {
        let version = state.version;
        let event = if full {
            ServerEvent::RoomStateSync { state }
        } else {
            ServerEvent::GameStateUpdated { state }
        };
        Packet::State(Broadcast {
            version,
            timestamp: 0,
            events: vec![event],
        })
    }

    fn connect(game: &mut ClientGame, now: u64) {
        game.start(now);
        game.handle_packet(
            Packet::Connected {
                player_id: "p1".into(),
                session_id: "s".into(),
                recovery_token: "t".into(),
                version: 1,
            },
            now,
        );
        game.handle_packet(broadcast(lobby(1), true), now);
    }

    #[test]
    fn test_ready_shows_before_ack() {
        let mut game = game();
        connect(&mut game, 0);

        let packet = game.submit(Intent::PlayerReadyChanged { ready: true }, 10).unwrap();
        assert!(matches!(packet, Some(Packet::Action(_))));
        assert!(game.state().unwrap().player("p1").unwrap().ready);
        assert!(!game.layer().confirmed().unwrap().player("p1").unwrap().ready);
    }

    #[test]
    fn test_local_validation_blocks_send() {
        let mut game = game();
        connect(&mut game, 0);
        let result = game.submit(Intent::VoteCast { choice: VoteChoice::Approve }, 10);
        assert!(result.is_err());
        assert_eq!(game.channel().in_flight_count(), 0);
    }

    #[test]
    fn test_old_broadcasts_are_discarded() {
        let mut game = game();
        connect(&mut game, 0);
        game.handle_packet(broadcast(lobby(5), false), 10);

        let mut stale = lobby(4);
        stale.round = 3;
        game.handle_packet(broadcast(stale, false), 20);
        assert_eq!(game.state().unwrap().version, 5);
    }

    #[test]
    fn test_full_sync_after_reconnect_is_accepted() {
        let mut game = game();
        connect(&mut game, 0);
        game.handle_packet(broadcast(lobby(9), false), 10);

        game.handle_packet(
            Packet::Connected {
                player_id: "p1".into(),
                session_id: "s2".into(),
                recovery_token: "t".into(),
                version: 3,
            },
            20,
        );
        game.handle_packet(broadcast(lobby(3), true), 20);
        assert_eq!(game.state().unwrap().version, 3);
    }

    #[test]
    fn test_stateless_broadcast_requests_sync() {
        let mut game = game();
        connect(&mut game, 0);
        let reply = game.handle_packet(
            Packet::State(Broadcast {
                version: 7,
                timestamp: 0,
                events: vec![],
            }),
            10,
        );
        assert_eq!(reply, vec![Packet::SyncRequest { known_version: 1 }]);
    }

    #[test]
    fn test_recovery_status_becomes_notice() {
        let mut game = game();
        connect(&mut game, 0);
        let mut state = lobby(2);
        state.paused = true;
        game.handle_packet(
            Packet::State(Broadcast {
                version: 2,
                timestamp: 0,
                events: vec![
                    ServerEvent::RecoveryStatusChanged {
                        status: RecoveryStatus::Paused,
                    },
                    ServerEvent::GameStateUpdated { state },
                ],
            }),
            10,
        );
        assert_eq!(game.take_notices(), vec![Notice::Paused]);
    }

    #[test]
    fn test_reject_rolls_back_and_notifies() {
        let mut game = game();
        connect(&mut game, 0);
        let before = game.state().cloned().unwrap();
        let Some(Packet::Action(event)) = game.submit(Intent::PlayerReadyChanged { ready: true }, 10).unwrap() else {
            panic!("expected an action packet");
        };

        game.handle_packet(
            Packet::Reject {
                event_id: event.id,
                code: "wrong_phase".into(),
                reason: "nope".into(),
            },
            20,
        );
        assert_eq!(game.state(), Some(&before));
        assert!(matches!(game.take_notices().as_slice(), [Notice::Rejected { .. }]));
    }

    #[test]
    fn test_reject_without_preview_names_the_intent() {
        let mut game = game();
        game.start(0);
        game.handle_packet(
            Packet::Connected {
                player_id: "p1".into(),
                session_id: "s".into(),
                recovery_token: "t".into(),
                version: 1,
            },
            0,
        );
        // No state yet, so nothing was applied locally
        let Some(Packet::Action(event)) = game.submit(Intent::StartGame, 10).unwrap() else {
            panic!("expected an action packet");
        };
        assert!(game.layer().pending().is_empty());

        game.handle_packet(
            Packet::Reject {
                event_id: event.id,
                code: "wrong_phase".into(),
                reason: "nope".into(),
            },
            20,
        );
        assert_eq!(
            game.take_notices(),
            vec![Notice::Rejected {
                event_id: event.id,
                action: "start_game",
                reason: "nope".into(),
            }]
        );
    }

    #[test]
    fn test_silence_triggers_reconnect() {
        let mut game = game();
        connect(&mut game, 0);
        game.submit(Intent::PlayerReadyChanged { ready: true }, 10).unwrap();

        // Heartbeats go out but nothing comes back
        assert!(game.tick(1_000).contains(&Packet::Heartbeat { timestamp: 1_000 }));
        game.tick(5_001);
        assert_eq!(game.status(), ConnectionStatus::Reconnecting { attempt: 1 });
        assert_eq!(game.channel().queued().count(), 1);
        assert!(game.take_notices().contains(&Notice::Reconnecting { attempt: 1 }));

        let packets = game.tick(5_501);
        assert!(packets.iter().any(|p| matches!(p, Packet::Connect { recovery_token: Some(_), .. })));

        // The pending update survived the outage
        assert!(game.state().unwrap().player("p1").unwrap().ready);
    }

    #[test]
    fn test_shutdown_says_goodbye_once() {
        let mut game = game();
        connect(&mut game, 0);
        assert_eq!(game.shutdown(), Some(Packet::Disconnect));
        assert_eq!(game.shutdown(), None);
        assert_eq!(game.status(), ConnectionStatus::Disconnected);
    }
}
