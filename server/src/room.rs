//! Per-room actor that serializes every authoritative mutation
//!
//! Each room runs as its own tokio task fed by an unbounded command channel.
//! The task owns the room's [`GameState`], so no two mutations for one room
//! can interleave while different rooms proceed independently. All decision
//! logic lives in the synchronous [`Room::handle`] and [`Room::tick`], which
//! return the packets to send; the async loop only moves messages around.

use crate::config::ServerConfig;
use crate::network::{GameMessage, ServerMessage};
use crate::recovery::persistence::PersistenceAdapter;
use crate::recovery::{RecoveryError, RecoveryManager};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::batch::EventBatcher;
use shared::clock::Clock;
use shared::engine::{self, Applied};
use shared::events::{ConnectionState, DeliveryClass, RecoveryStatus};
use shared::{Broadcast, GameError, GameEvent, GameState, Intent, Packet, PlayerId, ServerEvent};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Messages delivered to a room actor
#[derive(Debug)]
pub enum RoomCommand {
    Connect {
        player_id: PlayerId,
        player_name: String,
        addr: SocketAddr,
        recovery_token: Option<String>,
    },
    Action {
        event: GameEvent,
        addr: SocketAddr,
    },
    Heartbeat {
        player_id: PlayerId,
    },
    Sync {
        player_id: PlayerId,
        addr: SocketAddr,
    },
    Disconnect {
        player_id: PlayerId,
        /// The client said goodbye rather than going silent
        graceful: bool,
    },
    Shutdown,
}

/// A packet addressed to one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub addr: SocketAddr,
    pub packet: Packet,
}

pub struct Room {
    code: String,
    state: GameState,
    recovery: RecoveryManager,
    batcher: EventBatcher,
    members: HashMap<PlayerId, SocketAddr>,
    processed: HashMap<PlayerId, VecDeque<u64>>,
    processed_window: usize,
    rng: StdRng,
    closed: bool,
    /// Closed because no valid snapshot was left
    unrecoverable: bool,
    /// Set after a restore until the first broadcast announces it
    restored: bool,
}

impl Room {
    pub fn new(code: &str, config: &ServerConfig, store: Arc<dyn PersistenceAdapter>, now: u64) -> Self {
        Self {
            code: code.to_string(),
            state: GameState::new(code),
            recovery: RecoveryManager::new(code, config.recovery.clone(), store, now),
            batcher: EventBatcher::new(config.batch_window_ms),
            members: HashMap::new(),
            processed: HashMap::new(),
            processed_window: config.processed_window,
            rng: StdRng::from_entropy(),
            closed: false,
            unrecoverable: false,
            restored: false,
        }
    }

    /// Rebuilds a room from its newest valid snapshot
    pub fn restore(
        code: &str,
        config: &ServerConfig,
        store: Arc<dyn PersistenceAdapter>,
        now: u64,
    ) -> Result<Self, RecoveryError> {
        let mut room = Self::new(code, config, store, now);
        let mut state = room.recovery.restore_latest(now)?;
        for player in &mut state.players {
            player.connected = false;
        }
        if state.phase.is_in_game() && !state.phase.is_terminal() {
            state.paused = true;
        }
        state.version += 1;
        if state.paused {
            room.recovery.pause(now);
        }
        room.state = state;
        room.restored = true;
        Ok(room)
    }

    /// Replaces the rng, for deterministic role deals in tests
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.unrecoverable
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn handle(&mut self, command: RoomCommand, now: u64) -> Vec<Outbound> {
        if self.closed {
            return Vec::new();
        }
        let mut out = Vec::new();
        match command {
            RoomCommand::Connect {
                player_id,
                player_name,
                addr,
                recovery_token,
            } => self.on_connect(player_id, player_name, addr, recovery_token, now, &mut out),
            RoomCommand::Action { event, addr } => self.on_action(event, addr, now, &mut out),
            RoomCommand::Heartbeat { player_id } => self.recovery.touch(&player_id, now),
            RoomCommand::Sync { player_id, addr } => {
                out.push(Outbound {
                    addr,
                    packet: Packet::State(Broadcast {
                        version: self.state.version,
                        timestamp: now,
                        events: vec![ServerEvent::RoomStateSync {
                            state: self.state.redacted_for(&player_id),
                        }],
                    }),
                });
            }
            RoomCommand::Disconnect {
                player_id,
                graceful,
            } => self.on_disconnect(&player_id, graceful, now, &mut out),
            RoomCommand::Shutdown => {
                self.take_snapshot(now);
                self.closed = true;
            }
        }
        out
    }

    /// Periodic work: batched flush, timeouts, auto-actions and snapshots
    pub fn tick(&mut self, now: u64) -> Vec<Outbound> {
        let mut out = Vec::new();
        if self.closed {
            return out;
        }

        if let Some(events) = self.batcher.take_due(now) {
            self.broadcast(events, now, &mut out);
        }

        let newly_timed_out = self.recovery.check_timeouts(self.state.phase, now);
        for player_id in &newly_timed_out {
            self.members.remove(player_id);
            if let Some(player) = self.state.player(player_id) {
                if player.connected {
                    self.mutate_presence(player_id, false, ConnectionState::Timeout, now);
                }
            }
        }

        if self.state.paused {
            if !self.recovery.is_mass_disconnect() && self.recovery.connected_count() > 0 {
                self.resume(now, &mut out);
            }
        } else if self.recovery.is_mass_disconnect() && self.state.phase.is_in_game() {
            self.pause(now, &mut out);
        } else if self.recovery.config().auto_actions {
            self.run_auto_actions(now, &mut out);
        }

        if self.recovery.snapshot_due(now) {
            self.take_snapshot(now);
        }
        out
    }

    fn on_connect(
        &mut self,
        player_id: PlayerId,
        player_name: String,
        addr: SocketAddr,
        recovery_token: Option<String>,
        now: u64,
        out: &mut Vec<Outbound>,
    ) {
        if self.recovery.has_session(&player_id) {
            let Some(token) = recovery_token else {
                out.push(disconnected(addr, "player id already in use; recovery token required"));
                return;
            };
            match self
                .recovery
                .reconnect(&player_id, &token, self.state.phase, now, &mut self.rng)
            {
                Ok(reconnected) => {
                    self.members.insert(player_id.clone(), addr);
                    out.push(Outbound {
                        addr,
                        packet: Packet::Connected {
                            player_id: player_id.clone(),
                            session_id: reconnected.grant.session_id,
                            recovery_token: reconnected.grant.recovery_token,
                            version: self.state.version,
                        },
                    });
                    self.mutate_presence(&player_id, true, ConnectionState::Connected, now);
                    self.send_full_sync(&player_id, addr, now, out);

                    if self.state.paused {
                        for event in reconnected.replay {
                            self.recovery.queue_action(event);
                        }
                        if !self.recovery.is_mass_disconnect() {
                            self.resume(now, out);
                        }
                    } else {
                        for event in reconnected.replay {
                            self.apply_event(event, None, now, out);
                        }
                    }
                }
                Err(e) => {
                    info!("Room {}: reconnect refused for {}: {}", self.code, player_id, e);
                    out.push(disconnected(addr, &e.to_string()));
                }
            }
            return;
        }

        let intent = Intent::JoinRoom { player_name };
        match engine::reduce(&self.state, &player_id, &intent, now, &mut self.rng) {
            Ok(applied) => {
                let grant = match self.recovery.register_player(&player_id, now, &mut self.rng) {
                    Ok(grant) => grant,
                    Err(e) => {
                        error!("Room {}: cannot start session for {}: {}", self.code, player_id, e);
                        out.push(disconnected(addr, "session could not be created"));
                        return;
                    }
                };
                self.members.insert(player_id.clone(), addr);
                out.push(Outbound {
                    addr,
                    packet: Packet::Connected {
                        player_id: player_id.clone(),
                        session_id: grant.session_id,
                        recovery_token: grant.recovery_token,
                        version: applied.state.version,
                    },
                });
                self.commit(applied, now, out);
            }
            Err(e) => {
                info!("Room {}: join refused for {}: {}", self.code, player_id, e);
                out.push(disconnected(addr, &e.to_string()));
            }
        }
    }

    fn on_action(&mut self, event: GameEvent, addr: SocketAddr, now: u64, out: &mut Vec<Outbound>) {
        if !self.members.contains_key(&event.player_id) {
            out.push(Outbound {
                addr,
                packet: Packet::reject(event.id, &GameError::InvalidPlayer(event.player_id.clone())),
            });
            return;
        }
        self.recovery.touch(&event.player_id, now);

        if self.already_processed(&event) {
            debug!("Room {}: duplicate event {} from {}", self.code, event.id, event.player_id);
            out.push(Outbound {
                addr,
                packet: Packet::Ack {
                    event_id: event.id,
                    version: self.state.version,
                },
            });
            return;
        }

        if self.state.paused && !matches!(event.intent, Intent::LeaveRoom) {
            debug!("Room {}: queueing {} while paused", self.code, event.intent.name());
            self.recovery.queue_action(event);
            return;
        }

        self.apply_event(event, Some(addr), now, out);
    }

    /// Runs one event through the reducer and answers its sender
    ///
    /// A sender whose event was based on an older version gets the current
    /// state right away unless the commit already broadcast it.
    fn apply_event(&mut self, event: GameEvent, reply_to: Option<SocketAddr>, now: u64, out: &mut Vec<Outbound>) {
        let stale = event.is_stale(self.state.version);
        if stale {
            debug!(
                "Room {}: {} from {} based on version {} (now {})",
                self.code,
                event.intent.name(),
                event.player_id,
                event.version,
                self.state.version
            );
        }
        let reply_to = reply_to.or_else(|| self.members.get(&event.player_id).copied());

        match engine::reduce(&self.state, &event.player_id, &event.intent, now, &mut self.rng) {
            Ok(applied) => {
                self.remember(&event);
                if let Some(addr) = reply_to {
                    out.push(Outbound {
                        addr,
                        packet: Packet::Ack {
                            event_id: event.id,
                            version: applied.state.version,
                        },
                    });
                }
                let critical = applied.critical || event.intent.is_critical();
                if matches!(event.intent, Intent::LeaveRoom) && !applied.state.has_player(&event.player_id) {
                    self.members.remove(&event.player_id);
                    self.recovery.remove_player(&event.player_id);
                }
                let published = self.commit(applied, now, out);
                if critical {
                    self.take_snapshot(now);
                }
                if stale && !published && self.members.contains_key(&event.player_id) {
                    if let Some(addr) = reply_to {
                        self.send_full_sync(&event.player_id, addr, now, out);
                    }
                }
            }
            Err(e) => {
                debug!(
                    "Room {}: rejected {} from {}: {}",
                    self.code,
                    event.intent.name(),
                    event.player_id,
                    e
                );
                if let Some(addr) = reply_to {
                    out.push(Outbound {
                        addr,
                        packet: Packet::reject(event.id, &e),
                    });
                    if stale {
                        self.send_full_sync(&event.player_id, addr, now, out);
                    }
                }
            }
        }
    }

    fn on_disconnect(&mut self, player_id: &str, graceful: bool, now: u64, out: &mut Vec<Outbound>) {
        if self.members.remove(player_id).is_none() {
            return;
        }
        if graceful && !self.state.phase.is_in_game() {
            match engine::reduce(&self.state, player_id, &Intent::LeaveRoom, now, &mut self.rng) {
                Ok(applied) => {
                    self.recovery.remove_player(player_id);
                    self.commit(applied, now, out);
                }
                Err(e) => warn!("Room {}: leave failed for {}: {}", self.code, player_id, e),
            }
            return;
        }

        self.recovery.mark_disconnected(player_id, now);
        self.mutate_presence(player_id, false, ConnectionState::Disconnected, now);

        if !self.state.paused && self.state.phase.is_in_game() && self.recovery.is_mass_disconnect() {
            self.pause(now, out);
        }
    }

    /// Installs a reduced state, then publishes its events
    ///
    /// Returns false when the state only rides the next batch flush.
    fn commit(&mut self, applied: Applied, now: u64, out: &mut Vec<Outbound>) -> bool {
        if let Err(e) = applied.state.validate() {
            error!("Room {}: reducer produced an invalid state: {}", self.code, e);
            self.recover_from_corruption(now, out);
            return true;
        }
        self.state = applied.state;

        let (batched, immediate): (Vec<ServerEvent>, Vec<ServerEvent>) = applied
            .events
            .into_iter()
            .partition(|e| e.delivery_class() == DeliveryClass::Batched);
        let carried_by_batch = immediate.is_empty() && !batched.is_empty();
        for event in batched {
            self.batcher.push(event, now);
        }
        if !carried_by_batch {
            self.broadcast(immediate, now, out);
        }
        !carried_by_batch
    }

    /// Presence changes bump the version but ride the batch window
    fn mutate_presence(&mut self, player_id: &str, connected: bool, connection: ConnectionState, now: u64) {
        let Some(player) = self.state.player_mut(player_id) else {
            return;
        };
        player.connected = connected;
        self.state.version += 1;
        self.batcher.push(
            ServerEvent::PlayerPresenceChanged {
                player_id: player_id.to_string(),
                connection,
            },
            now,
        );
    }

    fn pause(&mut self, now: u64, out: &mut Vec<Outbound>) {
        warn!(
            "Room {}: {:.0}% of players disconnected, pausing",
            self.code,
            self.recovery.disconnected_fraction() * 100.0
        );
        self.state.paused = true;
        self.state.version += 1;
        self.recovery.pause(now);
        self.take_snapshot(now);
        self.broadcast(
            vec![ServerEvent::RecoveryStatusChanged {
                status: RecoveryStatus::Paused,
            }],
            now,
            out,
        );
    }

    fn resume(&mut self, now: u64, out: &mut Vec<Outbound>) {
        info!("Room {}: resuming play", self.code);
        self.state.paused = false;
        self.state.version += 1;
        self.recovery.resume(now);
        self.broadcast(
            vec![ServerEvent::RecoveryStatusChanged {
                status: RecoveryStatus::Resumed,
            }],
            now,
            out,
        );
        for event in self.recovery.take_pending() {
            self.apply_event(event, None, now, out);
        }
    }

    fn run_auto_actions(&mut self, now: u64, out: &mut Vec<Outbound>) {
        if !self.state.phase.is_in_game() {
            return;
        }
        for player_id in self.recovery.timed_out_players() {
            // A leader may need to propose and then vote in one sweep
            for _ in 0..2 {
                let Some(intent) = engine::auto_action(&self.state, &player_id) else {
                    break;
                };
                info!("Room {}: auto {} for {}", self.code, intent.name(), player_id);
                match engine::reduce(&self.state, &player_id, &intent, now, &mut self.rng) {
                    Ok(applied) => {
                        let critical = applied.critical || intent.is_critical();
                        self.commit(applied, now, out);
                        if critical {
                            self.take_snapshot(now);
                        }
                    }
                    Err(e) => {
                        warn!("Room {}: auto action for {} failed: {}", self.code, player_id, e);
                        break;
                    }
                }
            }
        }
    }

    /// Falls back to the newest valid snapshot; closes the room when none is left
    fn recover_from_corruption(&mut self, now: u64, out: &mut Vec<Outbound>) {
        match self.recovery.restore_latest(now) {
            Ok(mut state) => {
                state.version = self.state.version.max(state.version) + 1;
                self.state = state;
                for player in self.members.keys() {
                    self.recovery.mark_connected(player, now);
                }
                self.broadcast(
                    vec![ServerEvent::RecoveryStatusChanged {
                        status: RecoveryStatus::Restored,
                    }],
                    now,
                    out,
                );
            }
            Err(e) => {
                error!("Room {}: unrecoverable: {}", self.code, e);
                for addr in self.members.values() {
                    out.push(disconnected(*addr, "room state could not be recovered"));
                }
                self.members.clear();
                self.closed = true;
                self.unrecoverable = true;
            }
        }
    }

    fn take_snapshot(&mut self, now: u64) {
        if let Err(e) = self.recovery.take_snapshot(&self.state, now) {
            error!("Room {}: snapshot failed: {}", self.code, e);
        }
    }

    /// Sends `events` plus each member's redacted view, flushing anything batched
    fn broadcast(&mut self, events: Vec<ServerEvent>, now: u64, out: &mut Vec<Outbound>) {
        let mut all = self.batcher.flush();
        if std::mem::take(&mut self.restored) {
            all.push(ServerEvent::RecoveryStatusChanged {
                status: RecoveryStatus::Restored,
            });
        }
        all.extend(events);

        for (player_id, addr) in &self.members {
            let mut personal = all.clone();
            personal.push(ServerEvent::GameStateUpdated {
                state: self.state.redacted_for(player_id),
            });
            out.push(Outbound {
                addr: *addr,
                packet: Packet::State(Broadcast {
                    version: self.state.version,
                    timestamp: now,
                    events: personal,
                }),
            });
        }
    }

    fn send_full_sync(&mut self, player_id: &str, addr: SocketAddr, now: u64, out: &mut Vec<Outbound>) {
        let mut events = Vec::new();
        if std::mem::take(&mut self.restored) {
            events.push(ServerEvent::RecoveryStatusChanged {
                status: RecoveryStatus::Restored,
            });
        }
        events.push(ServerEvent::RoomStateSync {
            state: self.state.redacted_for(player_id),
        });
        out.push(Outbound {
            addr,
            packet: Packet::State(Broadcast {
                version: self.state.version,
                timestamp: now,
                events,
            }),
        });
    }

    fn already_processed(&self, event: &GameEvent) -> bool {
        self.processed
            .get(&event.player_id)
            .map(|ids| ids.contains(&event.id))
            .unwrap_or(false)
    }

    fn remember(&mut self, event: &GameEvent) {
        let ids = self.processed.entry(event.player_id.clone()).or_default();
        ids.push_back(event.id);
        while ids.len() > self.processed_window {
            ids.pop_front();
        }
    }

    /// Drives the room until shutdown, forwarding packets to the network sender
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RoomCommand>,
        game_tx: mpsc::UnboundedSender<GameMessage>,
        server_tx: mpsc::UnboundedSender<ServerMessage>,
        clock: Arc<dyn Clock>,
        tick: Duration,
    ) {
        let mut interval = tokio::time::interval(tick);
        info!("Room {} started", self.code);

        loop {
            let out = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command, clock.now_ms()),
                    None => {
                        self.handle(RoomCommand::Shutdown, clock.now_ms());
                        Vec::new()
                    }
                },
                _ = interval.tick() => self.tick(clock.now_ms()),
            };

            for Outbound { addr, packet } in out {
                if let Err(e) = game_tx.send(GameMessage::SendPacket { packet, addr }) {
                    error!("Room {}: failed to queue packet: {}", self.code, e);
                }
            }

            if self.closed {
                break;
            }
        }

        info!("Room {} stopped", self.code);
        if let Err(e) = server_tx.send(ServerMessage::RoomClosed {
            room_code: self.code.clone(),
            unrecoverable: self.unrecoverable,
        }) {
            debug!("Room {}: server loop already gone: {}", self.code, e);
        }
    }
}

fn disconnected(addr: SocketAddr, reason: &str) -> Outbound {
    Outbound {
        addr,
        packet: Packet::Disconnected {
            reason: reason.to_string(),
        },
    }
}
