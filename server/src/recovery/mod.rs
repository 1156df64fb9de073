//! Snapshots, player sessions and reconnection for one room
//!
//! The [`RecoveryManager`] is owned by a room actor and therefore never
//! accessed concurrently. It tracks a [`PlayerStateSnapshot`] per player,
//! decides when players have timed out or when enough of them dropped at
//! once to pause the room, and writes checksummed snapshots into a ring
//! buffer on the configured [`PersistenceAdapter`].

pub mod pending;
pub mod persistence;
pub mod session;
pub mod snapshot;

use crate::config::RecoveryConfig;
use log::{debug, info, warn};
use persistence::{PersistenceAdapter, PersistenceError};
use rand::Rng;
use session::TokenSigner;
use shared::events::ConnectionState;
use shared::{GameEvent, GameState, PlayerId};
use snapshot::{GameStateSnapshot, PlayerStateSnapshot};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("snapshot {sequence} checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch {
        sequence: u64,
        expected: String,
        actual: String,
    },
    #[error("snapshot failed validation: {}", .0.join("; "))]
    Corrupt(Vec<String>),
    #[error("no valid snapshot for room {0}")]
    NoValidSnapshot(String),
    #[error("recovery token is invalid")]
    InvalidToken,
    #[error("recovery token key rejected")]
    TokenKey,
    #[error("recovery token belongs to {actual}, not {expected}")]
    TokenPlayerMismatch { expected: PlayerId, actual: PlayerId },
    #[error("recovery token is for another session")]
    SessionMismatch,
    #[error("no session for player {0}")]
    UnknownPlayer(PlayerId),
    #[error("session for {0} expired")]
    SessionExpired(PlayerId),
}

/// Credentials handed to a player when their session starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub session_id: String,
    pub recovery_token: String,
}

/// Outcome of a successful reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconnected {
    pub grant: SessionGrant,
    /// Resolved queued actions, oldest first
    pub replay: Vec<GameEvent>,
}

pub struct RecoveryManager {
    room_code: String,
    config: RecoveryConfig,
    store: Arc<dyn PersistenceAdapter>,
    signer: TokenSigner,
    players: BTreeMap<PlayerId, PlayerStateSnapshot>,
    /// Sequences currently held in the store, oldest first
    snapshots: Vec<u64>,
    next_sequence: u64,
    last_snapshot_at: u64,
    /// Set while the room is paused; away time stops counting from here
    paused_since: Option<u64>,
}

impl RecoveryManager {
    pub fn new(
        room_code: &str,
        config: RecoveryConfig,
        store: Arc<dyn PersistenceAdapter>,
        now: u64,
    ) -> Self {
        let signer = TokenSigner::new(config.token_secret.clone());
        Self {
            room_code: room_code.to_string(),
            config,
            store,
            signer,
            players: BTreeMap::new(),
            snapshots: Vec::new(),
            next_sequence: 1,
            last_snapshot_at: now,
            paused_since: None,
        }
    }

    /// True when the store holds at least one snapshot for `room_code`
    pub fn has_snapshots(store: &dyn PersistenceAdapter, room_code: &str) -> Result<bool, RecoveryError> {
        Ok(!store.list(&GameStateSnapshot::prefix(room_code))?.is_empty())
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn session(&self, player_id: &str) -> Option<&PlayerStateSnapshot> {
        self.players.get(player_id)
    }

    pub fn has_session(&self, player_id: &str) -> bool {
        self.players.contains_key(player_id)
    }

    /// Starts a fresh session for a player who just joined
    pub fn register_player<R: Rng + ?Sized>(
        &mut self,
        player_id: &str,
        now: u64,
        rng: &mut R,
    ) -> Result<SessionGrant, RecoveryError> {
        let session_id = session::new_session_id(rng);
        let recovery_token = self
            .signer
            .issue(player_id, &session_id, &self.room_code, now, rng)?;

        let snapshot = PlayerStateSnapshot {
            player_id: player_id.to_string(),
            session_id: session_id.clone(),
            connection_state: ConnectionState::Connected,
            last_activity: now,
            game_data: None,
            pending_actions: Vec::new(),
            recovery_token: recovery_token.clone(),
        };
        self.persist_player(&snapshot);
        self.players.insert(player_id.to_string(), snapshot);
        info!("Room {}: session started for {}", self.room_code, player_id);

        Ok(SessionGrant {
            session_id,
            recovery_token,
        })
    }

    pub fn remove_player(&mut self, player_id: &str) {
        if self.players.remove(player_id).is_some() {
            if let Err(e) = self.store.remove(&player_key(&self.room_code, player_id)) {
                warn!("Room {}: failed to remove session {}: {}", self.room_code, player_id, e);
            }
        }
    }

    /// Records activity for a connected player
    pub fn touch(&mut self, player_id: &str, now: u64) {
        if let Some(player) = self.players.get_mut(player_id) {
            player.last_activity = now;
        }
    }

    /// Marks a player whose connection is still live, e.g. after an in-place restore
    pub fn mark_connected(&mut self, player_id: &str, now: u64) {
        if let Some(player) = self.players.get_mut(player_id) {
            player.connection_state = ConnectionState::Connected;
            player.last_activity = now;
        }
    }

    pub fn mark_disconnected(&mut self, player_id: &str, now: u64) {
        if let Some(player) = self.players.get_mut(player_id) {
            if player.connection_state == ConnectionState::Connected {
                player.connection_state = ConnectionState::Disconnected;
                player.last_activity = now;
                debug!("Room {}: {} disconnected", self.room_code, player_id);
            }
        }
    }

    /// Validates a recovery token and restores the player's session
    ///
    /// Fails once the phase timeout has elapsed since the player was last
    /// seen; the caller then treats the player as gone for good.
    pub fn reconnect<R: Rng + ?Sized>(
        &mut self,
        player_id: &str,
        token: &str,
        phase: shared::GamePhase,
        now: u64,
        rng: &mut R,
    ) -> Result<Reconnected, RecoveryError> {
        let claims = self.signer.verify(token, player_id)?;
        let timeout = self.config.timeout_for(phase);
        let counted_until = self.paused_since.unwrap_or(now);

        let player = self
            .players
            .get_mut(player_id)
            .ok_or_else(|| RecoveryError::UnknownPlayer(player_id.to_string()))?;
        if claims.session_id != player.session_id || claims.room_code != self.room_code {
            return Err(RecoveryError::SessionMismatch);
        }
        let away = counted_until.saturating_sub(player.last_activity);
        if player.connection_state != ConnectionState::Connected && away > timeout {
            player.connection_state = ConnectionState::Timeout;
            return Err(RecoveryError::SessionExpired(player_id.to_string()));
        }

        player.connection_state = ConnectionState::Connected;
        player.last_activity = now;
        let replay = pending::resolve_pending(std::mem::take(&mut player.pending_actions));
        let recovery_token = self
            .signer
            .issue(player_id, &player.session_id, &self.room_code, now, rng)?;
        player.recovery_token = recovery_token.clone();
        let grant = SessionGrant {
            session_id: player.session_id.clone(),
            recovery_token,
        };

        let snapshot = player.clone();
        self.persist_player(&snapshot);
        info!(
            "Room {}: {} reconnected after {}ms with {} queued action(s)",
            self.room_code,
            player_id,
            away,
            replay.len()
        );
        Ok(Reconnected { grant, replay })
    }

    /// Queues an action that arrived while the room could not apply it
    pub fn queue_action(&mut self, event: GameEvent) {
        if let Some(player) = self.players.get_mut(&event.player_id) {
            if !player.pending_actions.iter().any(|e| e.id == event.id) {
                player.pending_actions.push(event);
            }
        }
    }

    /// Drains and resolves queued actions for every connected player
    pub fn take_pending(&mut self) -> Vec<GameEvent> {
        let mut replay = Vec::new();
        for player in self.players.values_mut() {
            if player.connection_state == ConnectionState::Connected {
                replay.extend(pending::resolve_pending(std::mem::take(
                    &mut player.pending_actions,
                )));
            }
        }
        replay.sort_by_key(|e| (e.timestamp, e.id));
        replay
    }

    /// Stops the away clock for every disconnected player
    pub fn pause(&mut self, now: u64) {
        self.paused_since.get_or_insert(now);
    }

    /// Restarts the away clocks, shifted forward by the time spent paused
    pub fn resume(&mut self, now: u64) {
        let Some(since) = self.paused_since.take() else {
            return;
        };
        let paused_for = now.saturating_sub(since);
        for player in self.players.values_mut() {
            if player.connection_state == ConnectionState::Disconnected {
                player.last_activity = player.last_activity.saturating_add(paused_for);
            }
        }
        debug!("Room {}: resumed after {}ms paused", self.room_code, paused_for);
    }

    pub fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }

    /// Marks disconnected players whose phase timeout elapsed; returns the newly timed out
    ///
    /// Nobody times out while the room is paused.
    pub fn check_timeouts(&mut self, phase: shared::GamePhase, now: u64) -> Vec<PlayerId> {
        if self.paused_since.is_some() {
            return Vec::new();
        }
        let timeout = self.config.timeout_for(phase);
        let mut timed_out = Vec::new();
        for player in self.players.values_mut() {
            if player.connection_state == ConnectionState::Disconnected
                && now.saturating_sub(player.last_activity) > timeout
            {
                player.connection_state = ConnectionState::Timeout;
                timed_out.push(player.player_id.clone());
            }
        }
        for id in &timed_out {
            info!("Room {}: {} timed out", self.room_code, id);
        }
        timed_out
    }

    pub fn timed_out_players(&self) -> Vec<PlayerId> {
        self.players
            .values()
            .filter(|p| p.connection_state == ConnectionState::Timeout)
            .map(|p| p.player_id.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.players
            .values()
            .filter(|p| p.connection_state == ConnectionState::Connected)
            .count()
    }

    /// Share of players who dropped and may still come back
    ///
    /// Timed-out players are played by auto-actions, so they never hold a
    /// room paused.
    pub fn disconnected_fraction(&self) -> f64 {
        if self.players.is_empty() {
            return 0.0;
        }
        let away = self
            .players
            .values()
            .filter(|p| p.connection_state == ConnectionState::Disconnected)
            .count();
        away as f64 / self.players.len() as f64
    }

    /// Enough players dropped at once that play should stop rather than time them out
    pub fn is_mass_disconnect(&self) -> bool {
        self.disconnected_fraction() > self.config.mass_disconnect_threshold
    }

    pub fn snapshot_due(&self, now: u64) -> bool {
        now.saturating_sub(self.last_snapshot_at) >= self.config.snapshot_interval_ms
    }

    /// Writes a snapshot and prunes the ring buffer down to the configured size
    pub fn take_snapshot(&mut self, state: &GameState, now: u64) -> Result<GameStateSnapshot, RecoveryError> {
        let sequence = self.next_sequence;
        let players = self.players.values().cloned().collect();
        let snapshot = GameStateSnapshot::capture(sequence, now, state, players)?;

        self.store
            .save(&GameStateSnapshot::key(&self.room_code, sequence), &snapshot.encode()?)?;
        self.next_sequence += 1;
        self.last_snapshot_at = now;
        self.snapshots.push(sequence);

        while self.snapshots.len() > self.config.max_snapshots {
            let oldest = self.snapshots.remove(0);
            self.store
                .remove(&GameStateSnapshot::key(&self.room_code, oldest))?;
        }

        debug!(
            "Room {}: snapshot {} at version {}",
            self.room_code, sequence, state.version
        );
        Ok(snapshot)
    }

    /// Loads the newest snapshot that passes validation
    ///
    /// Corrupt or unreadable snapshots are skipped and deleted. Player
    /// sessions come back disconnected with a fresh activity stamp, so every
    /// player gets a full timeout window to reconnect.
    pub fn restore_latest(&mut self, now: u64) -> Result<GameState, RecoveryError> {
        let prefix = GameStateSnapshot::prefix(&self.room_code);
        let mut candidates = Vec::new();
        for key in self.store.list(&prefix)? {
            match self.store.load(&key)? {
                Some(bytes) => match GameStateSnapshot::decode(&bytes) {
                    Ok(snapshot) => candidates.push((key, snapshot)),
                    Err(e) => {
                        warn!("Room {}: unreadable snapshot {}: {}", self.room_code, key, e);
                        self.store.remove(&key)?;
                    }
                },
                None => continue,
            }
        }
        candidates.sort_by_key(|(_, s)| (s.timestamp, s.sequence));

        while let Some((key, snapshot)) = candidates.pop() {
            if let Err(e) = snapshot.validate() {
                warn!("Room {}: discarding snapshot {}: {}", self.room_code, key, e);
                self.store.remove(&key)?;
                continue;
            }

            self.next_sequence = candidates
                .iter()
                .map(|(_, s)| s.sequence)
                .chain(std::iter::once(snapshot.sequence))
                .max()
                .unwrap_or(0)
                + 1;
            self.snapshots = candidates.iter().map(|(_, s)| s.sequence).collect();
            self.snapshots.push(snapshot.sequence);
            self.snapshots.sort_unstable();
            self.last_snapshot_at = now;

            self.players = snapshot
                .players
                .into_iter()
                .map(|mut p| {
                    p.connection_state = ConnectionState::Disconnected;
                    p.last_activity = now;
                    (p.player_id.clone(), p)
                })
                .collect();

            info!(
                "Room {}: restored snapshot {} (version {})",
                self.room_code, snapshot.sequence, snapshot.version
            );
            return Ok(snapshot.game_state);
        }

        Err(RecoveryError::NoValidSnapshot(self.room_code.clone()))
    }

    fn persist_player(&self, snapshot: &PlayerStateSnapshot) {
        let result = bincode::serialize(snapshot)
            .map_err(RecoveryError::from)
            .and_then(|bytes| {
                self.store
                    .save(&player_key(&self.room_code, &snapshot.player_id), &bytes)
                    .map_err(RecoveryError::from)
            });
        if let Err(e) = result {
            warn!(
                "Room {}: failed to persist session {}: {}",
                self.room_code, snapshot.player_id, e
            );
        }
    }
}

pub fn player_key(room_code: &str, player_id: &str) -> String {
    format!("player/{}/{}", room_code, player_id)
}
