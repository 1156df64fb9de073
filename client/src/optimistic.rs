//! Optimistic updates and conflict resolution
//!
//! The layer keeps two states: the last confirmed authoritative state and the
//! working state the player sees. The working state is always the confirmed
//! state with the player's own pending updates replayed on top, so nothing
//! another player has not yet committed can ever show up locally.

use log::{debug, info, warn};
use shared::engine::speculate;
use shared::{GameError, GameState, Intent};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const MAX_CONFLICTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Pending,
    Confirmed,
    Rejected,
    TimedOut,
}

/// How a pending update is reconciled with a newer authoritative state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictStrategy {
    /// Show the server state; the pending effect waits for confirmation
    #[default]
    ServerWins,
    /// Keep showing the pending effect wherever it still applies
    ClientWins,
    /// Keep pending effects that still validate, drop the rest
    Merge,
    /// Keep the pending effect only if it is newer than the server state
    Timestamp,
    /// Drop the pending update
    Discard,
}

impl ConflictStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Timestamp => "timestamp",
            ConflictStrategy::Discard => "discard",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "server_wins" | "server" => Ok(ConflictStrategy::ServerWins),
            "client_wins" | "client" => Ok(ConflictStrategy::ClientWins),
            "merge" => Ok(ConflictStrategy::Merge),
            "timestamp" => Ok(ConflictStrategy::Timestamp),
            "discard" => Ok(ConflictStrategy::Discard),
            other => Err(format!("unknown conflict strategy '{}'", other)),
        }
    }
}

/// A locally applied action awaiting the server's verdict
#[derive(Debug, Clone)]
pub struct OptimisticUpdate {
    pub event_id: u64,
    pub intent: Intent,
    /// Confirmed version the update was created against
    pub base_version: u64,
    /// Working state just before this update's effect
    pub original_state: GameState,
    /// Working state just after it
    pub local_state: GameState,
    pub created_at: u64,
    pub status: UpdateStatus,
    expires_at: u64,
    conflict_id: Option<u64>,
    decision: Option<ConflictStrategy>,
}

#[derive(Debug, Clone)]
pub struct SyncConflict {
    pub id: u64,
    pub event_id: u64,
    pub intent: Intent,
    pub local_version: u64,
    pub server_version: u64,
    pub local_state: GameState,
    pub server_state: GameState,
    pub detected_at: u64,
    pub resolved_at: Option<u64>,
    pub resolution: Option<ConflictStrategy>,
}

impl SyncConflict {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Something the player should be told about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Rejected {
        event_id: u64,
        action: &'static str,
        reason: String,
    },
    TimedOut {
        event_id: u64,
        action: &'static str,
    },
    Conflict {
        conflict_id: u64,
        action: &'static str,
    },
    Reconnecting {
        attempt: u32,
    },
    Reconnected,
    Disconnected {
        reason: String,
    },
    Restored,
    Paused,
    Resumed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no conflict with id {0}")]
    UnknownConflict(u64),

    #[error("conflict {0} is already resolved")]
    AlreadyResolved(u64),
}

pub struct OptimisticLayer {
    player_id: String,
    confirmed: Option<GameState>,
    confirmed_at: u64,
    working: Option<GameState>,
    pending: Vec<OptimisticUpdate>,
    conflicts: VecDeque<SyncConflict>,
    next_conflict_id: u64,
    notices: Vec<Notice>,
    strategy: ConflictStrategy,
    auto_resolve: bool,
    timeout_ms: u64,
}

impl OptimisticLayer {
    pub fn new(player_id: impl Into<String>, strategy: ConflictStrategy, auto_resolve: bool, timeout_ms: u64) -> Self {
        Self {
            player_id: player_id.into(),
            confirmed: None,
            confirmed_at: 0,
            working: None,
            pending: Vec::new(),
            conflicts: VecDeque::new(),
            next_conflict_id: 1,
            notices: Vec::new(),
            strategy,
            auto_resolve,
            timeout_ms,
        }
    }

    /// The state to display
    pub fn working(&self) -> Option<&GameState> {
        self.working.as_ref()
    }

    pub fn confirmed(&self) -> Option<&GameState> {
        self.confirmed.as_ref()
    }

    pub fn confirmed_version(&self) -> u64 {
        self.confirmed.as_ref().map(|s| s.version).unwrap_or(0)
    }

    pub fn pending(&self) -> &[OptimisticUpdate] {
        &self.pending
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &SyncConflict> {
        self.conflicts.iter()
    }

    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &SyncConflict> {
        self.conflicts.iter().filter(|c| !c.is_resolved())
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    pub fn notify(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Validates an intent locally and returns the working state it would produce
    ///
    /// Intents that cannot be speculated leave the working state unchanged.
    pub fn preview(&self, intent: &Intent) -> Result<Option<GameState>, GameError> {
        let Some(working) = &self.working else {
            return Ok(None);
        };
        if intent.is_speculative() {
            speculate(working, &self.player_id, intent).map(Some)
        } else {
            Ok(Some(working.clone()))
        }
    }

    /// Records a sent event and shows its effect immediately
    pub fn apply_local(&mut self, event_id: u64, intent: Intent, local_state: GameState, now: u64) {
        let Some(original_state) = self.working.take() else {
            return;
        };
        self.working = Some(local_state.clone());
        debug!("Applied {} locally as event {}", intent.name(), event_id);
        self.pending.push(OptimisticUpdate {
            event_id,
            intent,
            base_version: self.confirmed_version(),
            original_state,
            local_state,
            created_at: now,
            status: UpdateStatus::Pending,
            expires_at: now + self.timeout_ms,
            conflict_id: None,
            decision: None,
        });
    }

    /// The server accepted the event; its effect arrives with the next broadcast
    pub fn confirm(&mut self, event_id: u64) -> Option<OptimisticUpdate> {
        let index = self.pending.iter().position(|u| u.event_id == event_id)?;
        let mut update = self.pending.remove(index);
        update.status = UpdateStatus::Confirmed;
        Some(update)
    }

    pub fn reject(&mut self, event_id: u64, reason: &str) -> Option<OptimisticUpdate> {
        let mut update = self.rollback(event_id)?;
        warn!("{} was rejected: {}", update.intent.name(), reason);
        update.status = UpdateStatus::Rejected;
        self.notices.push(Notice::Rejected {
            event_id,
            action: update.intent.name(),
            reason: reason.to_string(),
        });
        Some(update)
    }

    /// Rolls back every update older than the timeout; returns their event ids
    pub fn expire(&mut self, now: u64) -> Vec<u64> {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|u| now >= u.expires_at)
            .map(|u| u.event_id)
            .collect();

        for event_id in &expired {
            if let Some(update) = self.rollback(*event_id) {
                warn!("{} was not confirmed in time; rolled back", update.intent.name());
                self.notices.push(Notice::TimedOut {
                    event_id: *event_id,
                    action: update.intent.name(),
                });
            }
        }
        expired
    }

    /// Gives every pending update a fresh lifetime, e.g. after a reconnect
    pub fn restart_timers(&mut self, now: u64) {
        for update in &mut self.pending {
            update.expires_at = now + self.timeout_ms;
        }
    }

    /// Removes a pending update and undoes its effect
    ///
    /// When the update is the newest pending one, the working state becomes its
    /// recorded original state exactly. Otherwise the remaining updates are
    /// replayed on the confirmed state.
    pub fn rollback(&mut self, event_id: u64) -> Option<OptimisticUpdate> {
        let index = self.pending.iter().position(|u| u.event_id == event_id)?;
        let update = self.pending.remove(index);
        if index == self.pending.len() {
            self.working = Some(update.original_state.clone());
        } else {
            self.replay(false, 0);
        }
        Some(update)
    }

    /// Adopts a newer authoritative state; returns the event ids dropped locally
    pub fn on_authoritative(&mut self, state: GameState, timestamp: u64, now: u64) -> Vec<u64> {
        if state.version <= self.confirmed_version() && self.confirmed.is_some() {
            return Vec::new();
        }
        self.reset(state, timestamp, now)
    }

    /// Adopts an authoritative state even if its version is not newer
    ///
    /// Used for the full sync after a reconnect, where the room may have been
    /// rebuilt from an older snapshot.
    pub fn reset(&mut self, state: GameState, timestamp: u64, now: u64) -> Vec<u64> {
        self.confirmed = Some(state);
        self.confirmed_at = timestamp;
        self.replay(true, now)
    }

    /// Resolves a conflict left for the player
    pub fn resolve_conflict(&mut self, conflict_id: u64, strategy: ConflictStrategy, now: u64) -> Result<Vec<u64>, ResolveError> {
        let conflict = self
            .conflicts
            .iter_mut()
            .find(|c| c.id == conflict_id)
            .ok_or(ResolveError::UnknownConflict(conflict_id))?;
        if conflict.is_resolved() {
            return Err(ResolveError::AlreadyResolved(conflict_id));
        }
        conflict.resolved_at = Some(now);
        conflict.resolution = Some(strategy);
        info!("Conflict {} resolved with {}", conflict_id, strategy);

        if let Some(update) = self.pending.iter_mut().find(|u| u.conflict_id == Some(conflict_id)) {
            update.decision = Some(strategy);
        }
        Ok(self.replay(false, now))
    }

    /// Rebuilds the working state from the confirmed state and the pending updates
    fn replay(&mut self, detect: bool, now: u64) -> Vec<u64> {
        let Some(confirmed) = self.confirmed.clone() else {
            return Vec::new();
        };
        let mut current = confirmed.clone();
        let mut dropped = Vec::new();
        let mut kept = Vec::with_capacity(self.pending.len());

        for mut update in std::mem::take(&mut self.pending) {
            let replayed = if update.intent.is_speculative() {
                speculate(&current, &self.player_id, &update.intent)
            } else {
                Ok(current.clone())
            };
            let clean = matches!(&replayed, Ok(next) if *next == current) || update.base_version >= confirmed.version;
            if clean && replayed.is_ok() {
                update.original_state = current.clone();
                update.local_state = replayed.unwrap_or_else(|_| current.clone());
                current = update.local_state.clone();
                kept.push(update);
                continue;
            }

            if detect && update.conflict_id.is_none() {
                let id = self.record_conflict(&update, &confirmed, now);
                update.conflict_id = Some(id);
                if self.auto_resolve {
                    update.decision = Some(self.strategy);
                    self.mark_resolved(id, self.strategy, now);
                } else {
                    self.notices.push(Notice::Conflict {
                        conflict_id: id,
                        action: update.intent.name(),
                    });
                }
            }

            let keep_effect = match update.decision {
                None | Some(ConflictStrategy::ServerWins) => false,
                Some(ConflictStrategy::ClientWins) => replayed.is_ok(),
                Some(ConflictStrategy::Timestamp) => replayed.is_ok() && update.created_at > self.confirmed_at,
                Some(ConflictStrategy::Merge) => match &replayed {
                    Ok(_) => true,
                    Err(err) => {
                        self.drop_update(update, &err.to_string(), &mut dropped);
                        continue;
                    }
                },
                Some(ConflictStrategy::Discard) => {
                    self.drop_update(update, "discarded after a conflict", &mut dropped);
                    continue;
                }
            };

            update.original_state = current.clone();
            if keep_effect {
                if let Ok(next) = replayed {
                    current = next;
                }
            }
            update.local_state = current.clone();
            kept.push(update);
        }

        self.pending = kept;
        self.working = Some(current);
        dropped
    }

    fn drop_update(&mut self, mut update: OptimisticUpdate, reason: &str, dropped: &mut Vec<u64>) {
        update.status = UpdateStatus::Rejected;
        dropped.push(update.event_id);
        self.notices.push(Notice::Rejected {
            event_id: update.event_id,
            action: update.intent.name(),
            reason: reason.to_string(),
        });
    }

    fn record_conflict(&mut self, update: &OptimisticUpdate, server_state: &GameState, now: u64) -> u64 {
        let id = self.next_conflict_id;
        self.next_conflict_id += 1;
        debug!(
            "Conflict {}: {} based on v{} vs server v{}",
            id,
            update.intent.name(),
            update.base_version,
            server_state.version
        );
        if self.conflicts.len() == MAX_CONFLICTS {
            self.conflicts.pop_front();
        }
        self.conflicts.push_back(SyncConflict {
            id,
            event_id: update.event_id,
            intent: update.intent.clone(),
            local_version: update.base_version,
            server_version: server_state.version,
            local_state: update.local_state.clone(),
            server_state: server_state.clone(),
            detected_at: now,
            resolved_at: None,
            resolution: None,
        });
        id
    }

    fn mark_resolved(&mut self, id: u64, strategy: ConflictStrategy, now: u64) {
        if let Some(conflict) = self.conflicts.iter_mut().find(|c| c.id == id) {
            conflict.resolved_at = Some(now);
            conflict.resolution = Some(strategy);
        }
    }
}
