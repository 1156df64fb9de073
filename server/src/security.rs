//! Validation gate applied to every inbound action before it reaches a room
//!
//! The gate checks required fields, enforces per-player and per-room rate
//! limits and runs a few cheap anomaly heuristics. It is advisory: it keeps a
//! violation log and blocks abusive players, but the room still re-validates
//! every action against the game rules.
//!
//! The gate lives for the whole server process and keeps all counters in
//! memory. Several server instances behind one address would each enforce
//! their own limits.

use crate::config::SecurityConfig;
use log::{debug, warn};
use shared::{GameEvent, Intent, PlayerId};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    MissingField,
    RateLimited,
    RapidTiming,
    RepeatedAction,
    Replay,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityViolation {
    pub player_id: PlayerId,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub detail: String,
    pub at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    /// Let the action through but record what looked odd
    Warn(Vec<SecurityViolation>),
    Reject(SecurityViolation),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, GateDecision::Reject(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: u64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: u64,
    count: u32,
}

/// Fixed-window request counter keyed by an arbitrary identifier
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window_ms: u64,
    windows: HashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            windows: HashMap::new(),
        }
    }

    /// Counts one request against `key`
    ///
    /// Exactly `limit` requests succeed per window; the window restarts on the
    /// first request after it has fully elapsed.
    pub fn check(&mut self, key: &str, now: u64) -> RateLimitResult {
        let window_ms = self.window_ms;
        let window = self
            .windows
            .entry(key.to_string())
            .or_insert(Window {
                started_at: now,
                count: 0,
            });

        if now.saturating_sub(window.started_at) >= window_ms {
            window.started_at = now;
            window.count = 0;
        }

        let reset_at = window.started_at + window_ms;
        if window.count >= self.limit {
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_at,
            };
        }

        window.count += 1;
        RateLimitResult {
            allowed: true,
            remaining: self.limit - window.count,
            reset_at,
        }
    }

    /// Drops windows that have expired
    pub fn prune(&mut self, now: u64) {
        let window_ms = self.window_ms;
        self.windows
            .retain(|_, w| now.saturating_sub(w.started_at) < window_ms);
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

#[derive(Debug, Default)]
struct ActionHistory {
    last_at: Option<u64>,
    last_intent: Option<Intent>,
    repeat_started_at: u64,
    repeats: u32,
    recent: VecDeque<(u64, u64, Intent)>,
}

const RECENT_ACTIONS: usize = 32;

pub struct SecurityGate {
    config: SecurityConfig,
    player_limiter: RateLimiter,
    room_limiter: RateLimiter,
    history: HashMap<PlayerId, ActionHistory>,
    strikes: HashMap<PlayerId, u32>,
    blocked: HashSet<PlayerId>,
    violations: VecDeque<SecurityViolation>,
}

impl SecurityGate {
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            player_limiter: RateLimiter::new(config.player_limit, config.rate_window_ms),
            room_limiter: RateLimiter::new(config.room_limit, config.rate_window_ms),
            config,
            history: HashMap::new(),
            strikes: HashMap::new(),
            blocked: HashSet::new(),
            violations: VecDeque::new(),
        }
    }

    /// Decides whether an inbound action may reach its room
    pub fn inspect(&mut self, event: &GameEvent, now: u64) -> GateDecision {
        if event.player_id.trim().is_empty() || event.room_code.trim().is_empty() {
            let field = if event.player_id.trim().is_empty() {
                "playerId"
            } else {
                "roomCode"
            };
            let violation = self.record(
                &event.player_id,
                ViolationKind::MissingField,
                Severity::Critical,
                format!("missing required field {}", field),
                now,
            );
            return GateDecision::Reject(violation);
        }

        if self.blocked.contains(&event.player_id) {
            let violation = SecurityViolation {
                player_id: event.player_id.clone(),
                kind: ViolationKind::Blocked,
                severity: Severity::Critical,
                detail: "player is blocked".to_string(),
                at: now,
            };
            return GateDecision::Reject(violation);
        }

        let player_quota = self
            .player_limiter
            .check(&format!("player:{}", event.player_id), now);
        if !player_quota.allowed {
            return self.reject_rate_limited(event, "player", player_quota, now);
        }
        let room_quota = self
            .room_limiter
            .check(&format!("room:{}", event.room_code), now);
        if !room_quota.allowed {
            return self.reject_rate_limited(event, "room", room_quota, now);
        }

        let mut flagged = Vec::new();
        for (kind, severity, detail) in self.detect_anomalies(event, now) {
            let violation = self.record(&event.player_id, kind, severity, detail, now);
            if severity == Severity::Critical {
                return GateDecision::Reject(violation);
            }
            if severity >= Severity::High && self.strike(&event.player_id) {
                return GateDecision::Reject(violation);
            }
            flagged.push(violation);
        }

        if flagged.is_empty() {
            GateDecision::Allow
        } else {
            GateDecision::Warn(flagged)
        }
    }

    fn reject_rate_limited(
        &mut self,
        event: &GameEvent,
        scope: &str,
        quota: RateLimitResult,
        now: u64,
    ) -> GateDecision {
        let violation = self.record(
            &event.player_id,
            ViolationKind::RateLimited,
            Severity::High,
            format!("{} rate limit exceeded, resets at {}", scope, quota.reset_at),
            now,
        );
        self.strike(&event.player_id);
        GateDecision::Reject(violation)
    }

    fn detect_anomalies(&mut self, event: &GameEvent, now: u64) -> Vec<(ViolationKind, Severity, String)> {
        let config = &self.config;
        let history = self.history.entry(event.player_id.clone()).or_default();
        let mut found = Vec::new();

        // A resend of an event we have already seen is expected traffic
        if history.recent.iter().any(|(id, _, _)| *id == event.id) {
            return found;
        }

        if history
            .recent
            .iter()
            .any(|(_, ts, intent)| *ts == event.timestamp && *intent == event.intent)
        {
            found.push((
                ViolationKind::Replay,
                Severity::High,
                format!("replayed {} payload under new id {}", event.intent.name(), event.id),
            ));
        }

        if let Some(last_at) = history.last_at {
            let gap = now.saturating_sub(last_at);
            if gap < config.min_interval_ms {
                found.push((
                    ViolationKind::RapidTiming,
                    Severity::Low,
                    format!("{}ms between actions", gap),
                ));
            }
        }

        let same_as_last = history.last_intent.as_ref() == Some(&event.intent);
        if same_as_last && now.saturating_sub(history.repeat_started_at) <= config.repeat_window_ms {
            history.repeats += 1;
            if history.repeats > config.max_repeats {
                found.push((
                    ViolationKind::RepeatedAction,
                    Severity::Medium,
                    format!("{} repeated {} times", event.intent.name(), history.repeats),
                ));
            }
        } else {
            history.repeat_started_at = now;
            history.repeats = 1;
        }

        history.last_at = Some(now);
        history.last_intent = Some(event.intent.clone());
        history.recent.push_back((event.id, event.timestamp, event.intent.clone()));
        while history.recent.len() > RECENT_ACTIONS {
            history.recent.pop_front();
        }

        found
    }

    /// Counts a high-severity strike; true once the player crosses the block threshold
    fn strike(&mut self, player_id: &str) -> bool {
        let strikes = self.strikes.entry(player_id.to_string()).or_insert(0);
        *strikes += 1;
        if *strikes >= self.config.block_threshold {
            warn!("Blocking player {} after {} strikes", player_id, strikes);
            self.blocked.insert(player_id.to_string());
            true
        } else {
            false
        }
    }

    fn record(
        &mut self,
        player_id: &str,
        kind: ViolationKind,
        severity: Severity,
        detail: String,
        at: u64,
    ) -> SecurityViolation {
        let violation = SecurityViolation {
            player_id: player_id.to_string(),
            kind,
            severity,
            detail,
            at,
        };
        warn!(
            "Security violation ({:?}, {:?}) from {:?}: {}",
            kind, severity, player_id, violation.detail
        );
        self.violations.push_back(violation.clone());
        while self.violations.len() > self.config.max_violations {
            self.violations.pop_front();
        }
        violation
    }

    pub fn is_blocked(&self, player_id: &str) -> bool {
        self.blocked.contains(player_id)
    }

    pub fn violations(&self) -> impl Iterator<Item = &SecurityViolation> {
        self.violations.iter()
    }

    /// Players with action history still held
    pub fn tracked_players(&self) -> usize {
        self.history.len()
    }

    /// Forgets per-player history and strikes once a connection is gone
    ///
    /// Blocks are kept; a blocked player stays blocked across reconnects.
    pub fn forget(&mut self, player_id: &str) {
        self.history.remove(player_id);
        self.strikes.remove(player_id);
    }

    /// Drops expired rate windows and the history of idle players
    pub fn prune(&mut self, now: u64) {
        self.player_limiter.prune(now);
        self.room_limiter.prune(now);

        let ttl = self.config.history_ttl_ms;
        let before = self.history.len();
        self.history
            .retain(|_, h| h.last_at.map_or(false, |at| now.saturating_sub(at) <= ttl));
        let history = &self.history;
        self.strikes.retain(|player, _| history.contains_key(player));
        if self.history.len() < before {
            debug!("Pruned {} idle action histories", before - self.history.len());
        }
    }
}
