//! Runtime configuration for the authoritative server
//!
//! The binary builds these from command-line arguments; tests and embedders
//! construct them directly or start from `Default`.

use shared::GamePhase;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Room actor tick (batch flush, timeout sweep, snapshot schedule)
    pub tick_ms: u64,
    pub max_clients: usize,
    pub max_rooms: usize,
    /// Silence after which a connection is dropped
    pub connection_timeout_ms: u64,
    /// Window inside which batched-class events coalesce
    pub batch_window_ms: u64,
    /// Processed event ids remembered per player for duplicate detection
    pub processed_window: usize,
    /// Where snapshots live; `None` keeps them in memory
    pub data_dir: Option<PathBuf>,
    pub recovery: RecoveryConfig,
    pub security: SecurityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            tick_ms: 100,
            max_clients: 256,
            max_rooms: 64,
            connection_timeout_ms: 5_000,
            batch_window_ms: 250,
            processed_window: 256,
            data_dir: None,
            recovery: RecoveryConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub snapshot_interval_ms: u64,
    /// Ring buffer size per room
    pub max_snapshots: usize,
    pub lobby_timeout_ms: u64,
    pub vote_timeout_ms: u64,
    pub default_timeout_ms: u64,
    /// Disconnected fraction above which the room pauses
    pub mass_disconnect_threshold: f64,
    /// Submit pass actions for timed-out players
    pub auto_actions: bool,
    /// MAC key for recovery tokens
    pub token_secret: Vec<u8>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 30_000,
            max_snapshots: 10,
            lobby_timeout_ms: 120_000,
            vote_timeout_ms: 30_000,
            default_timeout_ms: 60_000,
            mass_disconnect_threshold: 0.5,
            auto_actions: true,
            token_secret: b"avalon-sync-development-secret".to_vec(),
        }
    }
}

impl RecoveryConfig {
    /// How long a disconnected player may stay away in a given phase
    pub fn timeout_for(&self, phase: GamePhase) -> u64 {
        match phase {
            GamePhase::Lobby | GamePhase::GameOver => self.lobby_timeout_ms,
            GamePhase::Voting | GamePhase::MissionSelect | GamePhase::MissionVote => {
                self.vote_timeout_ms
            }
            _ => self.default_timeout_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Actions allowed per player inside one rate window
    pub player_limit: u32,
    /// Actions allowed per room inside one rate window
    pub room_limit: u32,
    pub rate_window_ms: u64,
    /// Inter-action gap below which timing is flagged
    pub min_interval_ms: u64,
    pub repeat_window_ms: u64,
    /// Identical actions tolerated inside the repeat window
    pub max_repeats: u32,
    /// High-severity strikes before a player is blocked
    pub block_threshold: u32,
    pub max_violations: usize,
    /// Idle time after which a player's action history and strikes are dropped
    pub history_ttl_ms: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            player_limit: 20,
            room_limit: 200,
            rate_window_ms: 1_000,
            min_interval_ms: 50,
            repeat_window_ms: 2_000,
            max_repeats: 3,
            block_threshold: 5,
            max_violations: 500,
            history_ttl_ms: 300_000,
        }
    }
}
