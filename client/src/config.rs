//! Client runtime configuration

use crate::optimistic::ConflictStrategy;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub room_code: String,
    pub player_id: String,
    pub player_name: String,
    /// Simulated one-way latency added to every send and receive
    pub fake_ping_ms: u64,
    /// Lifetime of an unconfirmed optimistic update
    pub optimistic_timeout_ms: u64,
    /// Delay before an un-acked event is sent again
    pub resend_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Server silence after which the link counts as dropped
    pub server_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
    pub backoff_jitter_ms: u64,
    /// Give up after this many reconnect attempts; `None` retries until cancelled
    pub max_reconnect_attempts: Option<u32>,
    pub conflict_strategy: ConflictStrategy,
    /// Resolve conflicts immediately instead of asking the user
    pub auto_resolve: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:8080".to_string(),
            room_code: "LOBBY".to_string(),
            player_id: "player".to_string(),
            player_name: "Player".to_string(),
            fake_ping_ms: 0,
            optimistic_timeout_ms: 5_000,
            resend_interval_ms: 1_000,
            heartbeat_interval_ms: 1_000,
            server_timeout_ms: 5_000,
            backoff_base_ms: 500,
            backoff_multiplier: 2.0,
            backoff_max_ms: 30_000,
            backoff_jitter_ms: 250,
            max_reconnect_attempts: None,
            conflict_strategy: ConflictStrategy::default(),
            auto_resolve: true,
        }
    }
}
