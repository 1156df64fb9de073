//! Millisecond clock abstraction shared by server and client
//!
//! Every timeout in the system (optimistic expiry, player timeouts, rate-limit
//! windows, snapshot intervals, reconnect backoff) is computed from a `u64`
//! millisecond timestamp. Tokio timers only decide when those computations run,
//! so tests can drive time with [`ManualClock`] instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_millis();
        (millis.min(u64::MAX as u128)) as u64
    }
}

/// Clock that only moves when told to
///
/// Cloning shares the underlying counter, so a test can hand one clone to
/// the component under test and advance the other.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Current system timestamp in milliseconds
pub fn timestamp_ms() -> u64 {
    SystemClock.now_ms()
}
