//! Connection lifecycle, reconnect backoff and latency tracking

use rand::Rng;
use std::collections::VecDeque;

/// Where the client is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

/// Exponential backoff with additive jitter
///
/// `delay = min(base * multiplier^attempt, max) + jitter`, where jitter is
/// uniform in `[0, jitter_ms]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    multiplier: f64,
    max_ms: u64,
    jitter_ms: u64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, multiplier: f64, max_ms: u64, jitter_ms: u64) -> Self {
        Self {
            base_ms,
            multiplier,
            max_ms,
            jitter_ms,
            attempt: 0,
        }
    }

    /// Delay for `attempt` before jitter is added
    pub fn base_delay(&self, attempt: u32) -> u64 {
        let scaled = self.base_ms as f64 * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        if !scaled.is_finite() || scaled >= self.max_ms as f64 {
            self.max_ms
        } else {
            scaled as u64
        }
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> u64 {
        let delay = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = if self.jitter_ms > 0 {
            rng.gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        delay + jitter
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Critical,
}

impl ConnectionQuality {
    pub fn from_latency(latency_ms: u64) -> Self {
        match latency_ms {
            0..=99 => ConnectionQuality::Excellent,
            100..=299 => ConnectionQuality::Good,
            300..=999 => ConnectionQuality::Poor,
            _ => ConnectionQuality::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Critical => "critical",
        }
    }
}

/// Rolling window of round-trip samples
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, latency_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn last(&self) -> Option<u64> {
        self.samples.back().copied()
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64)
    }

    /// Quality of the averaged latency
    pub fn quality(&self) -> Option<ConnectionQuality> {
        self.average()
            .map(|avg| ConnectionQuality::from_latency(avg.round() as u64))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
