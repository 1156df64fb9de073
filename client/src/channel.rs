//! Client end of the synchronization channel
//!
//! [`SyncChannel`] is a synchronous state machine: callers feed it the current
//! time and incoming packets, and it returns the packets to send. It gives
//! at-least-once delivery for the player's own events. Events created while
//! offline wait in a FIFO queue, sent events are retried until acknowledged,
//! and everything still unacknowledged when the link drops goes back to the
//! front of the queue in its original order.

use crate::config::ClientConfig;
use crate::connection::{Backoff, ConnectionStatus, LatencyTracker};
use log::{debug, info, warn};
use rand::Rng;
use shared::{GameEvent, Intent, Packet, PROTOCOL_VERSION};
use std::collections::VecDeque;

/// Credentials from the last successful connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub recovery_token: String,
}

#[derive(Debug, Clone)]
struct InFlight {
    event: GameEvent,
    sent_at: u64,
    attempts: u32,
}

pub struct SyncChannel {
    player_id: String,
    room_code: String,
    player_name: String,
    status: ConnectionStatus,
    session: Option<Session>,
    next_event_id: u64,
    offline_queue: VecDeque<GameEvent>,
    in_flight: Vec<InFlight>,
    backoff: Backoff,
    latency: LatencyTracker,
    next_reconnect_at: Option<u64>,
    last_heartbeat_at: u64,
    last_server_contact: u64,
    resend_interval_ms: u64,
    heartbeat_interval_ms: u64,
    server_timeout_ms: u64,
    max_reconnect_attempts: Option<u32>,
}

impl SyncChannel {
    pub fn new(config: &ClientConfig, now: u64) -> Self {
        Self {
            player_id: config.player_id.clone(),
            room_code: config.room_code.clone(),
            player_name: config.player_name.clone(),
            status: ConnectionStatus::Disconnected,
            session: None,
            // Ids keep increasing across client restarts, so the server's
            // duplicate window never mistakes a new event for an old one
            next_event_id: now.saturating_mul(1_000).max(1),
            offline_queue: VecDeque::new(),
            in_flight: Vec::new(),
            backoff: Backoff::new(
                config.backoff_base_ms,
                config.backoff_multiplier,
                config.backoff_max_ms,
                config.backoff_jitter_ms,
            ),
            latency: LatencyTracker::new(20),
            next_reconnect_at: None,
            last_heartbeat_at: now,
            last_server_contact: now,
            resend_interval_ms: config.resend_interval_ms,
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            server_timeout_ms: config.server_timeout_ms,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    /// Events waiting for a connection, oldest first
    pub fn queued(&self) -> impl Iterator<Item = &GameEvent> {
        self.offline_queue.iter()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn connect_packet(&self) -> Packet {
        Packet::Connect {
            client_version: PROTOCOL_VERSION,
            room_code: self.room_code.clone(),
            player_id: self.player_id.clone(),
            player_name: self.player_name.clone(),
            recovery_token: self.session.as_ref().map(|s| s.recovery_token.clone()),
        }
    }

    /// Starts the first connection attempt
    pub fn begin_connect(&mut self, now: u64) -> Packet {
        self.status = ConnectionStatus::Connecting;
        self.last_server_contact = now;
        self.connect_packet()
    }

    /// Handles `Connected`; returns the queued events to flush, in order
    pub fn on_connected(&mut self, session_id: String, recovery_token: String, now: u64) -> Vec<Packet> {
        info!("Connected to room {} as {}", self.room_code, self.player_id);
        self.status = ConnectionStatus::Connected;
        self.session = Some(Session {
            session_id,
            recovery_token,
        });
        self.backoff.reset();
        self.next_reconnect_at = None;
        self.last_server_contact = now;
        self.last_heartbeat_at = now;

        let mut packets = Vec::with_capacity(self.offline_queue.len());
        while let Some(event) = self.offline_queue.pop_front() {
            packets.push(Packet::Action(event.clone()));
            self.in_flight.push(InFlight {
                event,
                sent_at: now,
                attempts: 1,
            });
        }
        if !packets.is_empty() {
            info!("Flushing {} queued event(s)", packets.len());
        }
        packets
    }

    /// Wraps an intent in an event; returns the packet when it can go out now
    pub fn submit(&mut self, intent: Intent, version: u64, now: u64) -> (GameEvent, Option<Packet>) {
        let event = GameEvent {
            id: self.next_event_id,
            player_id: self.player_id.clone(),
            room_code: self.room_code.clone(),
            timestamp: now,
            version,
            intent,
        };
        self.next_event_id += 1;

        if self.status.is_connected() {
            self.in_flight.push(InFlight {
                event: event.clone(),
                sent_at: now,
                attempts: 1,
            });
            let packet = Packet::Action(event.clone());
            (event, Some(packet))
        } else {
            debug!("Offline; queueing {}", event.intent.name());
            self.offline_queue.push_back(event.clone());
            (event, None)
        }
    }

    /// Stops tracking an answered event and records its round trip
    fn settle(&mut self, event_id: u64, now: u64) -> Option<(InFlight, u64)> {
        self.last_server_contact = now;
        let index = self.in_flight.iter().position(|f| f.event.id == event_id)?;
        let flight = self.in_flight.remove(index);
        let latency = now.saturating_sub(flight.sent_at);
        self.latency.record(latency);
        Some((flight, latency))
    }

    /// Returns the round trip of the acknowledged event
    pub fn on_ack(&mut self, event_id: u64, now: u64) -> Option<u64> {
        self.settle(event_id, now).map(|(_, latency)| latency)
    }

    /// Returns the name of the rejected event's intent
    pub fn on_reject(&mut self, event_id: u64, now: u64) -> Option<&'static str> {
        self.settle(event_id, now).map(|(flight, _)| flight.event.intent.name())
    }

    /// Drops an event the caller gave up on, wherever it is waiting
    pub fn abandon(&mut self, event_id: u64) {
        self.in_flight.retain(|f| f.event.id != event_id);
        self.offline_queue.retain(|e| e.id != event_id);
    }

    pub fn on_heartbeat_ack(&mut self, sent_timestamp: u64, now: u64) {
        self.last_server_contact = now;
        self.latency.record(now.saturating_sub(sent_timestamp));
    }

    /// Any packet from the server proves the link is alive
    pub fn on_server_contact(&mut self, now: u64) {
        self.last_server_contact = now;
    }

    /// Un-acked events whose resend interval elapsed
    pub fn due_resends(&mut self, now: u64) -> Vec<Packet> {
        if !self.status.is_connected() {
            return Vec::new();
        }
        let interval = self.resend_interval_ms;
        self.in_flight
            .iter_mut()
            .filter(|f| now.saturating_sub(f.sent_at) >= interval)
            .map(|f| {
                f.sent_at = now;
                f.attempts += 1;
                debug!("Resending event {} (attempt {})", f.event.id, f.attempts);
                Packet::Action(f.event.clone())
            })
            .collect()
    }

    pub fn heartbeat_due(&mut self, now: u64) -> Option<Packet> {
        if !self.status.is_connected() || now.saturating_sub(self.last_heartbeat_at) < self.heartbeat_interval_ms {
            return None;
        }
        self.last_heartbeat_at = now;
        Some(Packet::Heartbeat { timestamp: now })
    }

    /// True when a live link has been silent past the server timeout
    pub fn is_server_silent(&self, now: u64) -> bool {
        matches!(self.status, ConnectionStatus::Connected | ConnectionStatus::Connecting)
            && now.saturating_sub(self.last_server_contact) > self.server_timeout_ms
    }

    /// Moves to reconnecting and schedules the first attempt
    pub fn on_connection_lost<R: Rng + ?Sized>(&mut self, now: u64, rng: &mut R) {
        if matches!(self.status, ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting { .. }) {
            return;
        }
        warn!("Connection to server lost");

        // Unanswered events go back ahead of anything queued since
        let mut returning: Vec<GameEvent> = self.in_flight.drain(..).map(|f| f.event).collect();
        returning.sort_by_key(|e| e.id);
        for event in returning.into_iter().rev() {
            self.offline_queue.push_front(event);
        }

        self.schedule_reconnect(now, rng);
    }

    fn schedule_reconnect<R: Rng + ?Sized>(&mut self, now: u64, rng: &mut R) {
        let attempt = self.backoff.attempt();
        if let Some(max) = self.max_reconnect_attempts {
            if attempt >= max {
                warn!("Giving up after {} reconnect attempts", attempt);
                self.cancel();
                return;
            }
        }
        let delay = self.backoff.next_delay(rng);
        info!("Reconnecting in {}ms (attempt {})", delay, attempt + 1);
        self.status = ConnectionStatus::Reconnecting {
            attempt: attempt + 1,
        };
        self.next_reconnect_at = Some(now + delay);
    }

    /// Connect packet for a reconnect attempt that has come due
    ///
    /// Schedules the following attempt as well, so an attempt that gets no
    /// answer is retried with a longer delay.
    pub fn reconnect_due<R: Rng + ?Sized>(&mut self, now: u64, rng: &mut R) -> Option<Packet> {
        let due_at = self.next_reconnect_at?;
        if now < due_at {
            return None;
        }
        let packet = self.connect_packet();
        self.schedule_reconnect(now, rng);
        Some(packet)
    }

    /// Handles `Disconnected`; returns true when the client should keep trying
    pub fn on_disconnected<R: Rng + ?Sized>(&mut self, reason: &str, now: u64, rng: &mut R) -> bool {
        warn!("Server closed the connection: {}", reason);
        // The server forgot this address; a reconnect with the token restores the seat
        if reason == "not connected" && self.session.is_some() {
            self.status = ConnectionStatus::Connected;
            self.on_connection_lost(now, rng);
            return self.next_reconnect_at.is_some();
        }
        self.cancel();
        false
    }

    /// Abandons any reconnect in progress
    pub fn cancel(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.next_reconnect_at = None;
    }

    pub fn disconnect_packet(&mut self) -> Option<Packet> {
        let was_connected = self.status.is_connected();
        self.cancel();
        was_connected.then_some(Packet::Disconnect)
    }
}
