//! Connection tracking for the game server
//!
//! This module maps network addresses to the player and room they joined:
//! - Connection lifecycle (connect, disconnect, timeout)
//! - Address lookup so incoming packets reach the right room actor
//! - Liveness monitoring from heartbeats and any other traffic
//! - Capacity limits across all rooms
//!
//! Game state never lives here. A connection only remembers where to route
//! packets; the room actor owns everything about the player's seat.

use log::info;
use shared::PlayerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("server full")]
pub struct ServerFull;

/// A bound client endpoint
///
/// Each connection records:
/// - The address packets come from and go to
/// - The player and room it was admitted into
/// - When traffic was last seen, in server milliseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Player bound to this address
    pub player_id: PlayerId,
    /// Room the player joined
    pub room_code: String,
    /// Last time we received any packet from this address
    pub last_seen: u64,
}

impl Connection {
    /// Creates a connection that was just seen at `now`
    pub fn new(addr: SocketAddr, player_id: PlayerId, room_code: String, now: u64) -> Self {
        Self {
            addr,
            player_id,
            room_code,
            last_seen: now,
        }
    }

    /// Checks if the connection has been silent for longer than `timeout_ms`
    ///
    /// Returns true if no packets have arrived from this address within the
    /// timeout, indicating a likely dropped link.
    pub fn is_timed_out(&self, now: u64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) > timeout_ms
    }
}

/// Manages every bound address across all rooms
///
/// The ClientManager enforces the global capacity limit and lets the server
/// resolve an address to its player in one lookup. A player id can only be
/// bound to one address per room; rebinding moves the player to the new
/// address, which is how a reconnect from a fresh socket takes over.
pub struct ClientManager {
    /// Connections indexed by their network address
    connections: HashMap<SocketAddr, Connection>,
    /// Maximum number of concurrent connections allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity limit
    pub fn new(max_clients: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_clients,
        }
    }

    /// Binds `addr` to a player in a room
    ///
    /// Returns the address the player was previously bound to, if any, so the
    /// caller can tell the old endpoint it has been replaced. Returns [`ServerFull`]
    /// when the server is at capacity and `addr` is not already known.
    pub fn add(
        &mut self,
        addr: SocketAddr,
        player_id: &str,
        room_code: &str,
        now: u64,
    ) -> Result<Option<SocketAddr>, ServerFull> {
        if !self.connections.contains_key(&addr) && self.connections.len() >= self.max_clients {
            return Err(ServerFull);
        }

        let previous = self.find_by_player(room_code, player_id).filter(|a| *a != addr);
        if let Some(old) = previous {
            self.connections.remove(&old);
        }

        info!("{} bound to {} in room {}", addr, player_id, room_code);
        self.connections.insert(
            addr,
            Connection::new(addr, player_id.to_string(), room_code.to_string(), now),
        );
        Ok(previous)
    }

    /// Removes a connection
    ///
    /// Returns the removed connection so the caller can notify its room.
    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Connection> {
        let removed = self.connections.remove(addr);
        if let Some(connection) = &removed {
            info!("{} ({}) disconnected", addr, connection.player_id);
        }
        removed
    }

    /// Looks up the connection for an incoming packet
    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<&Connection> {
        self.connections.get(addr)
    }

    /// Finds the address a player is currently bound to
    pub fn find_by_player(&self, room_code: &str, player_id: &str) -> Option<SocketAddr> {
        self.connections
            .values()
            .find(|c| c.room_code == room_code && c.player_id == player_id)
            .map(|c| c.addr)
    }

    /// Records traffic from `addr`; returns false for unknown addresses
    pub fn touch(&mut self, addr: &SocketAddr, now: u64) -> bool {
        match self.connections.get_mut(addr) {
            Some(connection) => {
                connection.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Removes and returns connections silent for longer than `timeout_ms`
    ///
    /// Called periodically by the timeout checker task. The returned
    /// connections are no longer tracked; the server forwards each one to its
    /// room as an involuntary disconnect.
    pub fn check_timeouts(&mut self, now: u64, timeout_ms: u64) -> Vec<Connection> {
        let expired: Vec<SocketAddr> = self
            .connections
            .values()
            .filter(|c| c.is_timed_out(now, timeout_ms))
            .map(|c| c.addr)
            .collect();

        expired
            .into_iter()
            .filter_map(|addr| {
                let connection = self.connections.remove(&addr)?;
                info!("{} ({}) timed out", addr, connection.player_id);
                Some(connection)
            })
            .collect()
    }

    /// Drops every connection bound to `room_code`
    pub fn remove_room(&mut self, room_code: &str) -> Vec<Connection> {
        let addrs: Vec<SocketAddr> = self
            .connections
            .values()
            .filter(|c| c.room_code == room_code)
            .map(|c| c.addr)
            .collect();
        addrs
            .into_iter()
            .filter_map(|addr| self.connections.remove(&addr))
            .collect()
    }

    /// Returns the current number of connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no connections are tracked
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080)
    }

    fn test_addr2() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8081)
    }

    #[test]
    fn test_connection_creation() {
        let connection = Connection::new(test_addr(), "p1".into(), "ROOM".into(), 100);
        assert_eq!(connection.addr, test_addr());
        assert_eq!(connection.player_id, "p1");
        assert_eq!(connection.last_seen, 100);
    }

    #[test]
    fn test_connection_timeout() {
        let connection = Connection::new(test_addr(), "p1".into(), "ROOM".into(), 100);
        assert!(!connection.is_timed_out(600, 500));
        assert!(connection.is_timed_out(601, 500));
    }

    #[test]
    fn test_add_and_find() {
        let mut manager = ClientManager::new(4);
        assert!(manager.is_empty());
        assert_eq!(manager.add(test_addr(), "p1", "ROOM", 0), Ok(None));

        let connection = manager.find_by_addr(&test_addr()).unwrap();
        assert_eq!(connection.room_code, "ROOM");
        assert_eq!(manager.find_by_player("ROOM", "p1"), Some(test_addr()));
        assert_eq!(manager.find_by_player("OTHER", "p1"), None);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_capacity_limit() {
        let mut manager = ClientManager::new(1);
        assert!(manager.add(test_addr(), "p1", "ROOM", 0).is_ok());
        assert_eq!(manager.add(test_addr2(), "p2", "ROOM", 0), Err(ServerFull));
        // Re-binding a known address does not count against capacity
        assert!(manager.add(test_addr(), "p1", "ROOM", 10).is_ok());
    }

    #[test]
    fn test_rebind_replaces_old_address() {
        let mut manager = ClientManager::new(4);
        manager.add(test_addr(), "p1", "ROOM", 0).unwrap();
        let previous = manager.add(test_addr2(), "p1", "ROOM", 10).unwrap();
        assert_eq!(previous, Some(test_addr()));
        assert!(manager.find_by_addr(&test_addr()).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut manager = ClientManager::new(4);
        manager.add(test_addr(), "p1", "ROOM", 0).unwrap();
        assert_eq!(manager.remove(&test_addr()).map(|c| c.player_id), Some("p1".to_string()));
        assert!(manager.remove(&test_addr()).is_none());
    }

    #[test]
    fn test_touch_keeps_connection_alive() {
        let mut manager = ClientManager::new(4);
        manager.add(test_addr(), "p1", "ROOM", 0).unwrap();
        manager.add(test_addr2(), "p2", "ROOM", 0).unwrap();
        assert!(manager.touch(&test_addr(), 900));
        assert!(!manager.touch(&"10.0.0.1:1".parse().unwrap(), 900));

        let expired = manager.check_timeouts(1_200, 1_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].player_id, "p2");
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_room() {
        let mut manager = ClientManager::new(4);
        manager.add(test_addr(), "p1", "A", 0).unwrap();
        manager.add(test_addr2(), "p2", "B", 0).unwrap();
        let removed = manager.remove_room("A");
        assert_eq!(removed.len(), 1);
        assert_eq!(manager.len(), 1);
    }
}
