//! Server network layer: UDP transport, connection routing and room registry
//!
//! The main loop owns the room registry and the security gate. It never
//! touches game state itself; every packet that concerns a room becomes a
//! [`RoomCommand`] on that room's channel, and rooms hand their replies back
//! through the shared outgoing queue.

use crate::client_manager::{ClientManager, Connection};
use crate::config::ServerConfig;
use crate::recovery::persistence::{is_key_segment, FileAdapter, MemoryAdapter, PersistenceAdapter};
use crate::recovery::RecoveryManager;
use crate::room::{Room, RoomCommand};
use crate::security::{GateDecision, SecurityGate};
use bincode::serialize;
use log::{debug, error, info, warn};
use shared::clock::{Clock, SystemClock};
use shared::{GameEvent, Packet, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

/// Messages sent from network tasks and rooms to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { connection: Connection },
    RoomClosed { room_code: String, unrecoverable: bool },
    Shutdown,
}

/// Messages sent to the outgoing network task
#[derive(Debug)]
pub enum GameMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
}

/// Main server coordinating networking and the room actors
pub struct Server {
    socket: Arc<UdpSocket>,
    config: ServerConfig,
    clients: Arc<RwLock<ClientManager>>,
    rooms: HashMap<String, mpsc::UnboundedSender<RoomCommand>>,
    /// Rooms whose snapshots were all invalid; they stay closed until restart
    unrecoverable: HashSet<String>,
    gate: SecurityGate,
    store: Arc<dyn PersistenceAdapter>,
    clock: Arc<dyn Clock>,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let store: Arc<dyn PersistenceAdapter> = match &config.data_dir {
            Some(dir) => {
                info!("Persisting snapshots under {}", dir.display());
                Arc::new(FileAdapter::new(dir.clone())?)
            }
            None => Arc::new(MemoryAdapter::new()),
        };
        Self::with_store(config, store, Arc::new(SystemClock)).await
    }

    pub async fn with_store(
        config: ServerConfig,
        store: Arc<dyn PersistenceAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
            rooms: HashMap::new(),
            unrecoverable: HashSet::new(),
            gate: SecurityGate::new(config.security.clone()),
            store,
            clock,
            config,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle for asking the main loop to stop
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match Packet::decode(&buffer[..len]) {
                        Ok(packet) => {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to deserialize packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors silent connections
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();
        let clock = Arc::clone(&self.clock);
        let timeout_ms = self.config.connection_timeout_ms;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts(clock.now_ms(), timeout_ms)
                };

                for connection in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { connection }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn send_to_room(&mut self, room_code: &str, command: RoomCommand) {
        let delivered = match self.rooms.get(room_code) {
            Some(room) => room.send(command).is_ok(),
            None => false,
        };
        if !delivered {
            debug!("Room {} is gone; dropping command", room_code);
            self.rooms.remove(room_code);
        }
    }

    /// Finds the room's actor, restoring or creating it on first use
    fn room_sender(&mut self, room_code: &str) -> Option<mpsc::UnboundedSender<RoomCommand>> {
        if let Some(sender) = self.rooms.get(room_code) {
            if !sender.is_closed() {
                return Some(sender.clone());
            }
            self.rooms.remove(room_code);
        }
        if self.unrecoverable.contains(room_code) {
            return None;
        }
        if self.rooms.len() >= self.config.max_rooms {
            warn!("Room limit reached; refusing to open {}", room_code);
            return None;
        }

        let now = self.clock.now_ms();
        let room = match RecoveryManager::has_snapshots(self.store.as_ref(), room_code) {
            Ok(true) => match Room::restore(room_code, &self.config, Arc::clone(&self.store), now) {
                Ok(room) => {
                    info!("Room {} restored from snapshot", room_code);
                    room
                }
                Err(e) => {
                    error!("Room {} could not be restored: {}", room_code, e);
                    self.unrecoverable.insert(room_code.to_string());
                    return None;
                }
            },
            Ok(false) => Room::new(room_code, &self.config, Arc::clone(&self.store), now),
            Err(e) => {
                error!("Snapshot lookup for {} failed: {}", room_code, e);
                Room::new(room_code, &self.config, Arc::clone(&self.store), now)
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(room.run(
            rx,
            self.game_tx.clone(),
            self.server_tx.clone(),
            Arc::clone(&self.clock),
            Duration::from_millis(self.config.tick_ms),
        ));
        self.rooms.insert(room_code.to_string(), tx.clone());
        Some(tx)
    }

    /// Routes one incoming packet
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        let now = self.clock.now_ms();
        match packet {
            Packet::Connect {
                client_version,
                room_code,
                player_id,
                player_name,
                recovery_token,
            } => {
                info!(
                    "{} connecting to room {} as {} (version: {})",
                    addr, room_code, player_id, client_version
                );
                if client_version != PROTOCOL_VERSION {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: format!(
                                "protocol version {} not supported (server speaks {})",
                                client_version, PROTOCOL_VERSION
                            ),
                        },
                        addr,
                    );
                    return;
                }
                if room_code.is_empty() || player_id.is_empty() {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "room code and player id are required".to_string(),
                        },
                        addr,
                    );
                    return;
                }
                if !is_key_segment(&room_code) || !is_key_segment(&player_id) {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "room code and player id may only use letters, digits, '-' and '_'"
                                .to_string(),
                        },
                        addr,
                    );
                    return;
                }

                // The same socket moving to another seat leaves the old one first
                let previous = {
                    let clients = self.clients.read().await;
                    clients.find_by_addr(&addr).cloned()
                };
                if let Some(old) = previous {
                    if old.room_code != room_code || old.player_id != player_id {
                        self.send_to_room(
                            &old.room_code,
                            RoomCommand::Disconnect {
                                player_id: old.player_id,
                                graceful: true,
                            },
                        );
                    }
                }

                let bound_elsewhere = {
                    let clients = self.clients.read().await;
                    clients
                        .find_by_player(&room_code, &player_id)
                        .filter(|a| *a != addr)
                };
                if bound_elsewhere.is_some() && recovery_token.is_none() {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "player id already in use".to_string(),
                        },
                        addr,
                    );
                    return;
                }

                let Some(room) = self.room_sender(&room_code) else {
                    let reason = if self.unrecoverable.contains(&room_code) {
                        "room state could not be recovered"
                    } else {
                        "Server full"
                    };
                    self.send_packet(
                        Packet::Disconnected {
                            reason: reason.to_string(),
                        },
                        addr,
                    );
                    return;
                };

                let bound = {
                    let mut clients = self.clients.write().await;
                    clients.add(addr, &player_id, &room_code, now)
                };
                match bound {
                    Ok(replaced) => {
                        if let Some(old_addr) = replaced {
                            self.send_packet(
                                Packet::Disconnected {
                                    reason: "connection replaced".to_string(),
                                },
                                old_addr,
                            );
                        }
                        if room
                            .send(RoomCommand::Connect {
                                player_id,
                                player_name,
                                addr,
                                recovery_token,
                            })
                            .is_err()
                        {
                            error!("Room {} stopped while {} was connecting", room_code, addr);
                        }
                    }
                    Err(e) => {
                        self.send_packet(Packet::Disconnected { reason: e.to_string() }, addr);
                    }
                }
            }

            Packet::Action(event) => {
                let Some(connection) = self.touch(addr, now).await else {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "not connected".to_string(),
                        },
                        addr,
                    );
                    return;
                };
                if let Some(reject) = self.screen(&connection, &event, now) {
                    self.send_packet(reject, addr);
                    return;
                }
                self.send_to_room(&connection.room_code, RoomCommand::Action { event, addr });
            }

            Packet::Heartbeat { timestamp } => {
                if let Some(connection) = self.touch(addr, now).await {
                    self.send_packet(Packet::HeartbeatAck { timestamp }, addr);
                    self.send_to_room(
                        &connection.room_code,
                        RoomCommand::Heartbeat {
                            player_id: connection.player_id,
                        },
                    );
                }
            }

            Packet::SyncRequest { known_version } => {
                if let Some(connection) = self.touch(addr, now).await {
                    debug!(
                        "{} requested sync from version {}",
                        connection.player_id, known_version
                    );
                    self.send_to_room(
                        &connection.room_code,
                        RoomCommand::Sync {
                            player_id: connection.player_id,
                            addr,
                        },
                    );
                }
            }

            Packet::Disconnect => {
                let removed = {
                    let mut clients = self.clients.write().await;
                    clients.remove(&addr)
                };
                if let Some(connection) = removed {
                    self.gate.forget(&connection.player_id);
                    self.send_to_room(
                        &connection.room_code,
                        RoomCommand::Disconnect {
                            player_id: connection.player_id,
                            graceful: true,
                        },
                    );
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn touch(&self, addr: SocketAddr, now: u64) -> Option<Connection> {
        let mut clients = self.clients.write().await;
        if clients.touch(&addr, now) {
            clients.find_by_addr(&addr).cloned()
        } else {
            None
        }
    }

    /// Checks identity and the security gate; returns the rejection to send, if any
    fn screen(&mut self, connection: &Connection, event: &GameEvent, now: u64) -> Option<Packet> {
        if event.player_id != connection.player_id || event.room_code != connection.room_code {
            warn!(
                "{} sent an event as {} in {} while bound to {} in {}",
                connection.addr,
                event.player_id,
                event.room_code,
                connection.player_id,
                connection.room_code
            );
            return Some(Packet::Reject {
                event_id: event.id,
                code: "security".to_string(),
                reason: "event does not match the connection".to_string(),
            });
        }

        match self.gate.inspect(event, now) {
            GateDecision::Allow => None,
            GateDecision::Warn(violations) => {
                debug!(
                    "Event {} from {} passed with {} warning(s)",
                    event.id,
                    event.player_id,
                    violations.len()
                );
                None
            }
            GateDecision::Reject(violation) => Some(Packet::Reject {
                event_id: event.id,
                code: "security".to_string(),
                reason: violation.detail,
            }),
        }
    }

    async fn handle_timeout(&mut self, connection: Connection) {
        info!(
            "{} in room {} went silent",
            connection.player_id, connection.room_code
        );
        self.gate.forget(&connection.player_id);
        self.send_to_room(
            &connection.room_code,
            RoomCommand::Disconnect {
                player_id: connection.player_id,
                graceful: false,
            },
        );
    }

    async fn handle_room_closed(&mut self, room_code: &str, unrecoverable: bool) {
        self.rooms.remove(room_code);
        if unrecoverable {
            self.unrecoverable.insert(room_code.to_string());
        }
        let dropped = {
            let mut clients = self.clients.write().await;
            clients.remove_room(room_code)
        };
        for connection in &dropped {
            self.gate.forget(&connection.player_id);
        }
        info!(
            "Room {} closed; released {} connection(s)",
            room_code,
            dropped.len()
        );
    }

    fn shutdown_rooms(&mut self) {
        for (code, room) in self.rooms.drain() {
            if room.send(RoomCommand::Shutdown).is_err() {
                debug!("Room {} already stopped", code);
            }
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Initialize concurrent tasks
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut housekeeping = interval(Duration::from_secs(1));

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { connection }) => {
                            self.handle_timeout(connection).await;
                        },
                        Some(ServerMessage::RoomClosed { room_code, unrecoverable }) => {
                            self.handle_room_closed(&room_code, unrecoverable).await;
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = housekeeping.tick() => {
                    self.gate.prune(self.clock.now_ms());
                    let client_count = self.clients.read().await.len();
                    if client_count > 0 {
                        debug!("{} connection(s) across {} room(s)", client_count, self.rooms.len());
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted; shutting down");
                    break;
                }
            }
        }

        self.shutdown_rooms();
        Ok(())
    }
}
