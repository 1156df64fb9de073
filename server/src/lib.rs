//! # Game Server Library
//!
//! This library provides the authoritative server for the real-time social
//! deduction game. It owns the canonical state of every room, validates each
//! player action against the game rules, and broadcasts versioned updates so
//! every client converges on the same state.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Rooms
//! Every room is a single-writer actor. Actions for one room are applied in
//! arrival order by the room's own task, so there is never a second writer to
//! race with, while different rooms run in parallel.
//!
//! ### Connection Management
//! Handles the lifecycle of client endpoints:
//! - Binding an address to a player and room on connect
//! - Heartbeat echo and silence detection
//! - Graceful leave versus involuntary drop
//!
//! ### Recovery
//! Rooms snapshot themselves after every phase change and on an interval.
//! A dropped player can reclaim their seat with the recovery token issued at
//! join, and a room that lost its process can be rebuilt from the newest
//! snapshot that passes validation.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Maps addresses to players and rooms, and finds silent connections.
//!
//! ### Room Module (`room`)
//! The per-room actor: reducer calls, acknowledgements, broadcast batching,
//! pause and resume, automatic actions for timed-out players.
//!
//! ### Recovery Module (`recovery`)
//! Sessions, recovery tokens, checksummed snapshots and the persistence
//! adapters they are written through.
//!
//! ### Security Module (`security`)
//! Rate limiting and anomaly detection applied before an action reaches a room.
//!
//! ### Network Module (`network`)
//! UDP transport and the main loop that routes packets to rooms.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "127.0.0.1:8080".to_string(),
//!         ..ServerConfig::default()
//!     };
//!     let mut server = Server::new(config).await?;
//!
//!     // Runs until interrupted:
//!     // - Receives packets and routes them to room actors
//!     // - Screens every action through the security gate
//!     // - Forwards room replies to clients
//!     // - Reports silent connections to their rooms
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod network;
pub mod recovery;
pub mod room;
pub mod security;
