//! # Game Client Library
//!
//! This library provides the client side of the real-time social deduction
//! game. It keeps a local mirror of one room, applies the player's own actions
//! immediately, and reconciles that mirror with the authoritative server as
//! acknowledgements, rejections and broadcasts arrive.
//!
//! ## Architecture Overview
//!
//! The client is built so the player never waits on the network for their own
//! actions, while never showing anything the server has not committed for
//! anyone else.
//!
//! ### Optimistic Updates
//! A ready toggle, ballot or team proposal is validated locally against the
//! same rulebook the server uses and shown at once. Each update remembers the
//! state it replaced, so a rejection or a missing answer rolls it back exactly.
//!
//! ### Conflict Resolution
//! When a newer authoritative state arrives while updates are still pending,
//! they are replayed on top of it. An update that no longer fits is a
//! conflict, settled by the configured strategy or left for the player.
//!
//! ### Reliable Delivery
//! Events are resent until acknowledged, queued while offline and flushed in
//! order after reconnecting. The server ignores duplicates by event id, so
//! resending is always safe.
//!
//! ## Module Organization
//!
//! ### Channel Module (`channel`)
//! The synchronization channel: connection lifecycle, offline queue, resends,
//! heartbeats and the reconnect schedule.
//!
//! ### Connection Module (`connection`)
//! Connection status, exponential backoff with jitter, latency samples and
//! connection quality.
//!
//! ### Optimistic Module (`optimistic`)
//! Pending updates, rollback, conflict records and resolution strategies.
//!
//! ### Game Module (`game`)
//! Glue between the channel and the optimistic layer; drives both from
//! incoming packets and timer ticks.
//!
//! ### Input Module (`input`)
//! Parses typed commands into game intents.
//!
//! ### Rendering Module (`rendering`)
//! Text view of the room, notices and open conflicts.
//!
//! ### Network Module (`network`)
//! UDP socket and the run loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::config::ClientConfig;
//! use client::network::Client;
//! use tokio::sync::{mpsc, watch};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig {
//!         room_code: "ABCD".to_string(),
//!         player_id: "alice".to_string(),
//!         player_name: "Alice".to_string(),
//!         ..ClientConfig::default()
//!     };
//!
//!     let (commands, command_rx) = mpsc::channel(8);
//!     let (_shutdown, shutdown_rx) = watch::channel(false);
//!     commands.send("ready".to_string()).await?;
//!
//!     let mut client = Client::new(config).await?;
//!     client.run(command_rx, shutdown_rx).await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod game;
pub mod input;
pub mod network;
pub mod optimistic;
pub mod rendering;
