//! # Profile Server Library
//!
//! Server side of the profile replication toolkit. One binary runs in one of
//! two roles:
//!
//! - **Master**: caches the profile of every logged-in owner, restores it from
//!   and persists it to durable storage, serves snapshots to clients and game
//!   servers, and forwards game server changes to the owning client.
//! - **Game server**: holds the authoritative profiles of the players in its
//!   room, fetched from the master on join and flushed back as deltas.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! Each role runs one event loop that owns every profile of the process.
//! Network tasks only decode envelopes and forward them through a channel, so
//! all property mutation, delta encoding and delta application for a profile
//! happen on that loop.
//!
//! ### Tick-Driven Flushing
//! Debounce timers are plain deadlines checked on every loop tick. A flush
//! hands the encoded batch to the [`transport::Transport`] and returns; the
//! send receipt is polled on later ticks and only a successful receipt clears
//! the flushed changes.
//!
//! ## Module Organization
//!
//! - `transport`: the transport interface and an in-memory implementation
//! - `storage`: durable storage interface, memory and file backends
//! - `peer_manager`: connected peer tracking and timeouts
//! - `server_profile`, `cache`, `lifecycle`: profile ownership and eviction
//! - `propagation`: per-tier flush state machine
//! - `game_server`, `master`: the two tiers as synchronous state machines
//! - `network`: UDP transport and the async run loops
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::NodeConfig;
//! use server::network::MasterServer;
//! use server::storage::{FileStorage, ProfileStorage};
//! use shared::schema::player_schema;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage: Arc<dyn ProfileStorage> = Arc::new(FileStorage::new("profiles"));
//!     let mut server = MasterServer::new(
//!         "127.0.0.1:8080",
//!         NodeConfig::default(),
//!         player_schema(),
//!         Some(storage),
//!     )
//!     .await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod game_server;
pub mod lifecycle;
pub mod master;
pub mod network;
pub mod peer_manager;
pub mod propagation;
pub mod server_profile;
pub mod storage;
pub mod transport;
