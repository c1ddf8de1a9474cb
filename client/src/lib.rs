//! # Profile Client Library
//!
//! Client tier of the profile replication toolkit. A client logs in to the
//! master with an owner id and keeps a read-only replica of that owner's
//! profile: the full snapshot arrives on login, deltas follow whenever a game
//! server changes the profile.
//!
//! ## Module Organization
//!
//! - `replica`: the local profile copy and its change tracking
//! - `network`: UDP session with the master
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//! use shared::schema::player_schema;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new("127.0.0.1:8080", "alice", false, &player_schema()).await?;
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod replica;
