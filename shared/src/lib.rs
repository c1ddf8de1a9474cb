//! # Shared Replication Library
//!
//! Types shared by the game server, master server and client tiers: the
//! observable property containers, the profile aggregate and its binary codec,
//! profile schemas, and the transport envelope exchanged between processes.
//!
//! ## Module Organization
//!
//! - `codec`: big-endian primitive encoding and the [`codec::WireValue`] trait
//! - `property`: the object safe [`property::ObservableProperty`] capability
//! - `scalar`, `list`, `map`: the concrete property variants
//! - `profile`: key-ordered property collection with batched deltas
//! - `schema`: profile factories shared by all tiers
//! - `error`: the error taxonomy
//!
//! ## Flow
//!
//! A mutation marks a property dirty, the owning profile records its key as
//! pending, a per-tier flush encodes one batch for every pending property and
//! hands it to the transport. The receiving tier applies the batch to its own
//! profile, which marks the touched properties dirty again so the next tier
//! downstream receives them too.

pub mod codec;
pub mod error;
pub mod list;
pub mod map;
pub mod profile;
pub mod property;
pub mod scalar;
pub mod schema;

use serde::{Deserialize, Serialize};

pub use error::{ProfileError, ProfileResult};
pub use list::{ListEvent, ListOp, ObservableList};
pub use map::{MapEvent, MapOp, ObservableMap};
pub use profile::{ApplyReport, BatchDelta, FlushTicket, Profile};
pub use property::{DeltaMark, DeltaOutcome, ObservableProperty};
pub use scalar::{
    Observable, ObservableBool, ObservableDateTime, ObservableDouble, ObservableFloat, ObservableInt,
    ObservableLong, ObservableString,
};
pub use schema::ProfileSchema;

/// Identifier of a property within a profile schema (`int16` on the wire).
pub type PropertyKey = i16;

/// Logical owner of a profile, usually a user name.
pub type OwnerId = String;

/// Connection identifier assigned by the accepting process.
pub type PeerId = u32;

pub const PROTOCOL_VERSION: u32 = 1;

/// Operation carried by a [`Packet::Profile`] message
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Ask the master for the full profile of an owner.
    ProfileRequest,
    /// Full profile state (payload: profile snapshot).
    ProfileSnapshot,
    /// Batched property changes (payload: delta batch).
    ProfileDelta,
    /// The sender no longer needs the owner's profile.
    ProfileRelease,
}

/// Role announced by a peer when connecting
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    GameServer,
    Client,
}

/// Transport envelope, serialized with bincode
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect {
        client_version: u32,
        role: PeerRole,
        /// Owner logging in (clients only)
        owner: Option<OwnerId>,
        /// Guests get an ephemeral profile that is never restored or persisted
        guest: bool,
    },
    Profile {
        op: OpCode,
        owner: OwnerId,
        payload: Vec<u8>,
    },
    /// Keeps an otherwise silent session alive
    Heartbeat,
    Disconnect,

    Connected {
        peer_id: PeerId,
    },
    Disconnected {
        reason: String,
    },
}
