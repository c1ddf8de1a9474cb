//! Transport collaborator interface
//!
//! The replication core never performs network I/O itself. It hands encoded
//! payloads to a [`Transport`] and receives a [`SendReceipt`] that resolves
//! once the transport accepted (or failed) the send. Changes are only
//! declared flushed after the receipt resolved successfully.

use dashmap::DashSet;
use shared::{OpCode, OwnerId, Packet, PeerId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("failed to encode packet: {0}")]
    Encode(String),
    #[error("send failed: {0}")]
    Io(String),
}

/// Resolves with the outcome of a send. A dropped sender counts as failure.
pub type SendReceipt = oneshot::Receiver<Result<(), TransportError>>;

pub trait Transport: Send + Sync {
    /// Queues a profile message for `peer` and returns immediately.
    fn send(&self, peer: PeerId, op: OpCode, owner: &str, payload: Vec<u8>) -> SendReceipt;

    /// Whether `peer` currently has a live connection.
    fn is_connected(&self, peer: PeerId) -> bool;
}

/// Creates a receipt that is already resolved.
pub fn resolved(result: Result<(), TransportError>) -> SendReceipt {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

/// A message captured by [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub peer: PeerId,
    pub op: OpCode,
    pub owner: OwnerId,
    pub payload: Vec<u8>,
}

impl SentMessage {
    pub fn into_packet(self) -> Packet {
        Packet::Profile {
            op: self.op,
            owner: self.owner,
            payload: self.payload,
        }
    }
}

/// In-process transport that records outgoing messages
///
/// Used to wire tiers together inside one process and in tests. Sends
/// complete immediately unless holding is enabled, in which case receipts
/// stay unresolved until [`MemoryTransport::complete_held`] is called.
#[derive(Default)]
pub struct MemoryTransport {
    connected: DashSet<PeerId>,
    outbox: Mutex<Vec<SentMessage>>,
    held: Mutex<Vec<oneshot::Sender<Result<(), TransportError>>>>,
    hold: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, peer: PeerId) {
        self.connected.insert(peer);
    }

    pub fn disconnect(&self, peer: PeerId) {
        self.connected.remove(&peer);
    }

    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Resolves every held receipt with `result`. Returns how many resolved.
    pub fn complete_held(&self, result: Result<(), TransportError>) -> usize {
        let held: Vec<_> = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let count = held.len();
        for tx in held {
            let _ = tx.send(result.clone());
        }
        count
    }

    /// Takes every message sent so far.
    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.outbox.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Transport for MemoryTransport {
    fn send(&self, peer: PeerId, op: OpCode, owner: &str, payload: Vec<u8>) -> SendReceipt {
        if !self.is_connected(peer) {
            return resolved(Err(TransportError::NotConnected(peer)));
        }
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMessage {
                peer,
                op,
                owner: owner.to_string(),
                payload,
            });

        if self.hold.load(Ordering::SeqCst) {
            let (tx, rx) = oneshot::channel();
            self.held
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(tx);
            rx
        } else {
            resolved(Ok(()))
        }
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        self.connected.contains(&peer)
    }
}
