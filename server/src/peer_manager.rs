//! Connected peer tracking for the server processes
//!
//! This module handles the server-side bookkeeping of connected peers:
//! - Peer connection lifecycle (connect, disconnect, timeout)
//! - Address to peer lookups for incoming datagrams
//! - Owner association for client peers
//! - Capacity management
//!
//! Peers are held as `Arc<Peer>`. Profiles only keep a `Weak<Peer>`, so
//! dropping a peer here is what makes its profiles lose their recipient.

use log::info;
use shared::{OwnerId, PeerId, PeerRole};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity of a connected peer
#[derive(Debug, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub role: PeerRole,
}

/// A connected peer plus its session state
#[derive(Debug)]
pub struct PeerSession {
    pub peer: Arc<Peer>,
    /// Last time we received any packet from this peer
    pub last_seen: Instant,
    /// Owner logged in through this peer (clients only)
    pub owner: Option<OwnerId>,
}

impl PeerSession {
    pub fn new(peer: Arc<Peer>) -> Self {
        Self {
            peer,
            last_seen: Instant::now(),
            owner: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Checks if the peer has exceeded the connection timeout
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all connected peers
pub struct PeerManager {
    peers: HashMap<PeerId, PeerSession>,
    next_peer_id: PeerId,
    max_peers: usize,
    timeout: Duration,
}

impl PeerManager {
    /// Creates a new peer manager with the specified capacity limit.
    /// Peer IDs start from 1 and increment for each new connection.
    pub fn new(max_peers: usize, timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            next_peer_id: 1,
            max_peers,
            timeout,
        }
    }

    /// Attempts to add a new peer connection
    ///
    /// Returns the peer if successful, None if the server is at capacity.
    pub fn add_peer(&mut self, addr: SocketAddr, role: PeerRole) -> Option<Arc<Peer>> {
        if self.peers.len() >= self.max_peers {
            return None;
        }

        let id = self.next_peer_id;
        self.next_peer_id += 1;

        let peer = Arc::new(Peer { id, addr, role });
        info!("Peer {} ({:?}) connected from {}", id, role, addr);
        self.peers.insert(id, PeerSession::new(Arc::clone(&peer)));
        Some(peer)
    }

    /// Removes a peer, returning its session if it was connected.
    pub fn remove_peer(&mut self, peer_id: PeerId) -> Option<PeerSession> {
        let session = self.peers.remove(&peer_id)?;
        info!("Peer {} disconnected", peer_id);
        Some(session)
    }

    pub fn find_peer_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|(_, session)| session.peer.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn session(&self, peer_id: PeerId) -> Option<&PeerSession> {
        self.peers.get(&peer_id)
    }

    pub fn session_mut(&mut self, peer_id: PeerId) -> Option<&mut PeerSession> {
        self.peers.get_mut(&peer_id)
    }

    pub fn peer(&self, peer_id: PeerId) -> Option<Arc<Peer>> {
        self.peers.get(&peer_id).map(|s| Arc::clone(&s.peer))
    }

    /// Associates an owner with a client peer.
    pub fn set_owner(&mut self, peer_id: PeerId, owner: OwnerId) -> bool {
        match self.peers.get_mut(&peer_id) {
            Some(session) => {
                session.owner = Some(owner);
                true
            }
            None => false,
        }
    }

    /// Removes and returns every timed-out peer.
    pub fn check_timeouts(&mut self) -> Vec<PeerSession> {
        let timed_out: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, session)| session.is_timed_out(self.timeout))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|id| self.remove_peer(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    #[test]
    fn test_add_peer() {
        let mut manager = PeerManager::new(2, Duration::from_secs(5));
        let peer = manager.add_peer(test_addr(), PeerRole::Client).unwrap();
        assert_eq!(peer.id, 1);
        assert_eq!(manager.len(), 1);
        assert!(!manager.is_empty());
    }

    #[test]
    fn test_add_peer_max_capacity() {
        let mut manager = PeerManager::new(1, Duration::from_secs(5));
        assert!(manager.add_peer(test_addr(), PeerRole::Client).is_some());
        assert!(manager.add_peer(test_addr2(), PeerRole::Client).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_peer_drops_strong_reference() {
        let mut manager = PeerManager::new(2, Duration::from_secs(5));
        let peer = manager.add_peer(test_addr(), PeerRole::Client).unwrap();
        let weak = Arc::downgrade(&peer);
        drop(peer);

        assert!(weak.upgrade().is_some());
        assert!(manager.remove_peer(1).is_some());
        assert!(weak.upgrade().is_none());
        assert!(manager.remove_peer(1).is_none());
    }

    #[test]
    fn test_find_peer_by_addr() {
        let mut manager = PeerManager::new(2, Duration::from_secs(5));
        let first = manager.add_peer(test_addr(), PeerRole::GameServer).unwrap();
        manager.add_peer(test_addr2(), PeerRole::Client).unwrap();

        assert_eq!(manager.find_peer_by_addr(test_addr()), Some(first.id));
        let unknown: SocketAddr = "192.168.1.1:9999".parse().unwrap();
        assert_eq!(manager.find_peer_by_addr(unknown), None);
    }

    #[test]
    fn test_owner_association() {
        let mut manager = PeerManager::new(2, Duration::from_secs(5));
        let peer = manager.add_peer(test_addr(), PeerRole::Client).unwrap();
        assert!(manager.set_owner(peer.id, "ann".to_string()));
        assert_eq!(manager.session(peer.id).unwrap().owner.as_deref(), Some("ann"));
        assert!(!manager.set_owner(42, "bob".to_string()));
    }

    #[test]
    fn test_timeouts() {
        let mut manager = PeerManager::new(2, Duration::from_secs(1));
        let peer = manager.add_peer(test_addr(), PeerRole::Client).unwrap();
        assert!(manager.check_timeouts().is_empty());

        manager.session_mut(peer.id).unwrap().last_seen = Instant::now() - Duration::from_secs(2);
        let removed = manager.check_timeouts();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].peer.id, peer.id);
        assert!(manager.is_empty());
    }
}
