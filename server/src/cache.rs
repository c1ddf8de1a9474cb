//! Owner id → profile cache
//!
//! The cache is the one process-wide mutable structure. It is an explicit
//! service object handed to whoever needs it; every operation on a single
//! owner id is atomic with respect to concurrent logins and disconnects.
//!
//! Closures passed to [`ProfileCache::with`] / [`ProfileCache::with_mut`] run
//! while the owner's shard is locked and must not call back into the cache.

use crate::peer_manager::Peer;
use crate::server_profile::ServerProfile;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared::{OwnerId, PeerId};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
struct CachedProfile {
    profile: ServerProfile,
    /// Set while the owner is disconnected and the grace period runs.
    evict_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct ProfileCache {
    entries: DashMap<OwnerId, CachedProfile>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, owner: &str) -> bool {
        self.entries.contains_key(owner)
    }

    pub fn owners(&self) -> Vec<OwnerId> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Re-attaches an existing profile to `peer` and cancels its eviction.
    /// Returns false when the owner has no cached profile.
    pub fn reattach(&self, owner: &str, peer: Option<&Arc<Peer>>) -> bool {
        match self.entries.get_mut(owner) {
            Some(mut entry) => {
                entry.evict_at = None;
                if let Some(peer) = peer {
                    entry.profile.attach(peer);
                }
                true
            }
            None => false,
        }
    }

    /// Inserts `profile` unless the owner already has one, in which case the
    /// existing instance is re-attached and kept. Returns true if inserted.
    pub fn insert_if_absent(&self, owner: &str, profile: ServerProfile, peer: Option<&Arc<Peer>>) -> bool {
        match self.entries.entry(owner.to_string()) {
            Entry::Occupied(mut occupied) => {
                let cached = occupied.get_mut();
                cached.evict_at = None;
                if let Some(peer) = peer {
                    cached.profile.attach(peer);
                }
                false
            }
            Entry::Vacant(vacant) => {
                let mut profile = profile;
                if let Some(peer) = peer {
                    profile.attach(peer);
                }
                vacant.insert(CachedProfile {
                    profile,
                    evict_at: None,
                });
                true
            }
        }
    }

    pub fn with<R>(&self, owner: &str, f: impl FnOnce(&ServerProfile) -> R) -> Option<R> {
        self.entries.get(owner).map(|entry| f(&entry.profile))
    }

    pub fn with_mut<R>(&self, owner: &str, f: impl FnOnce(&mut ServerProfile) -> R) -> Option<R> {
        self.entries
            .get_mut(owner)
            .map(|mut entry| f(&mut entry.profile))
    }

    /// Starts the grace period: detaches the peer and sets the eviction time.
    pub fn schedule_eviction(&self, owner: &str, at: Instant) -> bool {
        match self.entries.get_mut(owner) {
            Some(mut entry) => {
                entry.profile.detach();
                entry.evict_at = Some(at);
                true
            }
            None => false,
        }
    }

    /// Starts the grace period on behalf of the departing session `peer`.
    ///
    /// `None` when the owner is not cached, `Some(false)` when a different
    /// live session is attached (the profile is left alone).
    pub fn schedule_eviction_for(&self, owner: &str, peer: PeerId, at: Instant) -> Option<bool> {
        let mut entry = self.entries.get_mut(owner)?;
        if entry.profile.peer().is_some_and(|attached| attached.id != peer) {
            return Some(false);
        }
        entry.profile.detach();
        entry.evict_at = Some(at);
        Some(true)
    }

    /// Moves a running grace period's end to `at`. Does nothing for owners
    /// that are not being evicted.
    pub fn postpone_eviction(&self, owner: &str, at: Instant) -> bool {
        match self.entries.get_mut(owner) {
            Some(mut entry) if entry.evict_at.is_some() => {
                entry.evict_at = Some(at);
                true
            }
            _ => false,
        }
    }

    /// Owners whose profile still waits for its stored state.
    pub fn unrestored(&self) -> Vec<OwnerId> {
        self.entries
            .iter()
            .filter(|entry| entry.profile.is_unrestored())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn eviction_time(&self, owner: &str) -> Option<Instant> {
        self.entries.get(owner).and_then(|entry| entry.evict_at)
    }

    /// Owners whose grace period is over but which are still cached.
    pub fn expiring(&self, now: Instant) -> Vec<OwnerId> {
        self.entries
            .iter()
            .filter(|entry| entry.evict_at.is_some_and(|at| at <= now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Removes and returns every profile whose grace period is over.
    pub fn take_expired(&self, now: Instant) -> Vec<ServerProfile> {
        self.expiring(now)
            .into_iter()
            // Re-checked under the shard lock: a re-login may have raced us.
            .filter_map(|owner| {
                self.entries
                    .remove_if(&owner, |_, cached| cached.evict_at.is_some_and(|at| at <= now))
            })
            .map(|(_, cached)| cached.profile)
            .collect()
    }

    pub fn remove(&self, owner: &str) -> Option<ServerProfile> {
        self.entries.remove(owner).map(|(_, cached)| cached.profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::schema::player_schema;
    use shared::PeerRole;
    use std::time::Duration;

    fn profile(owner: &str) -> ServerProfile {
        ServerProfile::new(owner.to_string(), player_schema().build().unwrap(), false)
    }

    fn peer(id: u32) -> Arc<Peer> {
        Arc::new(Peer {
            id,
            addr: "127.0.0.1:7000".parse().unwrap(),
            role: PeerRole::Client,
        })
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let cache = ProfileCache::new();
        let first = peer(1);
        let second = peer(2);
        assert!(cache.insert_if_absent("ann", profile("ann"), Some(&first)));
        assert!(!cache.insert_if_absent("ann", profile("ann"), Some(&second)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.with("ann", |p| p.peer().map(|p| p.id)).flatten(), Some(2));
    }

    #[test]
    fn test_eviction_after_grace() {
        let cache = ProfileCache::new();
        cache.insert_if_absent("ann", profile("ann"), None);
        let now = Instant::now();
        assert!(cache.schedule_eviction("ann", now + Duration::from_secs(5)));

        assert!(cache.take_expired(now).is_empty());
        let evicted = cache.take_expired(now + Duration::from_secs(5));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].owner(), "ann");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reattach_cancels_eviction() {
        let cache = ProfileCache::new();
        cache.insert_if_absent("ann", profile("ann"), None);
        let now = Instant::now();
        cache.schedule_eviction("ann", now);

        let returning = peer(3);
        assert!(cache.reattach("ann", Some(&returning)));
        assert_eq!(cache.eviction_time("ann"), None);
        assert!(cache.take_expired(now + Duration::from_secs(60)).is_empty());
        assert!(!cache.reattach("bob", None));
    }

    #[test]
    fn test_stale_session_cannot_schedule_eviction() {
        let cache = ProfileCache::new();
        let old_session = peer(1);
        let new_session = peer(2);
        cache.insert_if_absent("ann", profile("ann"), Some(&old_session));
        cache.reattach("ann", Some(&new_session));

        let now = Instant::now();
        assert_eq!(cache.schedule_eviction_for("ann", 1, now), Some(false));
        assert_eq!(cache.eviction_time("ann"), None);
        assert_eq!(cache.with("ann", |p| p.peer().map(|p| p.id)).flatten(), Some(2));

        assert_eq!(cache.schedule_eviction_for("ann", 2, now), Some(true));
        assert_eq!(cache.eviction_time("ann"), Some(now));
        assert_eq!(cache.schedule_eviction_for("bob", 2, now), None);
    }

    #[test]
    fn test_postpone_only_moves_running_eviction() {
        let cache = ProfileCache::new();
        cache.insert_if_absent("ann", profile("ann"), None);
        let now = Instant::now();
        assert!(!cache.postpone_eviction("ann", now));

        cache.schedule_eviction("ann", now);
        assert!(cache.postpone_eviction("ann", now + Duration::from_secs(1)));
        assert!(cache.take_expired(now).is_empty());
        assert_eq!(cache.take_expired(now + Duration::from_secs(1)).len(), 1);
    }

    #[test]
    fn test_schedule_eviction_detaches_peer() {
        let cache = ProfileCache::new();
        let owner_peer = peer(1);
        cache.insert_if_absent("ann", profile("ann"), Some(&owner_peer));
        cache.schedule_eviction("ann", Instant::now());
        assert_eq!(cache.with("ann", |p| p.peer().is_some()), Some(false));
    }
}
