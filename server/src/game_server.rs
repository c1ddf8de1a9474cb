//! Authoritative game server tier
//!
//! A game server holds the authoritative copy of every profile of the players
//! in its room. It fetches a profile from the master when a player joins,
//! mutates it from game logic and flushes the resulting deltas back to the
//! master on its own debounce timer.

use crate::cache::ProfileCache;
use crate::error::{NodeError, NodeResult};
use crate::lifecycle::ProfileManager;
use crate::propagation::{FlushStats, Recipient, TierPublisher};
use crate::server_profile::ServerProfile;
use crate::transport::{SendReceipt, Transport, TransportError};
use log::{debug, info, warn};
use shared::{ApplyReport, ObservableProperty, OpCode, OwnerId, PeerId, ProfileResult, ProfileSchema, PropertyKey};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot::error::TryRecvError;

/// A game-logic change to one profile. Returns whether anything changed.
pub type ProfileEdit = Box<dyn FnOnce(&mut ServerProfile) -> ProfileResult<bool> + Send>;

pub struct GameServerNode {
    master: PeerId,
    transport: Arc<dyn Transport>,
    manager: ProfileManager,
    publisher: TierPublisher,
    requested: HashSet<OwnerId>,
    /// `ProfileRelease` messages the master has not confirmed yet
    releases: HashMap<OwnerId, SendReceipt>,
}

impl GameServerNode {
    pub fn new(
        master: PeerId,
        transport: Arc<dyn Transport>,
        schema: ProfileSchema,
        flush_delay: Duration,
        grace: Duration,
    ) -> Self {
        let cache = Arc::new(ProfileCache::new());
        Self {
            master,
            manager: ProfileManager::new(cache, schema, None, grace),
            publisher: TierPublisher::new("game->master", Recipient::Fixed(master), flush_delay, Arc::clone(&transport)),
            transport,
            requested: HashSet::new(),
            releases: HashMap::new(),
        }
    }

    pub fn cache(&self) -> &ProfileCache {
        self.manager.cache()
    }

    pub fn publisher(&self) -> &TierPublisher {
        &self.publisher
    }

    pub fn is_loaded(&self, owner: &str) -> bool {
        self.cache().contains(owner)
    }

    pub fn is_requested(&self, owner: &str) -> bool {
        self.requested.contains(owner)
    }

    /// Called when a player joins the room.
    ///
    /// A profile still cached from an earlier visit is re-attached; otherwise
    /// the master is asked for a snapshot and `Some(receipt)` is returned.
    pub fn request_profile(&mut self, owner: &str) -> Option<SendReceipt> {
        // A rejoin supersedes an unconfirmed release.
        self.releases.remove(owner);
        if self.cache().reattach(owner, None) {
            debug!("Profile of {} still cached", owner);
            return None;
        }
        self.requested.insert(owner.to_string());
        info!("Requesting profile of {} from master", owner);
        Some(self.transport.send(self.master, OpCode::ProfileRequest, owner, Vec::new()))
    }

    /// Handles a profile message from the master.
    pub fn on_packet(&mut self, from: PeerId, op: OpCode, owner: &str, payload: &[u8]) -> NodeResult<ApplyReport> {
        if from != self.master {
            return Err(NodeError::UnexpectedMessage { op, peer: from });
        }
        match op {
            OpCode::ProfileSnapshot => {
                if !self.requested.remove(owner) && !self.is_loaded(owner) {
                    warn!("Unrequested profile snapshot for {}", owner);
                }
                let report = self.manager.adopt_snapshot(owner, payload)?;
                if !report.unknown.is_empty() {
                    warn!("Snapshot of {} carried unknown keys {:?}", owner, report.unknown);
                }
                info!("Loaded profile of {}", owner);
                Ok(report)
            }
            _ => Err(NodeError::UnexpectedMessage { op, peer: from }),
        }
    }

    /// Mutates one property of a loaded profile and schedules the flush.
    pub fn modify<P, R, F>(&mut self, owner: &str, key: PropertyKey, now: Instant, f: F) -> NodeResult<R>
    where
        P: ObservableProperty,
        F: FnOnce(&mut P) -> R,
    {
        let (result, dirty) = self
            .cache()
            .with_mut(owner, |profile| profile.update(key, f))
            .ok_or_else(|| NodeError::UnknownOwner(owner.to_string()))??;
        if dirty {
            self.publisher.notify_dirty(owner, now);
        }
        Ok(result)
    }

    /// Runs an arbitrary edit against a loaded profile.
    pub fn edit(&mut self, owner: &str, now: Instant, edit: ProfileEdit) -> NodeResult<bool> {
        let changed = self
            .cache()
            .with_mut(owner, edit)
            .ok_or_else(|| NodeError::UnknownOwner(owner.to_string()))??;
        let dirty = self
            .cache()
            .with(owner, |profile| profile.profile().has_dirty_properties())
            .unwrap_or(false);
        if dirty {
            self.publisher.notify_dirty(owner, now);
        }
        Ok(changed)
    }

    /// Called when a player leaves the room. The profile stays cached for the
    /// grace period so its last changes still reach the master.
    pub fn release(&mut self, owner: &str, now: Instant) {
        self.requested.remove(owner);
        self.manager.release(owner, now);
    }

    /// Drives the flush timer and evicts released profiles.
    ///
    /// An expiring profile gets one last flush. It stays cached until that
    /// flush is confirmed, so the master always receives its final state.
    pub fn tick(&mut self, now: Instant) -> FlushStats {
        let mut stats = self.publisher.tick(now, self.manager.cache());
        self.poll_releases();

        for owner in self.manager.cache().expiring(now) {
            let flushed = self.publisher.flush_now(&owner, now, self.manager.cache());
            stats.sent += flushed.sent;
            stats.committed += flushed.committed;
            if self.publisher.is_busy(&owner) {
                debug!("Holding {} until its last flush is confirmed", owner);
                self.manager
                    .cache()
                    .postpone_eviction(&owner, now + self.publisher.scheduler().delay());
            }
        }

        for evicted in self.manager.evict_expired(now) {
            self.publisher.cancel(&evicted.owner, self.manager.cache());
            self.send_release(evicted.owner);
        }
        stats
    }

    pub fn pending_releases(&self) -> usize {
        self.releases.len()
    }

    fn send_release(&mut self, owner: OwnerId) {
        let receipt = self
            .transport
            .send(self.master, OpCode::ProfileRelease, &owner, Vec::new());
        self.releases.insert(owner, receipt);
    }

    /// Drops confirmed releases and resends failed ones.
    fn poll_releases(&mut self) {
        let mut failed = Vec::new();
        self.releases.retain(|owner, receipt| {
            let outcome = match receipt.try_recv() {
                Err(TryRecvError::Empty) => return true,
                Ok(result) => result,
                Err(TryRecvError::Closed) => Err(TransportError::Io("receipt dropped".to_string())),
            };
            if let Err(err) = outcome {
                warn!("Release of {} did not reach the master, resending: {}", owner, err);
                failed.push(owner.clone());
            }
            false
        });
        for owner in failed {
            self.send_release(owner);
        }
    }
}
