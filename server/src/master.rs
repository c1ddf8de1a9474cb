//! Master server tier
//!
//! The master keeps the cached copy of every logged-in owner's profile. It
//! serves snapshots to clients on login and to game servers on request,
//! applies the deltas game servers send back, forwards them to the owning
//! client on the client-tier timer and writes snapshots to durable storage on
//! the persist timer.

use crate::cache::ProfileCache;
use crate::error::{NodeError, NodeResult};
use crate::lifecycle::{Acquisition, OwnerKind, ProfileManager, SessionRelease};
use crate::peer_manager::Peer;
use crate::propagation::{FlushScheduler, FlushStats, Recipient, TierPublisher};
use crate::storage::{ProfileStorage, StorageResult};
use crate::transport::{SendReceipt, Transport};
use log::{debug, error, info, warn};
use shared::{ApplyReport, OpCode, OwnerId, PeerId, PeerRole, ProfileSchema, PropertyKey};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A snapshot waiting to be written to storage
#[derive(Debug, Clone, PartialEq)]
pub struct PersistJob {
    pub owner: OwnerId,
    pub snapshot: Vec<u8>,
}

impl PersistJob {
    pub async fn run(self, storage: &dyn ProfileStorage) -> (OwnerId, StorageResult<()>) {
        let result = storage.persist(&self.owner, self.snapshot).await;
        (self.owner, result)
    }
}

/// Work produced by one [`MasterNode::tick`]
#[derive(Debug, Default)]
pub struct MasterTick {
    pub flush: FlushStats,
    pub persist: Vec<PersistJob>,
}

pub struct MasterNode {
    transport: Arc<dyn Transport>,
    manager: ProfileManager,
    clients: TierPublisher,
    persist: FlushScheduler,
}

impl MasterNode {
    pub fn new(
        transport: Arc<dyn Transport>,
        schema: ProfileSchema,
        storage: Option<Arc<dyn ProfileStorage>>,
        client_flush_delay: Duration,
        persist_delay: Duration,
        grace: Duration,
    ) -> Self {
        let cache = Arc::new(ProfileCache::new());
        Self {
            clients: TierPublisher::new("master->client", Recipient::OwnerPeer, client_flush_delay, Arc::clone(&transport)),
            transport,
            manager: ProfileManager::new(cache, schema, storage, grace),
            persist: FlushScheduler::new(persist_delay),
        }
    }

    pub fn cache(&self) -> &ProfileCache {
        self.manager.cache()
    }

    pub fn clients(&self) -> &TierPublisher {
        &self.clients
    }

    pub fn persist_scheduler(&self) -> &FlushScheduler {
        &self.persist
    }

    /// Logs an owner in through `peer` and sends it the full profile.
    ///
    /// A storage failure does not fail the login; it is returned in the
    /// acquisition as a warning.
    pub async fn client_login(&mut self, owner: &str, peer: &Arc<Peer>, kind: OwnerKind) -> NodeResult<Acquisition> {
        let acquisition = self.manager.acquire(owner, Some(peer), kind).await?;
        if let Some(warning) = &acquisition.warning {
            warn!("Login of {} continues without stored profile: {}", owner, warning);
        }

        // The snapshot carries every change the client has not seen yet.
        self.clients.cancel(owner, self.manager.cache());
        self.send_snapshot(owner, peer.id)?;
        info!("Owner {} logged in from peer {}", owner, peer.id);
        Ok(acquisition)
    }

    /// Answers a game server asking for an owner's profile.
    pub async fn serve_profile_request(&mut self, owner: &str, game_server: PeerId) -> NodeResult<SendReceipt> {
        // Also cancels a running grace period: the game server now holds it.
        let acquisition = self.manager.acquire(owner, None, OwnerKind::Registered).await?;
        if let Some(warning) = acquisition.warning {
            warn!("Serving defaults for {}: {}", owner, warning);
        }
        debug!("Serving profile of {} to game server {}", owner, game_server);
        self.send_snapshot(owner, game_server)
    }

    fn send_snapshot(&self, owner: &str, peer: PeerId) -> NodeResult<SendReceipt> {
        let snapshot = self
            .cache()
            .with(owner, |profile| profile.profile().encode_snapshot())
            .ok_or_else(|| NodeError::UnknownOwner(owner.to_string()))?;
        Ok(self.transport.send(peer, OpCode::ProfileSnapshot, owner, snapshot))
    }

    /// Applies a delta batch sent by the game server holding the profile.
    pub fn apply_game_update(&mut self, owner: &str, payload: &[u8], now: Instant) -> NodeResult<ApplyReport> {
        let (report, persists) = self
            .cache()
            .with_mut(owner, |profile| {
                profile
                    .apply_batch_delta(payload)
                    .map(|report| (report, profile.persists()))
            })
            .ok_or_else(|| NodeError::UnknownOwner(owner.to_string()))??;

        for (key, err) in &report.rejected {
            warn!("Rejected change to property {} of {}: {}", key, owner, err);
        }
        if !report.applied.is_empty() {
            self.clients.notify_dirty(owner, now);
            if persists {
                self.persist.mark_dirty(owner, now);
            }
        }
        Ok(report)
    }

    /// Handles a profile message from a connected peer.
    pub async fn on_packet(
        &mut self,
        from: &Peer,
        op: OpCode,
        owner: &str,
        payload: &[u8],
        now: Instant,
    ) -> NodeResult<Option<PersistJob>> {
        if from.role != PeerRole::GameServer {
            return Err(NodeError::UnexpectedMessage { op, peer: from.id });
        }
        match op {
            OpCode::ProfileRequest => {
                self.serve_profile_request(owner, from.id).await?;
                Ok(None)
            }
            OpCode::ProfileDelta => {
                self.apply_game_update(owner, payload, now)?;
                Ok(None)
            }
            OpCode::ProfileRelease => Ok(self.game_release(owner, now)),
            OpCode::ProfileSnapshot => Err(NodeError::UnexpectedMessage { op, peer: from.id }),
        }
    }

    /// A game server dropped the profile. Without a logged-in client nothing
    /// keeps it alive any more.
    fn game_release(&mut self, owner: &str, now: Instant) -> Option<PersistJob> {
        let has_client = self
            .cache()
            .with(owner, |profile| profile.peer().is_some())
            .unwrap_or(true);
        if has_client {
            return None;
        }
        self.release(owner, now)
    }

    /// The client session `peer` of the owner went away.
    ///
    /// Changes only meant for the client are dropped. Changes meant for
    /// storage are returned as a job to run right away. A session already
    /// replaced by a newer login leaves the profile untouched.
    pub fn client_disconnect(&mut self, owner: &str, peer: PeerId, now: Instant) -> Option<PersistJob> {
        match self.manager.release_session(owner, peer, now) {
            SessionRelease::Released(snapshot) => {
                self.clients.cancel(owner, self.manager.cache());
                info!("Owner {} disconnected", owner);
                snapshot.map(|snapshot| self.persist_now(owner, snapshot))
            }
            SessionRelease::Stale => {
                info!("Peer {} left, but {} is logged in from a newer session", peer, owner);
                None
            }
            SessionRelease::Unknown => None,
        }
    }

    fn release(&mut self, owner: &str, now: Instant) -> Option<PersistJob> {
        let snapshot = self.manager.release(owner, now)?;
        Some(self.persist_now(owner, snapshot))
    }

    fn persist_now(&mut self, owner: &str, snapshot: Vec<u8>) -> PersistJob {
        self.persist.cancel(owner);
        self.persist.begin_flight(owner);
        PersistJob {
            owner: owner.to_string(),
            snapshot,
        }
    }

    /// Retries loading stored profiles that were unavailable when their
    /// owner logged in. Returns the owners whose stored state got merged.
    ///
    /// Until then those profiles are never persisted, so the stored state
    /// cannot be overwritten by defaults.
    pub async fn retry_restores(&mut self, now: Instant) -> Vec<OwnerId> {
        let mut restored = Vec::new();
        for owner in self.cache().unrestored() {
            match self.manager.retry_restore(&owner).await {
                Ok(Some(_)) => {
                    self.resync_client(&owner);
                    let dirty = self
                        .cache()
                        .with(&owner, |profile| profile.needs_persist())
                        .unwrap_or(false);
                    if dirty {
                        self.persist.mark_dirty(&owner, now);
                    }
                    restored.push(owner);
                }
                Ok(None) => {}
                Err(err) => debug!("Stored profile of {} still unavailable: {}", owner, err),
            }
        }
        restored
    }

    /// Replaces pending client deltas with a fresh snapshot.
    fn resync_client(&mut self, owner: &str) {
        self.clients.cancel(owner, self.manager.cache());
        let peer = self
            .cache()
            .with(owner, |profile| profile.peer().map(|peer| peer.id))
            .flatten();
        if let Some(peer) = peer {
            if let Err(err) = self.send_snapshot(owner, peer) {
                warn!("Could not resend profile of {} to peer {}: {}", owner, peer, err);
            }
        }
    }

    /// Drives both timers and evicts expired profiles.
    pub fn tick(&mut self, now: Instant) -> MasterTick {
        let flush = self.clients.tick(now, self.manager.cache());
        let mut persist = Vec::new();

        for owner in self.persist.take_due(now) {
            let snapshot = self
                .cache()
                .with_mut(&owner, |profile| profile.take_persist_snapshot())
                .flatten();
            match snapshot {
                Some(snapshot) => {
                    self.persist.begin_flight(&owner);
                    persist.push(PersistJob { owner, snapshot });
                }
                None => self.persist.cancel(&owner),
            }
        }

        for evicted in self.manager.evict_expired(now) {
            self.clients.cancel(&evicted.owner, self.manager.cache());
            self.persist.cancel(&evicted.owner);
            if let Some(snapshot) = evicted.final_snapshot {
                persist.push(PersistJob {
                    owner: evicted.owner,
                    snapshot,
                });
            }
        }

        MasterTick { flush, persist }
    }

    /// Records the outcome of a [`PersistJob`]. Failed writes are retried on
    /// the next persist timer while the profile is cached.
    pub fn on_persist_result(&mut self, owner: &str, result: StorageResult<()>, now: Instant) {
        match result {
            Ok(()) => {
                debug!("Persisted profile of {}", owner);
                let still_dirty = self
                    .cache()
                    .with(owner, |profile| profile.needs_persist())
                    .unwrap_or(false);
                self.persist.finish_flight(owner, now, still_dirty);
            }
            Err(err) => {
                let cached = self
                    .cache()
                    .with_mut(owner, |profile| profile.mark_storage_dirty())
                    .is_some();
                if cached {
                    warn!("Persisting {} failed, will retry: {}", owner, err);
                    self.persist.finish_flight(owner, now, true);
                } else {
                    error!("Persisting evicted profile of {} failed: {}", owner, err);
                    self.persist.cancel(owner);
                }
            }
        }
    }

    /// String form of every property, for admin display.
    pub fn admin_strings(&self, owner: &str) -> NodeResult<BTreeMap<PropertyKey, String>> {
        self.cache()
            .with(owner, |profile| profile.profile().to_strings_dictionary())
            .ok_or_else(|| NodeError::UnknownOwner(owner.to_string()))
    }

    /// Imports admin edits given in string form and propagates them.
    pub fn apply_admin_strings(
        &mut self,
        owner: &str,
        values: &BTreeMap<PropertyKey, String>,
        now: Instant,
    ) -> NodeResult<ApplyReport> {
        let (report, persists) = self
            .cache()
            .with_mut(owner, |profile| (profile.apply_strings_dictionary(values), profile.persists()))
            .ok_or_else(|| NodeError::UnknownOwner(owner.to_string()))?;

        if !report.applied.is_empty() {
            self.clients.notify_dirty(owner, now);
            if persists {
                self.persist.mark_dirty(owner, now);
            }
        }
        Ok(report)
    }
}
