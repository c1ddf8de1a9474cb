//! Per-tier flush scheduling
//!
//! Every downstream target (game server → master, master → client) owns one
//! [`TierPublisher`]. For each owner it runs a small state machine:
//!
//! - **Idle**: nothing pending, no timer.
//! - **Pending**: first dirty mark armed a timer; later marks coalesce into it.
//! - **InFlight**: a batch was handed to the transport and its receipt has not
//!   resolved yet. Marks arriving now re-arm the timer once the flight ends.
//!
//! Nothing here blocks. Timers are checked by [`TierPublisher::tick`], which
//! the owning node calls from its run loop.

use crate::cache::ProfileCache;
use crate::transport::{SendReceipt, Transport, TransportError};
use log::{debug, warn};
use shared::{BatchDelta, FlushTicket, OpCode, OwnerId, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot::error::TryRecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushState {
    Pending { due: Instant },
    InFlight { rearm: bool },
}

/// Debounce timers, one per owner. An owner without an entry is Idle.
#[derive(Debug)]
pub struct FlushScheduler {
    delay: Duration,
    states: HashMap<OwnerId, FlushState>,
}

impl FlushScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            states: HashMap::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Records a change for `owner`. Arms the timer when Idle, keeps the
    /// running timer when Pending, and re-arms after the flight when InFlight.
    pub fn mark_dirty(&mut self, owner: &str, now: Instant) {
        match self.states.get_mut(owner) {
            None => {
                self.states.insert(
                    owner.to_string(),
                    FlushState::Pending { due: now + self.delay },
                );
            }
            Some(FlushState::Pending { .. }) => {}
            Some(FlushState::InFlight { rearm }) => *rearm = true,
        }
    }

    /// Arms the timer to fire at `now`, unless a flight is running.
    pub fn mark_urgent(&mut self, owner: &str, now: Instant) {
        match self.states.get_mut(owner) {
            Some(FlushState::InFlight { rearm }) => *rearm = true,
            _ => {
                self.states
                    .insert(owner.to_string(), FlushState::Pending { due: now });
            }
        }
    }

    /// Owners whose timer fired, in no particular order.
    pub fn take_due(&self, now: Instant) -> Vec<OwnerId> {
        self.states
            .iter()
            .filter(|(_, state)| matches!(state, FlushState::Pending { due } if *due <= now))
            .map(|(owner, _)| owner.clone())
            .collect()
    }

    pub fn begin_flight(&mut self, owner: &str) {
        self.states
            .insert(owner.to_string(), FlushState::InFlight { rearm: false });
    }

    /// Ends a flight. Goes back to Pending when changes arrived meanwhile or
    /// `still_dirty` says the profile has unsent changes, else to Idle.
    pub fn finish_flight(&mut self, owner: &str, now: Instant, still_dirty: bool) {
        let rearm = matches!(self.states.get(owner), Some(FlushState::InFlight { rearm: true }));
        if rearm || still_dirty {
            self.states.insert(
                owner.to_string(),
                FlushState::Pending { due: now + self.delay },
            );
        } else {
            self.states.remove(owner);
        }
    }

    pub fn cancel(&mut self, owner: &str) {
        self.states.remove(owner);
    }

    pub fn is_idle(&self, owner: &str) -> bool {
        !self.states.contains_key(owner)
    }

    pub fn is_pending(&self, owner: &str) -> bool {
        matches!(self.states.get(owner), Some(FlushState::Pending { .. }))
    }

    pub fn is_in_flight(&self, owner: &str) -> bool {
        matches!(self.states.get(owner), Some(FlushState::InFlight { .. }))
    }
}

/// Where a tier sends an owner's deltas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// Always the same peer (the master, seen from a game server)
    Fixed(PeerId),
    /// The peer currently attached to the owner's profile (the client)
    OwnerPeer,
}

#[derive(Debug)]
struct Flight {
    ticket: FlushTicket,
    receipt: SendReceipt,
}

/// Counters for one [`TierPublisher::tick`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    /// Batches handed to the transport
    pub sent: usize,
    /// Flights confirmed and committed
    pub committed: usize,
    /// Owners whose changes were dropped for lack of a recipient
    pub discarded: usize,
    /// Flights that failed and will be retried
    pub failed: usize,
}

enum FlushDecision {
    Nothing,
    Discard,
    Send { peer: PeerId, batch: BatchDelta },
}

/// Debounced delta publisher for one downstream tier
pub struct TierPublisher {
    name: &'static str,
    recipient: Recipient,
    transport: Arc<dyn Transport>,
    scheduler: FlushScheduler,
    flights: HashMap<OwnerId, Flight>,
}

impl TierPublisher {
    pub fn new(name: &'static str, recipient: Recipient, delay: Duration, transport: Arc<dyn Transport>) -> Self {
        Self {
            name,
            recipient,
            transport,
            scheduler: FlushScheduler::new(delay),
            flights: HashMap::new(),
        }
    }

    pub fn scheduler(&self) -> &FlushScheduler {
        &self.scheduler
    }

    pub fn notify_dirty(&mut self, owner: &str, now: Instant) {
        self.scheduler.mark_dirty(owner, now);
    }

    /// Whether the owner has a timer armed or a batch in flight.
    pub fn is_busy(&self, owner: &str) -> bool {
        !self.scheduler.is_idle(owner)
    }

    /// Drops the owner's timer and every unsent change destined for this tier.
    pub fn cancel(&mut self, owner: &str, cache: &ProfileCache) {
        self.scheduler.cancel(owner);
        self.flights.remove(owner);
        let discarded = cache
            .with_mut(owner, |server_profile| {
                let profile = server_profile.profile_mut();
                let had_changes = profile.has_dirty_properties();
                profile.clear_delta();
                had_changes
            })
            .unwrap_or(false);
        if discarded {
            debug!("[{}] Cancelled pending flush for {}", self.name, owner);
        }
    }

    /// Flushes `owner` right away, bypassing the debounce delay.
    pub fn flush_now(&mut self, owner: &str, now: Instant, cache: &ProfileCache) -> FlushStats {
        let mut stats = FlushStats::default();
        self.poll_flight(owner, now, cache, &mut stats);
        if self.scheduler.is_in_flight(owner) {
            self.scheduler.mark_urgent(owner, now);
            return stats;
        }
        self.flush_owner(owner, cache, &mut stats);
        stats
    }

    /// Resolves finished sends, then flushes every owner whose timer fired.
    pub fn tick(&mut self, now: Instant, cache: &ProfileCache) -> FlushStats {
        let mut stats = FlushStats::default();

        let owners: Vec<OwnerId> = self.flights.keys().cloned().collect();
        for owner in owners {
            self.poll_flight(&owner, now, cache, &mut stats);
        }

        for owner in self.scheduler.take_due(now) {
            self.flush_owner(&owner, cache, &mut stats);
        }
        stats
    }

    fn poll_flight(&mut self, owner: &str, now: Instant, cache: &ProfileCache, stats: &mut FlushStats) {
        let Some(flight) = self.flights.get_mut(owner) else {
            return;
        };
        let outcome = match flight.receipt.try_recv() {
            Err(TryRecvError::Empty) => return,
            Ok(result) => result,
            Err(TryRecvError::Closed) => Err(TransportError::Io("receipt dropped".to_string())),
        };
        let Some(flight) = self.flights.remove(owner) else {
            return;
        };

        match outcome {
            Ok(()) => {
                let still_dirty = cache.with_mut(owner, |server_profile| {
                    let profile = server_profile.profile_mut();
                    profile.commit_flush(&flight.ticket);
                    profile.has_dirty_properties()
                });
                match still_dirty {
                    Some(still_dirty) => {
                        stats.committed += 1;
                        self.scheduler.finish_flight(owner, now, still_dirty);
                    }
                    // Evicted while the send was running.
                    None => self.scheduler.cancel(owner),
                }
            }
            Err(err) => {
                warn!("[{}] Flush for {} failed, will retry: {}", self.name, owner, err);
                stats.failed += 1;
                self.scheduler.finish_flight(owner, now, true);
            }
        }
    }

    fn flush_owner(&mut self, owner: &str, cache: &ProfileCache, stats: &mut FlushStats) {
        let transport = &self.transport;
        let recipient = self.recipient;
        let decision = cache.with_mut(owner, |server_profile| {
            let peer = match recipient {
                Recipient::Fixed(peer) => Some(peer),
                Recipient::OwnerPeer => server_profile.peer().map(|peer| peer.id),
            }
            .filter(|peer| transport.is_connected(*peer));

            let profile = server_profile.profile_mut();
            match peer {
                None => {
                    profile.clear_delta();
                    FlushDecision::Discard
                }
                Some(peer) => {
                    let batch = profile.encode_batch_delta();
                    if batch.ticket.is_empty() {
                        FlushDecision::Nothing
                    } else {
                        FlushDecision::Send { peer, batch }
                    }
                }
            }
        });

        match decision {
            None | Some(FlushDecision::Nothing) => self.scheduler.cancel(owner),
            Some(FlushDecision::Discard) => {
                debug!("[{}] No live recipient for {}, discarding changes", self.name, owner);
                stats.discarded += 1;
                self.scheduler.cancel(owner);
            }
            Some(FlushDecision::Send { peer, batch }) => {
                debug!(
                    "[{}] Flushing {} properties of {} ({} bytes) to peer {}",
                    self.name,
                    batch.ticket.len(),
                    owner,
                    batch.payload.len(),
                    peer
                );
                let receipt = self
                    .transport
                    .send(peer, OpCode::ProfileDelta, owner, batch.payload);
                self.flights.insert(
                    owner.to_string(),
                    Flight {
                        ticket: batch.ticket,
                        receipt,
                    },
                );
                self.scheduler.begin_flight(owner);
                stats.sent += 1;
            }
        }
    }
}
