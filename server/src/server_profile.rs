//! Server-side profile: a profile plus its owning peer and persistence state

use crate::peer_manager::Peer;
use shared::{ApplyReport, ObservableProperty, OwnerId, Profile, ProfileResult, PropertyKey};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

#[derive(Debug)]
pub struct ServerProfile {
    owner: OwnerId,
    profile: Profile,
    /// Weak so the profile can outlive the connection during the grace period.
    peer: Weak<Peer>,
    persist: bool,
    storage_dirty: bool,
    /// Stored state could not be loaded yet; persisting would overwrite it.
    unrestored: bool,
    /// Keys changed while unrestored; these win over the stored values.
    touched: BTreeSet<PropertyKey>,
}

impl ServerProfile {
    pub fn new(owner: OwnerId, profile: Profile, persist: bool) -> Self {
        Self {
            owner,
            profile,
            peer: Weak::new(),
            persist,
            storage_dirty: false,
            unrestored: false,
            touched: BTreeSet::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Direct access for flush bookkeeping. Value changes should go through
    /// [`ServerProfile::update`] so storage tracking sees them.
    pub fn profile_mut(&mut self) -> &mut Profile {
        &mut self.profile
    }

    pub fn persists(&self) -> bool {
        self.persist
    }

    pub fn attach(&mut self, peer: &Arc<Peer>) {
        self.peer = Arc::downgrade(peer);
    }

    pub fn detach(&mut self) {
        self.peer = Weak::new();
    }

    /// The owning peer, if it is still connected.
    pub fn peer(&self) -> Option<Arc<Peer>> {
        self.peer.upgrade()
    }

    /// Mutates one property; returns the closure result and whether the
    /// profile now has changes to propagate.
    pub fn update<P, R, F>(&mut self, key: PropertyKey, f: F) -> ProfileResult<(R, bool)>
    where
        P: ObservableProperty,
        F: FnOnce(&mut P) -> R,
    {
        let result = self.profile.update(key, f)?;
        let dirty = self.profile.get_property(key)?.is_dirty();
        if dirty {
            self.record_change(&[key]);
        }
        Ok((result, dirty))
    }

    /// Applies a delta batch received from an upstream tier.
    pub fn apply_batch_delta(&mut self, payload: &[u8]) -> ProfileResult<ApplyReport> {
        let report = self.profile.apply_batch_delta(payload)?;
        self.record_change(&report.applied);
        Ok(report)
    }

    /// Imports values given in string form.
    pub fn apply_strings_dictionary(&mut self, values: &BTreeMap<PropertyKey, String>) -> ApplyReport {
        let report = self.profile.apply_strings_dictionary(values);
        self.record_change(&report.applied);
        report
    }

    fn record_change(&mut self, keys: &[PropertyKey]) {
        if keys.is_empty() {
            return;
        }
        self.storage_dirty = true;
        if self.unrestored {
            self.touched.extend(keys.iter().copied());
        }
    }

    pub fn mark_storage_dirty(&mut self) {
        self.storage_dirty = true;
    }

    /// Holds back persisting until [`ServerProfile::merge_restored`] ran.
    pub fn mark_unrestored(&mut self) {
        self.unrestored = true;
    }

    pub fn is_unrestored(&self) -> bool {
        self.unrestored
    }

    /// Fills in the stored state once it could be loaded.
    ///
    /// Properties changed since the profile was created keep their live
    /// value; every other property takes the stored one. The loaded values
    /// are left dirty for the downstream tier.
    pub fn merge_restored(&mut self, stored: &Profile) -> ProfileResult<ApplyReport> {
        let keep: Vec<PropertyKey> = stored.keys().filter(|key| !self.touched.contains(key)).collect();
        let report = self.profile.decode_snapshot(&stored.encode_partial_snapshot(&keep))?;
        self.unrestored = false;
        self.touched.clear();
        Ok(report)
    }

    /// Ends the wait for stored state without loading anything, e.g. when
    /// storage turned out to hold nothing for this owner.
    pub fn mark_restored(&mut self) {
        self.unrestored = false;
        self.touched.clear();
    }

    pub fn needs_persist(&self) -> bool {
        self.persist && self.storage_dirty && !self.unrestored
    }

    /// Snapshot to persist, clearing the storage flag. `None` when the
    /// profile is not persisted, still waits for its stored state, or nothing
    /// changed since the last persist.
    pub fn take_persist_snapshot(&mut self) -> Option<Vec<u8>> {
        if !self.needs_persist() {
            return None;
        }
        self.storage_dirty = false;
        Some(self.profile.encode_snapshot())
    }

    /// Unsaved changes of a profile that will never be persisted.
    pub fn has_stranded_changes(&self) -> bool {
        self.persist && self.storage_dirty && self.unrestored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::schema::{keys, player_schema};
    use shared::{ObservableInt, PeerRole};

    fn server_profile(persist: bool) -> ServerProfile {
        ServerProfile::new("ann".to_string(), player_schema().build().unwrap(), persist)
    }

    #[test]
    fn test_peer_reference_is_weak() {
        let mut profile = server_profile(false);
        let peer = Arc::new(Peer {
            id: 4,
            addr: "127.0.0.1:9000".parse().unwrap(),
            role: PeerRole::Client,
        });
        profile.attach(&peer);
        assert_eq!(profile.peer().unwrap().id, 4);

        drop(peer);
        assert!(profile.peer().is_none());
    }

    #[test]
    fn test_update_tracks_storage_dirty() {
        let mut profile = server_profile(true);
        let (changed, dirty) = profile
            .update(keys::COINS, |p: &mut ObservableInt| p.set(0))
            .unwrap();
        assert!(!changed);
        assert!(!dirty);
        assert!(profile.take_persist_snapshot().is_none());

        profile
            .update(keys::COINS, |p: &mut ObservableInt| p.set(10))
            .unwrap();
        let snapshot = profile.take_persist_snapshot().unwrap();
        assert!(!snapshot.is_empty());
        assert!(profile.take_persist_snapshot().is_none());
    }

    #[test]
    fn test_non_persistent_profile_never_yields_snapshot() {
        let mut profile = server_profile(false);
        profile
            .update(keys::COINS, |p: &mut ObservableInt| p.set(10))
            .unwrap();
        assert!(profile.take_persist_snapshot().is_none());
    }

    #[test]
    fn test_unrestored_profile_holds_back_persist() {
        let mut profile = server_profile(true);
        profile.mark_unrestored();
        profile
            .update(keys::COINS, |p: &mut ObservableInt| p.set(10))
            .unwrap();
        assert!(!profile.needs_persist());
        assert!(profile.take_persist_snapshot().is_none());
        assert!(profile.has_stranded_changes());

        let mut stored = player_schema().build().unwrap();
        stored
            .update(keys::COINS, |p: &mut ObservableInt| p.set(5000))
            .unwrap();
        stored
            .update(keys::LEVEL, |p: &mut ObservableInt| p.set(12))
            .unwrap();
        profile.merge_restored(&stored).unwrap();
        assert!(!profile.is_unrestored());

        let live = profile.profile();
        assert_eq!(*live.property::<ObservableInt>(keys::COINS).unwrap().get(), 10);
        assert_eq!(*live.property::<ObservableInt>(keys::LEVEL).unwrap().get(), 12);
        assert!(profile.take_persist_snapshot().is_some());
    }
}
