//! Client-side profile replica
//!
//! The client never writes to its profile. It loads the snapshot sent on
//! login and applies delta batches in arrival order. Applied changes are not
//! re-propagated, so the replica clears its own change logs after each apply.

use log::{debug, warn};
use shared::{ApplyReport, ObservableProperty, OwnerId, Profile, ProfileResult, ProfileSchema, PropertyKey};
use std::collections::BTreeMap;

pub struct ClientReplica {
    owner: OwnerId,
    profile: Profile,
    loaded: bool,
    /// Keys changed by snapshots or deltas since the last `take_changed`
    changed: Vec<PropertyKey>,
}

impl ClientReplica {
    pub fn new(owner: impl Into<OwnerId>, schema: &ProfileSchema) -> ProfileResult<Self> {
        Ok(Self {
            owner: owner.into(),
            profile: schema.build()?,
            loaded: false,
            changed: Vec::new(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether the login snapshot has arrived.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn property<P: ObservableProperty>(&self, key: PropertyKey) -> ProfileResult<&P> {
        self.profile.property(key)
    }

    /// Mutable access, for draining list and map notifications.
    pub fn property_mut<P: ObservableProperty>(&mut self, key: PropertyKey) -> ProfileResult<&mut P> {
        self.profile.property_mut(key)
    }

    pub fn on_snapshot(&mut self, payload: &[u8]) -> ProfileResult<ApplyReport> {
        let report = self.profile.decode_snapshot(payload)?;
        self.profile.clear_delta();
        self.loaded = true;
        self.record(&report);
        debug!("Loaded profile of {} ({} properties)", self.owner, report.applied.len());
        Ok(report)
    }

    /// Applies a delta batch. Deltas arriving before the snapshot are ignored;
    /// the snapshot already contains their effect.
    pub fn on_delta(&mut self, payload: &[u8]) -> ProfileResult<ApplyReport> {
        if !self.loaded {
            warn!("Delta for {} before its snapshot, ignoring", self.owner);
            return Ok(ApplyReport::default());
        }
        let report = self.profile.apply_batch_delta(payload)?;
        self.profile.clear_delta();
        for (key, err) in &report.rejected {
            warn!("Rejected change to property {}: {}", key, err);
        }
        self.record(&report);
        Ok(report)
    }

    fn record(&mut self, report: &ApplyReport) {
        for key in &report.applied {
            if !self.changed.contains(key) {
                self.changed.push(*key);
            }
        }
    }

    /// Keys changed since the last call, in first-change order.
    pub fn take_changed(&mut self) -> Vec<PropertyKey> {
        std::mem::take(&mut self.changed)
    }

    pub fn strings(&self) -> BTreeMap<PropertyKey, String> {
        self.profile.to_strings_dictionary()
    }
}
