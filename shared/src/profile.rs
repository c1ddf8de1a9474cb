//! Profile aggregate: an ordered set of observable properties
//!
//! The profile batches the changes of all its dirty properties into a single
//! message. Wire framing for both snapshots and delta batches:
//!
//! ```text
//! i32 propertyCount
//! repeated: i16 key | i32 payloadLength | payload bytes
//! ```
//!
//! Pending bookkeeping follows an explicit two step flush: encode a batch
//! (which returns a [`FlushTicket`]), hand the bytes to the transport, and only
//! once the transport confirmed the send call [`Profile::commit_flush`] with
//! that ticket.

use crate::codec::{WireReader, WireWriter};
use crate::error::{ProfileError, ProfileResult};
use crate::property::{DeltaMark, ObservableProperty, PreparedUpdate};
use crate::PropertyKey;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Record of what an encoded batch covered, used to commit it later
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushTicket {
    marks: Vec<(PropertyKey, DeltaMark)>,
}

impl FlushTicket {
    pub fn keys(&self) -> impl Iterator<Item = PropertyKey> + '_ {
        self.marks.iter().map(|(key, _)| *key)
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }
}

/// An encoded delta batch together with its commit ticket
#[derive(Debug, Clone)]
pub struct BatchDelta {
    pub payload: Vec<u8>,
    pub ticket: FlushTicket,
}

/// Outcome of applying a snapshot or delta batch
#[derive(Debug, Default, PartialEq)]
pub struct ApplyReport {
    /// Properties that received an update
    pub applied: Vec<PropertyKey>,
    /// Keys present in the payload but unknown to the local schema
    pub unknown: Vec<PropertyKey>,
    /// Individually rejected entries (the rest of the batch still applied)
    pub rejected: Vec<(PropertyKey, ProfileError)>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.unknown.is_empty() && self.rejected.is_empty()
    }
}

#[derive(Default)]
pub struct Profile {
    properties: BTreeMap<PropertyKey, Box<dyn ObservableProperty>>,
    pending: BTreeSet<PropertyKey>,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("properties", &self.properties.len())
            .field("pending", &self.pending)
            .finish()
    }
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property. Fails if its key is already registered.
    pub fn register<P: ObservableProperty>(&mut self, property: P) -> ProfileResult<()> {
        let key = property.key();
        if self.properties.contains_key(&key) {
            return Err(ProfileError::DuplicateKey { key });
        }
        self.properties.insert(key, Box::new(property));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn contains(&self, key: PropertyKey) -> bool {
        self.properties.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = PropertyKey> + '_ {
        self.properties.keys().copied()
    }

    /// Type-erased access, e.g. for diagnostics.
    pub fn get_property(&self, key: PropertyKey) -> ProfileResult<&dyn ObservableProperty> {
        self.properties
            .get(&key)
            .map(|p| p.as_ref())
            .ok_or(ProfileError::PropertyNotFound { key })
    }

    /// Typed read access to a property.
    pub fn property<P: ObservableProperty>(&self, key: PropertyKey) -> ProfileResult<&P> {
        let property = self.get_property(key)?;
        property
            .as_any()
            .downcast_ref::<P>()
            .ok_or(ProfileError::TypeMismatch {
                key,
                expected: std::any::type_name::<P>(),
            })
    }

    /// Typed write access to a property.
    ///
    /// Changes made through the returned reference are picked up as pending
    /// the next time the profile collects dirty properties. Prefer
    /// [`Profile::update`] which records the key immediately.
    pub fn property_mut<P: ObservableProperty>(&mut self, key: PropertyKey) -> ProfileResult<&mut P> {
        let property = self
            .properties
            .get_mut(&key)
            .ok_or(ProfileError::PropertyNotFound { key })?;
        property
            .as_any_mut()
            .downcast_mut::<P>()
            .ok_or(ProfileError::TypeMismatch {
                key,
                expected: std::any::type_name::<P>(),
            })
    }

    /// Runs `f` against a typed property and records it as pending if it
    /// became dirty.
    pub fn update<P, R, F>(&mut self, key: PropertyKey, f: F) -> ProfileResult<R>
    where
        P: ObservableProperty,
        F: FnOnce(&mut P) -> R,
    {
        let property = self.property_mut::<P>(key)?;
        let result = f(property);
        if property.is_dirty() {
            self.pending.insert(key);
        }
        Ok(result)
    }

    /// Moves every dirty property into the pending set. Returns the number of
    /// keys that were newly recorded.
    pub fn collect_dirty(&mut self) -> usize {
        let before = self.pending.len();
        for (key, property) in &self.properties {
            if property.is_dirty() {
                self.pending.insert(*key);
            }
        }
        self.pending.len() - before
    }

    pub fn has_dirty_properties(&self) -> bool {
        !self.pending.is_empty() || self.properties.values().any(|p| p.is_dirty())
    }

    pub fn pending_keys(&self) -> Vec<PropertyKey> {
        self.pending.iter().copied().collect()
    }

    /// Full-state encoding of every property, in key order.
    pub fn encode_snapshot(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_len(self.properties.len());
        for (key, property) in &self.properties {
            w.put_i16(*key);
            w.put_bytes(&property.encode_snapshot());
        }
        w.into_bytes()
    }

    /// Snapshot framing restricted to `keys`, skipping keys not registered.
    pub fn encode_partial_snapshot(&self, keys: &[PropertyKey]) -> Vec<u8> {
        let selected: Vec<_> = keys
            .iter()
            .filter_map(|key| self.properties.get(key).map(|property| (*key, property)))
            .collect();
        let mut w = WireWriter::new();
        w.put_len(selected.len());
        for (key, property) in selected {
            w.put_i16(key);
            w.put_bytes(&property.encode_snapshot());
        }
        w.into_bytes()
    }

    /// Replaces local values with a full snapshot.
    ///
    /// Entries with unknown keys are skipped. A structurally invalid payload
    /// is rejected before any property is touched.
    pub fn decode_snapshot(&mut self, payload: &[u8]) -> ProfileResult<ApplyReport> {
        let entries = parse_frame(payload)?;
        self.apply_entries(entries, |property, bytes| property.prepare_snapshot(bytes))
    }

    /// Encodes the deltas of all pending properties without clearing anything.
    pub fn encode_batch_delta(&mut self) -> BatchDelta {
        self.collect_dirty();
        // Iterate over a copy so the live set may change while encoding.
        let keys: Vec<PropertyKey> = self.pending.iter().copied().collect();

        let mut w = WireWriter::new();
        let mut marks = Vec::with_capacity(keys.len());
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            match self.properties.get(&key) {
                Some(property) => {
                    let (payload, mark) = property.encode_delta();
                    entries.push((key, payload));
                    marks.push((key, mark));
                }
                None => {
                    warn!("Pending key {} has no property; dropping it", key);
                    self.pending.remove(&key);
                }
            }
        }

        w.put_len(entries.len());
        for (key, payload) in &entries {
            w.put_i16(*key);
            w.put_bytes(payload);
        }
        BatchDelta {
            payload: w.into_bytes(),
            ticket: FlushTicket { marks },
        }
    }

    /// Declares a batch as sent: clears the covered changes and drops keys
    /// that have no newer changes from the pending set.
    pub fn commit_flush(&mut self, ticket: &FlushTicket) {
        for (key, mark) in &ticket.marks {
            if let Some(property) = self.properties.get_mut(key) {
                property.clear_delta_through(*mark);
                if !property.is_dirty() {
                    self.pending.remove(key);
                }
            }
        }
        debug!(
            "Committed flush of {} properties, {} still pending",
            ticket.marks.len(),
            self.pending.len()
        );
    }

    /// Discards every pending change.
    pub fn clear_delta(&mut self) {
        for property in self.properties.values_mut() {
            property.clear_delta();
        }
        self.pending.clear();
    }

    /// Applies a delta batch.
    ///
    /// The whole payload is parsed and every entry's delta decoded before any
    /// property is modified, so a malformed batch leaves the profile
    /// untouched. Repeated keys keep their last occurrence.
    pub fn apply_batch_delta(&mut self, payload: &[u8]) -> ProfileResult<ApplyReport> {
        let entries = parse_frame(payload)?;
        let report = self.apply_entries(entries, |property, bytes| property.prepare_delta(bytes))?;
        for key in &report.applied {
            if self.properties.get(key).is_some_and(|p| p.is_dirty()) {
                self.pending.insert(*key);
            }
        }
        Ok(report)
    }

    fn apply_entries<F>(&mut self, entries: BTreeMap<PropertyKey, &[u8]>, prepare: F) -> ProfileResult<ApplyReport>
    where
        F: Fn(&dyn ObservableProperty, &[u8]) -> ProfileResult<PreparedUpdate>,
    {
        let mut report = ApplyReport::default();
        let mut prepared = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            match self.properties.get(&key) {
                Some(property) => prepared.push((key, prepare(property.as_ref(), bytes)?)),
                None => {
                    warn!("{}", ProfileError::SchemaMismatch { key });
                    report.unknown.push(key);
                }
            }
        }

        for (key, update) in prepared {
            // Every prepared key was looked up above.
            let Some(property) = self.properties.get_mut(&key) else {
                continue;
            };
            match property.commit(update) {
                Ok(outcome) => {
                    report
                        .rejected
                        .extend(outcome.rejected.into_iter().map(|err| (key, err)));
                    report.applied.push(key);
                }
                Err(err) => {
                    warn!("Failed to apply property {}: {}", key, err);
                    report.rejected.push((key, err));
                }
            }
        }
        Ok(report)
    }

    /// String form of every property, for admin display.
    pub fn to_strings_dictionary(&self) -> BTreeMap<PropertyKey, String> {
        self.properties
            .iter()
            .map(|(key, property)| (*key, property.to_string_form()))
            .collect()
    }

    /// Imports string forms (admin tooling, config files).
    ///
    /// Unknown keys and unparsable values are reported per entry; the other
    /// entries still load.
    pub fn apply_strings_dictionary(&mut self, values: &BTreeMap<PropertyKey, String>) -> ApplyReport {
        let mut report = ApplyReport::default();
        for (key, value) in values {
            let Some(property) = self.properties.get_mut(key) else {
                report.unknown.push(*key);
                continue;
            };
            match property.load_string_form(value) {
                Ok(()) => {
                    if property.is_dirty() {
                        self.pending.insert(*key);
                    }
                    report.applied.push(*key);
                }
                Err(err) => report.rejected.push((*key, err)),
            }
        }
        report
    }
}

/// Parses the `count | (key, len, payload)*` framing into a key map.
///
/// Later occurrences of a key replace earlier ones.
fn parse_frame(payload: &[u8]) -> ProfileResult<BTreeMap<PropertyKey, &[u8]>> {
    let mut r = WireReader::new(payload);
    let count = r.get_len()?;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let key = r.get_i16()?;
        let bytes = r.get_bytes()?;
        entries.insert(key, bytes);
    }
    r.expect_end()?;
    Ok(entries)
}
