//! Key-indexed map property with an operation log
//!
//! Entries keep their insertion order (`IndexMap`), so snapshots and string
//! forms are deterministic and match the order in which keys were added.

use crate::codec::{UpdateOp, WireReader, WireValue, WireWriter};
use crate::error::{ProfileError, ProfileResult};
use crate::property::{
    downcast_update, DeltaMark, DeltaOutcome, LogEntry, ObservableProperty, PreparedUpdate, Revision,
};
use crate::PropertyKey;
use indexmap::IndexMap;
use log::warn;
use std::any::Any;
use std::hash::Hash;

/// A single replayable map mutation
#[derive(Debug, Clone, PartialEq)]
pub enum MapOp<K, V> {
    Set { key: K, value: V },
    Remove { key: K },
}

/// Local change notification, drained by the owner of the map
#[derive(Debug, Clone, PartialEq)]
pub enum MapEvent<K, V> {
    /// A new key was added.
    Added { key: K, value: V },
    /// An existing key got a new value.
    Set { key: K, value: V },
    Removed { key: K, value: V },
    Replaced,
}

enum MapUpdate<K, V> {
    Snapshot(Vec<(K, V)>),
    Delta(Vec<MapOp<K, V>>),
}

#[derive(Debug, Clone)]
pub struct ObservableMap<K: WireValue + Hash + Eq, V: WireValue> {
    key: PropertyKey,
    entries: IndexMap<K, V>,
    log: Vec<LogEntry<MapOp<K, V>>>,
    events: Vec<MapEvent<K, V>>,
    dirty: bool,
    revision: Revision,
}

impl<K: WireValue + Hash + Eq, V: WireValue> ObservableMap<K, V> {
    pub fn new(key: PropertyKey) -> Self {
        Self::with_entries(key, Vec::new())
    }

    /// Creates a clean map holding `entries`.
    pub fn with_entries(key: PropertyKey, entries: Vec<(K, V)>) -> Self {
        Self {
            key,
            entries: entries.into_iter().collect(),
            log: Vec::new(),
            events: Vec::new(),
            dirty: false,
            revision: Revision::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, K, V> {
        self.entries.iter()
    }

    pub fn pending_ops(&self) -> usize {
        self.log.len()
    }

    /// Inserts or replaces a value. Returns false when `key` already holds
    /// `value`.
    pub fn set(&mut self, key: K, value: V) -> bool {
        if self.entries.get(&key) == Some(&value) {
            return false;
        }
        // Set never fails.
        let _ = self.apply_op(MapOp::Set { key, value });
        true
    }

    /// Removes a key, returning its value. Missing keys record nothing.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.get(key).cloned()?;
        let _ = self.apply_op(MapOp::Remove { key: key.clone() });
        Some(value)
    }

    pub fn clear(&mut self) {
        let keys: Vec<K> = self.entries.keys().cloned().collect();
        for key in keys {
            let _ = self.apply_op(MapOp::Remove { key });
        }
    }

    pub fn drain_events(&mut self) -> Vec<MapEvent<K, V>> {
        std::mem::take(&mut self.events)
    }

    fn apply_op(&mut self, op: MapOp<K, V>) -> ProfileResult<()> {
        let event = match &op {
            MapOp::Set { key, value } => match self.entries.insert(key.clone(), value.clone()) {
                Some(_) => MapEvent::Set {
                    key: key.clone(),
                    value: value.clone(),
                },
                None => MapEvent::Added {
                    key: key.clone(),
                    value: value.clone(),
                },
            },
            MapOp::Remove { key } => match self.entries.shift_remove(key) {
                Some(value) => MapEvent::Removed {
                    key: key.clone(),
                    value,
                },
                None => {
                    return Err(ProfileError::out_of_range(
                        format!("key {}", key.to_wire_string()),
                        self.entries.len(),
                    ))
                }
            },
        };
        let revision = self.revision.bump();
        self.log.push(LogEntry { revision, op });
        self.events.push(event);
        self.dirty = true;
        Ok(())
    }

    fn replace_all(&mut self, entries: Vec<(K, V)>) {
        let old_keys: Vec<K> = self.entries.keys().cloned().collect();
        for key in old_keys {
            let revision = self.revision.bump();
            self.log.push(LogEntry {
                revision,
                op: MapOp::Remove { key },
            });
        }
        for (key, value) in &entries {
            let revision = self.revision.bump();
            self.log.push(LogEntry {
                revision,
                op: MapOp::Set {
                    key: key.clone(),
                    value: value.clone(),
                },
            });
        }
        self.revision.bump();
        self.entries = entries.into_iter().collect();
        self.events.push(MapEvent::Replaced);
        self.dirty = true;
    }

    fn encode_op(w: &mut WireWriter, op: &MapOp<K, V>) {
        match op {
            MapOp::Set { key, value } => {
                w.put_u8(UpdateOp::Set as u8);
                key.encode(w);
                value.encode(w);
            }
            MapOp::Remove { key } => {
                w.put_u8(UpdateOp::Remove as u8);
                key.encode(w);
            }
        }
    }

    fn decode_op(r: &mut WireReader<'_>) -> ProfileResult<MapOp<K, V>> {
        let op = UpdateOp::try_from(r.get_u8()?)?;
        let key = K::decode(r)?;
        Ok(match op {
            // Maps have no positional insert; treat it as a keyed set.
            UpdateOp::Set | UpdateOp::Insert => MapOp::Set {
                key,
                value: V::decode(r)?,
            },
            UpdateOp::Remove => MapOp::Remove { key },
        })
    }

    /// Decodes a delta payload into its operations without applying them.
    pub fn decode_delta(payload: &[u8]) -> ProfileResult<Vec<MapOp<K, V>>> {
        let mut r = WireReader::new(payload);
        let count = r.get_len()?;
        let mut ops = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            ops.push(Self::decode_op(&mut r)?);
        }
        r.expect_end()?;
        Ok(ops)
    }

    fn decode_entries(payload: &[u8]) -> ProfileResult<Vec<(K, V)>> {
        let mut r = WireReader::new(payload);
        let count = r.get_len()?;
        let mut entries = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            let key = K::decode(&mut r)?;
            let value = V::decode(&mut r)?;
            entries.push((key, value));
        }
        r.expect_end()?;
        Ok(entries)
    }
}

impl<K: WireValue + Hash + Eq, V: WireValue> ObservableProperty for ObservableMap<K, V> {
    fn key(&self) -> PropertyKey {
        self.key
    }

    fn type_name(&self) -> String {
        format!("map<{},{}>", K::TYPE_NAME, V::TYPE_NAME)
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn encode_snapshot(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_len(self.entries.len());
        for (key, value) in &self.entries {
            key.encode(&mut w);
            value.encode(&mut w);
        }
        w.into_bytes()
    }

    fn encode_delta(&self) -> (Vec<u8>, DeltaMark) {
        let mut w = WireWriter::new();
        w.put_len(self.log.len());
        for entry in &self.log {
            Self::encode_op(&mut w, &entry.op);
        }
        (w.into_bytes(), DeltaMark(self.revision.current()))
    }

    fn prepare_snapshot(&self, payload: &[u8]) -> ProfileResult<PreparedUpdate> {
        Ok(Box::new(MapUpdate::Snapshot(Self::decode_entries(payload)?)))
    }

    fn prepare_delta(&self, payload: &[u8]) -> ProfileResult<PreparedUpdate> {
        Ok(Box::new(MapUpdate::Delta(Self::decode_delta(payload)?)))
    }

    fn commit(&mut self, update: PreparedUpdate) -> ProfileResult<DeltaOutcome> {
        match downcast_update::<MapUpdate<K, V>>(self.key, update, "map")? {
            MapUpdate::Snapshot(entries) => {
                self.replace_all(entries);
                Ok(DeltaOutcome::single())
            }
            MapUpdate::Delta(ops) => {
                let mut outcome = DeltaOutcome::default();
                for op in ops {
                    match self.apply_op(op) {
                        Ok(()) => outcome.applied += 1,
                        Err(err) => {
                            warn!("Rejected map entry for property {}: {}", self.key, err);
                            outcome.rejected.push(err);
                        }
                    }
                }
                Ok(outcome)
            }
        }
    }

    fn clear_delta(&mut self) {
        self.log.clear();
        self.dirty = false;
    }

    fn clear_delta_through(&mut self, mark: DeltaMark) {
        self.log.retain(|entry| entry.revision > mark.0);
        self.dirty = self.dirty && (!self.log.is_empty() || self.revision.current() > mark.0);
    }

    fn to_string_form(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| format!("{}:{}", key.to_wire_string(), value.to_wire_string()))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn load_string_form(&mut self, input: &str) -> ProfileResult<()> {
        let mut entries = Vec::new();
        if !input.is_empty() {
            for pair in input.split(',') {
                let (key, value) = pair
                    .split_once(':')
                    .ok_or_else(|| ProfileError::invalid_value(pair, "expected key:value"))?;
                entries.push((K::parse_wire_string(key)?, V::parse_wire_string(value)?));
            }
        }
        self.replace_all(entries);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
