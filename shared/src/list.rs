//! Ordered list property with an operation log
//!
//! Every mutation is recorded as a [`ListOp`] so a delta only describes what
//! changed. Replaying a delta against a replica holding the same prior state
//! reproduces the source list exactly.

use crate::codec::{UpdateOp, WireReader, WireValue, WireWriter};
use crate::error::{ProfileError, ProfileResult};
use crate::property::{
    downcast_update, DeltaMark, DeltaOutcome, LogEntry, ObservableProperty, PreparedUpdate, Revision,
};
use crate::PropertyKey;
use log::warn;
use std::any::Any;

/// A single replayable list mutation
#[derive(Debug, Clone, PartialEq)]
pub enum ListOp<T> {
    /// Replaces the element at `index`; `index == len` appends.
    Set { index: usize, value: T },
    Remove { index: usize },
    Insert { index: usize, value: T },
}

/// Local change notification, drained by the owner of the list
#[derive(Debug, Clone, PartialEq)]
pub enum ListEvent<T> {
    Added { index: usize, value: T },
    Inserted { index: usize, value: T },
    Set { index: usize, value: T },
    Removed { index: usize, value: T },
    /// The whole list was replaced by a snapshot or string import.
    Replaced,
}

enum ListUpdate<T> {
    Snapshot(Vec<T>),
    Delta(Vec<ListOp<T>>),
}

#[derive(Debug, Clone)]
pub struct ObservableList<T: WireValue> {
    key: PropertyKey,
    items: Vec<T>,
    log: Vec<LogEntry<ListOp<T>>>,
    events: Vec<ListEvent<T>>,
    dirty: bool,
    revision: Revision,
}

impl<T: WireValue> ObservableList<T> {
    pub fn new(key: PropertyKey) -> Self {
        Self::with_items(key, Vec::new())
    }

    /// Creates a clean list holding `items`.
    pub fn with_items(key: PropertyKey, items: Vec<T>) -> Self {
        Self {
            key,
            items,
            log: Vec::new(),
            events: Vec::new(),
            dirty: false,
            revision: Revision::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.items.contains(value)
    }

    /// Number of queued log entries not yet cleared.
    pub fn pending_ops(&self) -> usize {
        self.log.len()
    }

    /// Appends a value at the end of the list.
    pub fn add(&mut self, value: T) {
        let index = self.items.len();
        // Set at len always appends.
        let _ = self.apply_op(ListOp::Set { index, value });
    }

    /// Appends every value in order; the first new index is the current length.
    pub fn add_range<I: IntoIterator<Item = T>>(&mut self, values: I) {
        for value in values {
            self.add(value);
        }
    }

    pub fn insert(&mut self, index: usize, value: T) -> ProfileResult<()> {
        self.apply_op(ListOp::Insert { index, value })
    }

    pub fn remove_at(&mut self, index: usize) -> ProfileResult<T> {
        let removed = self
            .items
            .get(index)
            .cloned()
            .ok_or_else(|| ProfileError::out_of_range(format!("index {}", index), self.items.len()))?;
        self.apply_op(ListOp::Remove { index })?;
        Ok(removed)
    }

    /// Replaces the element at `index`.
    ///
    /// `index == len` appends. Returns false when the element already holds
    /// `value`.
    pub fn set(&mut self, index: usize, value: T) -> ProfileResult<bool> {
        if self.items.get(index) == Some(&value) {
            return Ok(false);
        }
        self.apply_op(ListOp::Set { index, value })?;
        Ok(true)
    }

    /// Removes every element, recording one removal per element.
    pub fn clear(&mut self) {
        for index in (0..self.items.len()).rev() {
            let _ = self.apply_op(ListOp::Remove { index });
        }
    }

    /// Takes the queued change notifications.
    pub fn drain_events(&mut self) -> Vec<ListEvent<T>> {
        std::mem::take(&mut self.events)
    }

    /// Applies one operation, recording it in the log and the event queue.
    fn apply_op(&mut self, op: ListOp<T>) -> ProfileResult<()> {
        let len = self.items.len();
        let event = match &op {
            ListOp::Set { index, value } if *index < len => {
                self.items[*index] = value.clone();
                ListEvent::Set {
                    index: *index,
                    value: value.clone(),
                }
            }
            ListOp::Set { index, value } if *index == len => {
                self.items.push(value.clone());
                ListEvent::Added {
                    index: *index,
                    value: value.clone(),
                }
            }
            ListOp::Insert { index, value } if *index <= len => {
                self.items.insert(*index, value.clone());
                ListEvent::Inserted {
                    index: *index,
                    value: value.clone(),
                }
            }
            ListOp::Remove { index } if *index < len => {
                let value = self.items.remove(*index);
                ListEvent::Removed {
                    index: *index,
                    value,
                }
            }
            ListOp::Set { index, .. } | ListOp::Insert { index, .. } | ListOp::Remove { index } => {
                return Err(ProfileError::out_of_range(format!("index {}", index), len));
            }
        };
        let revision = self.revision.bump();
        self.log.push(LogEntry { revision, op });
        self.events.push(event);
        self.dirty = true;
        Ok(())
    }

    fn replace_all(&mut self, items: Vec<T>) {
        // Express the replacement as ops so downstream replicas can replay it.
        for index in (0..self.items.len()).rev() {
            let revision = self.revision.bump();
            self.log.push(LogEntry {
                revision,
                op: ListOp::Remove { index },
            });
        }
        for (index, value) in items.iter().enumerate() {
            let revision = self.revision.bump();
            self.log.push(LogEntry {
                revision,
                op: ListOp::Set {
                    index,
                    value: value.clone(),
                },
            });
        }
        self.revision.bump();
        self.items = items;
        self.events.push(ListEvent::Replaced);
        self.dirty = true;
    }

    fn encode_op(w: &mut WireWriter, op: &ListOp<T>) {
        match op {
            ListOp::Set { index, value } => {
                w.put_u8(UpdateOp::Set as u8);
                w.put_len(*index);
                value.encode(w);
            }
            ListOp::Remove { index } => {
                w.put_u8(UpdateOp::Remove as u8);
                w.put_len(*index);
            }
            ListOp::Insert { index, value } => {
                w.put_u8(UpdateOp::Insert as u8);
                w.put_len(*index);
                value.encode(w);
            }
        }
    }

    fn decode_op(r: &mut WireReader<'_>) -> ProfileResult<ListOp<T>> {
        let op = UpdateOp::try_from(r.get_u8()?)?;
        let index = r.get_len()?;
        Ok(match op {
            UpdateOp::Set => ListOp::Set {
                index,
                value: T::decode(r)?,
            },
            UpdateOp::Remove => ListOp::Remove { index },
            UpdateOp::Insert => ListOp::Insert {
                index,
                value: T::decode(r)?,
            },
        })
    }

    /// Decodes a delta payload into its operations without applying them.
    pub fn decode_delta(payload: &[u8]) -> ProfileResult<Vec<ListOp<T>>> {
        let mut r = WireReader::new(payload);
        let count = r.get_len()?;
        let mut ops = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            ops.push(Self::decode_op(&mut r)?);
        }
        r.expect_end()?;
        Ok(ops)
    }

    fn decode_items(payload: &[u8]) -> ProfileResult<Vec<T>> {
        let mut r = WireReader::new(payload);
        let count = r.get_len()?;
        let mut items = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            items.push(T::decode(&mut r)?);
        }
        r.expect_end()?;
        Ok(items)
    }
}

impl<T: WireValue> ObservableProperty for ObservableList<T> {
    fn key(&self) -> PropertyKey {
        self.key
    }

    fn type_name(&self) -> String {
        format!("list<{}>", T::TYPE_NAME)
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn encode_snapshot(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_len(self.items.len());
        for item in &self.items {
            item.encode(&mut w);
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
        Ok(Box::new(ListUpdate::Snapshot(Self::decode_items(payload)?)))
    }

    fn prepare_delta(&self, payload: &[u8]) -> ProfileResult<PreparedUpdate> {
        Ok(Box::new(ListUpdate::Delta(Self::decode_delta(payload)?)))
    }

    fn commit(&mut self, update: PreparedUpdate) -> ProfileResult<DeltaOutcome> {
        match downcast_update::<ListUpdate<T>>(self.key, update, "list")? {
            ListUpdate::Snapshot(items) => {
                self.replace_all(items);
                Ok(DeltaOutcome::single())
            }
            ListUpdate::Delta(ops) => {
                let mut outcome = DeltaOutcome::default();
                for op in ops {
                    match self.apply_op(op) {
                        Ok(()) => outcome.applied += 1,
                        Err(err) => {
                            warn!("Rejected list entry for property {}: {}", self.key, err);
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
        self.items
            .iter()
            .map(WireValue::to_wire_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn load_string_form(&mut self, input: &str) -> ProfileResult<()> {
        let items = if input.is_empty() {
            Vec::new()
        } else {
            input
                .split(',')
                .map(T::parse_wire_string)
                .collect::<ProfileResult<Vec<_>>>()?
        };
        self.replace_all(items);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
