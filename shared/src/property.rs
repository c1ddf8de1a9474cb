//! The observable property capability
//!
//! Every property variant (scalar, list, map) implements
//! [`ObservableProperty`]. The trait is object safe so that a profile can hold
//! a heterogeneous, key-ordered collection of boxed properties.
//!
//! Incoming updates are applied in two phases. `prepare_*` fully decodes and
//! validates a payload without touching the property, `commit` applies a
//! prepared update. The profile prepares every entry of a batch before
//! committing any of them, which is what makes batch application all or
//! nothing for structural errors.

use crate::error::{ProfileError, ProfileResult};
use crate::PropertyKey;
use std::any::Any;
use std::fmt;

/// A decoded, validated update waiting to be committed to its property.
pub type PreparedUpdate = Box<dyn Any + Send>;

/// Revision marker captured when a delta is encoded.
///
/// Clearing a delta through a mark only forgets the changes that existed when
/// the mark was taken; anything mutated afterwards stays dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DeltaMark(pub u64);

/// Result of committing one property update
#[derive(Debug, Default, PartialEq)]
pub struct DeltaOutcome {
    /// Log entries (or whole values for scalars) that were applied
    pub applied: usize,
    /// Entries rejected individually, e.g. indices beyond the collection
    pub rejected: Vec<ProfileError>,
}

impl DeltaOutcome {
    pub fn single() -> Self {
        Self {
            applied: 1,
            rejected: Vec::new(),
        }
    }
}

pub trait ObservableProperty: Any + Send + Sync + fmt::Debug {
    fn key(&self) -> PropertyKey;

    /// Type name for diagnostics, e.g. `int` or `list<string>`.
    fn type_name(&self) -> String;

    /// True when the value changed since the last cleared delta.
    fn is_dirty(&self) -> bool;

    fn encode_snapshot(&self) -> Vec<u8>;

    /// Encodes the pending delta and returns the mark to clear through once
    /// the bytes were handed to the transport.
    fn encode_delta(&self) -> (Vec<u8>, DeltaMark);

    fn prepare_snapshot(&self, payload: &[u8]) -> ProfileResult<PreparedUpdate>;

    fn prepare_delta(&self, payload: &[u8]) -> ProfileResult<PreparedUpdate>;

    /// Applies an update produced by this property's `prepare_*` methods.
    fn commit(&mut self, update: PreparedUpdate) -> ProfileResult<DeltaOutcome>;

    /// Forgets every pending change.
    fn clear_delta(&mut self);

    /// Forgets the changes covered by `mark`, keeping later ones.
    fn clear_delta_through(&mut self, mark: DeltaMark);

    fn to_string_form(&self) -> String;

    fn load_string_form(&mut self, input: &str) -> ProfileResult<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Replaces the value with a full snapshot and marks the property dirty.
    fn decode_snapshot(&mut self, payload: &[u8]) -> ProfileResult<()> {
        let update = self.prepare_snapshot(payload)?;
        self.commit(update).map(|_| ())
    }

    /// Replays a delta against the local value.
    fn apply_delta(&mut self, payload: &[u8]) -> ProfileResult<DeltaOutcome> {
        let update = self.prepare_delta(payload)?;
        self.commit(update)
    }
}

/// Downcasts a prepared update, reporting a type mismatch instead of panicking.
pub(crate) fn downcast_update<U: 'static>(
    key: PropertyKey,
    update: PreparedUpdate,
    expected: &'static str,
) -> ProfileResult<U> {
    update
        .downcast::<U>()
        .map(|boxed| *boxed)
        .map_err(|_| ProfileError::TypeMismatch { key, expected })
}

/// Monotonic revision counter shared by all property variants.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Revision(u64);

impl Revision {
    pub(crate) fn bump(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    pub(crate) fn current(&self) -> u64 {
        self.0
    }
}

/// One recorded mutation of a collection, tagged with the revision that
/// produced it.
#[derive(Debug, Clone)]
pub(crate) struct LogEntry<Op> {
    pub(crate) revision: u64,
    pub(crate) op: Op,
}
