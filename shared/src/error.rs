//! Error taxonomy for the replication engine
//!
//! Decode-time structural errors (`MalformedPayload`) reject a whole incoming
//! batch, per-entry semantic errors (`OutOfRangeMutation`) only reject the
//! offending log entry, and unknown keys (`SchemaMismatch`) are skipped.

use crate::PropertyKey;
use thiserror::Error;

/// Result alias used throughout the shared crate.
pub type ProfileResult<T> = Result<T, ProfileError>;

/// Errors raised by observable properties and the profile aggregate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    /// An incoming entry referenced a key that the local schema does not know.
    #[error("schema mismatch: unknown property key {key}")]
    SchemaMismatch { key: PropertyKey },
    /// A property with the same key was already registered.
    #[error("property key {key} is already registered")]
    DuplicateKey { key: PropertyKey },
    /// The binary payload is truncated or structurally invalid.
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },
    /// A mutation addressed an index or key outside the collection.
    #[error("mutation out of range: {target} (collection size {len})")]
    OutOfRangeMutation { target: String, len: usize },
    /// Durable storage could not restore or persist a profile.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// No property is registered under this key.
    #[error("property {key} not found")]
    PropertyNotFound { key: PropertyKey },
    /// The property exists but is not of the requested type.
    #[error("property {key} is not a {expected}")]
    TypeMismatch {
        key: PropertyKey,
        expected: &'static str,
    },
    /// A string form could not be parsed into a value.
    #[error("invalid value {input:?}: {reason}")]
    InvalidValue { input: String, reason: String },
}

impl ProfileError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        ProfileError::MalformedPayload {
            reason: reason.into(),
        }
    }

    pub fn out_of_range(target: impl Into<String>, len: usize) -> Self {
        ProfileError::OutOfRangeMutation {
            target: target.into(),
            len,
        }
    }

    pub fn invalid_value(input: &str, reason: impl ToString) -> Self {
        ProfileError::InvalidValue {
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Structural errors abort the whole batch they were found in.
    pub fn is_structural(&self) -> bool {
        matches!(self, ProfileError::MalformedPayload { .. })
    }
}
