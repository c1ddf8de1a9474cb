//! Scalar observable properties
//!
//! A scalar's delta is its whole value, so encoding a delta and a snapshot
//! produce identical bytes and there is no log to clear.

use crate::codec::{WireReader, WireValue, WireWriter};
use crate::error::{ProfileError, ProfileResult};
use crate::property::{downcast_update, DeltaMark, DeltaOutcome, ObservableProperty, PreparedUpdate, Revision};
use crate::PropertyKey;
use std::any::Any;
use time::OffsetDateTime;

/// Typed, dirty-tracked single value
#[derive(Debug, Clone)]
pub struct Observable<T: WireValue> {
    key: PropertyKey,
    value: T,
    dirty: bool,
    revision: Revision,
}

pub type ObservableBool = Observable<bool>;
pub type ObservableInt = Observable<i32>;
pub type ObservableLong = Observable<i64>;
pub type ObservableFloat = Observable<f32>;
pub type ObservableDouble = Observable<f64>;
pub type ObservableString = Observable<String>;
pub type ObservableDateTime = Observable<OffsetDateTime>;

impl<T: WireValue> Observable<T> {
    /// Creates a clean property holding `initial`.
    pub fn new(key: PropertyKey, initial: T) -> Self {
        Self {
            key,
            value: initial,
            dirty: false,
            revision: Revision::default(),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Replaces the value when it differs from the current one.
    ///
    /// Returns true if the property became dirty. Setting the current value
    /// again is a no-op and produces no flush traffic.
    pub fn set(&mut self, value: T) -> bool {
        if self.value == value {
            return false;
        }
        self.replace(value);
        true
    }

    fn replace(&mut self, value: T) {
        self.value = value;
        self.dirty = true;
        self.revision.bump();
    }

    fn encode_value(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(8);
        self.value.encode(&mut w);
        w.into_bytes()
    }

    fn decode_value(payload: &[u8]) -> ProfileResult<T> {
        let mut r = WireReader::new(payload);
        let value = T::decode(&mut r)?;
        r.expect_end()?;
        Ok(value)
    }
}

/// Numeric element types that support bounded arithmetic helpers
pub trait BoundedNumeric: WireValue + PartialOrd + Copy {
    fn checked_plus(self, rhs: Self) -> Option<Self>;
    fn checked_minus(self, rhs: Self) -> Option<Self>;
}

macro_rules! bounded_integer {
    ($ty:ty) => {
        impl BoundedNumeric for $ty {
            fn checked_plus(self, rhs: Self) -> Option<Self> {
                self.checked_add(rhs)
            }

            fn checked_minus(self, rhs: Self) -> Option<Self> {
                self.checked_sub(rhs)
            }
        }
    };
}

macro_rules! bounded_float {
    ($ty:ty) => {
        impl BoundedNumeric for $ty {
            fn checked_plus(self, rhs: Self) -> Option<Self> {
                let result = self + rhs;
                result.is_finite().then_some(result)
            }

            fn checked_minus(self, rhs: Self) -> Option<Self> {
                let result = self - rhs;
                result.is_finite().then_some(result)
            }
        }
    };
}

bounded_integer!(i32);
bounded_integer!(i64);
bounded_float!(f32);
bounded_float!(f64);

impl<T: BoundedNumeric> Observable<T> {
    /// Adds `amount` unless the result would exceed `max`.
    ///
    /// Returns false and leaves the value untouched when the bound (or the
    /// type's own range) would be crossed.
    pub fn add(&mut self, amount: T, max: T) -> bool {
        match self.value.checked_plus(amount) {
            Some(next) if next <= max => {
                self.set(next);
                true
            }
            _ => false,
        }
    }

    /// Subtracts `amount` unless the result would drop below `min`.
    pub fn subtract(&mut self, amount: T, min: T) -> bool {
        match self.value.checked_minus(amount) {
            Some(next) if next >= min => {
                self.set(next);
                true
            }
            _ => false,
        }
    }
}

impl<T: WireValue> ObservableProperty for Observable<T> {
    fn key(&self) -> PropertyKey {
        self.key
    }

    fn type_name(&self) -> String {
        T::TYPE_NAME.to_string()
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn encode_snapshot(&self) -> Vec<u8> {
        self.encode_value()
    }

    fn encode_delta(&self) -> (Vec<u8>, DeltaMark) {
        (self.encode_value(), DeltaMark(self.revision.current()))
    }

    fn prepare_snapshot(&self, payload: &[u8]) -> ProfileResult<PreparedUpdate> {
        Ok(Box::new(Self::decode_value(payload)?))
    }

    fn prepare_delta(&self, payload: &[u8]) -> ProfileResult<PreparedUpdate> {
        self.prepare_snapshot(payload)
    }

    fn commit(&mut self, update: PreparedUpdate) -> ProfileResult<DeltaOutcome> {
        let value = downcast_update::<T>(self.key, update, T::TYPE_NAME)?;
        self.replace(value);
        Ok(DeltaOutcome::single())
    }

    fn clear_delta(&mut self) {
        self.dirty = false;
    }

    fn clear_delta_through(&mut self, mark: DeltaMark) {
        if self.revision.current() <= mark.0 {
            self.dirty = false;
        }
    }

    fn to_string_form(&self) -> String {
        self.value.to_wire_string()
    }

    fn load_string_form(&mut self, input: &str) -> ProfileResult<()> {
        let value = T::parse_wire_string(input)?;
        self.set(value);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<T: WireValue> PartialEq<T> for Observable<T> {
    fn eq(&self, other: &T) -> bool {
        &self.value == other
    }
}

/// Helper for callers that only hold a type-erased property.
pub fn scalar_value<T: WireValue>(property: &dyn ObservableProperty) -> ProfileResult<&T> {
    property
        .as_any()
        .downcast_ref::<Observable<T>>()
        .map(Observable::get)
        .ok_or(ProfileError::TypeMismatch {
            key: property.key(),
            expected: T::TYPE_NAME,
        })
}
