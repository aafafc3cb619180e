//! Byte offsets with a distinguished unknown value.
//!
//! Offsets flow through pointer arithmetic, memory objects and def-sites.
//! Arithmetic saturates: any operation touching [`Offset::UNKNOWN`] (or
//! overflowing `u64`) yields [`Offset::UNKNOWN`] again, so imprecision only
//! ever grows.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;

/// A non-negative byte offset, or unknown.
///
/// The unknown value is represented as `u64::MAX`; constructing an offset
/// with that raw value therefore yields the unknown offset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Offset(pub u64);

impl Offset {
    /// The distinguished unknown offset.
    pub const UNKNOWN: Offset = Offset(u64::MAX);
    pub const ZERO: Offset = Offset(0);

    pub fn new(value: u64) -> Offset {
        Offset(value)
    }

    pub fn is_unknown(self) -> bool {
        self == Offset::UNKNOWN
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The concrete value, or `None` when unknown.
    pub fn value(self) -> Option<u64> {
        if self.is_unknown() { None } else { Some(self.0) }
    }

    /// Saturating addition: unknown absorbs, overflow collapses to unknown.
    pub fn saturating_add(self, rhs: Offset) -> Offset {
        match (self.value(), rhs.value()) {
            (Some(a), Some(b)) => match a.checked_add(b) {
                Some(sum) if sum < u64::MAX => Offset(sum),
                _ => Offset::UNKNOWN,
            },
            _ => Offset::UNKNOWN,
        }
    }

    /// Whether `from <= self < to`.
    ///
    /// Conservatively true when the value or either bound is unknown.
    pub fn in_range(self, from: Offset, to: Offset) -> bool {
        match (self.value(), from.value(), to.value()) {
            (Some(v), Some(a), Some(b)) => a <= v && v < b,
            _ => true,
        }
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Offset {
        Offset(value)
    }
}

impl Add for Offset {
    type Output = Offset;

    fn add(self, rhs: Offset) -> Offset {
        self.saturating_add(rhs)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "?")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
