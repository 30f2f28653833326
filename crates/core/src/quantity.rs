//! Non-negative stock quantity.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Integer quantity, non-negative by construction.
///
/// Arithmetic returns new values; `subtract` fails with
/// [`DomainError::InsufficientQuantity`] instead of going below zero.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Quantity(u64);

impl ValueObject for Quantity {}

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Build from a signed integer, rejecting negatives.
    pub fn try_from_signed(value: i64) -> DomainResult<Self> {
        u64::try_from(value)
            .map(Self)
            .map_err(|_| DomainError::invalid_argument(format!("quantity cannot be negative: {value}")))
    }

    /// Magnitude of a signed delta.
    pub fn from_signed_abs(delta: i64) -> Self {
        Self(delta.unsigned_abs())
    }

    /// Build a strictly positive quantity (movement and line amounts).
    pub fn positive(value: u64) -> DomainResult<Self> {
        if value == 0 {
            return Err(DomainError::invalid_argument("quantity must be positive"));
        }
        Ok(Self(value))
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Signed view, saturating at `i64::MAX`.
    pub fn as_signed(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn add(self, other: Quantity) -> DomainResult<Quantity> {
        self.0
            .checked_add(other.0)
            .map(Quantity)
            .ok_or_else(|| DomainError::invariant("quantity overflow"))
    }

    pub fn subtract(self, other: Quantity) -> DomainResult<Quantity> {
        self.0
            .checked_sub(other.0)
            .map(Quantity)
            .ok_or_else(|| DomainError::insufficient(self.0, other.0))
    }

    /// `self - other` as a signed difference.
    pub fn signed_difference(self, other: Quantity) -> i64 {
        self.as_signed() - other.as_signed()
    }
}

impl core::fmt::Display for Quantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for Quantity {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<u32> for Quantity {
    fn from(value: u32) -> Self {
        Self(u64::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtract_below_zero_is_insufficient() {
        let err = Quantity::new(3).subtract(Quantity::new(5)).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientQuantity {
                available: 3,
                requested: 5
            }
        );
    }

    #[test]
    fn arithmetic_returns_new_values() {
        let q = Quantity::new(10);
        let more = q.add(Quantity::new(5)).unwrap();
        assert_eq!(q.value(), 10);
        assert_eq!(more.value(), 15);
        assert!(more.subtract(Quantity::new(15)).unwrap().is_zero());
    }

    #[test]
    fn signed_helpers() {
        assert!(Quantity::try_from_signed(-1).is_err());
        assert_eq!(Quantity::try_from_signed(7).unwrap().value(), 7);
        assert_eq!(Quantity::from_signed_abs(-5).value(), 5);
        assert_eq!(Quantity::new(45).signed_difference(Quantity::new(50)), -5);
        assert!(Quantity::positive(0).is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: subtract either yields a non-negative value or fails, and never
            /// changes the receiver.
            #[test]
            fn subtract_never_goes_negative(a in 0u64..1_000_000, b in 0u64..1_000_000) {
                let qa = Quantity::new(a);
                match qa.subtract(Quantity::new(b)) {
                    Ok(r) => {
                        prop_assert!(b <= a);
                        prop_assert_eq!(r.value(), a - b);
                    }
                    Err(DomainError::InsufficientQuantity { available, requested }) => {
                        prop_assert!(b > a);
                        prop_assert_eq!(available, a);
                        prop_assert_eq!(requested, b);
                    }
                    Err(other) => prop_assert!(false, "unexpected error {other:?}"),
                }
                prop_assert_eq!(qa.value(), a);
            }

            #[test]
            fn add_then_subtract_is_identity(a in 0u64..1_000_000, b in 0u64..1_000_000) {
                let sum = Quantity::new(a).add(Quantity::new(b)).unwrap();
                prop_assert_eq!(sum.subtract(Quantity::new(b)).unwrap(), Quantity::new(a));
            }
        }
    }
}
