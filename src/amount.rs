use std::fmt;

use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::Serialize;
use thiserror::Error;

/// Largest minor-unit exponent accepted when converting decimal amounts.
pub const MAX_EXPONENT: u32 = 18;

/// Strictly positive quantity of the smallest currency unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Amount(i64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("Amount must be greater than zero, got {0}")]
    NotPositive(i64),
    #[error("Amount {value} has more than {exponent} fractional digits")]
    TooPrecise { value: Decimal, exponent: u32 },
    #[error("Amount {0} does not fit into minor units")]
    OutOfRange(Decimal),
    #[error("Currency exponent {0} exceeds the maximum of {MAX_EXPONENT}")]
    UnsupportedExponent(u32),
}

impl Amount {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = AmountError;

    fn try_from(minor: i64) -> Result<Self, Self::Error> {
        if minor > 0 {
            Ok(Self(minor))
        } else {
            Err(AmountError::NotPositive(minor))
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Converts a decimal amount in major units (e.g. `12.50`) into minor units.
///
/// The sign is preserved: rejecting non-positive amounts is the ledger's job, not the
/// converter's.
pub fn to_minor_units(value: Decimal, exponent: u32) -> Result<i64, AmountError> {
    if exponent > MAX_EXPONENT {
        return Err(AmountError::UnsupportedExponent(exponent));
    }
    let scaled = value
        .checked_mul(Decimal::from(10i64.pow(exponent)))
        .ok_or(AmountError::OutOfRange(value))?;
    if !scaled.fract().is_zero() {
        return Err(AmountError::TooPrecise { value, exponent });
    }
    scaled.to_i64().ok_or(AmountError::OutOfRange(value))
}

/// Inverse of [`to_minor_units`], keeping `exponent` fractional digits.
pub fn to_major_units(minor: i64, exponent: u32) -> Decimal {
    Decimal::new(minor, exponent)
}
