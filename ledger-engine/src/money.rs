//! Decimal money helpers.
//!
//! Every monetary computation in the engine stays in `Decimal` space; the
//! only place amounts become integers is the gateway boundary, which deals
//! in minor units (cents) rounded half-up to two decimal places.

use anyhow::anyhow;
use ledger_core::error::LedgerError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Round to two decimal places, half-up.
pub fn round_to_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert a decimal amount to integer minor units (cents).
///
/// Gateway boundary only; rounds half-up to cents first.
pub fn to_minor_units(amount: Decimal) -> Result<i64, LedgerError> {
    let cents = round_to_cents(amount) * Decimal::ONE_HUNDRED;
    cents
        .to_i64()
        .ok_or_else(|| LedgerError::InvalidInput(anyhow!("amount {} out of range", amount)))
}

/// Convert integer minor units (cents) back to a decimal amount.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn rounds_half_up() {
        assert_eq!(round_to_cents(dec("2.005")), dec("2.01"));
        assert_eq!(round_to_cents(dec("2.004")), dec("2.00"));
        assert_eq!(round_to_cents(dec("3.195")), dec("3.20"));
    }

    #[test]
    fn minor_unit_round_trip() {
        assert_eq!(to_minor_units(dec("100.00")).unwrap(), 10000);
        assert_eq!(to_minor_units(dec("0.01")).unwrap(), 1);
        assert_eq!(from_minor_units(25425), dec("254.25"));
    }

    #[test]
    fn minor_units_round_before_scaling() {
        // 19.999 -> 20.00 -> 2000, not 1999
        assert_eq!(to_minor_units(dec("19.999")).unwrap(), 2000);
    }
}
