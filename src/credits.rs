//! Fixed-point credit amounts.
//!
//! Balances are metered in credits with milli-credit precision. Amounts are
//! never negative; subtraction is checked or saturating.

use std::fmt;
use std::ops::Add;

use serde::{Deserialize, Serialize};

const MILLIS_PER_CREDIT: u64 = 1000;

/// A non-negative amount of credits, stored as milli-credits.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "f64", into = "f64")]
pub struct Credits(u64);

impl Credits {
    pub const ZERO: Credits = Credits(0);

    /// Builds an amount from whole credits.
    pub const fn whole(credits: u64) -> Self {
        Self(credits * MILLIS_PER_CREDIT)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn millis(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_sub(self, rhs: Credits) -> Option<Credits> {
        self.0.checked_sub(rhs.0).map(Credits)
    }

    pub fn saturating_sub(self, rhs: Credits) -> Credits {
        Credits(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Credits {
    type Output = Credits;

    fn add(self, rhs: Credits) -> Credits {
        Credits(self.0.saturating_add(rhs.0))
    }
}

impl TryFrom<f64> for Credits {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value < 0.0 {
            return Err(format!("credit amount must be a non-negative number, got {value}"));
        }
        Ok(Credits((value * MILLIS_PER_CREDIT as f64).round() as u64))
    }
}

impl From<Credits> for f64 {
    fn from(value: Credits) -> f64 {
        value.0 as f64 / MILLIS_PER_CREDIT as f64
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:03}",
            self.0 / MILLIS_PER_CREDIT,
            self.0 % MILLIS_PER_CREDIT
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_three_decimals() {
        assert_eq!(Credits::whole(7).to_string(), "7.000");
        assert_eq!(Credits::from_millis(2500).to_string(), "2.500");
    }

    #[test]
    fn parses_fractional_and_integer_numbers() {
        assert_eq!(Credits::try_from(1.25).unwrap(), Credits::from_millis(1250));
        let parsed: Credits = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, Credits::whole(3));
    }

    #[test]
    fn rejects_negative_amounts() {
        assert!(Credits::try_from(-1.0).is_err());
        assert!(serde_json::from_str::<Credits>("-0.5").is_err());
    }

    #[test]
    fn subtraction_never_goes_negative() {
        let small = Credits::whole(1);
        let big = Credits::whole(2);
        assert_eq!(small.checked_sub(big), None);
        assert_eq!(small.saturating_sub(big), Credits::ZERO);
        assert_eq!(big.checked_sub(small), Some(small));
    }
}
