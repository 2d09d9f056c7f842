//! Fixed-Point Token Units
//!
//! Converts between human-readable decimal amounts ("100", "0.01") and the
//! integer base units used at the contract boundary. The fund token and the
//! native currency both use 18 decimal places.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Decimal places used by every amount crossing the contract boundary
pub const DECIMALS: u32 = 18;

/// Largest decimals value representable in a u128 scale factor
const MAX_DECIMALS: u32 = 38;

/// An exact token amount in base units (amount * 10^18)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BaseUnits(u128);

impl BaseUnits {
    pub const ZERO: BaseUnits = BaseUnits(0);

    /// Wrap a raw base-unit integer
    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    /// Raw base-unit integer
    pub const fn raw(self) -> u128 {
        self.0
    }

    /// Parse a decimal amount such as "100" or "0.01"
    pub fn parse(amount: &str) -> Result<Self, UnitsError> {
        parse_units(amount, DECIMALS).map(Self)
    }

    /// Whole token amount (e.g. `from_whole(100)` is 100.0 tokens)
    pub fn from_whole(tokens: u64) -> Self {
        Self(tokens as u128 * scale(DECIMALS))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Lossy conversion for display and percentage math
    pub fn to_f64(self) -> f64 {
        let scale = scale(DECIMALS);
        (self.0 / scale) as f64 + (self.0 % scale) as f64 / scale as f64
    }

    pub fn checked_add(self, other: BaseUnits) -> Option<BaseUnits> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: BaseUnits) -> Option<BaseUnits> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(self, other: BaseUnits) -> BaseUnits {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: BaseUnits) -> BaseUnits {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for BaseUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_units(self.0, DECIMALS))
    }
}

impl FromStr for BaseUnits {
    type Err = UnitsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Amounts travel as decimal strings so JSON consumers never see a lossy float.
impl Serialize for BaseUnits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BaseUnits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BaseUnits::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn scale(decimals: u32) -> u128 {
    10u128.pow(decimals)
}

/// Convert a decimal string into base units with `decimals` fractional places.
///
/// More fractional digits than `decimals` is an error rather than a silent
/// truncation.
pub fn parse_units(amount: &str, decimals: u32) -> Result<u128, UnitsError> {
    if decimals > MAX_DECIMALS {
        return Err(UnitsError::UnsupportedDecimals(decimals));
    }

    let amount = amount.trim();
    if amount.is_empty() {
        return Err(UnitsError::Empty);
    }
    if amount.starts_with('-') {
        return Err(UnitsError::Negative(amount.to_string()));
    }
    let amount = amount.strip_prefix('+').unwrap_or(amount);

    let (whole, fraction) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(UnitsError::Invalid(amount.to_string()));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(UnitsError::Invalid(amount.to_string()));
    }
    if fraction.len() > decimals as usize {
        return Err(UnitsError::TooManyDecimals {
            value: amount.to_string(),
            decimals,
        });
    }

    let whole_value: u128 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| UnitsError::Overflow(amount.to_string()))?
    };

    let fraction_value: u128 = if fraction.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", fraction, width = decimals as usize);
        padded
            .parse()
            .map_err(|_| UnitsError::Invalid(amount.to_string()))?
    };

    whole_value
        .checked_mul(scale(decimals))
        .and_then(|v| v.checked_add(fraction_value))
        .ok_or_else(|| UnitsError::Overflow(amount.to_string()))
}

/// Convert base units back into a minimal decimal string ("100", "0.01", "0")
pub fn format_units(value: u128, decimals: u32) -> String {
    let decimals = decimals.min(MAX_DECIMALS);
    if decimals == 0 {
        return value.to_string();
    }

    let scale = scale(decimals);
    let whole = value / scale;
    let fraction = value % scale;

    if fraction == 0 {
        return whole.to_string();
    }

    let fraction = format!("{:0>width$}", fraction, width = decimals as usize);
    format!("{}.{}", whole, fraction.trim_end_matches('0'))
}

/// Errors produced while converting amounts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitsError {
    #[error("Amount is empty")]
    Empty,

    #[error("Amount must not be negative: {0}")]
    Negative(String),

    #[error("Invalid decimal amount: {0}")]
    Invalid(String),

    #[error("Amount {value} has more than {decimals} decimal places")]
    TooManyDecimals { value: String, decimals: u32 },

    #[error("Amount out of range: {0}")]
    Overflow(String),

    #[error("Unsupported decimals: {0}")]
    UnsupportedDecimals(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_whole_and_fractional() {
        assert_eq!(BaseUnits::parse("1").unwrap().raw(), 1_000_000_000_000_000_000);
        assert_eq!(BaseUnits::parse("1.5").unwrap().raw(), 1_500_000_000_000_000_000);
        assert_eq!(BaseUnits::parse("0.01").unwrap().raw(), 10_000_000_000_000_000);
        assert_eq!(BaseUnits::parse(".5").unwrap().raw(), 500_000_000_000_000_000);
        assert_eq!(BaseUnits::parse("0.000000000000000001").unwrap().raw(), 1);
    }

    #[test]
    fn test_display_round_trip() {
        for amount in ["10", "0.01", "1000000", "2.5", "123.456789"] {
            let units = BaseUnits::parse(amount).unwrap();
            assert_eq!(units.to_string(), amount);
        }
    }

    #[test]
    fn test_round_trip_display_precision() {
        for amount in ["10", "0.01", "1000000"] {
            let back = BaseUnits::parse(amount).unwrap().to_f64();
            let original: f64 = amount.parse().unwrap();
            assert_eq!(format!("{:.2}", back), format!("{:.2}", original));
        }
    }

    #[test]
    fn test_zero_formats_as_zero() {
        assert_eq!(BaseUnits::ZERO.to_string(), "0");
        assert_eq!(BaseUnits::parse("0.0").unwrap(), BaseUnits::ZERO);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(BaseUnits::parse(""), Err(UnitsError::Empty));
        assert!(matches!(BaseUnits::parse("-1"), Err(UnitsError::Negative(_))));
        assert!(matches!(BaseUnits::parse("abc"), Err(UnitsError::Invalid(_))));
        assert!(matches!(BaseUnits::parse("1.2.3"), Err(UnitsError::Invalid(_))));
        assert!(matches!(BaseUnits::parse("1e-7"), Err(UnitsError::Invalid(_))));
        assert!(matches!(BaseUnits::parse("."), Err(UnitsError::Invalid(_))));
    }

    #[test]
    fn test_rejects_excess_precision() {
        let err = BaseUnits::parse("0.0000000000000000001").unwrap_err();
        assert!(matches!(err, UnitsError::TooManyDecimals { decimals: 18, .. }));
    }

    #[test]
    fn test_overflow() {
        let huge = "1".repeat(40);
        assert!(matches!(BaseUnits::parse(&huge), Err(UnitsError::Overflow(_))));
    }

    #[test]
    fn test_other_decimals() {
        assert_eq!(parse_units("1.25", 6).unwrap(), 1_250_000);
        assert_eq!(format_units(1_250_000, 6), "1.25");
        assert_eq!(format_units(42, 0), "42");
        assert!(parse_units("1", 39).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let units = BaseUnits::parse("12.5").unwrap();
        let json = serde_json::to_string(&units).unwrap();
        assert_eq!(json, "\"12.5\"");
        let back: BaseUnits = serde_json::from_str(&json).unwrap();
        assert_eq!(back, units);
    }

    #[test]
    fn test_arithmetic() {
        let a = BaseUnits::from_whole(10);
        let b = BaseUnits::parse("2.5").unwrap();
        assert_eq!(a.checked_sub(b).unwrap().to_string(), "7.5");
        assert_eq!(b.saturating_sub(a), BaseUnits::ZERO);
        assert_eq!(a.checked_add(b).unwrap().to_string(), "12.5");
    }
}
