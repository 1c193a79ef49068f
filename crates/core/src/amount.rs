//! Fixed-point token amounts
//!
//! Prices and payment increments are carried as signed integers scaled by
//! 10^8, so sums and per-byte pricing never go through floating point.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Result, TollwayError};

/// Number of fractional decimal digits in an [`Amount`]
pub const AMOUNT_DECIMALS: u32 = 8;

const SCALE: i64 = 100_000_000;

/// Bytes in one MiB; prices are quoted per MiB of downstream traffic
pub const BYTES_PER_MEBIBYTE: u64 = 1_048_576;

/// Fixed-point amount with eight decimal places
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Build an amount from raw 1e-8 units
    pub const fn from_units(units: i64) -> Self {
        Self(units)
    }

    /// Raw 1e-8 units
    pub const fn units(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Amount owed for `bytes` of traffic at `price` per MiB.
    ///
    /// Truncates toward zero; saturates at the `i64` bounds.
    pub fn per_mebibyte(price: Amount, bytes: u64) -> Amount {
        let owed = i128::from(price.0) * i128::from(bytes) / i128::from(BYTES_PER_MEBIBYTE);
        Amount(owed.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64)
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }
}

impl FromStr for Amount {
    type Err = TollwayError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TollwayError::InvalidAmount(s.to_string());
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let (negative, digits) = match trimmed.as_bytes()[0] {
            b'-' => (true, &trimmed[1..]),
            b'+' => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };

        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if frac.len() > AMOUNT_DECIMALS as usize {
            return Err(invalid());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let whole_units: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut frac_units: i64 = 0;
        for (i, b) in frac.bytes().enumerate() {
            frac_units += i64::from(b - b'0') * 10_i64.pow(AMOUNT_DECIMALS - 1 - i as u32);
        }

        let units = whole_units
            .checked_mul(SCALE)
            .and_then(|w| w.checked_add(frac_units))
            .ok_or_else(invalid)?;

        Ok(Amount(if negative { -units } else { units }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / SCALE as u64;
        let frac = abs % SCALE as u64;
        if frac == 0 {
            return write!(f, "{}{}", sign, whole);
        }
        let frac = format!("{:08}", frac);
        write!(f, "{}{}.{}", sign, whole, frac.trim_end_matches('0'))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
