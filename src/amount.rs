//! Exact conversion of raw token integers into human-scale amounts.
//!
//! Index APIs report transfer values in the token's smallest unit as a decimal
//! string (`"5000000"` for 5 USDT on TRON, `"5000000000000000000"` for 5 USDT
//! on BSC). Dividing those by `10^decimals` in binary floating point loses
//! precision around the threshold, so everything here stays in decimal
//! arithmetic.

use std::fmt;
use std::str::FromStr;

use fastnum::UD256;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::error::AmountError;

/// Largest precision accepted from an index. 256-bit coefficients hold 77
/// significant digits, so nothing sensible needs more.
pub const MAX_DECIMALS: u32 = 77;

/// A non-negative token amount in whole-token units.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Amount(UD256);

impl Amount {
    pub const ZERO: Amount = Amount(UD256::ZERO);

    /// Parses a plain decimal such as `"5"` or `"12.50"`.
    pub fn parse(s: &str) -> Result<Self, AmountError> {
        let (int, frac) = match s.split_once('.') {
            Some((int, frac)) => (int, Some(frac)),
            None => (s, None),
        };
        if !is_digits(int) || frac.is_some_and(|f| !is_digits(f)) {
            return Err(AmountError::Invalid(s.to_string()));
        }
        from_decimal_str(s)
    }

    /// Renders with exactly `places` fractional digits, rounding half-up.
    pub fn to_fixed(&self, places: i16) -> String {
        self.0.rescale(places).to_string()
    }
}

impl From<UD256> for Amount {
    fn from(value: UD256) -> Self {
        Self(value)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

/// Always positional, never `1E-18`.
impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&positional(&self.0.to_string()))
    }
}

/// Rewrites scientific notation (`1.5E-7`, `2E+3`) as a plain decimal.
fn positional(s: &str) -> String {
    let Some((mantissa, exponent)) = s.split_once(|c| c == 'E' || c == 'e') else {
        return s.to_string();
    };
    let Ok(exponent) = exponent.parse::<i64>() else {
        return s.to_string();
    };
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let digits = format!("{int}{frac}");
    let point = int.len() as i64 + exponent;

    if point <= 0 {
        format!("0.{}{}", "0".repeat(point.unsigned_abs() as usize), digits)
    } else if point as usize >= digits.len() {
        format!("{}{}", digits, "0".repeat(point as usize - digits.len()))
    } else {
        let (int, frac) = digits.split_at(point as usize);
        format!("{int}.{frac}")
    }
}

/// Converts a raw integer value with `decimals` of precision into an [`Amount`].
pub fn normalize(raw_value: &str, decimals: u32) -> Result<Amount, AmountError> {
    if !is_digits(raw_value) {
        return Err(AmountError::Invalid(raw_value.to_string()));
    }
    if decimals > MAX_DECIMALS {
        return Err(AmountError::Precision(decimals));
    }

    let digits = raw_value.trim_start_matches('0');
    let scale = decimals as usize;
    let text = if scale == 0 {
        if digits.is_empty() { "0".to_string() } else { digits.to_string() }
    } else if digits.len() > scale {
        let (int, frac) = digits.split_at(digits.len() - scale);
        format!("{int}.{frac}")
    } else {
        format!("0.{digits:0>scale$}")
    };

    from_decimal_str(&text)
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn from_decimal_str(s: &str) -> Result<Amount, AmountError> {
    s.parse::<UD256>()
        .map(Amount)
        .map_err(|_| AmountError::OutOfRange(s.to_string()))
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl Visitor<'_> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative decimal amount")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                Amount::parse(v.trim()).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                Amount::parse(&v.to_string()).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
                if v < 0 {
                    return Err(E::custom(format!("amount must not be negative, got {v}")));
                }
                self.visit_u64(v as u64)
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom(format!("invalid amount {v}")));
                }
                // Display for f64 is the shortest round-trip form and never
                // uses an exponent
                Amount::parse(&v.to_string()).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}
