//! Money handling in integer centavos.
//!
//! Amounts travel as plain decimal reais (`150.00`) on every wire we touch,
//! but all arithmetic happens on integer cents so splits can be made exact.

use crate::errors::AppError;
use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Amount of money in centavos (BRL minor units).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cents(pub i64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    /// Parses a decimal reais string such as `"150"`, `"150.5"` or `"150.00"`.
    ///
    /// Rejects non-numeric input, non-positive values and more than two
    /// fractional digits.
    pub fn parse_positive(raw: &str) -> Result<Self, AppError> {
        let trimmed = raw.trim();
        let value = BigDecimal::from_str(trimmed)
            .map_err(|_| AppError::InvalidAmount(format!("'{}' is not a number", trimmed)))?;
        let cents = Self::from_decimal(&value)?;
        if cents.0 <= 0 {
            return Err(AppError::InvalidAmount(format!(
                "amount must be positive, got {}",
                trimmed
            )));
        }
        Ok(cents)
    }

    /// Converts an exact decimal into cents, refusing sub-cent precision.
    pub fn from_decimal(value: &BigDecimal) -> Result<Self, AppError> {
        let scaled = value * BigDecimal::from(100);
        if !scaled.is_integer() {
            return Err(AppError::InvalidAmount(format!(
                "{} has more than two decimal places",
                value
            )));
        }
        scaled
            .to_i64()
            .map(Cents)
            .ok_or_else(|| AppError::InvalidAmount(format!("{} is out of range", value)))
    }

    /// Decimal reais with two fractional digits, for NUMERIC columns.
    pub fn to_decimal(self) -> BigDecimal {
        BigDecimal::new(self.0.into(), 2)
    }

    /// Reais as a float, only for JSON payloads sent to external APIs.
    pub fn as_reais_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl From<Cents> for BigDecimal {
    fn from(value: Cents) -> Self {
        value.to_decimal()
    }
}

impl TryFrom<&BigDecimal> for Cents {
    type Error = AppError;

    fn try_from(value: &BigDecimal) -> Result<Self, Self::Error> {
        if value.is_zero() {
            return Ok(Cents::ZERO);
        }
        Cents::from_decimal(value)
    }
}

/// Serialized as a JSON number in reais (`75.0`), like the gateway expects.
impl Serialize for Cents {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_reais_f64())
    }
}

/// Accepts a JSON number or numeric string in reais.
impl<'de> Deserialize<'de> for Cents {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        let text = match &raw {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s.clone(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected a decimal amount, got {}",
                    other
                )))
            }
        };
        let value = BigDecimal::from_str(text.trim()).map_err(serde::de::Error::custom)?;
        Cents::from_decimal(&value).map_err(serde::de::Error::custom)
    }
}

/// For nullable price columns: `null` reads as zero.
pub fn zero_if_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Cents, D::Error> {
    Ok(Option::<Cents>::deserialize(deserializer)?.unwrap_or(Cents::ZERO))
}
