//! Token amount helpers.
//!
//! Amounts are `u128` base units. On the wire they travel as decimal
//! strings so JavaScript clients never lose precision.

use serde::{Deserialize, Deserializer, Serializer};

/// `#[serde(with = "as_string")]` adapter for `u128` fields.
pub mod as_string {
    use super::{Deserialize, Deserializer, Serializer};

    /// Serializes a `u128` as a decimal string.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Deserializes a `u128` from a decimal string.
    ///
    /// # Errors
    ///
    /// Fails if the string is not a valid unsigned integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parses a decimal or `0x`-prefixed hex amount as returned by chain APIs.
#[must_use]
pub fn parse_amount(raw: &str) -> Option<u128> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        if hex.is_empty() {
            return Some(0);
        }
        u128::from_str_radix(hex, 16).ok()
    } else {
        raw.parse().ok()
    }
}

/// Deserializes an amount that may be a JSON string (decimal or hex) or a
/// JSON number.
///
/// # Errors
///
/// Fails on anything that does not parse as an unsigned amount.
pub fn deserialize_flexible<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    match &value {
        serde_json::Value::String(s) => parse_amount(s),
        serde_json::Value::Number(n) => n.as_u64().map(u128::from),
        _ => None,
    }
    .ok_or_else(|| serde::de::Error::custom(format!("invalid amount: {value}")))
}
