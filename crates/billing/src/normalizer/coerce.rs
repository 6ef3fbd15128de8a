//! Lenient scalar coercion
//!
//! Providers send the same field as a string, integer, float or bool depending
//! on the delivery mode. Integers must fit in an `i32` and carry no fractional
//! part; anything else is rejected rather than truncated.

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoerceError {
    #[error("value {0} does not fit in a 32-bit integer")]
    Overflow(String),
    #[error("value {0} has a fractional part")]
    Fractional(String),
    #[error("value {0:?} is not a number")]
    NotNumeric(String),
    #[error("value {0:?} is not a timestamp")]
    NotTimestamp(String),
}

/// Coerce to `i32`; `Ok(None)` for null/empty
pub fn to_i32(value: &Value) -> Result<Option<i32>, CoerceError> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(i32::from(*b))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i32::try_from(i)
                    .map(Some)
                    .map_err(|_| CoerceError::Overflow(n.to_string()))
            } else if let Some(u) = n.as_u64() {
                i32::try_from(u)
                    .map(Some)
                    .map_err(|_| CoerceError::Overflow(n.to_string()))
            } else {
                float_to_i32(n.as_f64().unwrap_or(f64::NAN), &n.to_string()).map(Some)
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            if let Ok(i) = trimmed.parse::<i64>() {
                return i32::try_from(i)
                    .map(Some)
                    .map_err(|_| CoerceError::Overflow(trimmed.to_string()));
            }
            match trimmed.parse::<f64>() {
                Ok(f) => float_to_i32(f, trimmed).map(Some),
                Err(_) => match trimmed.to_ascii_lowercase().as_str() {
                    "true" => Ok(Some(1)),
                    "false" => Ok(Some(0)),
                    _ => Err(CoerceError::NotNumeric(trimmed.to_string())),
                },
            }
        }
        other => Err(CoerceError::NotNumeric(other.to_string())),
    }
}

fn float_to_i32(f: f64, raw: &str) -> Result<i32, CoerceError> {
    if !f.is_finite() {
        return Err(CoerceError::NotNumeric(raw.to_string()));
    }
    if f.fract() != 0.0 {
        return Err(CoerceError::Fractional(raw.to_string()));
    }
    if f < f64::from(i32::MIN) || f > f64::from(i32::MAX) {
        return Err(CoerceError::Overflow(raw.to_string()));
    }
    Ok(f as i32)
}

/// Coerce to `i64` (amounts in minor units)
pub fn to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Coerce to `bool`; unknown shapes are `None`
pub fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Coerce RFC 3339 strings or unix seconds to a timestamp
pub fn to_timestamp(value: &Value) -> Result<Option<OffsetDateTime>, CoerceError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(secs) = trimmed.parse::<i64>() {
                return from_unix(secs, trimmed).map(Some);
            }
            OffsetDateTime::parse(trimmed, &Rfc3339)
                .map(Some)
                .map_err(|_| CoerceError::NotTimestamp(trimmed.to_string()))
        }
        Value::Number(n) => match n.as_i64() {
            Some(secs) => from_unix(secs, &n.to_string()).map(Some),
            None => Err(CoerceError::NotTimestamp(n.to_string())),
        },
        other => Err(CoerceError::NotTimestamp(other.to_string())),
    }
}

fn from_unix(secs: i64, raw: &str) -> Result<OffsetDateTime, CoerceError> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|_| CoerceError::NotTimestamp(raw.to_string()))
}
