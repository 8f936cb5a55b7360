//! Field extraction from strategy params blobs.
//!
//! Params are stored as a JSON object per strategy and re-hydrate the
//! whole contract. Extraction is field-by-field so that a malformed blob
//! surfaces a precise construction error instead of a serde panic deep
//! inside the runner.
//!
//! Prices are accepted both as JSON numbers and as stringified decimals:
//! the engine writes decimals back as strings, while hand-written blobs
//! usually carry plain numbers.

use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use thiserror::Error;

/// Fallback datetime format for hand-written params (interpreted as UTC).
const NAIVE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A params object (JSON map).
pub type Params = Map<String, Value>;

/// Construction error for triggers, orders, and contracts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    #[error("'{0}' is missing")]
    MissingField(String),

    #[error("'{0}' is missing or has the wrong type")]
    BadType(String),

    #[error("'{key}' value '{value}' not supported")]
    Unsupported { key: String, value: String },

    #[error("'time_1' must be earlier than 'time_2'")]
    BadOrdering,

    #[error("'{key}' must be greater than or equal to 0")]
    Negative { key: String },
}

impl ParamsError {
    pub fn unsupported(key: &str, value: impl Into<String>) -> Self {
        ParamsError::Unsupported {
            key: key.to_string(),
            value: value.into(),
        }
    }
}

/// Required nested object.
pub fn object<'a>(params: &'a Params, key: &str) -> Result<&'a Params, ParamsError> {
    match params.get(key) {
        None => Err(ParamsError::MissingField(key.to_string())),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(ParamsError::BadType(key.to_string())),
    }
}

/// Optional nested object. Absent keys yield `None`; present keys must
/// be objects.
pub fn optional_object<'a>(
    params: &'a Params,
    key: &str,
) -> Result<Option<&'a Params>, ParamsError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(ParamsError::BadType(key.to_string())),
    }
}

/// Required string field.
pub fn string<'a>(params: &'a Params, key: &str) -> Result<&'a str, ParamsError> {
    match params.get(key) {
        None => Err(ParamsError::MissingField(key.to_string())),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ParamsError::BadType(key.to_string())),
    }
}

/// Required decimal field, accepting a JSON number or a stringified
/// decimal.
pub fn decimal(params: &Params, key: &str) -> Result<Decimal, ParamsError> {
    match params.get(key) {
        None => Err(ParamsError::MissingField(key.to_string())),
        Some(value) => decimal_value(value).ok_or_else(|| ParamsError::BadType(key.to_string())),
    }
}

/// Optional boolean field. Absent or null yields `false`.
pub fn flag(params: &Params, key: &str) -> Result<bool, ParamsError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(ParamsError::BadType(key.to_string())),
    }
}

/// Required timestamp field: RFC 3339, or `%Y-%m-%d %H:%M:%S` read as
/// UTC.
pub fn time(params: &Params, key: &str) -> Result<DateTime<Utc>, ParamsError> {
    let raw = string(params, key)?;
    parse_time(raw).ok_or_else(|| ParamsError::BadType(key.to_string()))
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, NAIVE_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn decimal_value(value: &Value) -> Option<Decimal> {
    match value {
        // serde_json renders numbers exactly, so going through the
        // string form avoids binary-float rounding.
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}
