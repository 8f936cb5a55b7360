//! Base types shared by the strategy engine.
//!
//! CRITICAL: All prices and sizes use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a contract position.
///
/// Long profits when price rises; short profits when price falls.
/// The integer codes match the persisted `side` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Short,
    Long,
}

impl Side {
    /// Persisted integer code (`0` short, `1` long).
    pub fn as_i16(&self) -> i16 {
        match self {
            Side::Short => 0,
            Side::Long => 1,
        }
    }

    /// Decode the persisted integer code.
    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Side::Short),
            1 => Some(Side::Long),
            _ => None,
        }
    }

    /// Display name used in user-facing messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Short => "Short",
            Side::Long => "Long",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Variant of entry (and stop-loss) construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Fixed-price entry trigger.
    Limit,
    /// Entry trigger derived from a trendline in (time, price) space.
    Trendline,
}

impl EntryType {
    /// Params-blob representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Limit => "limit",
            EntryType::Trendline => "trendline",
        }
    }

    /// Parse the params-blob representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "limit" => Some(EntryType::Limit),
            "trendline" => Some(EntryType::Trendline),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted position status of a contract strategy.
///
/// `Unknown` is terminal for the runner until a manual reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Closed,
    Opened,
    Unknown,
}

impl PositionStatus {
    /// Persisted integer code (`0` closed, `1` opened, `2` unknown).
    pub fn as_i16(&self) -> i16 {
        match self {
            PositionStatus::Closed => 0,
            PositionStatus::Opened => 1,
            PositionStatus::Unknown => 2,
        }
    }

    /// Decode the persisted integer code.
    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(PositionStatus::Closed),
            1 => Some(PositionStatus::Opened),
            2 => Some(PositionStatus::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Closed => "Closed",
            PositionStatus::Opened => "Opened",
            PositionStatus::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Comparison operator of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// Fires when price >= baseline.
    #[serde(rename = ">=")]
    Ge,
    /// Fires when price <= baseline.
    #[serde(rename = "<=")]
    Le,
}

impl Operator {
    /// Params-blob representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Ge => ">=",
            Operator::Le => "<=",
        }
    }

    /// Parse the params-blob representation. Only `>=` and `<=` are
    /// accepted.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            ">=" => Some(Operator::Ge),
            "<=" => Some(Operator::Le),
            _ => None,
        }
    }

    /// Evaluate `price <op> baseline`.
    pub fn compare(&self, price: Decimal, baseline: Decimal) -> bool {
        match self {
            Operator::Ge => price >= baseline,
            Operator::Le => price <= baseline,
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A (price, time) sample from the public trades feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    /// Traded price.
    pub price: Decimal,
    /// Trade timestamp.
    pub time: DateTime<Utc>,
}

impl Mark {
    pub fn new(price: Decimal, time: DateTime<Utc>) -> Self {
        Self { price, time }
    }
}
