//! Time-parameterised line trigger.
//!
//! The baseline drifts along the straight line through two (time, price)
//! anchors. Evaluation is exact decimal arithmetic over millisecond
//! offsets; the anchors themselves are returned verbatim so
//! `price_at(t1) == p1` and `price_at(t2) == p2` hold exactly.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};

use perp_common::Operator;

use super::super::params::{self, Params, ParamsError};

/// Trigger whose baseline is a line through `(time_1, price_1)` and
/// `(time_2, price_2)`, with `time_1 < time_2`.
#[derive(Debug, Clone, PartialEq)]
pub struct LineTrigger {
    pub operator: Operator,
    pub time_1: DateTime<Utc>,
    pub price_1: Decimal,
    pub time_2: DateTime<Utc>,
    pub price_2: Decimal,
}

impl LineTrigger {
    pub fn new(
        operator: Operator,
        time_1: DateTime<Utc>,
        price_1: Decimal,
        time_2: DateTime<Utc>,
        price_2: Decimal,
    ) -> Result<Self, ParamsError> {
        if time_1 >= time_2 {
            return Err(ParamsError::BadOrdering);
        }
        Ok(Self {
            operator,
            time_1,
            price_1,
            time_2,
            price_2,
        })
    }

    /// Build from a params descriptor:
    /// `{operator, time_1, price_1, time_2, price_2}`.
    pub fn from_params(data: &Params) -> Result<Self, ParamsError> {
        let raw = params::string(data, "operator")?;
        let operator =
            Operator::parse(raw).ok_or_else(|| ParamsError::unsupported("operator", raw))?;
        let price_1 = params::decimal(data, "price_1")?;
        let price_2 = params::decimal(data, "price_2")?;
        let time_1 = params::time(data, "time_1")?;
        let time_2 = params::time(data, "time_2")?;
        Self::new(operator, time_1, price_1, time_2, price_2)
    }

    /// Baseline price at `t`: interpolation inside the anchor interval,
    /// extrapolation outside it.
    pub fn price_at(&self, t: DateTime<Utc>) -> Decimal {
        // Anchors are exact by definition; the linear form below would
        // reproduce them only up to division precision.
        if t == self.time_1 {
            return self.price_1;
        }
        if t == self.time_2 {
            return self.price_2;
        }

        let span_ms = Decimal::from((self.time_2 - self.time_1).num_milliseconds());
        let elapsed_ms = Decimal::from((t - self.time_1).num_milliseconds());
        let rise = self.price_2 - self.price_1;
        self.price_1 + rise * elapsed_ms / span_ms
    }

    /// Replace the second anchor.
    pub fn readjust(&mut self, price_2: Decimal, time_2: DateTime<Utc>) {
        self.price_2 = price_2;
        self.time_2 = time_2;
    }

    /// Multiply both anchor prices; times are untouched.
    pub fn update_price_by_percent(&mut self, percent: Decimal) {
        self.price_1 *= percent;
        self.price_2 *= percent;
    }

    pub fn to_params(&self) -> Value {
        json!({
            "trigger_type": "line",
            "operator": self.operator.as_str(),
            "time_1": self.time_1.to_rfc3339(),
            "price_1": self.price_1.to_string(),
            "time_2": self.time_2.to_rfc3339(),
            "price_2": self.price_2.to_string(),
        })
    }
}
