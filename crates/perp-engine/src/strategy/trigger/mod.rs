//! Trigger evaluator.
//!
//! A trigger compares a mark-price sample against a baseline price and
//! fires when `price <op> baseline` holds. Two variants exist:
//!
//! - [`LimitTrigger`]: fixed baseline, independent of time.
//! - [`LineTrigger`]: baseline is the linear extrapolation through two
//!   (time, price) anchors, evaluated in exact decimal arithmetic.

pub mod limit;
pub mod line;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use perp_common::{Mark, Operator};

pub use limit::LimitTrigger;
pub use line::LineTrigger;

use super::params::{self, Params, ParamsError};

/// A price trigger: limit or time-parameterised line.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Limit(LimitTrigger),
    Line(LineTrigger),
}

impl Trigger {
    /// Build a trigger from its params descriptor.
    pub fn from_params(data: &Params) -> Result<Self, ParamsError> {
        match params::string(data, "trigger_type")? {
            "limit" => LimitTrigger::from_params(data).map(Trigger::Limit),
            "line" => LineTrigger::from_params(data).map(Trigger::Line),
            other => Err(ParamsError::unsupported("trigger_type", other)),
        }
    }

    /// Baseline price at `t`.
    pub fn price_at(&self, t: DateTime<Utc>) -> Decimal {
        match self {
            Trigger::Limit(l) => l.price_at(t),
            Trigger::Line(l) => l.price_at(t),
        }
    }

    pub fn operator(&self) -> Operator {
        match self {
            Trigger::Limit(l) => l.operator,
            Trigger::Line(l) => l.operator,
        }
    }

    pub fn set_operator(&mut self, operator: Operator) {
        match self {
            Trigger::Limit(l) => l.operator = operator,
            Trigger::Line(l) => l.operator = operator,
        }
    }

    /// Replace the anchor: the price for a limit, the second endpoint
    /// for a line.
    pub fn readjust(&mut self, price: Decimal, t: DateTime<Utc>) {
        match self {
            Trigger::Limit(l) => l.readjust(price, t),
            Trigger::Line(l) => l.readjust(price, t),
        }
    }

    /// Multiply the baseline by `percent` (both endpoint prices for a
    /// line).
    pub fn update_price_by_percent(&mut self, percent: Decimal) {
        match self {
            Trigger::Limit(l) => l.update_price_by_percent(percent),
            Trigger::Line(l) => l.update_price_by_percent(percent),
        }
    }

    /// Params descriptor for persistence.
    pub fn to_params(&self) -> Value {
        match self {
            Trigger::Limit(l) => l.to_params(),
            Trigger::Line(l) => l.to_params(),
        }
    }
}

/// Evaluate a possibly-absent trigger against a mark.
///
/// An unset trigger never fires.
pub fn is_fired(trigger: Option<&Trigger>, mark: &Mark) -> bool {
    let Some(trigger) = trigger else {
        return false;
    };
    let baseline = trigger.price_at(mark.time);
    trigger.operator().compare(mark.price, baseline)
}
