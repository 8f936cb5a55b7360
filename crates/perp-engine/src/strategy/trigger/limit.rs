//! Fixed-price trigger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};

use perp_common::Operator;

use super::super::params::{self, Params, ParamsError};

/// Trigger with a time-independent baseline price.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitTrigger {
    pub operator: Operator,
    pub price: Decimal,
}

impl LimitTrigger {
    pub fn new(operator: Operator, price: Decimal) -> Self {
        Self { operator, price }
    }

    /// Build from a params descriptor: `{operator, price}`.
    pub fn from_params(data: &Params) -> Result<Self, ParamsError> {
        let raw = params::string(data, "operator")?;
        let operator =
            Operator::parse(raw).ok_or_else(|| ParamsError::unsupported("operator", raw))?;
        let price = params::decimal(data, "price")?;
        Ok(Self { operator, price })
    }

    /// Baseline price; time is irrelevant for a limit.
    pub fn price_at(&self, _t: DateTime<Utc>) -> Decimal {
        self.price
    }

    pub fn readjust(&mut self, price: Decimal, _t: DateTime<Utc>) {
        self.price = price;
    }

    pub fn update_price_by_percent(&mut self, percent: Decimal) {
        self.price *= percent;
    }

    pub fn to_params(&self) -> Value {
        json!({
            "trigger_type": "limit",
            "operator": self.operator.as_str(),
            "price": self.price.to_string(),
        })
    }
}
