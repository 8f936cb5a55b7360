//! Take-profit order: a single trigger.

use serde_json::{json, Value};

use perp_common::Mark;

use super::super::params::{self, Params, ParamsError};
use super::super::trigger::{self, Trigger};

#[derive(Debug, Clone, PartialEq)]
pub struct TakeProfitOrder {
    trigger: Option<Trigger>,
}

impl TakeProfitOrder {
    /// Build from the `take_profit_order` params object.
    pub fn from_params(data: &Params) -> Result<Self, ParamsError> {
        let descriptor = params::object(data, "trigger")?;
        Ok(TakeProfitOrder {
            trigger: Some(Trigger::from_params(descriptor)?),
        })
    }

    pub fn is_fired(&self, mark: &Mark) -> bool {
        trigger::is_fired(self.trigger.as_ref(), mark)
    }

    pub fn trigger(&self) -> Option<&Trigger> {
        self.trigger.as_ref()
    }

    pub fn to_params(&self) -> Value {
        match &self.trigger {
            Some(t) => json!({ "trigger": t.to_params() }),
            None => json!({}),
        }
    }
}
