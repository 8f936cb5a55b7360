//! Stop-loss order.
//!
//! For `limit` entries the trigger comes from params. For `trendline`
//! entries the trigger is a limit set at entry time from the realized
//! entry price and the loss tolerance; until then it is unset. A
//! persisted trigger is still accepted at construction so a restarted
//! runner resumes an open position with its stop intact.

use rust_decimal::Decimal;
use serde_json::{Map, Value};

use perp_common::{EntryType, Mark, Operator, Side};

use super::super::params::{self, Params, ParamsError};
use super::super::trigger::{self, LimitTrigger, Trigger};

#[derive(Debug, Clone, PartialEq)]
pub struct StopLossOrder {
    trigger: Option<Trigger>,
    loss_tolerance_percent: Decimal,
    trendline_readjustment_enabled: bool,
}

impl StopLossOrder {
    /// Build from the `stop_loss_order` params object.
    pub fn from_params(entry_type: EntryType, data: &Params) -> Result<Self, ParamsError> {
        let mut order = StopLossOrder {
            trigger: None,
            loss_tolerance_percent: Decimal::ZERO,
            trendline_readjustment_enabled: false,
        };

        match entry_type {
            EntryType::Limit => {
                let descriptor = params::object(data, "trigger")?;
                order.trigger = Some(Trigger::from_params(descriptor)?);
            }
            EntryType::Trendline => {
                if let Some(descriptor) = params::optional_object(data, "trigger")? {
                    order.trigger = Some(Trigger::from_params(descriptor)?);
                }

                let tolerance = params::decimal(data, "loss_tolerance_percent")?;
                if tolerance < Decimal::ZERO {
                    return Err(ParamsError::Negative {
                        key: "loss_tolerance_percent".to_string(),
                    });
                }
                order.loss_tolerance_percent = tolerance;
                order.trendline_readjustment_enabled =
                    params::flag(data, "trendline_readjustment_enabled")?;
            }
        }

        Ok(order)
    }

    pub fn is_fired(&self, mark: &Mark) -> bool {
        trigger::is_fired(self.trigger.as_ref(), mark)
    }

    pub fn trigger(&self) -> Option<&Trigger> {
        self.trigger.as_ref()
    }

    pub fn trendline_readjustment_enabled(&self) -> bool {
        self.trendline_readjustment_enabled
    }

    /// Clear the trigger after it fires so the next entry attempt is
    /// not cut short by the previous stop.
    pub fn unset_trigger(&mut self) {
        self.trigger = None;
    }

    /// Set the trigger from the realized entry price: long stops below
    /// at `entry * (1 - tolerance)`, short stops above at
    /// `entry * (1 + tolerance)`.
    pub fn update_trigger_by_loss_percent(&mut self, side: Side, entry_price: Decimal) {
        let trigger = match side {
            Side::Long => LimitTrigger::new(
                Operator::Le,
                entry_price * (Decimal::ONE - self.loss_tolerance_percent),
            ),
            Side::Short => LimitTrigger::new(
                Operator::Ge,
                entry_price * (Decimal::ONE + self.loss_tolerance_percent),
            ),
        };
        self.trigger = Some(Trigger::Limit(trigger));
    }

    /// Params object for persistence. Tolerance and the readjustment
    /// flag are always written so a later re-hydration sees their
    /// current values.
    pub fn to_params(&self) -> Value {
        let mut map = Map::new();
        if let Some(t) = &self.trigger {
            map.insert("trigger".to_string(), t.to_params());
        }
        map.insert(
            "loss_tolerance_percent".to_string(),
            Value::String(self.loss_tolerance_percent.to_string()),
        );
        map.insert(
            "trendline_readjustment_enabled".to_string(),
            Value::Bool(self.trendline_readjustment_enabled),
        );
        Value::Object(map)
    }
}
