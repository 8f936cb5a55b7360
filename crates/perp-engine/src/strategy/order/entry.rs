//! Entry order.
//!
//! For `limit` entries the firing trigger comes straight from params.
//! For `trendline` entries the firing trigger is derived: a clone of the
//! trendline trigger with both anchor prices scaled away from the line
//! by the offset percent (above the line for long, below for short).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};

use perp_common::{EntryType, Mark, Operator, Side};

use super::super::params::{self, Params, ParamsError};
use super::super::trigger::{self, Trigger};

#[derive(Debug, Clone, PartialEq)]
pub struct EntryOrder {
    trigger: Option<Trigger>,
    trendline_trigger: Option<Trigger>,
    trendline_offset_percent: Decimal,
    flip_operator_enabled: bool,
}

impl EntryOrder {
    /// Build from the `entry_order` params object.
    ///
    /// `limit` requires `trigger`; `trendline` requires
    /// `trendline_trigger` and `trendline_offset_percent`, and computes
    /// the firing trigger immediately.
    pub fn from_params(
        side: Side,
        entry_type: EntryType,
        data: &Params,
    ) -> Result<Self, ParamsError> {
        let mut order = EntryOrder {
            trigger: None,
            trendline_trigger: None,
            trendline_offset_percent: Decimal::ZERO,
            flip_operator_enabled: false,
        };

        match entry_type {
            EntryType::Limit => {
                let descriptor = params::object(data, "trigger")?;
                order.trigger = Some(Trigger::from_params(descriptor)?);
            }
            EntryType::Trendline => {
                let descriptor = params::object(data, "trendline_trigger")?;
                order.trendline_trigger = Some(Trigger::from_params(descriptor)?);
                order.trendline_offset_percent =
                    params::decimal(data, "trendline_offset_percent")?;
                order.update_trigger_by_trendline_and_offset(side);
            }
        }

        order.flip_operator_enabled = params::flag(data, "flip_operator_enabled")?;
        Ok(order)
    }

    pub fn is_fired(&self, mark: &Mark) -> bool {
        trigger::is_fired(self.trigger.as_ref(), mark)
    }

    pub fn trigger(&self) -> Option<&Trigger> {
        self.trigger.as_ref()
    }

    pub fn trendline_trigger(&self) -> Option<&Trigger> {
        self.trendline_trigger.as_ref()
    }

    pub fn flip_operator_enabled(&self) -> bool {
        self.flip_operator_enabled
    }

    /// Replace the second trendline anchor with the breakout peak,
    /// clamped so the line cannot cross its first anchor in the trend's
    /// wrong direction (long: `p2 <= p1`, short: `p2 >= p1`).
    pub fn update_trendline_trigger(&mut self, side: Side, peak_price: Decimal, peak_time: DateTime<Utc>) {
        let Some(trendline) = self.trendline_trigger.as_mut() else {
            return;
        };
        let mut p2 = peak_price;
        if let Trigger::Line(line) = &*trendline {
            match side {
                Side::Long => {
                    if p2 >= line.price_1 {
                        p2 = line.price_1;
                    }
                }
                Side::Short => {
                    if p2 <= line.price_1 {
                        p2 = line.price_1;
                    }
                }
            }
        }
        trendline.readjust(p2, peak_time);
    }

    /// Recompute the firing trigger from the trendline and the offset.
    ///
    /// Long entries fire above the trendline, short entries below it.
    pub fn update_trigger_by_trendline_and_offset(&mut self, side: Side) {
        let Some(trendline) = self.trendline_trigger.as_ref() else {
            return;
        };
        let percent = match side {
            Side::Long => Decimal::ONE + self.trendline_offset_percent,
            Side::Short => Decimal::ONE - self.trendline_offset_percent,
        };
        // Clone so the derived trigger never aliases the trendline.
        let mut derived = trendline.clone();
        derived.update_price_by_percent(percent);
        self.trigger = Some(derived);
    }

    /// Set the operator by side on both the firing trigger and, when
    /// present, the trendline trigger.
    pub fn flip_operator(&mut self, side: Side) {
        let operator = match side {
            Side::Long => Operator::Ge,
            Side::Short => Operator::Le,
        };
        if let Some(t) = self.trigger.as_mut() {
            t.set_operator(operator);
        }
        if let Some(t) = self.trendline_trigger.as_mut() {
            t.set_operator(operator);
        }
    }

    /// Clear the flip flag so the flip happens at most once per strategy
    /// lifetime.
    pub fn disable_operator_flip(&mut self) {
        self.flip_operator_enabled = false;
    }

    /// Params object for persistence. Offset and flip flag are always
    /// written so a later re-hydration sees their current values.
    pub fn to_params(&self) -> Value {
        let mut map = Map::new();
        if let Some(t) = &self.trigger {
            map.insert("trigger".to_string(), t.to_params());
        }
        if let Some(t) = &self.trendline_trigger {
            map.insert("trendline_trigger".to_string(), t.to_params());
            map.insert(
                "trendline_offset_percent".to_string(),
                Value::String(self.trendline_offset_percent.to_string()),
            );
        }
        map.insert(
            "flip_operator_enabled".to_string(),
            Value::Bool(self.flip_operator_enabled),
        );
        Value::Object(map)
    }
}
