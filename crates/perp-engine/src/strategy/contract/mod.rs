//! Contract state machine.
//!
//! A contract consumes mark-price samples and transitions between
//! `Closed` and `Opened`, invoking a [`ContractHook`] callback at every
//! externally observable event: entry fired, stop-loss placed, stop-loss
//! fired, take-profit fired, params persisted, trendline readjusted,
//! breakout peak moved. The state machine itself performs no IO; the
//! hook owns the exchange, the store, and the notifier.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use thiserror::Error;

use perp_common::{EntryType, Mark, PositionStatus, Side};

use super::order::{EntryOrder, StopLossOrder, TakeProfitOrder};
use super::params::{self, Params, ParamsError};
use super::trigger::Trigger;

/// Cooldown between breakout-peak hook notifications, in seconds. The
/// in-memory peak is updated on every sample regardless.
pub const BREAKOUT_PEAK_TRIGGERED_INTERVAL_SECS: i64 = 20;

/// Error returned by hook callbacks.
#[derive(Debug, Clone, Error)]
pub enum HookError {
    /// Exchange-side failure. `halt` marks failures that leave the
    /// position in a state the engine can no longer reconcile.
    #[error("exchange: {message}")]
    Exchange { message: String, halt: bool },

    /// Persistence failure. Always halts.
    #[error("store: {0}")]
    Store(String),

    /// Anything else. Always halts.
    #[error("{0}")]
    Internal(String),
}

impl HookError {
    pub fn exchange(message: impl Into<String>, halt: bool) -> Self {
        HookError::Exchange {
            message: message.into(),
            halt,
        }
    }

    /// Whether the runner must stop checking prices for this strategy.
    pub fn halts(&self) -> bool {
        match self {
            HookError::Exchange { halt, .. } => *halt,
            HookError::Store(_) | HookError::Internal(_) => true,
        }
    }
}

/// Error surfaced by [`Contract::check_price`].
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Hook(#[from] HookError),

    /// The contract is in `Unknown` status; only a manual reset clears
    /// it.
    #[error("unknown status")]
    BadState,
}

/// Result of one price check: whether the strategy must stop receiving
/// marks, plus an optional error. Halted with no error means a
/// deliberate termination (take-profit done, or an entry conflict that
/// requires a reset).
#[derive(Debug)]
pub struct CheckOutcome {
    pub halted: bool,
    pub error: Option<CheckError>,
}

impl CheckOutcome {
    fn ok() -> Self {
        CheckOutcome {
            halted: false,
            error: None,
        }
    }

    fn halt() -> Self {
        CheckOutcome {
            halted: true,
            error: None,
        }
    }

    fn from_hook_error(e: HookError) -> Self {
        CheckOutcome {
            halted: e.halts(),
            error: Some(CheckError::Hook(e)),
        }
    }
}

/// Decision returned by [`ContractHook::entry_triggered`].
#[derive(Debug, Clone)]
pub enum EntryDecision {
    /// Position opened; carry the realized entry price forward.
    Proceed { entry_price: Decimal },
    /// Do not open (e.g. a conflicting non-closed strategy on the same
    /// user and symbol); the strategy terminates and awaits a reset.
    Halt,
}

/// Side-effect seam invoked by the state machine.
///
/// Callbacks receive the data they need by argument; the hook never
/// holds a reference back to the contract.
#[async_trait]
pub trait ContractHook: Send + Sync {
    /// Entry condition fired. Place the entry order and report the
    /// realized entry price.
    async fn entry_triggered(&self, mark: &Mark) -> Result<EntryDecision, HookError>;

    /// A stop-loss trigger exists for the freshly opened position.
    /// Place the exchange-side trigger order at `stop_price`.
    async fn stop_loss_trigger_created(&self, stop_price: Decimal) -> Result<(), HookError>;

    /// The stop-loss fired; close the position and cancel the trigger
    /// order.
    async fn stop_loss_triggered(&self) -> Result<(), HookError>;

    /// The take-profit fired; close the position. The strategy halts
    /// regardless of the result.
    async fn take_profit_triggered(&self) -> Result<(), HookError>;

    /// Persist the serialized strategy params.
    async fn params_updated(&self, params: Value) -> Result<(), HookError>;

    /// The breakout peak moved (notification gated by the cooldown).
    async fn breakout_peak_updated(&self, peak: &BreakoutPeak);

    /// The entry trendline was readjusted after a stop-loss.
    async fn entry_trendline_trigger_updated(&self, trendline: Option<&Trigger>);

    /// The entry trigger operator was flipped.
    async fn entry_trigger_operator_updated(&self);
}

/// Highest (long) or lowest (short) price seen since the last entry.
/// Used to readjust the trendline after a loss so the next breakout is
/// measured from the real extreme, not the stale anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakoutPeak {
    pub time: DateTime<Utc>,
    pub price: Decimal,
    last_notified: DateTime<Utc>,
}

impl Default for BreakoutPeak {
    fn default() -> Self {
        BreakoutPeak {
            time: DateTime::UNIX_EPOCH,
            price: Decimal::ZERO,
            last_notified: DateTime::UNIX_EPOCH,
        }
    }
}

impl BreakoutPeak {
    fn set(&mut self, time: DateTime<Utc>, price: Decimal) {
        self.time = time;
        self.price = price;
    }

    /// Track the extreme for the side. Ties refresh the peak time.
    fn record(&mut self, side: Side, time: DateTime<Utc>, price: Decimal) -> bool {
        let moved = match side {
            Side::Long => price >= self.price,
            Side::Short => price <= self.price,
        };
        if moved {
            self.set(time, price);
        }
        moved
    }

    fn reset(&mut self) {
        self.time = DateTime::UNIX_EPOCH;
        self.price = Decimal::ZERO;
    }
}

/// The aggregate owning the per-strategy state machine.
pub struct Contract {
    side: Side,
    entry_type: EntryType,
    entry_order: EntryOrder,
    stop_loss_order: Option<StopLossOrder>,
    take_profit_order: Option<TakeProfitOrder>,
    status: PositionStatus,
    breakout_peak: BreakoutPeak,
    hook: Option<Arc<dyn ContractHook>>,
}

impl std::fmt::Debug for Contract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contract")
            .field("side", &self.side)
            .field("entry_type", &self.entry_type)
            .field("entry_order", &self.entry_order)
            .field("stop_loss_order", &self.stop_loss_order)
            .field("take_profit_order", &self.take_profit_order)
            .field("status", &self.status)
            .field("breakout_peak", &self.breakout_peak)
            .field("hook", &self.hook.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl Contract {
    /// Re-hydrate a contract from its persisted params blob.
    pub fn from_params(side: Side, data: &Params) -> Result<Self, ParamsError> {
        let raw = params::string(data, "entry_type")?;
        let entry_type =
            EntryType::parse(raw).ok_or_else(|| ParamsError::unsupported("entry_type", raw))?;

        let entry_order =
            EntryOrder::from_params(side, entry_type, params::object(data, "entry_order")?)?;

        let take_profit_order = params::optional_object(data, "take_profit_order")?
            .map(TakeProfitOrder::from_params)
            .transpose()?;

        let stop_loss_order = params::optional_object(data, "stop_loss_order")?
            .map(|obj| StopLossOrder::from_params(entry_type, obj))
            .transpose()?;

        let mut breakout_peak = BreakoutPeak::default();
        if let Some(peak) = params::optional_object(data, "breakout_peak")? {
            breakout_peak.set(params::time(peak, "time")?, params::decimal(peak, "price")?);
        }

        Ok(Contract {
            side,
            entry_type,
            entry_order,
            stop_loss_order,
            take_profit_order,
            status: PositionStatus::Closed,
            breakout_peak,
            hook: None,
        })
    }

    pub fn set_hook(&mut self, hook: Arc<dyn ContractHook>) {
        self.hook = Some(hook);
    }

    pub fn set_status(&mut self, status: PositionStatus) {
        self.status = status;
    }

    pub fn status(&self) -> PositionStatus {
        self.status
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn entry_order(&self) -> &EntryOrder {
        &self.entry_order
    }

    pub fn stop_loss_order(&self) -> Option<&StopLossOrder> {
        self.stop_loss_order.as_ref()
    }

    pub fn take_profit_order(&self) -> Option<&TakeProfitOrder> {
        self.take_profit_order.as_ref()
    }

    pub fn breakout_peak(&self) -> &BreakoutPeak {
        &self.breakout_peak
    }

    /// Serialize the strategy params for persistence.
    ///
    /// The breakout peak is deliberately excluded: a stop-loss reset
    /// must clear any persisted copy.
    pub fn to_params(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "entry_type".to_string(),
            Value::String(self.entry_type.as_str().to_string()),
        );
        map.insert("entry_order".to_string(), self.entry_order.to_params());
        if let Some(slo) = &self.stop_loss_order {
            map.insert("stop_loss_order".to_string(), slo.to_params());
        }
        if let Some(tpo) = &self.take_profit_order {
            map.insert("take_profit_order".to_string(), tpo.to_params());
        }
        Value::Object(map)
    }

    /// Drive the state machine with one mark-price sample.
    pub async fn check_price(&mut self, mark: Mark) -> CheckOutcome {
        match self.status {
            PositionStatus::Closed => self.check_closed(mark).await,
            PositionStatus::Opened => self.check_opened(mark).await,
            PositionStatus::Unknown => CheckOutcome {
                halted: true,
                error: Some(CheckError::BadState),
            },
        }
    }

    async fn check_closed(&mut self, mark: Mark) -> CheckOutcome {
        if !self.entry_order.is_fired(&mark) {
            return CheckOutcome::ok();
        }

        // If the same sample would also fire the stop-loss or the
        // take-profit, the tick is ambiguous: entering now would close
        // the position immediately. Skip and wait for a sample that
        // disambiguates.
        if self
            .stop_loss_order
            .as_ref()
            .is_some_and(|o| o.is_fired(&mark))
        {
            return CheckOutcome::ok();
        }
        if self
            .take_profit_order
            .as_ref()
            .is_some_and(|o| o.is_fired(&mark))
        {
            return CheckOutcome::ok();
        }

        let Some(hook) = self.hook.clone() else {
            return CheckOutcome::from_hook_error(HookError::Internal(
                "contract hook is not set".to_string(),
            ));
        };

        let entry_price = match hook.entry_triggered(&mark).await {
            Err(e) => return CheckOutcome::from_hook_error(e),
            Ok(EntryDecision::Halt) => return CheckOutcome::halt(),
            Ok(EntryDecision::Proceed { entry_price }) => entry_price,
        };
        self.status = PositionStatus::Opened;

        if let Some(slo) = self.stop_loss_order.as_mut() {
            if self.entry_type == EntryType::Trendline {
                // The trendline stop depends on the realized entry
                // price.
                slo.update_trigger_by_loss_percent(self.side, entry_price);
            }
            let stop_price = match slo.trigger() {
                Some(t) => t.price_at(mark.time),
                None => {
                    return CheckOutcome::from_hook_error(HookError::Internal(
                        "stop-loss trigger is not set".to_string(),
                    ))
                }
            };
            if let Err(e) = hook.stop_loss_trigger_created(stop_price).await {
                return CheckOutcome::from_hook_error(e);
            }

            if self.entry_type == EntryType::Trendline && slo.trendline_readjustment_enabled() {
                // Seed the peak: the default zero price would corrupt
                // short-side tracking.
                self.breakout_peak.set(mark.time, mark.price);
            }
        }

        // Without the flip, an entry trigger and a stop-loss trigger on
        // the same side of the price would fire in turn every time the
        // mark oscillates around the stop level.
        if self.entry_order.flip_operator_enabled() {
            self.entry_order.flip_operator(self.side);
            hook.entry_trigger_operator_updated().await;
            self.entry_order.disable_operator_flip();
        }

        if let Err(e) = hook.params_updated(self.to_params()).await {
            return CheckOutcome::from_hook_error(e);
        }

        CheckOutcome::ok()
    }

    async fn check_opened(&mut self, mark: Mark) -> CheckOutcome {
        let Some(hook) = self.hook.clone() else {
            return CheckOutcome::from_hook_error(HookError::Internal(
                "contract hook is not set".to_string(),
            ));
        };

        let readjustment_enabled = self.entry_type == EntryType::Trendline
            && self
                .stop_loss_order
                .as_ref()
                .is_some_and(|o| o.trendline_readjustment_enabled());

        if readjustment_enabled && self.breakout_peak.record(self.side, mark.time, mark.price) {
            let cooldown = Duration::seconds(BREAKOUT_PEAK_TRIGGERED_INTERVAL_SECS);
            if mark.time > self.breakout_peak.last_notified + cooldown {
                hook.breakout_peak_updated(&self.breakout_peak).await;
                self.breakout_peak.last_notified = mark.time;
            }
        }

        if self
            .stop_loss_order
            .as_ref()
            .is_some_and(|o| o.is_fired(&mark))
        {
            if let Err(e) = hook.stop_loss_triggered().await {
                return CheckOutcome::from_hook_error(e);
            }
            self.status = PositionStatus::Closed;

            if self.entry_type == EntryType::Trendline {
                // Clear the fired stop so it cannot cut the next entry
                // attempt short.
                if let Some(slo) = self.stop_loss_order.as_mut() {
                    slo.unset_trigger();
                }
                if readjustment_enabled {
                    self.readjust_entry_trendline();
                    hook.entry_trendline_trigger_updated(self.entry_order.trendline_trigger())
                        .await;
                    self.breakout_peak.reset();
                }
            }

            if let Err(e) = hook.params_updated(self.to_params()).await {
                return CheckOutcome::from_hook_error(e);
            }
            return CheckOutcome::ok();
        }

        if self
            .take_profit_order
            .as_ref()
            .is_some_and(|o| o.is_fired(&mark))
        {
            self.status = PositionStatus::Closed;
            let error = hook.take_profit_triggered().await.err();
            // Take-profit terminates the strategy by contract.
            return CheckOutcome {
                halted: true,
                error: error.map(CheckError::Hook),
            };
        }

        CheckOutcome::ok()
    }

    /// Move the trendline's second anchor to the breakout peak (clamped
    /// against the first anchor) and rebuild the firing trigger from the
    /// adjusted line and the offset.
    fn readjust_entry_trendline(&mut self) {
        self.entry_order.update_trendline_trigger(
            self.side,
            self.breakout_peak.price,
            self.breakout_peak.time,
        );
        self.entry_order
            .update_trigger_by_trendline_and_offset(self.side);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records the callbacks invoked since the last drain.
    pub struct RecordingHook {
        names: Mutex<Vec<&'static str>>,
    }

    impl RecordingHook {
        pub fn new() -> Arc<Self> {
            Arc::new(RecordingHook {
                names: Mutex::new(Vec::new()),
            })
        }

        pub fn drain(&self) -> Vec<&'static str> {
            std::mem::take(&mut self.names.lock().unwrap())
        }

        fn push(&self, name: &'static str) {
            self.names.lock().unwrap().push(name);
        }
    }

    #[async_trait]
    impl ContractHook for RecordingHook {
        async fn entry_triggered(&self, mark: &Mark) -> Result<EntryDecision, HookError> {
            self.push("EntryTriggered");
            Ok(EntryDecision::Proceed {
                entry_price: mark.price,
            })
        }

        async fn stop_loss_trigger_created(&self, _stop_price: Decimal) -> Result<(), HookError> {
            self.push("StopLossTriggerCreated");
            Ok(())
        }

        async fn stop_loss_triggered(&self) -> Result<(), HookError> {
            self.push("StopLossTriggered");
            Ok(())
        }

        async fn take_profit_triggered(&self) -> Result<(), HookError> {
            self.push("TakeProfitTriggered");
            Ok(())
        }

        async fn params_updated(&self, _params: Value) -> Result<(), HookError> {
            Ok(())
        }

        async fn breakout_peak_updated(&self, _peak: &BreakoutPeak) {
            self.push("BreakoutPeakUpdated");
        }

        async fn entry_trendline_trigger_updated(&self, _trendline: Option<&Trigger>) {
            self.push("EntryTrendlineTriggerUpdated");
        }

        async fn entry_trigger_operator_updated(&self) {
            self.push("EntryTriggerOperatorUpdated");
        }
    }

    fn limit_contract() -> (Contract, Arc<RecordingHook>) {
        let data = json!({
            "entry_type": "limit",
            "entry_order": {
                "trigger": {"trigger_type": "limit", "operator": ">=", "price": 47000},
            },
            "stop_loss_order": {
                "trigger": {"trigger_type": "limit", "operator": "<=", "price": 46000},
            },
            "take_profit_order": {
                "trigger": {"trigger_type": "limit", "operator": ">=", "price": 48000},
            },
        });
        let mut contract =
            Contract::from_params(Side::Long, data.as_object().unwrap()).unwrap();
        let hook = RecordingHook::new();
        contract.set_hook(hook.clone());
        (contract, hook)
    }

    fn mark(price: Decimal) -> Mark {
        Mark::new(price, Utc::now())
    }

    use chrono::Utc;

    #[tokio::test]
    async fn test_entry_and_stop_loss_cycle() {
        let (mut contract, hook) = limit_contract();

        contract.check_price(mark(dec!(46999))).await;
        assert!(hook.drain().is_empty());

        contract.check_price(mark(dec!(47000))).await;
        assert_eq!(
            hook.drain(),
            vec!["EntryTriggered", "StopLossTriggerCreated"]
        );
        assert_eq!(contract.status(), PositionStatus::Opened);

        contract.check_price(mark(dec!(46000))).await;
        assert_eq!(hook.drain(), vec!["StopLossTriggered"]);
        assert_eq!(contract.status(), PositionStatus::Closed);
    }

    #[tokio::test]
    async fn test_take_profit_halts() {
        let (mut contract, hook) = limit_contract();
        contract.check_price(mark(dec!(47000))).await;
        hook.drain();

        let outcome = contract.check_price(mark(dec!(48000))).await;
        assert!(outcome.halted);
        assert!(outcome.error.is_none());
        assert_eq!(hook.drain(), vec!["TakeProfitTriggered"]);
        assert_eq!(contract.status(), PositionStatus::Closed);
    }

    #[tokio::test]
    async fn test_ambiguous_sample_skips_entry() {
        // Entry >= 47000, stop-loss <= 46000: a sample at 45000 fires
        // both, so nothing may happen.
        let data = json!({
            "entry_type": "limit",
            "entry_order": {
                "trigger": {"trigger_type": "limit", "operator": "<=", "price": 47000},
            },
            "stop_loss_order": {
                "trigger": {"trigger_type": "limit", "operator": "<=", "price": 46000},
            },
        });
        let mut contract =
            Contract::from_params(Side::Long, data.as_object().unwrap()).unwrap();
        let hook = RecordingHook::new();
        contract.set_hook(hook.clone());

        let outcome = contract.check_price(mark(dec!(45000))).await;
        assert!(!outcome.halted);
        assert!(outcome.error.is_none());
        assert!(hook.drain().is_empty());
        assert_eq!(contract.status(), PositionStatus::Closed);
    }

    #[tokio::test]
    async fn test_unknown_status_halts() {
        let (mut contract, _hook) = limit_contract();
        contract.set_status(PositionStatus::Unknown);
        let outcome = contract.check_price(mark(dec!(47000))).await;
        assert!(outcome.halted);
        assert!(matches!(outcome.error, Some(CheckError::BadState)));
    }

    #[tokio::test]
    async fn test_entry_halt_decision_keeps_closed() {
        struct HaltingHook;

        #[async_trait]
        impl ContractHook for HaltingHook {
            async fn entry_triggered(&self, _mark: &Mark) -> Result<EntryDecision, HookError> {
                Ok(EntryDecision::Halt)
            }
            async fn stop_loss_trigger_created(&self, _p: Decimal) -> Result<(), HookError> {
                unreachable!("entry halted")
            }
            async fn stop_loss_triggered(&self) -> Result<(), HookError> {
                Ok(())
            }
            async fn take_profit_triggered(&self) -> Result<(), HookError> {
                Ok(())
            }
            async fn params_updated(&self, _params: Value) -> Result<(), HookError> {
                Ok(())
            }
            async fn breakout_peak_updated(&self, _peak: &BreakoutPeak) {}
            async fn entry_trendline_trigger_updated(&self, _t: Option<&Trigger>) {}
            async fn entry_trigger_operator_updated(&self) {}
        }

        let (mut contract, _recording) = limit_contract();
        contract.set_hook(Arc::new(HaltingHook));
        let outcome = contract.check_price(mark(dec!(47000))).await;
        assert!(outcome.halted);
        assert!(outcome.error.is_none());
        assert_eq!(contract.status(), PositionStatus::Closed);
    }

    #[test]
    fn test_params_roundtrip_excludes_breakout_peak() {
        let data = json!({
            "entry_type": "trendline",
            "entry_order": {
                "trendline_trigger": {
                    "trigger_type": "line",
                    "operator": ">=",
                    "time_1": "2021-08-17T11:45:00Z",
                    "price_1": 47160,
                    "time_2": "2021-08-18T10:00:00Z",
                    "price_2": 45560,
                },
                "trendline_offset_percent": 0.01,
            },
            "stop_loss_order": {
                "loss_tolerance_percent": 0.01,
                "trendline_readjustment_enabled": true,
            },
            "breakout_peak": {
                "time": "2021-08-18T15:47:00Z",
                "price": "45727.76",
            },
        });
        let contract = Contract::from_params(Side::Long, data.as_object().unwrap()).unwrap();
        assert_eq!(contract.breakout_peak().price, dec!(45727.76));

        let written = contract.to_params();
        assert!(written.get("breakout_peak").is_none());

        // The round-tripped params re-hydrate to the same orders.
        let reread =
            Contract::from_params(Side::Long, written.as_object().unwrap()).unwrap();
        assert_eq!(reread.entry_order(), contract.entry_order());
        assert_eq!(reread.stop_loss_order(), contract.stop_loss_order());
    }

    #[test]
    fn test_rejects_unknown_entry_type() {
        let data = json!({
            "entry_type": "baseline",
            "entry_order": {},
        });
        let err = Contract::from_params(Side::Long, data.as_object().unwrap()).unwrap_err();
        assert_eq!(err, ParamsError::unsupported("entry_type", "baseline"));
    }
}
