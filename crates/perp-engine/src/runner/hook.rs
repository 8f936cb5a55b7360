//! Live contract hook: the bridge between the pure state machine and
//! side effects.
//!
//! Every callback works against the in-memory strategy row first, then
//! persists, then notifies. Exchange calls run under bounded retries;
//! benign-terminal rejections (position already flat, order already
//! gone) are treated as the desired end state.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use perp_common::{Mark, PositionStatus, Side};

use crate::db::{StrategyChanges, StrategyStore, User};
use crate::exchange::{Exchanger, OrderId, CANCEL_RETRY_ATTEMPTS, RETRY_ATTEMPTS, RETRY_INTERVAL};
use crate::notify::Notifier;
use crate::strategy::contract::{BreakoutPeak, ContractHook, EntryDecision, HookError};
use crate::strategy::Trigger;

/// The strategy row shared between the hook and its runner. Critical
/// sections are short and never held across an await.
pub type SharedStrategy = Arc<std::sync::Mutex<crate::db::ContractStrategy>>;

/// Per-user entry serialization table, shared across all hooks.
pub type EntryTakers = Arc<DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>;

/// Fields of the strategy row a callback needs, cloned out of the lock.
struct StrategySnapshot {
    uuid: Uuid,
    user_uuid: Uuid,
    symbol: String,
    margin: Decimal,
    side: Side,
    label: String,
}

enum ClosePositionError {
    /// The exchange already flattened the position.
    AlreadyFlat,
    Hook(HookError),
}

pub struct LiveHook {
    strategy: SharedStrategy,
    user: Arc<User>,
    store: Arc<dyn StrategyStore>,
    exchange: Arc<dyn Exchanger>,
    notifier: Arc<dyn Notifier>,
    entry_takers: EntryTakers,
}

impl LiveHook {
    pub fn new(
        strategy: SharedStrategy,
        user: Arc<User>,
        store: Arc<dyn StrategyStore>,
        exchange: Arc<dyn Exchanger>,
        notifier: Arc<dyn Notifier>,
        entry_takers: EntryTakers,
    ) -> Self {
        Self {
            strategy,
            user,
            store,
            exchange,
            notifier,
            entry_takers,
        }
    }

    fn snapshot(&self) -> StrategySnapshot {
        let s = self.strategy.lock().unwrap();
        StrategySnapshot {
            uuid: s.uuid,
            user_uuid: s.user_uuid,
            symbol: s.symbol.clone(),
            margin: s.margin,
            side: s.side().unwrap_or(Side::Long),
            label: s.label(),
        }
    }

    /// Log and send the notification without blocking the caller.
    fn notify(&self, text: String) {
        let s = self.snapshot();
        info!(strategy = %s.uuid, user = %s.user_uuid, symbol = %s.symbol, "{text}");
        let notifier = self.notifier.clone();
        let chat_id = self.user.telegram_chat_id;
        tokio::spawn(async move { notifier.send(chat_id, &text).await });
    }

    fn internal_error_text(&self, label: &str) -> String {
        format!(
            "[Error] '{label}' Internal Server Error. Please check and reset your position and order"
        )
    }

    /// Requested entry size recorded in `exchange_orders_details`.
    fn entry_size(&self) -> Result<Decimal, HookError> {
        let s = self.strategy.lock().unwrap();
        s.exchange_orders_details
            .get("entry_order")
            .and_then(|e| e.get("size"))
            .and_then(Value::as_str)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                HookError::Internal("'exchange_orders_details.entry_order.size' is missing".into())
            })
    }

    fn stop_loss_order_id(&self) -> Option<OrderId> {
        let s = self.strategy.lock().unwrap();
        s.exchange_orders_details
            .get("stop_loss_order")
            .and_then(|o| o.get("order_id"))
            .and_then(Value::as_i64)
    }

    fn reset_memory_position(&self) {
        let mut s = self.strategy.lock().unwrap();
        s.position_status = PositionStatus::Closed.as_i16();
        s.exchange_orders_details = json!({});
    }

    /// Close the open position and read the closing fill back.
    async fn close_open_position(
        &self,
        report_if_failed: bool,
    ) -> Result<(), ClosePositionError> {
        let s = self.snapshot();
        let size = self
            .entry_size()
            .map_err(|e| {
                self.notify(self.internal_error_text(&s.label));
                ClosePositionError::Hook(e)
            })?;

        let order_id = match self
            .exchange
            .retry_close_position(&s.symbol, s.side, size, RETRY_ATTEMPTS, RETRY_INTERVAL)
            .await
        {
            Ok(order_id) => order_id,
            Err(e) if e.is_reduce_only_rejection() => return Err(ClosePositionError::AlreadyFlat),
            Err(e) => {
                if report_if_failed {
                    self.notify(format!(
                        "[Error] {} - failed to close position, please check and reset your position and order, err: {e}",
                        s.label
                    ));
                }
                return Err(ClosePositionError::Hook(HookError::exchange(
                    format!("failed to close position: {e}"),
                    true,
                )));
            }
        };

        match self
            .exchange
            .retry_get_order_fill(&s.symbol, order_id, RETRY_ATTEMPTS, RETRY_INTERVAL)
            .await
        {
            Ok(Some(fill)) => {
                self.notify(format!(
                    "[Info] '{}' position has been closed @{} (fee: ${})",
                    s.label, fill.price, fill.fee
                ));
                Ok(())
            }
            Ok(None) => {
                self.notify(
                    "[Warn] Not sure whether the position has been closed. please check and reset your position and order"
                        .to_string(),
                );
                Err(ClosePositionError::Hook(HookError::exchange(
                    "no closing fill was found".to_string(),
                    true,
                )))
            }
            Err(e) => {
                self.notify(format!(
                    "[Error] Failed to get position from the position just closed, err: {e}"
                ));
                Err(ClosePositionError::Hook(HookError::exchange(
                    format!("failed to get closing fill: {e}"),
                    true,
                )))
            }
        }
    }

    /// Close the position and cancel any outstanding stop-loss trigger.
    /// The persisted row is reset by the supervisor's follow-up event;
    /// only the in-memory copy changes here.
    async fn close_position(&self) -> Result<(), HookError> {
        let s = self.snapshot();
        match self.close_open_position(true).await {
            Ok(()) => {}
            Err(ClosePositionError::AlreadyFlat) => {
                return Err(HookError::exchange(
                    "close position rejected as reduce-only, the position is already flat".to_string(),
                    true,
                ));
            }
            Err(ClosePositionError::Hook(e)) => return Err(e),
        }

        // It's possible there is no stop-loss order id yet: the
        // position opened but something failed before the trigger order
        // was created.
        if let Some(order_id) = self.stop_loss_order_id() {
            match self
                .exchange
                .retry_cancel_open_trigger_order(
                    &s.symbol,
                    order_id,
                    CANCEL_RETRY_ATTEMPTS,
                    RETRY_INTERVAL,
                )
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_order_already_closed() => {}
                Err(e) => {
                    self.notify(format!(
                        "[Error] Failed to cancel {} stop-loss order, err: {e}",
                        s.symbol
                    ));
                    return Err(HookError::exchange(
                        format!("failed to cancel stop-loss order: {e}"),
                        true,
                    ));
                }
            }
        }

        self.reset_memory_position();
        Ok(())
    }
}

#[async_trait]
impl ContractHook for LiveHook {
    async fn entry_triggered(&self, mark: &Mark) -> Result<EntryDecision, HookError> {
        let s = self.snapshot();

        // One account may hold only one entry-in-progress per symbol at
        // a time; serialize per user.
        let taker = self
            .entry_takers
            .entry(s.user_uuid)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone();
        let _taken = taker.lock().await;

        let count = self
            .store
            .non_closed_count(s.user_uuid, &s.symbol, s.uuid)
            .await
            .map_err(|e| HookError::Store(format!("failed to count non-closed strategies: {e}")))?;
        if count > 0 {
            self.notify(format!(
                "[Warn] '{} ${}' is triggered, but conflicts with others. Please make sure other {} strategies' status are 'closed'. This strategy will be reset shortly",
                s.label, s.margin, s.symbol
            ));
            return Ok(EntryDecision::Halt);
        }

        let size = s.margin / mark.price;
        let order_id = match self.exchange.place_entry_order(&s.symbol, s.side, size).await {
            Ok(order_id) => order_id,
            Err(e) => {
                self.notify(format!("[Error] Failed to place entry order, err: {e}"));
                return Err(HookError::exchange(
                    format!("failed to place entry order: {e}"),
                    false,
                ));
            }
        };

        let fill = match self
            .exchange
            .retry_get_order_fill(&s.symbol, order_id, RETRY_ATTEMPTS, RETRY_INTERVAL)
            .await
        {
            Ok(Some(fill)) => fill,
            Ok(None) => {
                self.notify(
                    "[Warn] Entry order has been placed, but can't find any open position. please check and reset your position and order"
                        .to_string(),
                );
                return Err(HookError::exchange(
                    "entry order has been placed, but no open position was found".to_string(),
                    true,
                ));
            }
            Err(e) => {
                self.notify(format!("[Error] Failed to get open position, err: {e}"));
                return Err(HookError::exchange(
                    format!("failed to get open position: {e}"),
                    true,
                ));
            }
        };

        self.notify(format!(
            "[Entry] '{}' has been triggered @{} (margin: ${}, fee: ${})",
            s.label,
            fill.price,
            s.margin.round_dp(0),
            fill.fee
        ));

        // The exchange may split a large order and report only the last
        // partial fill; record the requested size, not the reported
        // one.
        let details = json!({
            "entry_order": {
                "fee_rate": fill.fee_rate.to_string(),
                "order_id": fill.order_id,
                "price": fill.price.to_string(),
                "size": size.to_string(),
                "time": fill.time.to_rfc3339(),
            }
        });

        {
            let mut row = self.strategy.lock().unwrap();
            row.position_status = PositionStatus::Opened.as_i16();
            row.exchange_orders_details = details.clone();
            row.last_position_at = Some(fill.time);
        }

        let changes = StrategyChanges {
            position_status: Some(PositionStatus::Opened.as_i16()),
            exchange_orders_details: Some(details),
            last_position_at: Some(fill.time),
            ..Default::default()
        };
        if let Err(e) = self.store.update_strategy(s.uuid, changes).await {
            self.notify(self.internal_error_text(&s.label));
            return Err(HookError::Store(format!(
                "failed to update 'exchange_orders_details': {e}"
            )));
        }

        Ok(EntryDecision::Proceed {
            entry_price: fill.price,
        })
    }

    async fn stop_loss_trigger_created(&self, stop_price: Decimal) -> Result<(), HookError> {
        let s = self.snapshot();
        let size = self.entry_size().map_err(|e| {
            self.notify(self.internal_error_text(&s.label));
            e
        })?;

        let order_id = match self
            .exchange
            .retry_place_stop_loss_order(
                &s.symbol,
                s.side,
                stop_price,
                size,
                RETRY_ATTEMPTS,
                RETRY_INTERVAL,
            )
            .await
        {
            Ok(order_id) => order_id,
            Err(e) => {
                self.notify(format!(
                    "[Error] {} - failed to place stop-loss order, err: {e}",
                    s.label
                ));
                // A position without a stop is unprotected; get flat.
                let _ = self.close_position().await;
                return Err(HookError::exchange(
                    format!("failed to place stop-loss order: {e}"),
                    true,
                ));
            }
        };

        self.notify(format!(
            "[Info] {} stop-loss order has been placed @{stop_price}",
            s.symbol
        ));

        let details = {
            let mut row = self.strategy.lock().unwrap();
            row.exchange_orders_details["stop_loss_order"] = json!({ "order_id": order_id });
            row.exchange_orders_details.clone()
        };
        let changes = StrategyChanges {
            exchange_orders_details: Some(details),
            ..Default::default()
        };
        if let Err(e) = self.store.update_strategy(s.uuid, changes).await {
            self.notify(self.internal_error_text(&s.label));
            return Err(HookError::Store(format!(
                "failed to update 'exchange_orders_details': {e}"
            )));
        }
        Ok(())
    }

    async fn stop_loss_triggered(&self) -> Result<(), HookError> {
        let s = self.snapshot();
        self.notify(format!("[Stop-loss] '{}' has been triggered", s.label));

        match self.close_open_position(false).await {
            Ok(()) => {}
            Err(ClosePositionError::AlreadyFlat) => {
                // The exchange-side trigger got there first.
                self.notify(format!(
                    "[Stop-loss] '{}' position has been closed by stop-loss trigger order",
                    s.label
                ));
            }
            Err(ClosePositionError::Hook(e)) => return Err(e),
        }

        let Some(order_id) = self.stop_loss_order_id() else {
            self.notify(self.internal_error_text(&s.label));
            return Err(HookError::Internal(
                "'exchange_orders_details.stop_loss_order' is missing".to_string(),
            ));
        };
        match self
            .exchange
            .retry_cancel_open_trigger_order(
                &s.symbol,
                order_id,
                CANCEL_RETRY_ATTEMPTS,
                RETRY_INTERVAL,
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_order_already_closed() => {}
            Err(e) => {
                self.notify(format!(
                    "[Error] Failed to cancel {} stop-loss order, err: {e}",
                    s.symbol
                ));
                return Err(HookError::exchange(
                    format!("failed to cancel stop-loss order: {e}"),
                    true,
                ));
            }
        }

        let changes = StrategyChanges {
            position_status: Some(PositionStatus::Closed.as_i16()),
            exchange_orders_details: Some(json!({})),
            ..Default::default()
        };
        if let Err(e) = self.store.update_strategy(s.uuid, changes).await {
            self.notify(self.internal_error_text(&s.label));
            return Err(HookError::Store(format!(
                "failed to update 'position_status': {e}"
            )));
        }
        self.reset_memory_position();
        Ok(())
    }

    async fn take_profit_triggered(&self) -> Result<(), HookError> {
        let s = self.snapshot();
        self.notify(format!("[Take-profit] '{}' has been triggered", s.label));

        // The persisted update happens via the supervisor's reset event.
        self.strategy.lock().unwrap().enabled = 0;

        self.close_position().await
    }

    async fn params_updated(&self, params: Value) -> Result<(), HookError> {
        let s = self.snapshot();
        self.strategy.lock().unwrap().params = params.clone();

        let changes = StrategyChanges {
            params: Some(params),
            ..Default::default()
        };
        if let Err(e) = self.store.update_strategy(s.uuid, changes).await {
            self.notify(self.internal_error_text(&s.label));
            return Err(HookError::Store(format!("failed to update 'params': {e}")));
        }
        Ok(())
    }

    async fn breakout_peak_updated(&self, peak: &BreakoutPeak) {
        let s = self.snapshot();
        debug!(
            strategy = %s.uuid,
            symbol = %s.symbol,
            price = %peak.price,
            time = %peak.time,
            "breakout peak updated"
        );

        // Persisted alongside params but outside the canonical params
        // round-trip, so a stop-loss reset drops it.
        let params = {
            let mut row = self.strategy.lock().unwrap();
            row.params["breakout_peak"] = json!({
                "time": peak.time.to_rfc3339(),
                "price": peak.price.to_string(),
            });
            row.params.clone()
        };
        let changes = StrategyChanges {
            params: Some(params),
            ..Default::default()
        };
        if let Err(e) = self.store.update_strategy(s.uuid, changes).await {
            error!(strategy = %s.uuid, error = %e, "failed to save breakout peak");
        }
    }

    async fn entry_trendline_trigger_updated(&self, trendline: Option<&Trigger>) {
        let s = self.snapshot();
        self.notify(format!(
            "[Info] '{}' entry trend line has been updated",
            s.label
        ));

        if let Some(Trigger::Line(line)) = trendline {
            self.notify(format!(
                "[Info] New entry trend line:\nPoint 1: ${}, '{}'\nPoint 2: ${}, '{}'",
                line.price_1,
                line.time_1.format("%Y-%m-%d %H:%M"),
                line.price_2,
                line.time_2.format("%Y-%m-%d %H:%M"),
            ));
        }
    }

    async fn entry_trigger_operator_updated(&self) {
        let s = self.snapshot();
        self.notify(format!(
            "[Info] '{}' entry trigger operator has been updated",
            s.label
        ));
    }
}
