//! Per-strategy runner.
//!
//! A runner owns one strategy's contract and its mark-input channel. It
//! drains incoming marks, runs `check_price` one at a time on a spawned
//! task, translates the outcome into lifecycle events, and cooperates
//! with the supervisor for disable/reset/restart and graceful shutdown.

pub mod hook;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use perp_common::{Mark, PositionStatus};

use crate::db::ContractStrategy;
use crate::notify::Notifier;
use crate::strategy::contract::{CheckOutcome, Contract, ContractHook};
use crate::strategy::ParamsError;
use crate::supervisor::{Event, EventSender, RunnerIndex};

pub use hook::{LiveHook, SharedStrategy};

/// Back-off after a non-halting check-price error; the next mark
/// retries.
const ERROR_BACKOFF_SECS: u64 = 3;

/// `exchange_orders_details` disagrees with the invariant implied by
/// `position_status`; the runner halts until a manual reset.
#[derive(Debug, Error)]
pub enum OrdersDetailsError {
    #[error("position status: 'Closed', 'exchange_orders_details' isn't empty")]
    ClosedNotEmpty,

    #[error("position status: 'Opened', 'exchange_orders_details.{0}' is missing")]
    OpenedMissing(&'static str),

    #[error("position status: 'Opened', 'exchange_orders_details.entry_order.size' is malformed")]
    MalformedSize,

    #[error("unknown status")]
    UnknownStatus,

    #[error("undefined status '{0}'")]
    UndefinedStatus(i16),
}

/// Shared handle to a running strategy. The supervisor keeps one per
/// uuid and per symbol; the runner task and the handle together own the
/// strategy's lifecycle.
pub struct RunnerHandle {
    pub uuid: Uuid,
    pub user_uuid: Uuid,
    pub symbol: String,
    /// `"Long BTCUSDT"`-style label for notifications.
    pub label: String,

    mark_tx: mpsc::Sender<Mark>,
    stop_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
    check_price_enabled: AtomicBool,

    /// Serializes `check_price` against supervisor-initiated mutations
    /// (disable, reset, restart).
    pub serial: tokio::sync::Mutex<()>,

    last_checked: std::sync::Mutex<Option<DateTime<Utc>>>,
    join: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RunnerHandle {
    /// Idempotent cooperative stop. The input channel is silenced
    /// before the stop signal fires, otherwise a concurrent broadcast
    /// could target a receiver that never reads again.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.check_price_enabled.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(());
    }

    pub fn check_price_enabled(&self) -> bool {
        self.check_price_enabled.load(Ordering::SeqCst)
    }

    fn disable_price_checks(&self) {
        self.check_price_enabled.store(false, Ordering::SeqCst);
    }

    /// Non-blocking mark delivery: a busy or stopping runner loses the
    /// sample rather than stalling the broadcaster.
    pub fn try_send_mark(&self, mark: Mark) {
        if self.check_price_enabled() {
            let _ = self.mark_tx.try_send(mark);
        }
    }

    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        *self.last_checked.lock().unwrap()
    }

    fn record_checked(&self, at: DateTime<Utc>) {
        *self.last_checked.lock().unwrap() = Some(at);
    }

    pub fn set_join(&self, handle: JoinHandle<()>) {
        *self.join.lock().unwrap() = Some(handle);
    }

    pub fn take_join(&self) -> Option<JoinHandle<()>> {
        self.join.lock().unwrap().take()
    }
}

/// Owns one strategy's contract and input channel.
pub struct StrategyRunner {
    handle: Arc<RunnerHandle>,
    mark_rx: mpsc::Receiver<Mark>,
    // Subscribed at construction so a stop landing before the task is
    // scheduled is buffered, not lost.
    stop_rx: broadcast::Receiver<()>,
    contract: Arc<tokio::sync::Mutex<Contract>>,
    strategy: SharedStrategy,
    notifier: Arc<dyn Notifier>,
    telegram_chat_id: i64,
    events: EventSender,
    index: Arc<RunnerIndex>,
}

impl StrategyRunner {
    /// Re-hydrate the contract from the strategy row and wire the hook.
    pub fn new(
        strategy: SharedStrategy,
        hook: Arc<dyn ContractHook>,
        notifier: Arc<dyn Notifier>,
        telegram_chat_id: i64,
        events: EventSender,
        index: Arc<RunnerIndex>,
    ) -> Result<(Self, Arc<RunnerHandle>), ParamsError> {
        let (uuid, user_uuid, symbol, label, side, status, params) = {
            let s = strategy.lock().unwrap();
            let side = s
                .side()
                .ok_or_else(|| ParamsError::unsupported("side", s.side.to_string()))?;
            let status = s.position_status().ok_or_else(|| {
                ParamsError::unsupported("position_status", s.position_status.to_string())
            })?;
            (
                s.uuid,
                s.user_uuid,
                s.symbol.clone(),
                s.label(),
                side,
                status,
                s.params.clone(),
            )
        };

        let params = params
            .as_object()
            .ok_or_else(|| ParamsError::BadType("params".to_string()))?
            .clone();
        let mut contract = Contract::from_params(side, &params)?;
        contract.set_hook(hook);
        contract.set_status(status);

        let (mark_tx, mark_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = broadcast::channel(4);
        let handle = Arc::new(RunnerHandle {
            uuid,
            user_uuid,
            symbol,
            label,
            mark_tx,
            stop_tx,
            stopped: AtomicBool::new(false),
            check_price_enabled: AtomicBool::new(true),
            serial: tokio::sync::Mutex::new(()),
            last_checked: std::sync::Mutex::new(None),
            join: std::sync::Mutex::new(None),
        });

        let runner = StrategyRunner {
            handle: handle.clone(),
            mark_rx,
            stop_rx,
            contract: Arc::new(tokio::sync::Mutex::new(contract)),
            strategy,
            notifier,
            telegram_chat_id,
            events,
            index,
        };
        Ok((runner, handle))
    }

    /// Main loop: wait for the stop signal or the next mark. A mark
    /// arriving while a check-price task is still in flight is dropped;
    /// the capacity-1 channel means at most one more is buffered.
    pub async fn run(mut self) {
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = self.stop_rx.recv() => break,
                mark = self.mark_rx.recv() => {
                    let Some(mark) = mark else { break };
                    if !self.handle.check_price_enabled() {
                        continue;
                    }
                    if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
                        continue;
                    }
                    in_flight = Some(self.spawn_check_price(mark));
                }
            }
        }

        // Drain the in-flight check before reporting the close upward.
        if let Some(task) = in_flight {
            let _ = task.await;
        }
        self.index.remove(&self.handle.symbol, self.handle.uuid);
    }

    fn spawn_check_price(&self, mark: Mark) -> JoinHandle<()> {
        let handle = self.handle.clone();
        let contract = self.contract.clone();
        let strategy = self.strategy.clone();
        let notifier = self.notifier.clone();
        let chat_id = self.telegram_chat_id;
        let events = self.events.clone();

        tokio::spawn(async move {
            let _serial = handle.serial.lock().await;

            let checked = std::panic::AssertUnwindSafe(check_price(
                &handle, &contract, &strategy, &events, mark,
            ))
            .catch_unwind()
            .await;

            if checked.is_err() {
                // The strategy mutex may be poisoned by the panic; the
                // handle's label is safe to read.
                let label = handle.label.clone();
                error!(strategy = %handle.uuid, symbol = %handle.symbol, "check_price panicked");
                let text = format!(
                    "[Error] '{label}' Internal Server Error. Please check and reset your position and order"
                );
                let notifier = notifier.clone();
                tokio::spawn(async move { notifier.send(chat_id, &text).await });
                handle.disable_price_checks();
                let _ = events.send(Event::OutOfSync(handle.uuid));
                let _ = events.send(Event::Disable(handle.uuid));
            }

            handle.record_checked(Utc::now());
        })
    }
}

/// One serialized price check: validate the persisted order details,
/// drive the contract, translate the outcome.
async fn check_price(
    handle: &RunnerHandle,
    contract: &tokio::sync::Mutex<Contract>,
    strategy: &SharedStrategy,
    events: &EventSender,
    mark: Mark,
) {
    let validation = {
        let s = strategy.lock().unwrap();
        validate_orders_details(&s)
    };
    if let Err(e) = validation {
        error!(
            strategy = %handle.uuid,
            symbol = %handle.symbol,
            error = %e,
            "invalid 'exchange_orders_details'"
        );
        handle.disable_price_checks();
        let _ = events.send(Event::OutOfSync(handle.uuid));
        let _ = events.send(Event::Disable(handle.uuid));
        return;
    }

    let outcome: CheckOutcome = contract.lock().await.check_price(mark).await;
    match (outcome.error, outcome.halted) {
        (Some(e), true) => {
            error!(
                strategy = %handle.uuid,
                symbol = %handle.symbol,
                error = %e,
                "halted with error"
            );
            handle.disable_price_checks();
            let _ = events.send(Event::OutOfSync(handle.uuid));
            let _ = events.send(Event::Disable(handle.uuid));
        }
        (Some(e), false) => {
            error!(
                strategy = %handle.uuid,
                symbol = %handle.symbol,
                error = %e,
                "check_price failed, will retry on the next mark"
            );
            tokio::time::sleep(std::time::Duration::from_secs(ERROR_BACKOFF_SECS)).await;
        }
        (None, true) => {
            // Take-profit (or an entry conflict): the strategy is done
            // and waits for its reset.
            handle.disable_price_checks();
            info!(strategy = %handle.uuid, symbol = %handle.symbol, "strategy is done");
            let _ = events.send(Event::Reset(handle.uuid));
        }
        (None, false) => {}
    }
}

/// Check the `exchange_orders_details` invariants implied by
/// `position_status`.
pub fn validate_orders_details(cs: &ContractStrategy) -> Result<(), OrdersDetailsError> {
    let details = &cs.exchange_orders_details;
    let empty = details.is_null() || details.as_object().is_some_and(|m| m.is_empty());

    match PositionStatus::from_i16(cs.position_status) {
        Some(PositionStatus::Closed) => {
            if !empty {
                return Err(OrdersDetailsError::ClosedNotEmpty);
            }
        }
        Some(PositionStatus::Opened) => {
            let entry = details
                .get("entry_order")
                .and_then(|v| v.as_object())
                .ok_or(OrdersDetailsError::OpenedMissing("entry_order"))?;
            if !entry.contains_key("order_id") {
                return Err(OrdersDetailsError::OpenedMissing("entry_order.order_id"));
            }
            let size = entry
                .get("size")
                .ok_or(OrdersDetailsError::OpenedMissing("entry_order.size"))?;
            let parsed = size.as_str().and_then(|s| s.parse::<Decimal>().ok());
            if parsed.is_none() {
                return Err(OrdersDetailsError::MalformedSize);
            }
        }
        Some(PositionStatus::Unknown) => return Err(OrdersDetailsError::UnknownStatus),
        None => return Err(OrdersDetailsError::UndefinedStatus(cs.position_status)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strategy_row(status: PositionStatus, details: serde_json::Value) -> ContractStrategy {
        ContractStrategy {
            id: 1,
            uuid: Uuid::new_v4(),
            user_uuid: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            margin: Decimal::new(1000, 0),
            side: 1,
            params: json!({}),
            enabled: 1,
            position_status: status.as_i16(),
            exchange: "BINANCE".to_string(),
            exchange_orders_details: details,
            last_position_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_closed_requires_empty_details() {
        let ok = strategy_row(PositionStatus::Closed, json!({}));
        assert!(validate_orders_details(&ok).is_ok());

        let ok = strategy_row(PositionStatus::Closed, serde_json::Value::Null);
        assert!(validate_orders_details(&ok).is_ok());

        let bad = strategy_row(
            PositionStatus::Closed,
            json!({"entry_order": {"order_id": 1}}),
        );
        assert!(matches!(
            validate_orders_details(&bad),
            Err(OrdersDetailsError::ClosedNotEmpty)
        ));
    }

    #[test]
    fn test_opened_requires_entry_order() {
        let ok = strategy_row(
            PositionStatus::Opened,
            json!({"entry_order": {"order_id": 42, "size": "0.02"}}),
        );
        assert!(validate_orders_details(&ok).is_ok());

        let bad = strategy_row(PositionStatus::Opened, json!({}));
        assert!(matches!(
            validate_orders_details(&bad),
            Err(OrdersDetailsError::OpenedMissing("entry_order"))
        ));

        let bad = strategy_row(
            PositionStatus::Opened,
            json!({"entry_order": {"size": "0.02"}}),
        );
        assert!(matches!(
            validate_orders_details(&bad),
            Err(OrdersDetailsError::OpenedMissing("entry_order.order_id"))
        ));

        let bad = strategy_row(
            PositionStatus::Opened,
            json!({"entry_order": {"order_id": 42, "size": "not-a-number"}}),
        );
        assert!(matches!(
            validate_orders_details(&bad),
            Err(OrdersDetailsError::MalformedSize)
        ));
    }

    #[test]
    fn test_unknown_status_is_invalid() {
        let bad = strategy_row(PositionStatus::Unknown, json!({}));
        assert!(matches!(
            validate_orders_details(&bad),
            Err(OrdersDetailsError::UnknownStatus)
        ));
    }
}
