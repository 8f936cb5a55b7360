//! Shared test doubles and helpers for the integration suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;

use perp_common::{Mark, PositionStatus, Side};
use perp_engine::db::{ContractStrategy, StoreError, StrategyChanges, StrategyStore, SymbolRow, User};
use perp_engine::exchange::{ExchangeError, Exchanger, ExchangerFactory, OrderFill, OrderId};
use perp_engine::notify::Notifier;
use perp_engine::strategy::contract::{
    BreakoutPeak, Contract, ContractHook, EntryDecision, HookError,
};
use perp_engine::strategy::Trigger;

pub fn mark(price: Decimal, time: DateTime<Utc>) -> Mark {
    Mark::new(price, time)
}

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

pub fn contract_from(side: Side, params: Value) -> Contract {
    Contract::from_params(side, params.as_object().expect("params must be an object"))
        .expect("valid params")
}

/// Records the hook callbacks invoked since the last drain.
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

/// One feed step: a mark and the hooks it must produce.
pub struct FeedStep {
    pub price: Decimal,
    pub time: DateTime<Utc>,
    pub expected_hooks: Vec<&'static str>,
}

impl FeedStep {
    pub fn new(price: Decimal, time: DateTime<Utc>, expected_hooks: Vec<&'static str>) -> Self {
        Self {
            price,
            time,
            expected_hooks,
        }
    }
}

/// Drive a contract through a feed table, asserting the hook sequence
/// per step.
pub async fn run_scenario(
    title: &str,
    contract: &mut Contract,
    hook: &RecordingHook,
    feeds: &[FeedStep],
) {
    for (i, step) in feeds.iter().enumerate() {
        contract.check_price(mark(step.price, step.time)).await;
        let got = hook.drain();
        assert_eq!(
            step.expected_hooks, got,
            "scenario '{title}' step {i} (price {}): expected {:?}, got {:?}",
            step.price, step.expected_hooks, got
        );
    }
}

// ---------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    strategies: Mutex<HashMap<Uuid, ContractStrategy>>,
    users: Mutex<HashMap<Uuid, User>>,
    symbols: Mutex<Vec<SymbolRow>>,
    /// When set, every write fails (to exercise persistence-error
    /// paths).
    pub fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_strategy(&self, cs: ContractStrategy) {
        self.strategies.lock().unwrap().insert(cs.uuid, cs);
    }

    pub fn insert_user(&self, user: User) {
        self.users.lock().unwrap().insert(user.uuid, user);
    }

    pub fn strategy(&self, uuid: Uuid) -> Option<ContractStrategy> {
        self.strategies.lock().unwrap().get(&uuid).cloned()
    }
}

#[async_trait]
impl StrategyStore for MemoryStore {
    async fn enabled_strategies(&self) -> Result<Vec<ContractStrategy>, StoreError> {
        Ok(self
            .strategies
            .lock()
            .unwrap()
            .values()
            .filter(|cs| cs.enabled == 1)
            .cloned()
            .collect())
    }

    async fn strategy_by_uuid(&self, uuid: Uuid) -> Result<ContractStrategy, StoreError> {
        self.strategies
            .lock()
            .unwrap()
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::StrategyNotFound(uuid))
    }

    async fn update_strategy(
        &self,
        uuid: Uuid,
        changes: StrategyChanges,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected failure".to_string()));
        }
        let mut strategies = self.strategies.lock().unwrap();
        let cs = strategies
            .get_mut(&uuid)
            .ok_or(StoreError::StrategyNotFound(uuid))?;
        if let Some(enabled) = changes.enabled {
            cs.enabled = enabled;
        }
        if let Some(status) = changes.position_status {
            cs.position_status = status;
        }
        if let Some(params) = changes.params {
            cs.params = params;
        }
        if let Some(details) = changes.exchange_orders_details {
            cs.exchange_orders_details = details;
        }
        if let Some(at) = changes.last_position_at {
            cs.last_position_at = Some(at);
        }
        cs.updated_at = Utc::now();
        Ok(())
    }

    async fn non_closed_count(
        &self,
        user_uuid: Uuid,
        symbol: &str,
        exclude_uuid: Uuid,
    ) -> Result<i64, StoreError> {
        Ok(self
            .strategies
            .lock()
            .unwrap()
            .values()
            .filter(|cs| {
                cs.user_uuid == user_uuid
                    && cs.symbol == symbol
                    && cs.uuid != exclude_uuid
                    && cs.position_status != PositionStatus::Closed.as_i16()
            })
            .count() as i64)
    }

    async fn user_by_uuid(&self, uuid: Uuid) -> Result<User, StoreError> {
        self.users
            .lock()
            .unwrap()
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::UserNotFound(uuid))
    }

    async fn enabled_symbols(&self) -> Result<Vec<SymbolRow>, StoreError> {
        Ok(self.symbols.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------
// Exchange double
// ---------------------------------------------------------------------

/// Exchange double that fills every order instantly at the requested
/// terms, with an optional artificial latency to keep work in flight.
pub struct MockExchanger {
    next_order_id: AtomicI64,
    pub latency: Duration,
    pub fill_price: Mutex<Decimal>,
}

impl MockExchanger {
    pub fn new() -> Arc<Self> {
        Arc::new(MockExchanger {
            next_order_id: AtomicI64::new(1),
            latency: Duration::ZERO,
            fill_price: Mutex::new(dec!(47000)),
        })
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(MockExchanger {
            next_order_id: AtomicI64::new(1),
            latency,
            fill_price: Mutex::new(dec!(47000)),
        })
    }

    fn next_id(&self) -> OrderId {
        self.next_order_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Exchanger for MockExchanger {
    async fn place_entry_order(
        &self,
        _symbol: &str,
        _side: Side,
        _size: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        self.simulate_latency().await;
        Ok(self.next_id())
    }

    async fn place_stop_loss_order(
        &self,
        _symbol: &str,
        _side: Side,
        _trigger_price: Decimal,
        _size: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        self.simulate_latency().await;
        Ok(self.next_id())
    }

    async fn cancel_open_trigger_order(
        &self,
        _symbol: &str,
        _order_id: OrderId,
    ) -> Result<(), ExchangeError> {
        self.simulate_latency().await;
        Ok(())
    }

    async fn close_position(
        &self,
        _symbol: &str,
        _side: Side,
        _size: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        self.simulate_latency().await;
        Ok(self.next_id())
    }

    async fn get_order_fill(
        &self,
        _symbol: &str,
        order_id: OrderId,
    ) -> Result<Option<OrderFill>, ExchangeError> {
        self.simulate_latency().await;
        let price = *self.fill_price.lock().unwrap();
        Ok(Some(OrderFill {
            order_id,
            price,
            size: dec!(0.02),
            fee: dec!(0.38),
            fee_rate: dec!(0.0004),
            time: Utc::now(),
        }))
    }
}

pub struct MockFactory {
    pub exchanger: Arc<MockExchanger>,
}

impl MockFactory {
    pub fn new(exchanger: Arc<MockExchanger>) -> Arc<Self> {
        Arc::new(Self { exchanger })
    }
}

impl ExchangerFactory for MockFactory {
    fn create(
        &self,
        _exchange: &str,
        _user: &User,
    ) -> Result<Arc<dyn Exchanger>, ExchangeError> {
        Ok(self.exchanger.clone())
    }
}

// ---------------------------------------------------------------------
// Notifier double
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct MockNotifier {
    pub messages: Mutex<Vec<(i64, String)>>,
}

impl MockNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, chat_id: i64, text: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((chat_id, text.to_string()));
    }
}

// ---------------------------------------------------------------------
// Row builders
// ---------------------------------------------------------------------

pub fn user_row(chat_id: i64) -> User {
    User {
        id: 1,
        uuid: Uuid::new_v4(),
        telegram_chat_id: chat_id,
        exchange_api_info: json!({
            "BINANCE": {"api_key": "key", "api_secret": "secret"}
        }),
    }
}

pub fn strategy_row(user_uuid: Uuid, symbol: &str, params: Value) -> ContractStrategy {
    ContractStrategy {
        id: 1,
        uuid: Uuid::new_v4(),
        user_uuid,
        symbol: symbol.to_string(),
        margin: dec!(1000),
        side: Side::Long.as_i16(),
        params,
        enabled: 1,
        position_status: PositionStatus::Closed.as_i16(),
        exchange: "BINANCE".to_string(),
        exchange_orders_details: json!({}),
        last_position_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Entry-only long limit strategy params firing at `price`.
pub fn entry_only_params(price: Decimal) -> Value {
    json!({
        "entry_type": "limit",
        "entry_order": {
            "trigger": {"trigger_type": "limit", "operator": ">=", "price": price.to_string()},
        },
    })
}
