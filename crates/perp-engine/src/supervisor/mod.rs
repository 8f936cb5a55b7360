//! Multi-strategy supervisor.
//!
//! Loads enabled strategies at boot, owns the runner indices, fans mark
//! prices out, and processes lifecycle events on a single-consumer loop
//! so enable/disable spam for one uuid can never interleave.

pub mod events;
pub mod index;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use perp_common::{Mark, PositionStatus};

use crate::db::{ContractStrategy, StoreError, StrategyChanges, StrategyStore, User};
use crate::exchange::{ExchangeError, Exchanger, ExchangerFactory};
use crate::notify::Notifier;
use crate::runner::{hook::EntryTakers, LiveHook, StrategyRunner};
use crate::strategy::ParamsError;

pub use events::{Event, EventReceiver, EventSender};
pub use index::RunnerIndex;

/// Pause between runner launches at boot, avoiding a notification
/// storm.
const STARTUP_THROTTLE: Duration = Duration::from_millis(100);

/// How long a restart waits for the old runner to leave the index.
const RESTART_WAIT: Duration = Duration::from_millis(300);
const RESTART_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum StartRunnerError {
    #[error("bad strategy params: {0}")]
    Params(#[from] ParamsError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

pub struct Supervisor {
    store: Arc<dyn StrategyStore>,
    notifier: Arc<dyn Notifier>,
    exchanger_factory: Arc<dyn ExchangerFactory>,

    index: Arc<RunnerIndex>,
    entry_takers: EntryTakers,
    exchange_clients: DashMap<Uuid, Arc<dyn Exchanger>>,
    user_cache: DashMap<Uuid, Arc<User>>,

    events_tx: EventSender,
    events_rx: std::sync::Mutex<Option<EventReceiver>>,
    events_stop_tx: broadcast::Sender<()>,
    events_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn StrategyStore>,
        notifier: Arc<dyn Notifier>,
        exchanger_factory: Arc<dyn ExchangerFactory>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (events_stop_tx, _) = broadcast::channel(1);
        Arc::new(Supervisor {
            store,
            notifier,
            exchanger_factory,
            index: Arc::new(RunnerIndex::new()),
            entry_takers: Arc::new(DashMap::new()),
            exchange_clients: DashMap::new(),
            user_cache: DashMap::new(),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            events_stop_tx,
            events_task: std::sync::Mutex::new(None),
        })
    }

    pub fn events(&self) -> EventSender {
        self.events_tx.clone()
    }

    pub fn index(&self) -> Arc<RunnerIndex> {
        self.index.clone()
    }

    pub fn runner_count(&self) -> usize {
        self.index.len()
    }

    pub fn exists(&self, uuid: Uuid) -> bool {
        self.index.contains(uuid)
    }

    /// Fan one mark out to every runner listening on the symbol.
    pub fn broadcast(&self, symbol: &str, mark: Mark) {
        self.index.broadcast(symbol, mark);
    }

    /// Launch the event loop and every enabled strategy.
    pub async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        self.spawn_event_loop();

        let strategies = self.store.enabled_strategies().await?;
        info!(count = strategies.len(), "starting enabled strategies");
        for cs in strategies {
            let uuid = cs.uuid;
            let user = match self.fetch_user(cs.user_uuid).await {
                Ok(user) => user,
                Err(e) => {
                    error!(strategy = %uuid, user = %cs.user_uuid, error = %e, "user lookup failed");
                    continue;
                }
            };
            if let Err(e) = self.start_runner(cs, user) {
                error!(strategy = %uuid, error = %e, "failed to start runner");
                let _ = self.events_tx.send(Event::OutOfSync(uuid));
                let _ = self.events_tx.send(Event::Disable(uuid));
            }
            tokio::time::sleep(STARTUP_THROTTLE).await;
        }
        Ok(())
    }

    /// Stop every runner, wait for their in-flight work to drain, then
    /// tear the event loop down.
    pub async fn stop_all(&self) {
        let handles = self.index.all_handles();
        for handle in &handles {
            handle.stop();
        }
        for handle in handles {
            if let Some(join) = handle.take_join() {
                let _ = join.await;
            }
        }

        let _ = self.events_stop_tx.send(());
        let task = self.events_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn spawn_event_loop(self: &Arc<Self>) {
        let mut rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .expect("event loop already started");
        let mut stop_rx = self.events_stop_tx.subscribe();
        let supervisor = self.clone();

        // One event at a time: enable/disable/reset races on the same
        // uuid resolve in arrival order.
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        supervisor.handle_event(event).await;
                    }
                }
            }
        });
        *self.events_task.lock().unwrap() = Some(task);
    }

    async fn handle_event(&self, event: Event) {
        info!(kind = event.kind(), strategy = %event.uuid(), "processing event");
        match event {
            Event::Enable(uuid) => self.enable_strategy(uuid).await,
            Event::Disable(uuid) => self.disable_strategy(uuid).await,
            Event::Restart(uuid) => self.restart_strategy(uuid).await,
            Event::OutOfSync(uuid) => self.out_of_sync_strategy(uuid).await,
            Event::Reset(uuid) => self.reset_strategy(uuid).await,
        }
    }

    /// Fetch the user and refresh the cache.
    async fn fetch_user(&self, uuid: Uuid) -> Result<Arc<User>, StoreError> {
        let user = Arc::new(self.store.user_by_uuid(uuid).await?);
        self.user_cache.insert(uuid, user.clone());
        Ok(user)
    }

    fn cached_user(&self, uuid: Uuid) -> Option<Arc<User>> {
        self.user_cache.get(&uuid).map(|e| e.value().clone())
    }

    /// Build and launch a runner for one strategy row.
    fn start_runner(
        &self,
        cs: ContractStrategy,
        user: Arc<User>,
    ) -> Result<(), StartRunnerError> {
        // Rebuild unconditionally so changed API credentials take
        // effect.
        let exchanger = self.exchanger_factory.create(&cs.exchange, &user)?;
        self.exchange_clients.insert(user.uuid, exchanger.clone());

        let chat_id = user.telegram_chat_id;
        let shared = Arc::new(std::sync::Mutex::new(cs));
        let hook = Arc::new(LiveHook::new(
            shared.clone(),
            user,
            self.store.clone(),
            exchanger,
            self.notifier.clone(),
            self.entry_takers.clone(),
        ));

        let (runner, handle) = StrategyRunner::new(
            shared,
            hook,
            self.notifier.clone(),
            chat_id,
            self.events_tx.clone(),
            self.index.clone(),
        )?;

        self.index.insert(handle.clone());
        handle.set_join(tokio::spawn(runner.run()));
        Ok(())
    }

    async fn enable_strategy(&self, uuid: Uuid) {
        if self.index.contains(uuid) {
            error!(strategy = %uuid, "enable: already in the runner index");
            return;
        }

        let cs = match self.store.strategy_by_uuid(uuid).await {
            Ok(cs) => cs,
            Err(e) => {
                error!(strategy = %uuid, error = %e, "enable: strategy lookup failed");
                return;
            }
        };
        let user = match self.fetch_user(cs.user_uuid).await {
            Ok(user) => user,
            Err(e) => {
                error!(strategy = %uuid, error = %e, "enable: user lookup failed");
                return;
            }
        };
        let label = cs.label();
        let chat_id = user.telegram_chat_id;

        if let Err(e) = self
            .store
            .update_strategy(uuid, StrategyChanges::enabled(true))
            .await
        {
            error!(strategy = %uuid, error = %e, "enable: update failed");
            self.notify(
                chat_id,
                format!(
                    "[Error] '{label}' Internal Server Error. Please check and reset your position and order"
                ),
            );
            return;
        }

        if let Err(e) = self.start_runner(cs, user) {
            error!(strategy = %uuid, error = %e, "enable: failed to start runner");
            self.notify(
                chat_id,
                format!("[Error] '{label}' Internal Server Error. Please disable your strategy"),
            );
            return;
        }

        info!(strategy = %uuid, "strategy has been enabled");
        self.notify(chat_id, format!("[Info] '{label}' has been enabled"));
    }

    async fn disable_strategy(&self, uuid: Uuid) {
        let Some(handle) = self.index.get(uuid) else {
            error!(strategy = %uuid, "disable: not in the runner index");
            return;
        };

        // Serialize against a pending check_price before touching the
        // row or the runner.
        let _serial = handle.serial.lock().await;

        let Some(user) = self.cached_user(handle.user_uuid) else {
            error!(strategy = %uuid, user = %handle.user_uuid, "disable: user not cached");
            return;
        };

        if let Err(e) = self
            .store
            .update_strategy(uuid, StrategyChanges::enabled(false))
            .await
        {
            error!(strategy = %uuid, error = %e, "disable: update failed");
            self.notify(
                user.telegram_chat_id,
                format!(
                    "[Error] '{}' Internal Server Error. Please check and reset your position and order",
                    handle.label
                ),
            );
            return;
        }

        handle.stop();

        info!(strategy = %uuid, symbol = %handle.symbol, "strategy has been disabled");
        self.notify(
            user.telegram_chat_id,
            format!("[Info] '{}' has been disabled", handle.label),
        );
    }

    async fn out_of_sync_strategy(&self, uuid: Uuid) {
        let Some(handle) = self.index.get(uuid) else {
            error!(strategy = %uuid, "out_of_sync: not in the runner index");
            return;
        };
        let _serial = handle.serial.lock().await;

        let Some(user) = self.cached_user(handle.user_uuid) else {
            error!(strategy = %uuid, user = %handle.user_uuid, "out_of_sync: user not cached");
            return;
        };

        if let Err(e) = self
            .store
            .update_strategy(uuid, StrategyChanges::position_status(PositionStatus::Unknown))
            .await
        {
            error!(strategy = %uuid, error = %e, "out_of_sync: update failed");
            self.notify(
                user.telegram_chat_id,
                format!(
                    "[Error] '{}' Internal Server Error. Please check and reset your position and order",
                    handle.label
                ),
            );
            return;
        }

        warn!(strategy = %uuid, symbol = %handle.symbol, "status has been changed to 'Unknown'");
        self.notify(
            user.telegram_chat_id,
            format!(
                "[Warn] '{}' is out of sync, please check and reset your position and order",
                handle.label
            ),
        );
    }

    async fn reset_strategy(&self, uuid: Uuid) {
        let Some(handle) = self.index.get(uuid) else {
            error!(strategy = %uuid, "reset: not in the runner index");
            return;
        };
        let _serial = handle.serial.lock().await;

        let Some(user) = self.cached_user(handle.user_uuid) else {
            error!(strategy = %uuid, user = %handle.user_uuid, "reset: user not cached");
            return;
        };

        let changes = StrategyChanges {
            enabled: Some(0),
            position_status: Some(PositionStatus::Closed.as_i16()),
            exchange_orders_details: Some(serde_json::json!({})),
            ..Default::default()
        };
        if let Err(e) = self.store.update_strategy(uuid, changes).await {
            error!(strategy = %uuid, error = %e, "reset: update failed");
            self.notify(
                user.telegram_chat_id,
                format!(
                    "[Error] '{}' Internal Server Error. Please check and reset your position and order",
                    handle.label
                ),
            );
            return;
        }

        handle.stop();

        info!(strategy = %uuid, symbol = %handle.symbol, "strategy has been reset");
        self.notify(
            user.telegram_chat_id,
            format!("[Info] '{}' has been reset", handle.label),
        );
    }

    async fn restart_strategy(&self, uuid: Uuid) {
        let Some(handle) = self.index.get(uuid) else {
            error!(strategy = %uuid, "restart: not in the runner index");
            return;
        };

        handle.stop();
        if let Some(join) = handle.take_join() {
            let _ = tokio::time::timeout(RESTART_WAIT, join).await;
        }
        // The runner removes itself from the index on exit; correctness
        // requires re-checking rather than assuming the wait sufficed.
        let deadline = tokio::time::Instant::now() + RESTART_WAIT;
        while self.index.contains(uuid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(RESTART_POLL).await;
        }
        if self.index.contains(uuid) {
            error!(strategy = %uuid, "restart: old runner did not exit in time");
            return;
        }

        let cs = match self.store.strategy_by_uuid(uuid).await {
            Ok(cs) => cs,
            Err(e) => {
                error!(strategy = %uuid, error = %e, "restart: strategy lookup failed");
                return;
            }
        };
        let user = match self.fetch_user(cs.user_uuid).await {
            Ok(user) => user,
            Err(e) => {
                error!(strategy = %uuid, error = %e, "restart: user lookup failed");
                return;
            }
        };
        let label = cs.label();
        let chat_id = user.telegram_chat_id;

        if let Err(e) = self.start_runner(cs, user) {
            error!(strategy = %uuid, error = %e, "restart: failed to start runner");
            self.notify(
                chat_id,
                format!("[Error] '{label}' Internal Server Error. Please disable your strategy"),
            );
            return;
        }

        info!(strategy = %uuid, "strategy has been restarted");
        self.notify(chat_id, format!("[Info] '{label}' has been restarted"));
    }

    fn notify(&self, chat_id: i64, text: String) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move { notifier.send(chat_id, &text).await });
    }
}
