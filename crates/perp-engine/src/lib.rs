//! Strategy engine for perpetual-futures contracts.
//!
//! Executes user-defined derivatives strategies against a live
//! mark-price feed. Each strategy is a small state machine driven by
//! price samples: it waits for an entry condition, opens a position
//! through the exchange REST API, tracks a stop-loss trigger, optionally
//! readjusts its entry trendline after losses, and closes on stop-loss
//! or take-profit.
//!
//! ## Architecture
//!
//! - `strategy`: triggers, orders, and the contract state machine (pure,
//!   no IO)
//! - `runner`: per-strategy runner and the live hook performing the IO
//! - `supervisor`: runner indices, mark broadcast, lifecycle event loop
//! - `feed`: public-trades adapter with per-symbol throttling
//! - `exchange`: REST capability set and the trades WebSocket client
//! - `db`: strategy/user/symbol persistence behind a trait seam
//! - `notify`: user notifications
//! - `server`: admin HTTP surface
//! - `shutdown`: staged, bounded teardown
//!
//! CRITICAL: All prices use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

pub mod config;
pub mod db;
pub mod exchange;
pub mod feed;
pub mod notify;
pub mod runner;
pub mod server;
pub mod shutdown;
pub mod strategy;
pub mod supervisor;

pub use config::EngineConfig;
pub use db::{ContractStrategy, PgStore, StoreError, StrategyChanges, StrategyStore, User};
pub use exchange::{ExchangeError, Exchanger, ExchangerFactory, OrderFill, OrderId};
pub use feed::{FeedError, MarkFeed, Throttle, Trade, TradeStream, TradeStreamConnector};
pub use notify::{new_notifier, Notifier};
pub use runner::{LiveHook, RunnerHandle, SharedStrategy, StrategyRunner};
pub use strategy::contract::{
    BreakoutPeak, CheckError, CheckOutcome, Contract, ContractHook, EntryDecision, HookError,
};
pub use strategy::{ParamsError, Trigger};
pub use supervisor::{Event, EventSender, RunnerIndex, Supervisor};
