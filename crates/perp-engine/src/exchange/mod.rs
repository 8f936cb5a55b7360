//! Exchange client abstraction.
//!
//! The engine needs a small capability set from the exchange: place a
//! market entry order, place a reduce-only stop-market trigger order,
//! cancel an open trigger order, close a position, and read a fill.
//! Each operation has a bounded-retry variant; retries stop early when
//! the error is recognised as benign-terminal (the order is already in
//! the state the caller wanted).

pub mod binance;
pub mod ws;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;

use perp_common::Side;

use crate::db::User;

/// Exchange-side order identifier.
pub type OrderId = i64;

/// Default retry parameters: 30 attempts at 2 s for placement, close,
/// and position lookups; 20 attempts at 2 s for cancellation.
pub const RETRY_ATTEMPTS: u32 = 30;
pub const CANCEL_RETRY_ATTEMPTS: u32 = 20;
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Network or transport failure; always worth retrying.
    #[error("transport: {0}")]
    Transport(String),

    /// Exchange API rejection with its error code.
    #[error("api error {code}: {message}")]
    Api { code: i64, message: String },

    /// The credentials document is missing or malformed.
    #[error("credentials: {0}")]
    Credentials(String),

    /// A response arrived but could not be decoded.
    #[error("bad response: {0}")]
    BadResponse(String),
}

impl ExchangeError {
    /// Errors that mean the desired end state already holds (or can
    /// never hold): retrying is pointless and the caller treats the
    /// operation as settled.
    ///
    /// Binance futures codes: -2011 unknown order (cancel of an already
    /// closed order), -2013 order does not exist, -2022 reduce-only
    /// rejected (position already flat), -2019 margin insufficient,
    /// -4164 notional below minimum.
    pub fn is_benign_terminal(&self) -> bool {
        match self {
            ExchangeError::Api { code, .. } => {
                matches!(code, -2011 | -2013 | -2019 | -2022 | -4164)
            }
            _ => false,
        }
    }

    /// The position side already flat when asked to reduce. Callers
    /// closing a position treat this as "closed by the exchange-side
    /// trigger already".
    pub fn is_reduce_only_rejection(&self) -> bool {
        matches!(self, ExchangeError::Api { code: -2022, .. })
    }

    /// The order was already gone when asked to cancel.
    pub fn is_order_already_closed(&self) -> bool {
        matches!(self, ExchangeError::Api { code: -2011 | -2013, .. })
    }
}

/// Fill details of an executed order.
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub order_id: OrderId,
    /// Average fill price.
    pub price: Decimal,
    /// Executed size.
    pub size: Decimal,
    pub fee: Decimal,
    pub fee_rate: Decimal,
    pub time: DateTime<Utc>,
}

/// Private REST capability set, one client per user.
///
/// Implementations must be internally thread-safe: the client is shared
/// between the runner hook and supervisor-side cleanups.
#[async_trait]
pub trait Exchanger: Send + Sync {
    /// Market entry order. Returns the exchange order id.
    async fn place_entry_order(
        &self,
        symbol: &str,
        side: Side,
        size: Decimal,
    ) -> Result<OrderId, ExchangeError>;

    /// Reduce-only stop-market trigger order at `trigger_price`.
    async fn place_stop_loss_order(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: Decimal,
        size: Decimal,
    ) -> Result<OrderId, ExchangeError>;

    /// Cancel an open trigger order.
    async fn cancel_open_trigger_order(
        &self,
        symbol: &str,
        order_id: OrderId,
    ) -> Result<(), ExchangeError>;

    /// Market reduce-only order closing `size` of the position. Returns
    /// the closing order id.
    async fn close_position(
        &self,
        symbol: &str,
        side: Side,
        size: Decimal,
    ) -> Result<OrderId, ExchangeError>;

    /// Fill details for an order, or `None` while nothing has executed.
    async fn get_order_fill(
        &self,
        symbol: &str,
        order_id: OrderId,
    ) -> Result<Option<OrderFill>, ExchangeError>;

    /// Bounded-retry variant of [`Exchanger::place_stop_loss_order`].
    async fn retry_place_stop_loss_order(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: Decimal,
        size: Decimal,
        attempts: u32,
        interval: Duration,
    ) -> Result<OrderId, ExchangeError> {
        retry(attempts, interval, "place_stop_loss_order", || {
            self.place_stop_loss_order(symbol, side, trigger_price, size)
        })
        .await
    }

    /// Bounded-retry variant of [`Exchanger::cancel_open_trigger_order`].
    async fn retry_cancel_open_trigger_order(
        &self,
        symbol: &str,
        order_id: OrderId,
        attempts: u32,
        interval: Duration,
    ) -> Result<(), ExchangeError> {
        retry(attempts, interval, "cancel_open_trigger_order", || {
            self.cancel_open_trigger_order(symbol, order_id)
        })
        .await
    }

    /// Bounded-retry variant of [`Exchanger::close_position`].
    async fn retry_close_position(
        &self,
        symbol: &str,
        side: Side,
        size: Decimal,
        attempts: u32,
        interval: Duration,
    ) -> Result<OrderId, ExchangeError> {
        retry(attempts, interval, "close_position", || {
            self.close_position(symbol, side, size)
        })
        .await
    }

    /// Retrying fill lookup; also retries while the order has no fill
    /// yet.
    async fn retry_get_order_fill(
        &self,
        symbol: &str,
        order_id: OrderId,
        attempts: u32,
        interval: Duration,
    ) -> Result<Option<OrderFill>, ExchangeError> {
        let mut last = None;
        for attempt in 1..=attempts {
            match self.get_order_fill(symbol, order_id).await {
                Ok(Some(fill)) => return Ok(Some(fill)),
                Ok(None) => last = None,
                Err(e) if e.is_benign_terminal() => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "get_order_fill failed");
                    last = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        match last {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

/// Builds a per-user exchange client from the user's stored credentials.
pub trait ExchangerFactory: Send + Sync {
    fn create(
        &self,
        exchange: &str,
        user: &User,
    ) -> Result<std::sync::Arc<dyn Exchanger>, ExchangeError>;
}

/// Run `op` up to `attempts` times with a fixed interval. Transient
/// errors retry; benign-terminal errors return immediately for the
/// caller to classify.
async fn retry<T, F, Fut>(
    attempts: u32,
    interval: Duration,
    what: &'static str,
    op: F,
) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExchangeError>>,
{
    let mut last = ExchangeError::Transport("no attempts made".to_string());
    for attempt in 1..=attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_benign_terminal() => return Err(e),
            Err(e) => {
                warn!(attempt, what, error = %e, "exchange call failed");
                last = e;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(last)
}
