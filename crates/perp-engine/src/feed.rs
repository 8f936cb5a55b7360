//! Mark-price feed adapter.
//!
//! Subscribes to the exchange's public-trades stream for the enabled
//! symbol set, throttles to at most one sample per 200 ms per symbol,
//! and fans each surviving sample out through the runner index. Any
//! stream error triggers a reconnect after a fixed back-off; the loop
//! terminates only on the shutdown signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use perp_common::Mark;

use crate::supervisor::RunnerIndex;

/// Minimum spacing between published marks per symbol (five per
/// second).
pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(200);

/// Back-off before reconnecting after a stream error.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connect: {0}")]
    Connect(String),

    #[error("stream: {0}")]
    Stream(String),

    #[error("stream closed")]
    Closed,
}

/// One public trade from the exchange.
#[derive(Debug, Clone)]
pub struct Trade {
    pub symbol: String,
    pub price: Decimal,
    pub time: DateTime<Utc>,
}

/// A connected public-trades stream.
#[async_trait]
pub trait TradeStream: Send {
    async fn next_trade(&mut self) -> Result<Trade, FeedError>;
}

/// Connects trade streams for a symbol set; one connection per feed
/// session, re-invoked on every reconnect.
#[async_trait]
pub trait TradeStreamConnector: Send + Sync {
    async fn connect(&self, symbols: &[String]) -> Result<Box<dyn TradeStream>, FeedError>;
}

/// Per-symbol rate limiter: drop anything arriving inside the window.
pub struct Throttle {
    interval: Duration,
    last_published: HashMap<String, Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_published: HashMap::new(),
        }
    }

    pub fn allow(&mut self, symbol: &str) -> bool {
        self.allow_at(symbol, Instant::now())
    }

    fn allow_at(&mut self, symbol: &str, now: Instant) -> bool {
        match self.last_published.get(symbol) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                self.last_published.insert(symbol.to_string(), now);
                true
            }
        }
    }
}

/// The feed: connect, throttle, publish, reconnect.
pub struct MarkFeed {
    connector: Arc<dyn TradeStreamConnector>,
    index: Arc<RunnerIndex>,
    symbols: Vec<String>,
    throttle: Throttle,
    stop_tx: broadcast::Sender<()>,
}

impl MarkFeed {
    pub fn new(
        connector: Arc<dyn TradeStreamConnector>,
        index: Arc<RunnerIndex>,
        symbols: Vec<String>,
    ) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            connector,
            index,
            symbols,
            throttle: Throttle::new(THROTTLE_INTERVAL),
            stop_tx,
        }
    }

    /// Handle used by the shutdown coordinator to close the feed.
    pub fn stop_handle(&self) -> FeedStopHandle {
        FeedStopHandle {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Connect-listen-reconnect loop. Returns when the stop handle
    /// fires.
    pub async fn run(mut self) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            info!(symbols = ?self.symbols, "feed connecting");
            let stream = tokio::select! {
                _ = stop_rx.recv() => break,
                result = self.connector.connect(&self.symbols) => result,
            };

            match stream {
                Ok(stream) => {
                    info!("feed listening");
                    if self.listen(stream, &mut stop_rx).await {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "feed connection failed"),
            }

            // Reconnect after a pause unless shutting down.
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
        info!("feed closed");
    }

    /// Returns true when the feed should terminate instead of
    /// reconnecting.
    async fn listen(
        &mut self,
        mut stream: Box<dyn TradeStream>,
        stop_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        loop {
            let trade = tokio::select! {
                _ = stop_rx.recv() => return true,
                trade = stream.next_trade() => trade,
            };
            match trade {
                Ok(trade) => {
                    if self.throttle.allow(&trade.symbol) {
                        self.index
                            .broadcast(&trade.symbol, Mark::new(trade.price, trade.time));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "feed stream error, reconnecting");
                    return false;
                }
            }
        }
    }
}

/// Clonable stop signal for the feed.
#[derive(Clone)]
pub struct FeedStopHandle {
    stop_tx: broadcast::Sender<()>,
}

impl FeedStopHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}
