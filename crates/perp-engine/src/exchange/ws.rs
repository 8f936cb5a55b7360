//! Binance aggregate-trades WebSocket client.
//!
//! Implements the feed's [`TradeStream`] over a combined-stream
//! subscription (`<symbol>@aggTrade` per symbol). Protocol pings are
//! answered inline; unparseable frames are skipped rather than treated
//! as fatal.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::feed::{FeedError, Trade, TradeStream, TradeStreamConnector};

const DEFAULT_WS_BASE: &str = "wss://fstream.binance.com";

/// Aggregate trade payload.
#[derive(Debug, Deserialize)]
struct AggTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "T")]
    timestamp: i64,
}

/// Combined-stream envelope.
#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[allow(dead_code)]
    stream: String,
    data: AggTrade,
}

pub struct BinanceTradeConnector {
    ws_base: String,
}

impl BinanceTradeConnector {
    pub fn new() -> Self {
        Self {
            ws_base: DEFAULT_WS_BASE.to_string(),
        }
    }

    pub fn with_base(ws_base: impl Into<String>) -> Self {
        Self {
            ws_base: ws_base.into(),
        }
    }

    fn stream_url(&self, symbols: &[String]) -> String {
        let streams = symbols
            .iter()
            .map(|s| format!("{}@aggTrade", s.to_lowercase()))
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/stream?streams={streams}", self.ws_base)
    }
}

impl Default for BinanceTradeConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeStreamConnector for BinanceTradeConnector {
    async fn connect(&self, symbols: &[String]) -> Result<Box<dyn TradeStream>, FeedError> {
        if symbols.is_empty() {
            return Err(FeedError::Connect("no symbols to subscribe".to_string()));
        }
        let url = self.stream_url(symbols);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        Ok(Box::new(BinanceTradeStream { ws }))
    }
}

pub struct BinanceTradeStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TradeStream for BinanceTradeStream {
    async fn next_trade(&mut self) -> Result<Trade, FeedError> {
        loop {
            let message = self
                .ws
                .next()
                .await
                .ok_or(FeedError::Closed)?
                .map_err(|e| FeedError::Stream(e.to_string()))?;

            match message {
                Message::Text(text) => {
                    let parsed: StreamMessage = match serde_json::from_str(&text) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            debug!(error = %e, "skipping unparseable frame");
                            continue;
                        }
                    };
                    let price: Decimal = parsed
                        .data
                        .price
                        .parse()
                        .map_err(|_| FeedError::Stream("bad trade price".to_string()))?;
                    let time = Utc
                        .timestamp_millis_opt(parsed.data.timestamp)
                        .single()
                        .ok_or_else(|| FeedError::Stream("bad trade timestamp".to_string()))?;
                    return Ok(Trade {
                        symbol: parsed.data.symbol,
                        price,
                        time,
                    });
                }
                Message::Ping(payload) => {
                    self.ws
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| FeedError::Stream(e.to_string()))?;
                }
                Message::Close(_) => return Err(FeedError::Closed),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_lowercases_symbols() {
        let connector = BinanceTradeConnector::with_base("wss://example.test");
        let url = connector.stream_url(&["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert_eq!(
            url,
            "wss://example.test/stream?streams=btcusdt@aggTrade/ethusdt@aggTrade"
        );
    }

    #[test]
    fn test_agg_trade_parses() {
        let raw = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1628812800123,"s":"BTCUSDT","a":1,"p":"47000.10","q":"0.5","f":1,"l":2,"T":1628812800100,"m":false}}"#;
        let parsed: StreamMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.data.symbol, "BTCUSDT");
        assert_eq!(parsed.data.price, "47000.10");
        assert_eq!(parsed.data.timestamp, 1628812800100);
    }
}
