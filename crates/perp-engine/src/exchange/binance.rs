//! Binance USDT-margined futures REST client.
//!
//! Signed endpoints follow the standard scheme: the query string plus a
//! millisecond timestamp is HMAC-SHA256 signed with the API secret and
//! appended as `signature`; the API key travels in the `X-MBX-APIKEY`
//! header.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use perp_common::Side;

use crate::db::User;

use super::{ExchangeError, Exchanger, ExchangerFactory, OrderFill, OrderId};

const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

type HmacSha256 = Hmac<Sha256>;

/// Per-user REST client. `reqwest::Client` is internally thread-safe,
/// so one instance is shared between the hook and supervisor cleanups.
#[derive(Debug)]
pub struct BinanceFutures {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceFutures {
    /// Build a client from a user's credentials document:
    /// `{"api_key": "...", "api_secret": "..."}`.
    pub fn from_credentials(credentials: &Value) -> Result<Self, ExchangeError> {
        Self::with_base_url(credentials, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(credentials: &Value, base_url: &str) -> Result<Self, ExchangeError> {
        let api_key = credential_field(credentials, "api_key")?;
        let api_secret = credential_field(credentials, "api_secret")?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
        })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<T, ExchangeError> {
        params.push(("timestamp".to_string(), Utc::now().timestamp_millis().to_string()));
        params.push(("recvWindow".to_string(), "5000".to_string()));

        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        debug!(%path, "binance request");
        let response = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(decode_api_error(status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|e| ExchangeError::BadResponse(e.to_string()))
    }

    fn order_side(side: Side, reduce: bool) -> &'static str {
        // Reducing means trading against the position direction.
        match (side, reduce) {
            (Side::Long, false) | (Side::Short, true) => "BUY",
            (Side::Short, false) | (Side::Long, true) => "SELL",
        }
    }
}

fn credential_field(credentials: &Value, key: &str) -> Result<String, ExchangeError> {
    credentials
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ExchangeError::Credentials(format!("'{key}' is missing")))
}

fn decode_api_error(status: u16, body: &str) -> ExchangeError {
    #[derive(Deserialize)]
    struct ApiError {
        code: i64,
        msg: String,
    }
    match serde_json::from_str::<ApiError>(body) {
        Ok(e) => ExchangeError::Api {
            code: e.code,
            message: e.msg,
        },
        Err(_) => ExchangeError::BadResponse(format!("http {status}: {body}")),
    }
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, ExchangeError> {
    raw.parse()
        .map_err(|_| ExchangeError::BadResponse(format!("'{field}' is not a decimal: {raw}")))
}

fn ms_to_time(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct OrderAck {
    #[serde(rename = "orderId")]
    order_id: i64,
}

#[derive(Debug, Deserialize)]
struct OrderStatus {
    #[serde(rename = "orderId")]
    order_id: i64,
    #[serde(rename = "avgPrice")]
    avg_price: String,
    #[serde(rename = "executedQty")]
    executed_qty: String,
    status: String,
    #[serde(rename = "updateTime")]
    update_time: i64,
}

#[derive(Debug, Deserialize)]
struct UserTrade {
    commission: String,
}

#[async_trait]
impl Exchanger for BinanceFutures {
    async fn place_entry_order(
        &self,
        symbol: &str,
        side: Side,
        size: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        let ack: OrderAck = self
            .signed_request(
                Method::POST,
                "/fapi/v1/order",
                vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("side".to_string(), Self::order_side(side, false).to_string()),
                    ("type".to_string(), "MARKET".to_string()),
                    ("quantity".to_string(), size.to_string()),
                ],
            )
            .await?;
        Ok(ack.order_id)
    }

    async fn place_stop_loss_order(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: Decimal,
        size: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        let ack: OrderAck = self
            .signed_request(
                Method::POST,
                "/fapi/v1/order",
                vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("side".to_string(), Self::order_side(side, true).to_string()),
                    ("type".to_string(), "STOP_MARKET".to_string()),
                    ("stopPrice".to_string(), trigger_price.to_string()),
                    ("quantity".to_string(), size.to_string()),
                    ("reduceOnly".to_string(), "true".to_string()),
                ],
            )
            .await?;
        Ok(ack.order_id)
    }

    async fn cancel_open_trigger_order(
        &self,
        symbol: &str,
        order_id: OrderId,
    ) -> Result<(), ExchangeError> {
        let _: Value = self
            .signed_request(
                Method::DELETE,
                "/fapi/v1/order",
                vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("orderId".to_string(), order_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: Side,
        size: Decimal,
    ) -> Result<OrderId, ExchangeError> {
        let ack: OrderAck = self
            .signed_request(
                Method::POST,
                "/fapi/v1/order",
                vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("side".to_string(), Self::order_side(side, true).to_string()),
                    ("type".to_string(), "MARKET".to_string()),
                    ("quantity".to_string(), size.to_string()),
                    ("reduceOnly".to_string(), "true".to_string()),
                ],
            )
            .await?;
        Ok(ack.order_id)
    }

    async fn get_order_fill(
        &self,
        symbol: &str,
        order_id: OrderId,
    ) -> Result<Option<OrderFill>, ExchangeError> {
        let status: OrderStatus = self
            .signed_request(
                Method::GET,
                "/fapi/v1/order",
                vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("orderId".to_string(), order_id.to_string()),
                ],
            )
            .await?;

        if status.status != "FILLED" {
            return Ok(None);
        }

        let price = parse_decimal(&status.avg_price, "avgPrice")?;
        let size = parse_decimal(&status.executed_qty, "executedQty")?;

        // Commissions live on the trade records, not the order.
        let trades: Vec<UserTrade> = self
            .signed_request(
                Method::GET,
                "/fapi/v1/userTrades",
                vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("orderId".to_string(), order_id.to_string()),
                ],
            )
            .await?;
        let fee = trades
            .iter()
            .map(|t| parse_decimal(&t.commission, "commission"))
            .sum::<Result<Decimal, _>>()?;
        let notional = price * size;
        let fee_rate = if notional > Decimal::ZERO {
            fee / notional
        } else {
            Decimal::ZERO
        };

        Ok(Some(OrderFill {
            order_id: status.order_id,
            price,
            size,
            fee,
            fee_rate,
            time: ms_to_time(status.update_time),
        }))
    }
}

/// Builds one [`BinanceFutures`] client per user from the credentials
/// stored on the user row.
pub struct BinanceFactory {
    base_url: String,
}

impl BinanceFactory {
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for BinanceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangerFactory for BinanceFactory {
    fn create(&self, exchange: &str, user: &User) -> Result<Arc<dyn Exchanger>, ExchangeError> {
        if exchange != "BINANCE" {
            return Err(ExchangeError::Credentials(format!(
                "exchange '{exchange}' not supported"
            )));
        }
        let credentials = user.api_credentials(exchange).ok_or_else(|| {
            ExchangeError::Credentials(format!("no '{exchange}' credentials for user"))
        })?;
        Ok(Arc::new(BinanceFutures::with_base_url(
            credentials,
            &self.base_url,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_order_side_mapping() {
        assert_eq!(BinanceFutures::order_side(Side::Long, false), "BUY");
        assert_eq!(BinanceFutures::order_side(Side::Long, true), "SELL");
        assert_eq!(BinanceFutures::order_side(Side::Short, false), "SELL");
        assert_eq!(BinanceFutures::order_side(Side::Short, true), "BUY");
    }

    #[test]
    fn test_signature_is_deterministic_hex() {
        let client = BinanceFutures::from_credentials(&json!({
            "api_key": "key",
            "api_secret": "secret",
        }))
        .unwrap();
        let a = client.sign("symbol=BTCUSDT&timestamp=1");
        let b = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_missing_credentials() {
        let err = BinanceFutures::from_credentials(&json!({"api_key": "key"})).unwrap_err();
        assert!(matches!(err, ExchangeError::Credentials(_)));
    }

    #[test]
    fn test_decode_api_error() {
        let err = decode_api_error(400, r#"{"code":-2022,"msg":"ReduceOnly Order is rejected."}"#);
        assert!(err.is_reduce_only_rejection());

        let err = decode_api_error(502, "<html>bad gateway</html>");
        assert!(matches!(err, ExchangeError::BadResponse(_)));
    }
}
