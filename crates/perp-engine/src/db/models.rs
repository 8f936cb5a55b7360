//! Row models for the persistence layer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use perp_common::{PositionStatus, Side};

/// A persisted contract strategy.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ContractStrategy {
    pub id: i64,
    pub uuid: Uuid,
    pub user_uuid: Uuid,
    /// e.g. `BTCUSDT`.
    pub symbol: String,
    /// Quote-currency margin used to size the entry.
    pub margin: Decimal,
    /// 1: long, 0: short.
    pub side: i16,
    /// Params blob re-hydrating the contract.
    pub params: Value,
    /// 1: enabled, 0: disabled.
    pub enabled: i16,
    /// 0: closed, 1: opened, 2: unknown.
    pub position_status: i16,
    /// e.g. `BINANCE`.
    pub exchange: String,
    /// Exchange-side order ids and fill details for the open position.
    pub exchange_orders_details: Value,
    pub last_position_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContractStrategy {
    pub fn side(&self) -> Option<Side> {
        Side::from_i16(self.side)
    }

    pub fn position_status(&self) -> Option<PositionStatus> {
        PositionStatus::from_i16(self.position_status)
    }

    /// `"Long BTCUSDT"`-style label used in notifications.
    pub fn label(&self) -> String {
        let side = self
            .side()
            .map(|s| s.as_str())
            .unwrap_or("?");
        format!("{} {}", side, self.symbol)
    }
}

/// A tradable symbol; the feed subscribes to every enabled row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SymbolRow {
    pub id: i64,
    pub market_type: String,
    pub exchange: String,
    pub name: String,
    pub enabled: i16,
}

/// A strategy owner.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub uuid: Uuid,
    pub telegram_chat_id: i64,
    /// Per-exchange API credentials, keyed by exchange name.
    pub exchange_api_info: Value,
}

impl User {
    /// Credentials document for one exchange, if configured.
    pub fn api_credentials(&self, exchange: &str) -> Option<&Value> {
        self.exchange_api_info.get(exchange)
    }
}

/// Partial update of a strategy row. Only the set fields are written.
#[derive(Debug, Clone, Default)]
pub struct StrategyChanges {
    pub enabled: Option<i16>,
    pub position_status: Option<i16>,
    pub params: Option<Value>,
    pub exchange_orders_details: Option<Value>,
    pub last_position_at: Option<DateTime<Utc>>,
}

impl StrategyChanges {
    pub fn enabled(v: bool) -> Self {
        StrategyChanges {
            enabled: Some(v as i16),
            ..Default::default()
        }
    }

    pub fn position_status(status: PositionStatus) -> Self {
        StrategyChanges {
            position_status: Some(status.as_i16()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_none()
            && self.position_status.is_none()
            && self.params.is_none()
            && self.exchange_orders_details.is_none()
            && self.last_position_at.is_none()
    }
}
