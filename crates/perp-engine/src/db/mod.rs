//! Persistence layer.
//!
//! The engine talks to the database through the [`StrategyStore`] trait
//! so the runner and supervisor can be exercised against in-memory
//! doubles. The production implementation is a thin `sqlx` Postgres
//! wrapper; every row is bounded to its uuid, so concurrent writers on
//! different strategies never conflict.

pub mod models;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub use models::{ContractStrategy, StrategyChanges, SymbolRow, User};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(String),

    #[error("strategy '{0}' not found")]
    StrategyNotFound(Uuid),

    #[error("user '{0}' not found")]
    UserNotFound(Uuid),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Operations the engine needs from the database.
#[async_trait]
pub trait StrategyStore: Send + Sync {
    /// All strategies with `enabled = 1`, loaded at boot.
    async fn enabled_strategies(&self) -> Result<Vec<ContractStrategy>, StoreError>;

    async fn strategy_by_uuid(&self, uuid: Uuid) -> Result<ContractStrategy, StoreError>;

    /// Partial update of one strategy row.
    async fn update_strategy(
        &self,
        uuid: Uuid,
        changes: StrategyChanges,
    ) -> Result<(), StoreError>;

    /// Number of non-closed strategies for the same user and symbol,
    /// excluding `exclude_uuid`. Used to enforce one entry per user per
    /// symbol.
    async fn non_closed_count(
        &self,
        user_uuid: Uuid,
        symbol: &str,
        exclude_uuid: Uuid,
    ) -> Result<i64, StoreError>;

    async fn user_by_uuid(&self, uuid: Uuid) -> Result<User, StoreError>;

    /// Symbols the feed subscribes to.
    async fn enabled_symbols(&self) -> Result<Vec<SymbolRow>, StoreError>;
}

/// Postgres-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        info!("connecting to database");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StrategyStore for PgStore {
    async fn enabled_strategies(&self) -> Result<Vec<ContractStrategy>, StoreError> {
        let rows = sqlx::query_as::<_, ContractStrategy>(
            "SELECT * FROM contract_strategies WHERE enabled = 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn strategy_by_uuid(&self, uuid: Uuid) -> Result<ContractStrategy, StoreError> {
        sqlx::query_as::<_, ContractStrategy>(
            "SELECT * FROM contract_strategies WHERE uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::StrategyNotFound(uuid))
    }

    async fn update_strategy(
        &self,
        uuid: Uuid,
        changes: StrategyChanges,
    ) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE contract_strategies SET updated_at = now()");
        if let Some(enabled) = changes.enabled {
            builder.push(", enabled = ").push_bind(enabled);
        }
        if let Some(status) = changes.position_status {
            builder.push(", position_status = ").push_bind(status);
        }
        if let Some(params) = changes.params {
            builder.push(", params = ").push_bind(params);
        }
        if let Some(details) = changes.exchange_orders_details {
            builder
                .push(", exchange_orders_details = ")
                .push_bind(details);
        }
        if let Some(at) = changes.last_position_at {
            builder.push(", last_position_at = ").push_bind(at);
        }
        builder.push(" WHERE uuid = ").push_bind(uuid);

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::StrategyNotFound(uuid));
        }
        Ok(())
    }

    async fn non_closed_count(
        &self,
        user_uuid: Uuid,
        symbol: &str,
        exclude_uuid: Uuid,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM contract_strategies \
             WHERE user_uuid = $1 AND symbol = $2 AND uuid <> $3 AND position_status <> $4",
        )
        .bind(user_uuid)
        .bind(symbol)
        .bind(exclude_uuid)
        .bind(perp_common::PositionStatus::Closed.as_i16())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn user_by_uuid(&self, uuid: Uuid) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE uuid = $1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::UserNotFound(uuid))
    }

    async fn enabled_symbols(&self) -> Result<Vec<SymbolRow>, StoreError> {
        let rows = sqlx::query_as::<_, SymbolRow>("SELECT * FROM symbols WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
