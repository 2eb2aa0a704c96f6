//! SQLite-backed store.
//!
//! Decimals are stored as TEXT to keep them exact; timestamps as RFC 3339.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{Sqlite, SqlitePoolOptions};
use sqlx::{Executor, SqlitePool};
use std::str::FromStr;
use tracing::error;

use super::Store;
use crate::error::StoreError;
use crate::models::{
    OrderType, RiskSettings, RiskState, Side, SignalSource, StopOrigin, StrategyState, Trade,
    TradeStatus, UserAccount,
};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct AccountRow {
    user_id: String,
    paper_trading_mode: bool,
    paper_capital: String,
    risk_settings: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct RiskStateRow {
    user_id: String,
    daily_pnl: String,
    trade_count: i64,
    consecutive_losses: i64,
    emergency_stop: bool,
    emergency_stop_reason: Option<String>,
    emergency_stop_origin: Option<String>,
    capital_conservation_mode: bool,
    last_reset_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StrategyStateRow {
    user_id: String,
    strategy_name: String,
    confidence_score: String,
    consecutive_losses: i64,
    total_trades: i64,
    winning_trades: i64,
    total_pnl: String,
    updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TradeRow {
    id: String,
    user_id: String,
    symbol: String,
    side: String,
    order_type: String,
    quantity: String,
    requested_price: String,
    executed_price: Option<String>,
    status: String,
    strategy_name: String,
    confidence_score: String,
    source: String,
    pnl: String,
    fees: String,
    stop_loss_price: Option<String>,
    take_profit_price: Option<String>,
    order_id: Option<String>,
    error_message: Option<String>,
    entry_time: String,
    exit_time: Option<String>,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. A single long-lived connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                user_id TEXT PRIMARY KEY,
                paper_trading_mode INTEGER NOT NULL DEFAULT 1,
                paper_capital TEXT NOT NULL,
                risk_settings TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS risk_states (
                user_id TEXT PRIMARY KEY,
                daily_pnl TEXT NOT NULL,
                trade_count INTEGER NOT NULL DEFAULT 0,
                consecutive_losses INTEGER NOT NULL DEFAULT 0,
                emergency_stop INTEGER NOT NULL DEFAULT 0,
                emergency_stop_reason TEXT,
                emergency_stop_origin TEXT,
                capital_conservation_mode INTEGER NOT NULL DEFAULT 0,
                last_reset_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_states (
                user_id TEXT NOT NULL,
                strategy_name TEXT NOT NULL,
                confidence_score TEXT NOT NULL,
                consecutive_losses INTEGER NOT NULL DEFAULT 0,
                total_trades INTEGER NOT NULL DEFAULT 0,
                winning_trades INTEGER NOT NULL DEFAULT 0,
                total_pnl TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, strategy_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity TEXT NOT NULL,
                requested_price TEXT NOT NULL,
                executed_price TEXT,
                status TEXT NOT NULL,
                strategy_name TEXT NOT NULL,
                confidence_score TEXT NOT NULL,
                source TEXT NOT NULL,
                pnl TEXT NOT NULL,
                fees TEXT NOT NULL,
                stop_loss_price TEXT,
                take_profit_price TEXT,
                order_id TEXT,
                error_message TEXT,
                entry_time TEXT NOT NULL,
                exit_time TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_user_time ON trades(user_id, entry_time)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    error!(error = %e, "Database error");
    StoreError::Backend(e.to_string())
}

fn decimal(field: &str, raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|_| StoreError::Corrupted(format!("{}: not a decimal: {}", field, raw)))
}

fn opt_decimal(field: &str, raw: Option<&str>) -> Result<Option<Decimal>, StoreError> {
    raw.map(|r| decimal(field, r)).transpose()
}

fn timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupted(format!("{}: not a timestamp: {}", field, raw)))
}

fn counter(field: &str, raw: i64) -> Result<u32, StoreError> {
    u32::try_from(raw).map_err(|_| StoreError::Corrupted(format!("{}: out of range: {}", field, raw)))
}

fn parsed<T>(field: &str, raw: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T, StoreError> {
    parse(raw).ok_or_else(|| StoreError::Corrupted(format!("{}: unknown value: {}", field, raw)))
}

impl TryFrom<AccountRow> for UserAccount {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let risk_settings: RiskSettings = serde_json::from_str(&row.risk_settings)
            .map_err(|e| StoreError::Corrupted(format!("risk_settings: {}", e)))?;

        Ok(UserAccount {
            paper_capital: decimal("paper_capital", &row.paper_capital)?,
            user_id: row.user_id,
            paper_trading_mode: row.paper_trading_mode,
            risk_settings,
        })
    }
}

impl TryFrom<RiskStateRow> for RiskState {
    type Error = StoreError;

    fn try_from(row: RiskStateRow) -> Result<Self, Self::Error> {
        let emergency_stop_origin = row
            .emergency_stop_origin
            .as_deref()
            .map(|o| parsed("emergency_stop_origin", o, StopOrigin::parse))
            .transpose()?;

        Ok(RiskState {
            daily_pnl: decimal("daily_pnl", &row.daily_pnl)?,
            trade_count: counter("trade_count", row.trade_count)?,
            consecutive_losses: counter("consecutive_losses", row.consecutive_losses)?,
            emergency_stop: row.emergency_stop,
            emergency_stop_reason: row.emergency_stop_reason,
            emergency_stop_origin,
            capital_conservation_mode: row.capital_conservation_mode,
            last_reset_at: timestamp("last_reset_at", &row.last_reset_at)?,
            user_id: row.user_id,
        })
    }
}

impl TryFrom<StrategyStateRow> for StrategyState {
    type Error = StoreError;

    fn try_from(row: StrategyStateRow) -> Result<Self, Self::Error> {
        Ok(StrategyState {
            confidence_score: decimal("confidence_score", &row.confidence_score)?,
            consecutive_losses: counter("consecutive_losses", row.consecutive_losses)?,
            total_trades: counter("total_trades", row.total_trades)?,
            winning_trades: counter("winning_trades", row.winning_trades)?,
            total_pnl: decimal("total_pnl", &row.total_pnl)?,
            updated_at: timestamp("updated_at", &row.updated_at)?,
            user_id: row.user_id,
            strategy_name: row.strategy_name,
        })
    }
}

impl TryFrom<TradeRow> for Trade {
    type Error = StoreError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        Ok(Trade {
            side: parsed("side", &row.side, Side::parse)?,
            order_type: parsed("order_type", &row.order_type, OrderType::parse)?,
            quantity: decimal("quantity", &row.quantity)?,
            requested_price: decimal("requested_price", &row.requested_price)?,
            executed_price: opt_decimal("executed_price", row.executed_price.as_deref())?,
            status: parsed("status", &row.status, TradeStatus::parse)?,
            confidence_score: decimal("confidence_score", &row.confidence_score)?,
            source: parsed("source", &row.source, SignalSource::parse)?,
            pnl: decimal("pnl", &row.pnl)?,
            fees: decimal("fees", &row.fees)?,
            stop_loss_price: opt_decimal("stop_loss_price", row.stop_loss_price.as_deref())?,
            take_profit_price: opt_decimal("take_profit_price", row.take_profit_price.as_deref())?,
            entry_time: timestamp("entry_time", &row.entry_time)?,
            exit_time: row.exit_time.as_deref().map(|t| timestamp("exit_time", t)).transpose()?,
            id: row.id,
            user_id: row.user_id,
            symbol: row.symbol,
            strategy_name: row.strategy_name,
            order_id: row.order_id,
            error_message: row.error_message,
        })
    }
}

async fn upsert_risk_state<'e, E>(executor: E, state: &RiskState) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO risk_states (
            user_id, daily_pnl, trade_count, consecutive_losses, emergency_stop,
            emergency_stop_reason, emergency_stop_origin, capital_conservation_mode, last_reset_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            daily_pnl = excluded.daily_pnl,
            trade_count = excluded.trade_count,
            consecutive_losses = excluded.consecutive_losses,
            emergency_stop = excluded.emergency_stop,
            emergency_stop_reason = excluded.emergency_stop_reason,
            emergency_stop_origin = excluded.emergency_stop_origin,
            capital_conservation_mode = excluded.capital_conservation_mode,
            last_reset_at = excluded.last_reset_at
        "#,
    )
    .bind(&state.user_id)
    .bind(state.daily_pnl.to_string())
    .bind(i64::from(state.trade_count))
    .bind(i64::from(state.consecutive_losses))
    .bind(state.emergency_stop)
    .bind(&state.emergency_stop_reason)
    .bind(state.emergency_stop_origin.map(|o| o.as_str()))
    .bind(state.capital_conservation_mode)
    .bind(state.last_reset_at.to_rfc3339())
    .execute(executor)
    .await
    .map_err(backend)?;

    Ok(())
}

async fn upsert_strategy_state<'e, E>(executor: E, state: &StrategyState) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO strategy_states (
            user_id, strategy_name, confidence_score, consecutive_losses,
            total_trades, winning_trades, total_pnl, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, strategy_name) DO UPDATE SET
            confidence_score = excluded.confidence_score,
            consecutive_losses = excluded.consecutive_losses,
            total_trades = excluded.total_trades,
            winning_trades = excluded.winning_trades,
            total_pnl = excluded.total_pnl,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&state.user_id)
    .bind(&state.strategy_name)
    .bind(state.confidence_score.to_string())
    .bind(i64::from(state.consecutive_losses))
    .bind(i64::from(state.total_trades))
    .bind(i64::from(state.winning_trades))
    .bind(state.total_pnl.to_string())
    .bind(state.updated_at.to_rfc3339())
    .execute(executor)
    .await
    .map_err(backend)?;

    Ok(())
}

async fn upsert_trade<'e, E>(executor: E, trade: &Trade) -> Result<u64, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO trades (
            id, user_id, symbol, side, order_type, quantity, requested_price, executed_price,
            status, strategy_name, confidence_score, source, pnl, fees,
            stop_loss_price, take_profit_price, order_id, error_message, entry_time, exit_time
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            executed_price = excluded.executed_price,
            status = excluded.status,
            confidence_score = excluded.confidence_score,
            pnl = excluded.pnl,
            fees = excluded.fees,
            stop_loss_price = excluded.stop_loss_price,
            take_profit_price = excluded.take_profit_price,
            order_id = excluded.order_id,
            error_message = excluded.error_message,
            exit_time = excluded.exit_time
        "#,
    )
    .bind(&trade.id)
    .bind(&trade.user_id)
    .bind(&trade.symbol)
    .bind(trade.side.as_str())
    .bind(trade.order_type.as_str())
    .bind(trade.quantity.to_string())
    .bind(trade.requested_price.to_string())
    .bind(trade.executed_price.map(|p| p.to_string()))
    .bind(trade.status.as_str())
    .bind(&trade.strategy_name)
    .bind(trade.confidence_score.to_string())
    .bind(trade.source.as_str())
    .bind(trade.pnl.to_string())
    .bind(trade.fees.to_string())
    .bind(trade.stop_loss_price.map(|p| p.to_string()))
    .bind(trade.take_profit_price.map(|p| p.to_string()))
    .bind(&trade.order_id)
    .bind(&trade.error_message)
    .bind(trade.entry_time.to_rfc3339())
    .bind(trade.exit_time.map(|t| t.to_rfc3339()))
    .execute(executor)
    .await
    .map_err(backend)?;

    Ok(result.rows_affected())
}

#[async_trait]
impl Store for Database {
    async fn load_account(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT user_id, paper_trading_mode, paper_capital, risk_settings FROM accounts WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(UserAccount::try_from).transpose()
    }

    async fn save_account(&self, account: &UserAccount) -> Result<(), StoreError> {
        let settings = serde_json::to_string(&account.risk_settings)
            .map_err(|e| StoreError::Backend(format!("serialize risk settings: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO accounts (user_id, paper_trading_mode, paper_capital, risk_settings, updated_at)
            VALUES (?, ?, ?, ?, datetime('now'))
            ON CONFLICT(user_id) DO UPDATE SET
                paper_trading_mode = excluded.paper_trading_mode,
                paper_capital = excluded.paper_capital,
                risk_settings = excluded.risk_settings,
                updated_at = datetime('now')
            "#,
        )
        .bind(&account.user_id)
        .bind(account.paper_trading_mode)
        .bind(account.paper_capital.to_string())
        .bind(settings)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT user_id FROM accounts ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn load_risk_state(&self, user_id: &str) -> Result<Option<RiskState>, StoreError> {
        let row = sqlx::query_as::<_, RiskStateRow>("SELECT * FROM risk_states WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.map(RiskState::try_from).transpose()
    }

    async fn save_risk_state(&self, state: &RiskState) -> Result<(), StoreError> {
        upsert_risk_state(&self.pool, state).await
    }

    async fn load_strategy_state(
        &self,
        user_id: &str,
        strategy_name: &str,
    ) -> Result<Option<StrategyState>, StoreError> {
        let row = sqlx::query_as::<_, StrategyStateRow>(
            "SELECT * FROM strategy_states WHERE user_id = ? AND strategy_name = ?",
        )
        .bind(user_id)
        .bind(strategy_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(StrategyState::try_from).transpose()
    }

    async fn save_strategy_state(&self, state: &StrategyState) -> Result<(), StoreError> {
        upsert_strategy_state(&self.pool, state).await
    }

    async fn list_strategy_states(&self, user_id: &str) -> Result<Vec<StrategyState>, StoreError> {
        let rows = sqlx::query_as::<_, StrategyStateRow>(
            "SELECT * FROM strategy_states WHERE user_id = ? ORDER BY strategy_name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(StrategyState::try_from).collect()
    }

    async fn create_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        upsert_trade(&self.pool, trade).await.map(|_| ())
    }

    async fn update_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM trades WHERE id = ?")
            .bind(&trade.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        if exists.is_none() {
            return Err(StoreError::NotFound(format!("trade {}", trade.id)));
        }
        upsert_trade(&self.pool, trade).await.map(|_| ())
    }

    async fn load_trade(&self, trade_id: &str) -> Result<Option<Trade>, StoreError> {
        let row = sqlx::query_as::<_, TradeRow>("SELECT * FROM trades WHERE id = ?")
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.map(Trade::try_from).transpose()
    }

    async fn list_pending_trades(&self) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE status = 'PENDING' ORDER BY entry_time",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(Trade::try_from).collect()
    }

    async fn list_trades(&self, user_id: &str, limit: usize) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE user_id = ? ORDER BY entry_time DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(Trade::try_from).collect()
    }

    async fn commit(
        &self,
        risk: &RiskState,
        strategy: Option<&StrategyState>,
        trade: Option<&Trade>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        upsert_risk_state(&mut *tx, risk).await?;
        if let Some(strategy) = strategy {
            upsert_strategy_state(&mut *tx, strategy).await?;
        }
        if let Some(trade) = trade {
            upsert_trade(&mut *tx, trade).await?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(())
    }
}
