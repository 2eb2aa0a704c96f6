//! Persistence for accounts, risk state, strategy state and trades.
//!
//! The engine owns all business rules; stores only load and save records.
//! `commit` writes a user's risk state, strategy state and trade in one
//! transaction so settlement is all-or-nothing.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::Database;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{RiskState, StrategyState, Trade, UserAccount};

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_account(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError>;

    async fn save_account(&self, account: &UserAccount) -> Result<(), StoreError>;

    /// All users with an account, sorted.
    async fn list_users(&self) -> Result<Vec<String>, StoreError>;

    async fn load_risk_state(&self, user_id: &str) -> Result<Option<RiskState>, StoreError>;

    async fn save_risk_state(&self, state: &RiskState) -> Result<(), StoreError>;

    async fn load_strategy_state(
        &self,
        user_id: &str,
        strategy_name: &str,
    ) -> Result<Option<StrategyState>, StoreError>;

    async fn save_strategy_state(&self, state: &StrategyState) -> Result<(), StoreError>;

    async fn list_strategy_states(&self, user_id: &str) -> Result<Vec<StrategyState>, StoreError>;

    async fn create_trade(&self, trade: &Trade) -> Result<(), StoreError>;

    /// Replace a stored trade. Fails with `NotFound` if it was never created.
    async fn update_trade(&self, trade: &Trade) -> Result<(), StoreError>;

    async fn load_trade(&self, trade_id: &str) -> Result<Option<Trade>, StoreError>;

    /// PENDING trades across all users, oldest first.
    async fn list_pending_trades(&self) -> Result<Vec<Trade>, StoreError>;

    /// Most recent trades for a user, newest first.
    async fn list_trades(&self, user_id: &str, limit: usize) -> Result<Vec<Trade>, StoreError>;

    /// Atomically upsert the given records. Either all are written or none.
    async fn commit(
        &self,
        risk: &RiskState,
        strategy: Option<&StrategyState>,
        trade: Option<&Trade>,
    ) -> Result<(), StoreError>;
}
