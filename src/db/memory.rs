//! In-memory store for tests and dry runs.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use super::Store;
use crate::error::StoreError;
use crate::models::{RiskState, StrategyState, Trade, TradeStatus, UserAccount};

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<String, UserAccount>,
    risk_states: HashMap<String, RiskState>,
    strategy_states: BTreeMap<(String, String), StrategyState>,
    trades: HashMap<String, Trade>,
}

/// Keeps every record in process memory. Writes can be made to fail on demand.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
    failing_users: RwLock<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `StoreError::Backend` until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make writes of records owned by `user_id` fail until reset.
    pub fn set_fail_writes_for(&self, user_id: &str, fail: bool) {
        let mut users = self.failing_users.write();
        if fail {
            users.insert(user_id.to_string());
        } else {
            users.remove(user_id);
        }
    }

    fn check_writable(&self, user_id: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) || self.failing_users.read().contains(user_id) {
            return Err(StoreError::Backend("write failure injected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_account(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.tables.read().accounts.get(user_id).cloned())
    }

    async fn save_account(&self, account: &UserAccount) -> Result<(), StoreError> {
        self.check_writable(&account.user_id)?;
        self.tables
            .write()
            .accounts
            .insert(account.user_id.clone(), account.clone());
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.tables.read().accounts.keys().cloned().collect())
    }

    async fn load_risk_state(&self, user_id: &str) -> Result<Option<RiskState>, StoreError> {
        Ok(self.tables.read().risk_states.get(user_id).cloned())
    }

    async fn save_risk_state(&self, state: &RiskState) -> Result<(), StoreError> {
        self.check_writable(&state.user_id)?;
        self.tables
            .write()
            .risk_states
            .insert(state.user_id.clone(), state.clone());
        Ok(())
    }

    async fn load_strategy_state(
        &self,
        user_id: &str,
        strategy_name: &str,
    ) -> Result<Option<StrategyState>, StoreError> {
        let key = (user_id.to_string(), strategy_name.to_string());
        Ok(self.tables.read().strategy_states.get(&key).cloned())
    }

    async fn save_strategy_state(&self, state: &StrategyState) -> Result<(), StoreError> {
        self.check_writable(&state.user_id)?;
        let key = (state.user_id.clone(), state.strategy_name.clone());
        self.tables.write().strategy_states.insert(key, state.clone());
        Ok(())
    }

    async fn list_strategy_states(&self, user_id: &str) -> Result<Vec<StrategyState>, StoreError> {
        Ok(self
            .tables
            .read()
            .strategy_states
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn create_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        self.check_writable(&trade.user_id)?;
        self.tables.write().trades.insert(trade.id.clone(), trade.clone());
        Ok(())
    }

    async fn update_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        self.check_writable(&trade.user_id)?;
        let mut tables = self.tables.write();
        match tables.trades.get_mut(&trade.id) {
            Some(stored) => {
                *stored = trade.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("trade {}", trade.id))),
        }
    }

    async fn load_trade(&self, trade_id: &str) -> Result<Option<Trade>, StoreError> {
        Ok(self.tables.read().trades.get(trade_id).cloned())
    }

    async fn list_pending_trades(&self) -> Result<Vec<Trade>, StoreError> {
        let mut pending: Vec<Trade> = self
            .tables
            .read()
            .trades
            .values()
            .filter(|t| t.status == TradeStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.entry_time);
        Ok(pending)
    }

    async fn list_trades(&self, user_id: &str, limit: usize) -> Result<Vec<Trade>, StoreError> {
        let mut trades: Vec<Trade> = self
            .tables
            .read()
            .trades
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.entry_time.cmp(&a.entry_time));
        trades.truncate(limit);
        Ok(trades)
    }

    async fn commit(
        &self,
        risk: &RiskState,
        strategy: Option<&StrategyState>,
        trade: Option<&Trade>,
    ) -> Result<(), StoreError> {
        self.check_writable(&risk.user_id)?;

        let mut tables = self.tables.write();
        tables.risk_states.insert(risk.user_id.clone(), risk.clone());
        if let Some(strategy) = strategy {
            let key = (strategy.user_id.clone(), strategy.strategy_name.clone());
            tables.strategy_states.insert(key, strategy.clone());
        }
        if let Some(trade) = trade {
            tables.trades.insert(trade.id.clone(), trade.clone());
        }
        Ok(())
    }
}
