//! Execution engine: ingestion, admission, sizing, dispatch and settlement.
//!
//! Every read-modify-write of a user's `RiskState` or `StrategyState` happens
//! while holding that user's mutex. Exchange calls happen outside it. Users
//! never share a lock, so different users proceed fully in parallel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::ExchangeConnector;
use crate::clock::{Clock, SystemClock};
use crate::db::Store;
use crate::error::{ConnectorError, EngineError, RiskViolation, StoreError};
use crate::models::{
    RiskState, Signal, StopOrigin, StrategyState, Trade, TradeStatus, UserAccount,
    INITIAL_CONFIDENCE,
};
use crate::notify::{EngineEvent, LogNotifier, Notifier};

use super::dispatcher::{DispatchResult, ExecutionDispatcher};
use super::ingestor::{RawPayload, SignalIngestor};
use super::learner::ConfidenceLearner;
use super::position_sizer::{protective_levels, PositionSizer};
use super::{risk_gate, settlement, EngineConfig};

/// Reason reported when a user's risk state cannot be trusted.
pub const RISK_STATE_UNAVAILABLE: &str = "Risk state unavailable";

/// Synchronous answer to a submitted signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    /// Passed the risk gate and consumed a daily slot
    pub accepted: bool,
    /// Rejection reason, or the trade-level error of an admitted trade
    pub reason: Option<String>,
    pub violation: Option<RiskViolation>,
    pub trade_id: Option<String>,
    pub status: Option<TradeStatus>,
}

impl SubmitOutcome {
    fn rejected(violation: RiskViolation) -> Self {
        Self {
            accepted: false,
            reason: Some(violation.to_string()),
            violation: Some(violation),
            trade_id: None,
            status: None,
        }
    }

    fn admitted(trade: &Trade) -> Self {
        Self {
            accepted: true,
            reason: trade.error_message.clone(),
            violation: None,
            trade_id: Some(trade.id.clone()),
            status: Some(trade.status),
        }
    }
}

/// Read model for status displays.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSnapshot {
    pub risk: RiskState,
    pub strategies: Vec<StrategyState>,
    pub pending_trades: usize,
}

enum RiskLoad {
    Ready(RiskState),
    Unavailable(String),
}

enum Admission {
    Admitted { confidence: Decimal },
    Rejected(RiskViolation),
}

/// Risk-gated signal-to-trade engine.
pub struct ExecutionEngine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    connector: Arc<dyn ExchangeConnector>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    ingestor: SignalIngestor,
    sizer: PositionSizer,
    dispatcher: ExecutionDispatcher,
    learner: ConfidenceLearner,

    // Per-user critical sections
    user_locks: DashMap<String, Arc<Mutex<()>>>,

    // Live account capital and when it was fetched
    capital_cache: DashMap<String, (Decimal, DateTime<Utc>)>,
}

impl ExecutionEngine {
    /// Create an engine on the system clock, logging events.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        connector: Arc<dyn ExchangeConnector>,
    ) -> Self {
        Self {
            ingestor: SignalIngestor::new(&config),
            sizer: PositionSizer::new(config.confidence_sizing),
            dispatcher: ExecutionDispatcher::new(connector.clone(), config.paper_fee_rate),
            learner: ConfidenceLearner::new(config.learning_rate),
            config,
            store,
            connector,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
            user_locks: DashMap::new(),
            capital_cache: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ingestor(&self) -> &SignalIngestor {
        &self.ingestor
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    // ==================== Signal Submission ====================

    /// Ingest a raw payload and run it through admission and execution.
    ///
    /// Returns once the admission decision is made and the order is dispatched;
    /// live orders may still be pending a fill confirmation.
    pub async fn submit_signal(
        &self,
        user_id: &str,
        payload: &RawPayload,
    ) -> Result<SubmitOutcome, EngineError> {
        let signal = match self.ingestor.ingest(payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Dropping malformed signal");
                return Err(e.into());
            }
        };

        self.submit(user_id, signal).await
    }

    /// Admission and execution for an already-normalized signal.
    pub async fn submit(&self, user_id: &str, signal: Signal) -> Result<SubmitOutcome, EngineError> {
        let account = self.account(user_id).await?;

        let confidence = match self.admit(&account, &signal).await? {
            Admission::Admitted { confidence } => confidence,
            Admission::Rejected(violation) => {
                info!(
                    user_id = %user_id,
                    symbol = %signal.symbol,
                    code = violation.code(),
                    reason = %violation,
                    "Signal rejected"
                );
                return Ok(SubmitOutcome::rejected(violation));
            }
        };

        let trade = self.prepare_trade(&account, &signal, confidence).await;
        if trade.status == TradeStatus::Rejected {
            self.store_trade(&trade, true).await?;
            return Ok(SubmitOutcome::admitted(&trade));
        }

        let trade = self.execute(&account, trade).await?;
        Ok(SubmitOutcome::admitted(&trade))
    }

    /// Gate the signal and reserve its daily slot inside the user's critical section.
    async fn admit(&self, account: &UserAccount, signal: &Signal) -> Result<Admission, EngineError> {
        let lock = self.user_lock(&account.user_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let mut risk = match self.load_risk_state(&account.user_id, now).await? {
            RiskLoad::Ready(state) => state,
            RiskLoad::Unavailable(_) => {
                return Ok(Admission::Rejected(RiskViolation::EmergencyStopActive {
                    reason: RISK_STATE_UNAVAILABLE.to_string(),
                }))
            }
        };
        risk.roll_over(now);

        if let Err(violation) = risk_gate::admit(signal, &account.risk_settings, &mut risk, now) {
            return Ok(Admission::Rejected(violation));
        }

        // Strategy state is created lazily, in the same write as the reservation
        let existing = self
            .store
            .load_strategy_state(&account.user_id, &signal.strategy_name)
            .await?;
        let created = if existing.is_none() {
            Some(StrategyState::new(&account.user_id, &signal.strategy_name, now))
        } else {
            None
        };
        let strategy_confidence = existing
            .as_ref()
            .or(created.as_ref())
            .map_or(INITIAL_CONFIDENCE, |s| s.confidence_score);

        if let Err(e) = self.store.commit(&risk, created.as_ref(), None).await {
            error!(user_id = %account.user_id, error = %e, "Failed to persist admission");
            return Err(e.into());
        }

        info!(
            user_id = %account.user_id,
            symbol = %signal.symbol,
            side = signal.side.as_str(),
            strategy = %signal.strategy_name,
            trade_count = risk.trade_count,
            "Signal admitted"
        );

        Ok(Admission::Admitted {
            confidence: signal.confidence.unwrap_or(strategy_confidence),
        })
    }

    /// Resolve price and capital, size the order, and build the trade.
    /// Failures produce a REJECTED trade; the reserved slot stays consumed.
    async fn prepare_trade(&self, account: &UserAccount, signal: &Signal, confidence: Decimal) -> Trade {
        let now = self.clock.now();
        let mut trade = Trade {
            id: Uuid::new_v4().to_string(),
            user_id: account.user_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            order_type: signal.order_type,
            quantity: Decimal::ZERO,
            requested_price: signal.price.unwrap_or(Decimal::ZERO),
            executed_price: None,
            status: TradeStatus::Pending,
            strategy_name: signal.strategy_name.clone(),
            confidence_score: confidence,
            source: signal.source,
            pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            stop_loss_price: None,
            take_profit_price: None,
            order_id: None,
            error_message: None,
            entry_time: now,
            exit_time: None,
        };

        let price = match signal.price {
            Some(price) => price,
            None => match self.connector.get_current_price(&signal.symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(trade_id = %trade.id, symbol = %signal.symbol, error = %e, "Price unavailable");
                    settlement::reject(&mut trade, &format!("price unavailable: {}", e), now);
                    return trade;
                }
            },
        };
        trade.requested_price = price;

        let capital = match self.capital_for(account).await {
            Ok(capital) => capital,
            Err(e) => {
                warn!(trade_id = %trade.id, user_id = %account.user_id, error = %e, "Capital unavailable");
                settlement::reject(&mut trade, &format!("capital unavailable: {}", e), now);
                return trade;
            }
        };

        let sized = self.sizer.size(
            capital,
            price,
            &signal.symbol,
            &account.risk_settings,
            confidence,
            signal.quantity,
        );
        if sized.quantity <= Decimal::ZERO {
            info!(trade_id = %trade.id, capital = %capital, price = %price, "Position size rounds to zero");
            settlement::reject(&mut trade, "position size rounds to zero", now);
            return trade;
        }

        let (stop_loss, take_profit) =
            protective_levels(signal.side, price, &signal.symbol, &account.risk_settings);
        trade.quantity = sized.quantity;
        trade.stop_loss_price = stop_loss;
        trade.take_profit_price = take_profit;

        debug!(
            trade_id = %trade.id,
            quantity = %trade.quantity,
            nominal = %sized.nominal,
            scale = %sized.scale,
            "Position sized"
        );
        trade
    }

    async fn capital_for(&self, account: &UserAccount) -> Result<Decimal, ConnectorError> {
        if account.paper_trading_mode {
            return Ok(account.paper_capital);
        }

        let now = self.clock.now();
        let cached = self.capital_cache.get(&account.user_id).map(|entry| *entry);
        if let Some((capital, fetched_at)) = cached {
            let fresh = u64::try_from((now - fetched_at).num_seconds())
                .map_or(false, |age| age < self.config.capital_cache_secs);
            if fresh {
                return Ok(capital);
            }
        }

        let capital = self.connector.get_account_capital(&account.user_id).await?;
        self.capital_cache.insert(account.user_id.clone(), (capital, now));
        Ok(capital)
    }

    /// Dispatch the trade and apply whatever the dispatch resolved to.
    /// Live trades are persisted as PENDING before submission so a fast fill
    /// confirmation can find them.
    async fn execute(&self, account: &UserAccount, trade: Trade) -> Result<Trade, EngineError> {
        let paper = account.paper_trading_mode;
        if !paper {
            if let Err(e) = self.store.create_trade(&trade).await {
                error!(trade_id = %trade.id, error = %e, "Failed to record pending trade");
                return Err(e.into());
            }
        }

        let result = self.dispatcher.dispatch(&trade, paper).await;

        let lock = self.user_lock(&trade.user_id);
        let _guard = lock.lock().await;

        // A confirmation may have landed while the order was in flight
        let mut current = if paper { trade } else { self.find_trade(&trade.id).await? };

        match result {
            DispatchResult::Filled { executed_price, fees, order_id } => {
                if current.is_terminal() {
                    return Ok(current);
                }
                current.order_id = order_id;
                self.settle_locked(account, current, executed_price, fees).await
            }
            DispatchResult::Pending { order_id } => {
                if current.status == TradeStatus::Pending && current.order_id.is_none() {
                    current.order_id = Some(order_id);
                    self.store_trade(&current, paper).await?;
                }
                Ok(current)
            }
            DispatchResult::Rejected { reason } => {
                if current.status == TradeStatus::Pending {
                    settlement::reject(&mut current, &reason, self.clock.now());
                    self.store_trade(&current, paper).await?;
                }
                Ok(current)
            }
        }
    }

    /// Paper trades are first written here; live trades already exist.
    async fn store_trade(&self, trade: &Trade, is_new: bool) -> Result<(), EngineError> {
        let written = if is_new {
            self.store.create_trade(trade).await
        } else {
            self.store.update_trade(trade).await
        };
        written.map_err(|e| {
            error!(trade_id = %trade.id, error = %e, "Failed to record trade");
            EngineError::from(e)
        })
    }

    // ==================== Fill Settlement ====================

    /// Inbound fill/cancel confirmation for a pending live trade.
    pub async fn on_fill_confirmed(
        &self,
        trade_id: &str,
        executed_price: Decimal,
        fees: Decimal,
        status: TradeStatus,
    ) -> Result<Trade, EngineError> {
        if status == TradeStatus::Pending {
            return Err(EngineError::InvalidFillStatus(status));
        }
        if status == TradeStatus::Filled {
            if executed_price <= Decimal::ZERO {
                return Err(EngineError::InvalidFill(format!(
                    "executed price must be positive, got {}",
                    executed_price
                )));
            }
            if fees < Decimal::ZERO {
                return Err(EngineError::InvalidFill(format!("fees must not be negative, got {}", fees)));
            }
        }

        let user_id = self.find_trade(trade_id).await?.user_id;
        let account = self.account(&user_id).await?;

        let lock = self.user_lock(&user_id);
        let _guard = lock.lock().await;

        let mut trade = self.find_trade(trade_id).await?;
        if trade.is_terminal() {
            return Err(EngineError::TradeAlreadyFinal {
                trade_id: trade.id,
                status: trade.status,
            });
        }

        match status {
            TradeStatus::Filled => self.settle_locked(&account, trade, executed_price, fees).await,
            TradeStatus::Cancelled => {
                settlement::cancel(&mut trade, "cancelled by exchange", self.clock.now());
                self.store.update_trade(&trade).await?;
                self.notify_cancelled(&trade);
                Ok(trade)
            }
            _ => {
                settlement::reject(&mut trade, "rejected by exchange", self.clock.now());
                self.store.update_trade(&trade).await?;
                info!(trade_id = %trade.id, "Trade rejected by exchange");
                Ok(trade)
            }
        }
    }

    /// PnL, risk counters, breaker, confidence; committed in one write.
    /// Caller holds the user's lock.
    async fn settle_locked(
        &self,
        account: &UserAccount,
        mut trade: Trade,
        executed_price: Decimal,
        fees: Decimal,
    ) -> Result<Trade, EngineError> {
        let now = self.clock.now();

        let mut risk = match self.load_risk_state(&trade.user_id, now).await? {
            RiskLoad::Ready(state) => state,
            RiskLoad::Unavailable(msg) => {
                error!(trade_id = %trade.id, "Cannot settle fill against unusable risk state");
                return Err(StoreError::Corrupted(msg).into());
            }
        };
        risk.roll_over(now);

        let mut strategy = self
            .store
            .load_strategy_state(&trade.user_id, &trade.strategy_name)
            .await?
            .unwrap_or_else(|| StrategyState::new(&trade.user_id, &trade.strategy_name, now));

        let outcome = settlement::settle_fill(
            &mut trade,
            &mut risk,
            &account.risk_settings,
            executed_price,
            fees,
            now,
        );
        self.learner.record_outcome(&mut strategy, outcome.pnl, now);

        if let Err(e) = self.store.commit(&risk, Some(&strategy), Some(&trade)).await {
            error!(trade_id = %trade.id, error = %e, "Failed to commit settlement");
            return Err(e.into());
        }

        info!(
            user_id = %trade.user_id,
            trade_id = %trade.id,
            pnl = %outcome.pnl,
            daily_pnl = %risk.daily_pnl,
            confidence = %strategy.confidence_score,
            "Trade settled"
        );

        self.notifier.notify(EngineEvent::TradeFilled {
            user_id: trade.user_id.clone(),
            trade_id: trade.id.clone(),
            symbol: trade.symbol.clone(),
            strategy_name: trade.strategy_name.clone(),
            pnl: outcome.pnl,
        });
        if outcome.breaker_tripped {
            self.notifier.notify(EngineEvent::EmergencyStopTriggered {
                user_id: trade.user_id.clone(),
                reason: settlement::LOSS_LIMIT_REASON.to_string(),
            });
        }

        Ok(trade)
    }

    // ==================== Maintenance ====================

    /// Cancel live orders that have waited longer than the fill timeout.
    pub async fn sweep_expired_orders(&self) -> Result<Vec<String>, EngineError> {
        let now = self.clock.now();
        let timeout = self.config.fill_timeout_secs;
        let expired: Vec<Trade> = self
            .store
            .list_pending_trades()
            .await?
            .into_iter()
            .filter(|t| {
                u64::try_from((now - t.entry_time).num_seconds()).map_or(false, |age| age >= timeout)
            })
            .collect();

        let mut cancelled = Vec::new();
        let mut failed = 0;
        for stale in expired {
            match self.cancel_expired(&stale.user_id, &stale.id).await {
                Ok(true) => cancelled.push(stale.id),
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    error!(trade_id = %stale.id, user_id = %stale.user_id, error = %e, "Failed to cancel expired order");
                }
            }
        }

        if !cancelled.is_empty() || failed > 0 {
            info!(count = cancelled.len(), failed, "Cancelled expired orders");
        }
        Ok(cancelled)
    }

    async fn cancel_expired(&self, user_id: &str, trade_id: &str) -> Result<bool, EngineError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut trade = self.find_trade(trade_id).await?;
        if trade.status != TradeStatus::Pending {
            return Ok(false);
        }

        settlement::cancel(&mut trade, "no fill confirmation before timeout", self.clock.now());
        self.store.update_trade(&trade).await?;
        self.notify_cancelled(&trade);
        Ok(true)
    }

    /// Roll every user's risk state into the current trading day. Idempotent.
    /// A user whose state cannot be read or written is skipped.
    pub async fn run_daily_reset(&self) -> Result<usize, EngineError> {
        let mut reset = 0;
        let mut failed = 0;

        for user_id in self.store.list_users().await? {
            match self.reset_user(&user_id).await {
                Ok(true) => {
                    reset += 1;
                    debug!(user_id = %user_id, "Daily risk state reset");
                }
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    error!(user_id = %user_id, error = %e, "Daily reset failed");
                }
            }
        }

        if reset > 0 || failed > 0 {
            info!(users = reset, failed, "Daily reset applied");
        }
        Ok(reset)
    }

    async fn reset_user(&self, user_id: &str) -> Result<bool, EngineError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let mut risk = match self.load_risk_state(user_id, now).await? {
            RiskLoad::Ready(state) => state,
            RiskLoad::Unavailable(_) => return Ok(false),
        };
        if !risk.roll_over(now) {
            return Ok(false);
        }
        self.store.save_risk_state(&risk).await?;
        Ok(true)
    }

    // ==================== Manual Controls ====================

    /// Halt trading for a user. User and admin stops survive daily resets.
    pub async fn trigger_emergency_stop(
        &self,
        user_id: &str,
        origin: StopOrigin,
        reason: &str,
    ) -> Result<RiskState, EngineError> {
        self.account(user_id).await?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let mut risk = match self.load_risk_state(user_id, now).await? {
            RiskLoad::Ready(state) => state,
            RiskLoad::Unavailable(_) => RiskState::new(user_id, now),
        };
        risk.roll_over(now);
        risk.trip(reason, origin);
        self.store.save_risk_state(&risk).await?;

        warn!(user_id = %user_id, origin = origin.as_str(), reason = %reason, "Emergency stop engaged");
        self.notifier.notify(EngineEvent::EmergencyStopTriggered {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
        });

        Ok(risk)
    }

    /// Explicit external reset of any emergency stop.
    pub async fn clear_emergency_stop(&self, user_id: &str) -> Result<RiskState, EngineError> {
        self.account(user_id).await?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let mut risk = match self.load_risk_state(user_id, now).await? {
            RiskLoad::Ready(state) => state,
            RiskLoad::Unavailable(msg) => return Err(StoreError::Corrupted(msg).into()),
        };
        risk.roll_over(now);
        risk.clear_stop();
        self.store.save_risk_state(&risk).await?;

        info!(user_id = %user_id, "Emergency stop cleared");
        Ok(risk)
    }

    /// Store an account with coin keys normalized like incoming symbols.
    pub async fn save_account(&self, mut account: UserAccount) -> Result<UserAccount, EngineError> {
        account
            .risk_settings
            .normalize_coins(|coin| self.ingestor.normalize_symbol(coin));
        self.store.save_account(&account).await?;
        info!(user_id = %account.user_id, paper = account.paper_trading_mode, "Account saved");
        Ok(account)
    }

    /// Current risk state (as of today) and strategy confidence for a user.
    pub async fn risk_snapshot(&self, user_id: &str) -> Result<RiskSnapshot, EngineError> {
        self.account(user_id).await?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let mut risk = match self.load_risk_state(user_id, now).await? {
            RiskLoad::Ready(state) => state,
            RiskLoad::Unavailable(msg) => return Err(StoreError::Corrupted(msg).into()),
        };
        risk.roll_over(now);

        let strategies = self.store.list_strategy_states(user_id).await?;
        let pending_trades = self
            .store
            .list_pending_trades()
            .await?
            .iter()
            .filter(|t| t.user_id == user_id)
            .count();

        Ok(RiskSnapshot {
            risk,
            strategies,
            pending_trades,
        })
    }

    // ==================== Helpers ====================

    async fn account(&self, user_id: &str) -> Result<UserAccount, EngineError> {
        self.store
            .load_account(user_id)
            .await?
            .ok_or_else(|| EngineError::UnknownUser(user_id.to_string()))
    }

    async fn find_trade(&self, trade_id: &str) -> Result<Trade, EngineError> {
        self.store
            .load_trade(trade_id)
            .await?
            .ok_or_else(|| EngineError::TradeNotFound(trade_id.to_string()))
    }

    /// Load a user's risk state. Corrupt or inconsistent records come back as
    /// `Unavailable` so callers fail closed; backend errors propagate.
    async fn load_risk_state(&self, user_id: &str, now: DateTime<Utc>) -> Result<RiskLoad, EngineError> {
        match self.store.load_risk_state(user_id).await {
            Ok(Some(state)) => match state.validate(now) {
                Ok(()) if state.user_id == user_id => Ok(RiskLoad::Ready(state)),
                Ok(()) => {
                    error!(user_id = %user_id, stored = %state.user_id, "Risk state belongs to another user");
                    Ok(RiskLoad::Unavailable("risk state user mismatch".to_string()))
                }
                Err(msg) => {
                    error!(user_id = %user_id, error = %msg, "Inconsistent risk state");
                    Ok(RiskLoad::Unavailable(msg))
                }
            },
            Ok(None) => Ok(RiskLoad::Ready(RiskState::new(user_id, now))),
            Err(StoreError::Corrupted(msg)) => {
                error!(user_id = %user_id, error = %msg, "Corrupted risk state");
                Ok(RiskLoad::Unavailable(msg))
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to load risk state");
                Err(e.into())
            }
        }
    }

    fn notify_cancelled(&self, trade: &Trade) {
        self.notifier.notify(EngineEvent::TradeCancelled {
            user_id: trade.user_id.clone(),
            trade_id: trade.id.clone(),
            reason: trade.error_message.clone().unwrap_or_default(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AckStatus, MockExchangeConnector, OrderAck};
    use crate::clock::ManualClock;
    use crate::db::{Database, MemoryStore};
    use crate::notify::ChannelNotifier;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use tokio::sync::mpsc;

    const USER: &str = "alice";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    fn live_account() -> UserAccount {
        let mut account = UserAccount::new(USER);
        account.paper_trading_mode = false;
        account
    }

    fn buy(symbol: &str, price: u32, quantity: u32) -> RawPayload {
        RawPayload::from(json!({
            "symbol": symbol,
            "action": "BUY",
            "price": price,
            "quantity": quantity,
        }))
    }

    /// Exchange that reports 10k capital and answers every order with `ack`.
    fn exchange(ack: AckStatus) -> MockExchangeConnector {
        let mut mock = MockExchangeConnector::new();
        mock.expect_get_account_capital().returning(|_| Ok(dec!(10000)));
        mock.expect_get_current_price().returning(|_| Ok(dec!(100)));
        mock.expect_submit_order().returning(move |order| {
            Ok(OrderAck {
                order_id: format!("ex-{}", order.client_order_id),
                status: ack.clone(),
            })
        });
        mock
    }

    struct Harness {
        engine: Arc<ExecutionEngine>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    }

    impl Harness {
        async fn new(account: UserAccount, connector: MockExchangeConnector) -> Self {
            let store = Arc::new(MemoryStore::new());
            store.save_account(&account).await.unwrap();
            Self::with_store(store, connector)
        }

        fn with_store(store: Arc<MemoryStore>, connector: MockExchangeConnector) -> Self {
            let clock = Arc::new(ManualClock::new(start()));
            let (tx, events) = mpsc::unbounded_channel();
            let engine = ExecutionEngine::new(EngineConfig::default(), store.clone(), Arc::new(connector))
                .with_clock(clock.clone())
                .with_notifier(Arc::new(ChannelNotifier::new(tx)));
            Self {
                engine: Arc::new(engine),
                store,
                clock,
                events,
            }
        }

        async fn risk(&self) -> RiskState {
            self.store.load_risk_state(USER).await.unwrap().unwrap()
        }

        async fn trade(&self, outcome: &SubmitOutcome) -> Trade {
            let id = outcome.trade_id.as_deref().unwrap();
            self.store.load_trade(id).await.unwrap().unwrap()
        }

        async fn strategy(&self) -> StrategyState {
            self.store
                .load_strategy_state(USER, "webhook_signal")
                .await
                .unwrap()
                .unwrap()
        }

        fn drain_events(&mut self) -> Vec<EngineEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    // ==================== Paper Trading ====================

    #[tokio::test]
    async fn test_paper_trade_fills_without_exchange_calls() {
        // No expectations: any exchange call panics
        let mut h = Harness::new(UserAccount::new(USER), MockExchangeConnector::new()).await;

        let outcome = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 2)).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.status, Some(TradeStatus::Filled));

        let trade = h.trade(&outcome).await;
        assert_eq!(trade.symbol, "BTC");
        assert_eq!(trade.quantity, dec!(2));
        assert_eq!(trade.executed_price, Some(dec!(100)));
        assert_eq!(trade.pnl, Decimal::ZERO);
        assert!(trade.exit_time.is_some());

        assert_eq!(h.risk().await.trade_count, 1);
        assert!(matches!(h.drain_events()[..], [EngineEvent::TradeFilled { .. }]));
    }

    #[tokio::test]
    async fn test_symbol_normalized_against_enabled_coins() {
        let mut account = UserAccount::new(USER);
        account.risk_settings.enabled_coins = ["BTC".to_string()].into_iter().collect();
        let h = Harness::new(account, MockExchangeConnector::new()).await;

        let admitted = h.engine.submit_signal(USER, &buy("btc/usdt", 100, 1)).await.unwrap();
        assert!(admitted.accepted);
        assert_eq!(h.trade(&admitted).await.symbol, "BTC");

        let refused = h.engine.submit_signal(USER, &buy("ETHUSDT", 100, 1)).await.unwrap();
        assert!(!refused.accepted);
        assert_eq!(
            refused.violation,
            Some(RiskViolation::CoinDisabled { symbol: "ETH".to_string() })
        );
        assert_eq!(h.risk().await.trade_count, 1);
    }

    #[tokio::test]
    async fn test_saved_account_coin_keys_match_signals() {
        let h = Harness::new(UserAccount::new(USER), MockExchangeConnector::new()).await;

        let mut account = UserAccount::new(USER);
        account.risk_settings.enabled_coins =
            ["btcusdt", "sol-usdc"].iter().map(|s| s.to_string()).collect();
        account.risk_settings.per_coin.insert(
            "btc/usdt".to_string(),
            crate::models::CoinSettings {
                stop_loss_pct: Some(dec!(10)),
                ..Default::default()
            },
        );
        let saved = h.engine.save_account(account).await.unwrap();

        let stored = h.store.load_account(USER).await.unwrap().unwrap();
        assert_eq!(stored, saved);
        assert!(stored.risk_settings.is_coin_enabled("BTC"));
        assert!(stored.risk_settings.is_coin_enabled("SOL"));
        assert!(stored.risk_settings.coin("BTC").is_some());

        let outcome = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(h.trade(&outcome).await.stop_loss_price, Some(dec!(90)));
    }

    #[tokio::test]
    async fn test_consecutive_losses_block_regardless_of_pnl() {
        let h = Harness::new(UserAccount::new(USER), MockExchangeConnector::new()).await;

        let mut risk = RiskState::new(USER, start());
        risk.consecutive_losses = 3;
        risk.daily_pnl = dec!(500);
        h.store.save_risk_state(&risk).await.unwrap();

        let outcome = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.violation, Some(RiskViolation::ConsecutiveLossCutoff { losses: 3 }));
        assert!(outcome.trade_id.is_none());

        // Rejection leaves the state and the trade log untouched
        assert_eq!(h.risk().await, risk);
        assert!(h.store.list_trades(USER, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ai_signal_confidence_threshold() {
        let h = Harness::new(UserAccount::new(USER), MockExchangeConnector::new()).await;
        let ai = |confidence: f64| {
            RawPayload::from(json!({
                "symbol": "ETHUSDT",
                "side": "sell",
                "price": 2000,
                "source": "ai",
                "confidence": confidence,
            }))
        };

        let low = h.engine.submit_signal(USER, &ai(0.6)).await.unwrap();
        assert_eq!(
            low.violation,
            Some(RiskViolation::ConfidenceBelowThreshold {
                confidence: Some(dec!(60)),
                threshold: dec!(70),
            })
        );

        let high = h.engine.submit_signal(USER, &ai(0.85)).await.unwrap();
        assert!(high.accepted);
        let trade = h.trade(&high).await;
        assert_eq!(trade.confidence_score, dec!(85));
        assert_eq!(trade.side, crate::models::Side::Sell);
    }

    // ==================== Live Execution ====================

    #[tokio::test]
    async fn test_loss_cap_trips_breaker_on_fill() {
        let mut h = Harness::new(live_account(), exchange(AckStatus::Accepted)).await;

        let mut risk = RiskState::new(USER, start());
        risk.daily_pnl = dec!(-950);
        h.store.save_risk_state(&risk).await.unwrap();

        let outcome = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 2)).await.unwrap();
        assert_eq!(outcome.status, Some(TradeStatus::Pending));
        let trade_id = outcome.trade_id.clone().unwrap();
        assert_eq!(h.trade(&outcome).await.order_id, Some(format!("ex-{}", trade_id)));

        let filled = h
            .engine
            .on_fill_confirmed(&trade_id, dec!(50), Decimal::ZERO, TradeStatus::Filled)
            .await
            .unwrap();
        assert_eq!(filled.pnl, dec!(-100));

        let risk = h.risk().await;
        assert_eq!(risk.daily_pnl, dec!(-1050));
        assert!(risk.emergency_stop);
        assert_eq!(risk.emergency_stop_reason.as_deref(), Some("Daily loss limit reached"));
        assert_eq!(risk.emergency_stop_origin, Some(StopOrigin::System));
        assert!(risk.capital_conservation_mode);

        let events = h.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::EmergencyStopTriggered { reason, .. } if reason == "Daily loss limit reached")));

        let blocked = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        assert_eq!(blocked.violation.as_ref().map(|v| v.code()), Some("EMERGENCY_STOP_ACTIVE"));

        // Breaker stops clear with the next trading day
        h.clock.advance(Duration::days(1));
        assert_eq!(h.engine.run_daily_reset().await.unwrap(), 1);
        let risk = h.risk().await;
        assert!(!risk.emergency_stop);
        assert!(!risk.capital_conservation_mode);
        assert_eq!(risk.daily_pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_confidence_learns_from_fills() {
        let h = Harness::new(live_account(), exchange(AckStatus::Accepted)).await;

        let first = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        let second = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        assert_eq!(h.strategy().await.confidence_score, dec!(50));

        h.engine
            .on_fill_confirmed(first.trade_id.as_deref().unwrap(), dec!(110), Decimal::ZERO, TradeStatus::Filled)
            .await
            .unwrap();
        assert_eq!(h.strategy().await.confidence_score, dec!(55));

        h.engine
            .on_fill_confirmed(second.trade_id.as_deref().unwrap(), dec!(90), Decimal::ZERO, TradeStatus::Filled)
            .await
            .unwrap();

        let strategy = h.strategy().await;
        assert_eq!(strategy.confidence_score, dec!(49.5));
        assert_eq!(strategy.total_trades, 2);
        assert_eq!(strategy.winning_trades, 1);
        assert_eq!(strategy.total_pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_immediate_fill_settles_on_submission() {
        let ack = AckStatus::Filled {
            executed_price: dec!(101),
            fees: dec!(0.5),
        };
        let h = Harness::new(live_account(), exchange(ack)).await;

        let outcome = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 2)).await.unwrap();
        assert_eq!(outcome.status, Some(TradeStatus::Filled));

        let trade = h.trade(&outcome).await;
        assert_eq!(trade.pnl, dec!(1.5));
        assert_eq!(trade.fees, dec!(0.5));
        assert!(trade.order_id.is_some());
        assert_eq!(h.risk().await.daily_pnl, dec!(1.5));
        assert_eq!(h.strategy().await.confidence_score, dec!(55));
    }

    #[tokio::test]
    async fn test_exchange_rejection_keeps_slot_consumed() {
        let ack = AckStatus::Rejected {
            reason: "insufficient margin".to_string(),
        };
        let h = Harness::new(live_account(), exchange(ack)).await;

        let outcome = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.status, Some(TradeStatus::Rejected));
        assert_eq!(outcome.reason.as_deref(), Some("insufficient margin"));

        let risk = h.risk().await;
        assert_eq!(risk.trade_count, 1);
        assert_eq!(risk.daily_pnl, Decimal::ZERO);
        assert_eq!(risk.consecutive_losses, 0);
    }

    #[tokio::test]
    async fn test_price_lookup_failure_rejects_trade() {
        let mut mock = MockExchangeConnector::new();
        mock.expect_get_current_price()
            .times(1)
            .returning(|_| Err(ConnectorError::Network("connection reset".to_string())));
        mock.expect_get_account_capital().never();
        mock.expect_submit_order().never();
        let h = Harness::new(live_account(), mock).await;

        let payload = RawPayload::from(json!({"symbol": "BTCUSDT", "action": "BUY"}));
        let outcome = h.engine.submit_signal(USER, &payload).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.status, Some(TradeStatus::Rejected));
        assert!(outcome.reason.unwrap().starts_with("price unavailable"));
        assert_eq!(h.risk().await.trade_count, 1);
    }

    #[tokio::test]
    async fn test_live_capital_is_cached() {
        let mut mock = MockExchangeConnector::new();
        mock.expect_get_account_capital().times(1).returning(|_| Ok(dec!(10000)));
        mock.expect_submit_order().times(2).returning(|order| {
            Ok(OrderAck {
                order_id: order.client_order_id.clone(),
                status: AckStatus::Accepted,
            })
        });
        let h = Harness::new(live_account(), mock).await;

        for _ in 0..2 {
            let outcome = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
            assert_eq!(outcome.status, Some(TradeStatus::Pending));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_daily_trade_limit_holds_under_concurrency() {
        let mut account = live_account();
        account.risk_settings.max_trade_count_per_day = 3;

        let mut mock = MockExchangeConnector::new();
        mock.expect_get_account_capital().returning(|_| Ok(dec!(10000)));
        mock.expect_submit_order().times(3).returning(|order| {
            Ok(OrderAck {
                order_id: order.client_order_id.clone(),
                status: AckStatus::Accepted,
            })
        });
        let h = Harness::new(account, mock).await;

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let engine = h.engine.clone();
                tokio::spawn(async move { engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            if outcome.accepted {
                accepted += 1;
            } else {
                assert_eq!(
                    outcome.violation,
                    Some(RiskViolation::DailyTradeLimitExceeded { count: 3, limit: 3 })
                );
            }
        }

        assert_eq!(accepted, 3);
        assert_eq!(h.risk().await.trade_count, 3);
        assert_eq!(h.store.list_pending_trades().await.unwrap().len(), 3);
    }

    // ==================== Fill Confirmation ====================

    #[tokio::test]
    async fn test_fill_confirmation_errors() {
        let h = Harness::new(live_account(), exchange(AckStatus::Accepted)).await;
        let outcome = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        let trade_id = outcome.trade_id.unwrap();

        let err = h
            .engine
            .on_fill_confirmed(&trade_id, dec!(100), Decimal::ZERO, TradeStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidFillStatus(TradeStatus::Pending)));

        let err = h
            .engine
            .on_fill_confirmed("missing", dec!(100), Decimal::ZERO, TradeStatus::Filled)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TradeNotFound(id) if id == "missing"));

        let cancelled = h
            .engine
            .on_fill_confirmed(&trade_id, Decimal::ZERO, Decimal::ZERO, TradeStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(cancelled.status, TradeStatus::Cancelled);

        let err = h
            .engine
            .on_fill_confirmed(&trade_id, dec!(100), Decimal::ZERO, TradeStatus::Filled)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::TradeAlreadyFinal { status: TradeStatus::Cancelled, .. }
        ));
        assert_eq!(h.risk().await.daily_pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_fill_without_positive_price_is_refused() {
        let h = Harness::new(live_account(), exchange(AckStatus::Accepted)).await;
        let outcome = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 2)).await.unwrap();
        let trade_id = outcome.trade_id.clone().unwrap();
        let risk_before = h.risk().await;

        for price in [Decimal::ZERO, dec!(-5)] {
            let err = h
                .engine
                .on_fill_confirmed(&trade_id, price, Decimal::ZERO, TradeStatus::Filled)
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidFill(_)));
        }
        let err = h
            .engine
            .on_fill_confirmed(&trade_id, dec!(100), dec!(-1), TradeStatus::Filled)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidFill(_)));

        assert_eq!(h.risk().await, risk_before);
        assert_eq!(h.strategy().await.total_trades, 0);
        assert_eq!(h.trade(&outcome).await.status, TradeStatus::Pending);

        let trade = h
            .engine
            .on_fill_confirmed(&trade_id, dec!(100), Decimal::ZERO, TradeStatus::Filled)
            .await
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Filled);
        assert!(!h.risk().await.emergency_stop);
    }

    #[tokio::test]
    async fn test_expired_orders_are_cancelled() {
        let mut h = Harness::new(live_account(), exchange(AckStatus::Accepted)).await;
        let outcome = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        let trade_id = outcome.trade_id.clone().unwrap();

        h.clock.advance(Duration::seconds(299));
        assert!(h.engine.sweep_expired_orders().await.unwrap().is_empty());

        h.clock.advance(Duration::seconds(1));
        assert_eq!(h.engine.sweep_expired_orders().await.unwrap(), vec![trade_id.clone()]);

        let trade = h.trade(&outcome).await;
        assert_eq!(trade.status, TradeStatus::Cancelled);
        assert_eq!(trade.error_message.as_deref(), Some("no fill confirmation before timeout"));
        assert!(h
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::TradeCancelled { trade_id: id, .. } if *id == trade_id)));

        // The reserved slot is not refunded
        assert_eq!(h.risk().await.trade_count, 1);

        let late = h
            .engine
            .on_fill_confirmed(&trade_id, dec!(100), Decimal::ZERO, TradeStatus::Filled)
            .await;
        assert!(matches!(late, Err(EngineError::TradeAlreadyFinal { .. })));
    }

    #[tokio::test]
    async fn test_settlement_failure_leaves_state_untouched() {
        let h = Harness::new(live_account(), exchange(AckStatus::Accepted)).await;
        let outcome = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        let trade_id = outcome.trade_id.clone().unwrap();
        let risk_before = h.risk().await;

        h.store.set_fail_writes(true);
        let err = h
            .engine
            .on_fill_confirmed(&trade_id, dec!(90), Decimal::ZERO, TradeStatus::Filled)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InternalState(StoreError::Backend(_))));

        assert_eq!(h.risk().await, risk_before);
        assert_eq!(h.strategy().await.total_trades, 0);
        assert_eq!(h.trade(&outcome).await.status, TradeStatus::Pending);

        h.store.set_fail_writes(false);
        let trade = h
            .engine
            .on_fill_confirmed(&trade_id, dec!(90), Decimal::ZERO, TradeStatus::Filled)
            .await
            .unwrap();
        assert_eq!(trade.pnl, dec!(-10));
        assert_eq!(h.risk().await.daily_pnl, dec!(-10));
    }

    // ==================== Emergency Stop & Daily Reset ====================

    #[tokio::test]
    async fn test_user_stop_survives_daily_reset() {
        let h = Harness::new(UserAccount::new(USER), MockExchangeConnector::new()).await;

        let risk = h
            .engine
            .trigger_emergency_stop(USER, StopOrigin::User, "Going on holiday")
            .await
            .unwrap();
        assert!(risk.emergency_stop);
        assert!(!risk.capital_conservation_mode);

        h.clock.advance(Duration::days(1));
        h.engine.run_daily_reset().await.unwrap();

        let risk = h.risk().await;
        assert!(risk.emergency_stop);
        assert_eq!(risk.emergency_stop_reason.as_deref(), Some("Going on holiday"));

        let blocked = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        assert_eq!(
            blocked.violation,
            Some(RiskViolation::EmergencyStopActive {
                reason: "Going on holiday".to_string()
            })
        );

        h.engine.clear_emergency_stop(USER).await.unwrap();
        let resumed = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        assert!(resumed.accepted);
    }

    #[tokio::test]
    async fn test_maintenance_skips_failing_user() {
        let h = Harness::new(live_account(), exchange(AckStatus::Accepted)).await;
        let mut bob = live_account();
        bob.user_id = "bob".to_string();
        h.store.save_account(&bob).await.unwrap();

        let alice_trade = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        let bob_trade = h.engine.submit_signal("bob", &buy("BTCUSDT", 100, 1)).await.unwrap();

        h.clock.advance(Duration::days(1));
        h.store.set_fail_writes_for(USER, true);

        let cancelled = h.engine.sweep_expired_orders().await.unwrap();
        assert_eq!(cancelled, vec![bob_trade.trade_id.clone().unwrap()]);
        assert_eq!(h.trade(&alice_trade).await.status, TradeStatus::Pending);

        assert_eq!(h.engine.run_daily_reset().await.unwrap(), 1);
        assert_eq!(h.store.load_risk_state("bob").await.unwrap().unwrap().trade_count, 0);
        assert_eq!(h.risk().await.trade_count, 1);

        h.store.set_fail_writes_for(USER, false);
        assert_eq!(h.engine.sweep_expired_orders().await.unwrap().len(), 1);
        assert_eq!(h.engine.run_daily_reset().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_daily_reset_is_idempotent() {
        let h = Harness::new(UserAccount::new(USER), MockExchangeConnector::new()).await;
        h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        assert_eq!(h.engine.run_daily_reset().await.unwrap(), 0);

        h.clock.advance(Duration::days(1));
        assert_eq!(h.engine.run_daily_reset().await.unwrap(), 1);
        let once = h.risk().await;
        assert_eq!(h.engine.run_daily_reset().await.unwrap(), 0);
        assert_eq!(h.risk().await, once);

        assert_eq!(once.trade_count, 0);
        assert_eq!(once.consecutive_losses, 0);
        assert_eq!(once.last_reset_at, start() + Duration::days(1));
    }

    #[tokio::test]
    async fn test_snapshot_rolls_over_stale_state() {
        let h = Harness::new(UserAccount::new(USER), MockExchangeConnector::new()).await;
        h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();

        let snapshot = h.engine.risk_snapshot(USER).await.unwrap();
        assert_eq!(snapshot.risk.trade_count, 1);
        assert_eq!(snapshot.strategies.len(), 1);
        assert_eq!(snapshot.pending_trades, 0);

        h.clock.advance(Duration::days(1));
        let snapshot = h.engine.risk_snapshot(USER).await.unwrap();
        assert_eq!(snapshot.risk.trade_count, 0);
    }

    // ==================== Failure Handling ====================

    #[tokio::test]
    async fn test_inconsistent_risk_state_fails_closed() {
        let h = Harness::new(UserAccount::new(USER), MockExchangeConnector::new()).await;

        let mut risk = RiskState::new(USER, start());
        risk.emergency_stop_origin = Some(StopOrigin::System);
        h.store.save_risk_state(&risk).await.unwrap();

        let outcome = h.engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(
            outcome.violation,
            Some(RiskViolation::EmergencyStopActive {
                reason: RISK_STATE_UNAVAILABLE.to_string()
            })
        );
        assert!(h.store.list_trades(USER, 10).await.unwrap().is_empty());

        let err = h.engine.clear_emergency_stop(USER).await.unwrap_err();
        assert!(matches!(err, EngineError::InternalState(StoreError::Corrupted(_))));

        // A manual stop replaces the unusable record
        let risk = h
            .engine
            .trigger_emergency_stop(USER, StopOrigin::Admin, "Investigating")
            .await
            .unwrap();
        assert_eq!(risk.emergency_stop_origin, Some(StopOrigin::Admin));
        assert!(h.store.load_risk_state(USER).await.unwrap().unwrap().validate(start()).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_user_and_invalid_payload() {
        let h = Harness::new(UserAccount::new(USER), MockExchangeConnector::new()).await;

        let err = h.engine.submit_signal("mallory", &buy("BTCUSDT", 100, 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownUser(user) if user == "mallory"));

        let payload = RawPayload::from(json!({"action": "BUY", "price": 100}));
        let err = h.engine.submit_signal(USER, &payload).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSignal(_)));

        assert!(h.store.load_risk_state(USER).await.unwrap().is_none());
    }

    // ==================== SQLite ====================

    async fn sqlite_engine() -> (Arc<Database>, ExecutionEngine) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.save_account(&UserAccount::new(USER)).await.unwrap();
        let engine = ExecutionEngine::new(
            EngineConfig::default(),
            db.clone(),
            Arc::new(MockExchangeConnector::new()),
        )
        .with_clock(Arc::new(ManualClock::new(start())));
        (db, engine)
    }

    #[tokio::test]
    async fn test_sqlite_paper_settlement_end_to_end() {
        let (db, engine) = sqlite_engine().await;

        let payload = RawPayload::from_body("SYMBOL: ETHUSDT\nACTION: SELL\nPRICE: 2000\nQUANTITY: 0.1");
        let outcome = engine.submit_signal(USER, &payload).await.unwrap();
        assert_eq!(outcome.status, Some(TradeStatus::Filled));

        let trades = db.list_trades(USER, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].symbol, "ETH");
        assert_eq!(trades[0].quantity, dec!(0.1));
        assert_eq!(trades[0].executed_price, Some(dec!(2000)));

        let risk = db.load_risk_state(USER).await.unwrap().unwrap();
        assert_eq!(risk.trade_count, 1);
        assert_eq!(risk.consecutive_losses, 1);

        let strategy = db.load_strategy_state(USER, "webhook_signal").await.unwrap().unwrap();
        assert_eq!(strategy.total_trades, 1);
        assert_eq!(strategy.confidence_score, dec!(45));
    }

    #[tokio::test]
    async fn test_sqlite_corrupted_risk_row_fails_closed() {
        let (db, engine) = sqlite_engine().await;
        db.save_risk_state(&RiskState::new(USER, start())).await.unwrap();

        sqlx::query("UPDATE risk_states SET daily_pnl = 'not-a-number' WHERE user_id = ?")
            .bind(USER)
            .execute(db.pool())
            .await
            .unwrap();

        let outcome = engine.submit_signal(USER, &buy("BTCUSDT", 100, 1)).await.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason.as_deref(), Some("emergency stop active: Risk state unavailable"));
        assert!(db.list_trades(USER, 10).await.unwrap().is_empty());
    }
}
