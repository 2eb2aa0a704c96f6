//! Per-(user, strategy) confidence and performance state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Lower bound for a strategy's confidence score.
pub const MIN_CONFIDENCE: Decimal = dec!(5);

/// Upper bound for a strategy's confidence score.
pub const MAX_CONFIDENCE: Decimal = dec!(95);

/// Confidence assigned to a strategy the first time it is seen.
pub const INITIAL_CONFIDENCE: Decimal = dec!(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    pub user_id: String,
    pub strategy_name: String,

    /// Always within `[MIN_CONFIDENCE, MAX_CONFIDENCE]`
    pub confidence_score: Decimal,

    pub consecutive_losses: u32,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub total_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl StrategyState {
    pub fn new(user_id: impl Into<String>, strategy_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            strategy_name: strategy_name.into(),
            confidence_score: INITIAL_CONFIDENCE,
            consecutive_losses: 0,
            total_trades: 0,
            winning_trades: 0,
            total_pnl: Decimal::ZERO,
            updated_at: now,
        }
    }

    /// Fraction of winning trades (0-1), zero before the first trade.
    pub fn win_rate(&self) -> Decimal {
        if self.total_trades == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.winning_trades) / Decimal::from(self.total_trades)
    }
}
