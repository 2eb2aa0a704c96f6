//! Per-strategy confidence learning from trade outcomes.
//!
//! Wins move confidence a fraction of the way toward 100; losses decay it
//! multiplicatively. Three or more losses in a row apply an extra 20% cut.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::models::{StrategyState, MAX_CONFIDENCE, MIN_CONFIDENCE};

/// Losing streak at which the extra penalty applies.
const PENALTY_STREAK: u32 = 3;
const STREAK_PENALTY: Decimal = dec!(0.8);

#[derive(Debug, Clone)]
pub struct ConfidenceLearner {
    learning_rate: Decimal,
}

impl ConfidenceLearner {
    pub fn new(learning_rate: Decimal) -> Self {
        Self { learning_rate }
    }

    /// Fold one filled trade's PnL into the strategy. `pnl > 0` is a win.
    pub fn record_outcome(&self, state: &mut StrategyState, pnl: Decimal, now: DateTime<Utc>) {
        let win = pnl > Decimal::ZERO;

        state.total_trades += 1;
        state.total_pnl += pnl;
        if win {
            state.winning_trades += 1;
            state.consecutive_losses = 0;
        } else {
            state.consecutive_losses += 1;
        }

        let previous = state.confidence_score;
        let mut confidence = if win {
            previous + self.learning_rate * (Decimal::ONE_HUNDRED - previous)
        } else {
            previous - self.learning_rate * previous
        };

        if state.consecutive_losses >= PENALTY_STREAK {
            confidence = (confidence * STREAK_PENALTY).max(MIN_CONFIDENCE);
        }

        state.confidence_score = clamp_confidence(confidence);
        state.updated_at = now;

        debug!(
            user_id = %state.user_id,
            strategy = %state.strategy_name,
            from = %previous,
            to = %state.confidence_score,
            "Strategy confidence updated"
        );
    }
}

pub fn clamp_confidence(value: Decimal) -> Decimal {
    value.max(MIN_CONFIDENCE).min(MAX_CONFIDENCE)
}
