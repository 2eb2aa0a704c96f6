//! Fill settlement: trade PnL, daily risk counters, and the post-fill breaker.
//!
//! Everything here mutates in-memory copies; the engine commits the results
//! in a single store transaction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::models::{RiskSettings, RiskState, StopOrigin, Trade, TradeStatus};

pub const LOSS_LIMIT_REASON: &str = "Daily loss limit reached";

/// What a settlement did beyond the arithmetic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlementOutcome {
    pub pnl: Decimal,
    /// The loss-cap breaker went from off to on
    pub breaker_tripped: bool,
}

/// Apply a confirmed fill to the trade and the user's risk state.
pub fn settle_fill(
    trade: &mut Trade,
    risk: &mut RiskState,
    settings: &RiskSettings,
    executed_price: Decimal,
    fees: Decimal,
    now: DateTime<Utc>,
) -> SettlementOutcome {
    let pnl = trade.calculate_pnl(executed_price, fees);

    trade.executed_price = Some(executed_price);
    trade.fees = fees;
    trade.pnl = pnl;
    trade.status = TradeStatus::Filled;
    trade.exit_time = Some(now);

    risk.daily_pnl += pnl;
    if pnl > Decimal::ZERO {
        risk.consecutive_losses = 0;
    } else {
        risk.consecutive_losses += 1;
    }

    let mut breaker_tripped = false;
    if risk.loss_cap_reached(settings.daily_loss_cap) {
        breaker_tripped = !risk.emergency_stop;
        risk.trip(LOSS_LIMIT_REASON, StopOrigin::System);

        if breaker_tripped {
            warn!(
                user_id = %risk.user_id,
                daily_pnl = %risk.daily_pnl,
                cap = %settings.daily_loss_cap,
                "Daily loss cap crossed, emergency stop engaged"
            );
        }
    }

    SettlementOutcome { pnl, breaker_tripped }
}

/// Mark an order cancelled. No PnL effect; the consumed slot stays consumed.
pub fn cancel(trade: &mut Trade, reason: &str, now: DateTime<Utc>) {
    close_without_fill(trade, TradeStatus::Cancelled, reason, now);
}

/// Mark a trade rejected after admission. Same accounting as `cancel`.
pub fn reject(trade: &mut Trade, reason: &str, now: DateTime<Utc>) {
    close_without_fill(trade, TradeStatus::Rejected, reason, now);
}

fn close_without_fill(trade: &mut Trade, status: TradeStatus, reason: &str, now: DateTime<Utc>) {
    trade.status = status;
    trade.pnl = Decimal::ZERO;
    trade.error_message = Some(reason.to_string());
    trade.exit_time = Some(now);
}
