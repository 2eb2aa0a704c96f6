//! Pre-trade risk gate.
//!
//! Guards run in a fixed order and short-circuit on the first failure:
//! 1. coin enabled
//! 2. emergency stop
//! 3. daily trade count
//! 4. consecutive losses
//! 5. daily loss cap
//! 6. trading hours
//! 7. AI confidence threshold
//!
//! The caller must hold the user's critical section for both `evaluate`
//! and the slot reservation in `admit`.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::RiskViolation;
use crate::models::{RiskSettings, RiskState, Signal, SignalSource};

/// Consecutive losing fills after which new signals are refused.
pub const CONSECUTIVE_LOSS_LIMIT: u32 = 3;

/// Evaluate all guards without mutating anything.
pub fn evaluate(
    signal: &Signal,
    settings: &RiskSettings,
    state: &RiskState,
    now: DateTime<Utc>,
) -> Result<(), RiskViolation> {
    if !settings.is_coin_enabled(&signal.symbol) {
        return Err(RiskViolation::CoinDisabled {
            symbol: signal.symbol.clone(),
        });
    }

    if state.emergency_stop {
        return Err(RiskViolation::EmergencyStopActive {
            reason: state
                .emergency_stop_reason
                .clone()
                .unwrap_or_else(|| "Emergency stop".to_string()),
        });
    }

    if state.trade_count >= settings.max_trade_count_per_day {
        return Err(RiskViolation::DailyTradeLimitExceeded {
            count: state.trade_count,
            limit: settings.max_trade_count_per_day,
        });
    }

    if state.consecutive_losses >= CONSECUTIVE_LOSS_LIMIT {
        return Err(RiskViolation::ConsecutiveLossCutoff {
            losses: state.consecutive_losses,
        });
    }

    if state.loss_cap_reached(settings.daily_loss_cap) {
        return Err(RiskViolation::DailyLossCapReached {
            daily_pnl: state.daily_pnl,
            cap: settings.daily_loss_cap,
        });
    }

    if let Some(hours) = &settings.trading_hours {
        if !hours.is_open(now) {
            return Err(RiskViolation::TradingHoursClosed);
        }
    }

    if signal.source == SignalSource::Ai {
        let threshold = settings.min_confidence_threshold;
        match signal.confidence {
            Some(c) if c >= threshold => {}
            confidence => {
                return Err(RiskViolation::ConfidenceBelowThreshold {
                    confidence,
                    threshold,
                })
            }
        }
    }

    Ok(())
}

/// Evaluate and, on success, reserve the daily slot by incrementing `trade_count`.
pub fn admit(
    signal: &Signal,
    settings: &RiskSettings,
    state: &mut RiskState,
    now: DateTime<Utc>,
) -> Result<(), RiskViolation> {
    evaluate(signal, settings, state, now)?;
    state.trade_count += 1;

    debug!(
        user_id = %state.user_id,
        symbol = %signal.symbol,
        trade_count = state.trade_count,
        "Signal admitted"
    );
    Ok(())
}
