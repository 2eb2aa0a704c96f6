//! Position sizing: capital cap per trade, scaled by confidence.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::models::{RiskSettings, Side};

/// Decimal places kept on order quantities.
const QUANTITY_DP: u32 = 2;

/// Output of a sizing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    /// Final order quantity, truncated to `QUANTITY_DP` places
    pub quantity: Decimal,
    /// Quote-currency allocation the quantity was derived from
    pub nominal: Decimal,
    /// Confidence multiplier applied to the allocation (1 when disabled)
    pub scale: Decimal,
}

/// Calculator for order quantities.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    confidence_sizing: bool,
}

impl PositionSizer {
    pub fn new(confidence_sizing: bool) -> Self {
        Self { confidence_sizing }
    }

    /// Calculate the order quantity for a signal.
    ///
    /// # Arguments
    /// * `capital` - Capital available to the user
    /// * `price` - Effective price the order is valued at (must be positive)
    /// * `symbol` - Normalized base symbol, for per-coin caps
    /// * `settings` - The user's risk settings
    /// * `confidence` - Signal or strategy confidence (0-100)
    /// * `requested_quantity` - Explicit quantity from the signal, capped at the bound
    ///
    /// # Returns
    /// The sized order; `quantity` may be zero when the bound rounds down to nothing.
    pub fn size(
        &self,
        capital: Decimal,
        price: Decimal,
        symbol: &str,
        settings: &RiskSettings,
        confidence: Decimal,
        requested_quantity: Option<Decimal>,
    ) -> SizedOrder {
        if capital <= Decimal::ZERO || price <= Decimal::ZERO {
            return SizedOrder {
                quantity: Decimal::ZERO,
                nominal: Decimal::ZERO,
                scale: Decimal::ZERO,
            };
        }

        let cap_pct = cap_percent(symbol, settings) / Decimal::ONE_HUNDRED;
        let scale = if self.confidence_sizing {
            confidence_scale(confidence, settings.min_confidence_threshold)
        } else {
            Decimal::ONE
        };

        let nominal = capital * cap_pct * scale;
        let bound = truncate(nominal / price);

        let quantity = match requested_quantity {
            Some(requested) => truncate(requested.min(bound)),
            None => bound,
        };

        SizedOrder {
            quantity: quantity.max(Decimal::ZERO),
            nominal,
            scale,
        }
    }
}

/// `min(maxTradeSizePercent, perCoin.maxPositionSize)` as a percentage.
pub fn cap_percent(symbol: &str, settings: &RiskSettings) -> Decimal {
    match settings.coin(symbol) {
        Some(coin) => settings.max_trade_size_percent.min(coin.max_position_size),
        None => settings.max_trade_size_percent,
    }
}

/// Linear map of `[threshold, 100]` onto `[0.5, 1.0]`, clamped at both ends.
pub fn confidence_scale(confidence: Decimal, threshold: Decimal) -> Decimal {
    let half = dec!(0.5);
    let hundred = Decimal::ONE_HUNDRED;

    if threshold >= hundred {
        return half;
    }

    let c = confidence.max(threshold).min(hundred);
    half + half * (c - threshold) / (hundred - threshold)
}

/// Stop-loss and take-profit prices from per-coin percentages.
pub fn protective_levels(
    side: Side,
    price: Decimal,
    symbol: &str,
    settings: &RiskSettings,
) -> (Option<Decimal>, Option<Decimal>) {
    let Some(coin) = settings.coin(symbol) else {
        return (None, None);
    };

    let offset = |pct: Decimal| price * pct / Decimal::ONE_HUNDRED;
    let stop_loss = coin
        .stop_loss_pct
        .map(|pct| price - offset(pct) * side.multiplier());
    let take_profit = coin
        .take_profit_pct
        .map(|pct| price + offset(pct) * side.multiplier());

    (stop_loss, take_profit)
}

fn truncate(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(QUANTITY_DP, RoundingStrategy::ToZero)
}
