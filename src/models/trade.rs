//! Trade record created by the engine on admission.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{OrderType, Side, SignalSource};

/// Lifecycle status of a trade. Everything except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "PENDING",
            TradeStatus::Filled => "FILLED",
            TradeStatus::Cancelled => "CANCELLED",
            TradeStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(TradeStatus::Pending),
            "FILLED" => Some(TradeStatus::Filled),
            "CANCELLED" | "CANCELED" => Some(TradeStatus::Cancelled),
            "REJECTED" => Some(TradeStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TradeStatus::Pending)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single admitted trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Unique trade identifier (UUID v4)
    pub id: String,

    pub user_id: String,

    /// Normalized base symbol
    pub symbol: String,

    pub side: Side,

    pub order_type: OrderType,

    pub quantity: Decimal,

    /// Price the order was sized against
    pub requested_price: Decimal,

    pub executed_price: Option<Decimal>,

    pub status: TradeStatus,

    pub strategy_name: String,

    /// Confidence used for sizing (0-100)
    pub confidence_score: Decimal,

    pub source: SignalSource,

    /// Only meaningful when `status == Filled`
    pub pnl: Decimal,

    pub fees: Decimal,

    #[serde(default)]
    pub stop_loss_price: Option<Decimal>,

    #[serde(default)]
    pub take_profit_price: Option<Decimal>,

    /// Exchange order id for live orders
    #[serde(default)]
    pub order_id: Option<String>,

    #[serde(default)]
    pub error_message: Option<String>,

    pub entry_time: DateTime<Utc>,

    pub exit_time: Option<DateTime<Utc>>,
}

impl Trade {
    /// Realized P&L for a fill: `(executed - requested) * qty * side - fees`.
    pub fn calculate_pnl(&self, executed_price: Decimal, fees: Decimal) -> Decimal {
        (executed_price - self.requested_price) * self.quantity * self.side.multiplier() - fees
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Notional value at the requested price.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.requested_price
    }
}
