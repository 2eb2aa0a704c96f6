//! User account: execution mode and risk settings.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::RiskSettings;

/// Everything the engine needs to know about a user besides their mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub user_id: String,

    /// Simulated fills, no exchange calls
    #[serde(default = "default_true")]
    pub paper_trading_mode: bool,

    /// Capital used for sizing while paper trading
    #[serde(default = "default_paper_capital")]
    pub paper_capital: Decimal,

    #[serde(default)]
    pub risk_settings: RiskSettings,
}

fn default_true() -> bool {
    true
}

fn default_paper_capital() -> Decimal {
    dec!(10000)
}

impl UserAccount {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            paper_trading_mode: true,
            paper_capital: default_paper_capital(),
            risk_settings: RiskSettings::default(),
        }
    }
}
