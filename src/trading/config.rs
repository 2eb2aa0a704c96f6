//! Engine configuration.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Process-wide settings. Per-user risk limits live in `RiskSettings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Quote suffixes stripped from incoming symbols, e.g. `BTCUSDT` -> `BTC`
    pub quote_currencies: Vec<String>,

    /// Scale position size by signal confidence
    pub confidence_sizing: bool,

    /// Step size of the strategy confidence learner (0.0 to 1.0)
    pub learning_rate: Decimal,

    /// Fee charged on simulated fills, as a fraction of notional
    pub paper_fee_rate: Decimal,

    /// Pending live orders older than this are cancelled
    pub fill_timeout_secs: u64,

    /// How long fetched account capital is reused
    pub capital_cache_secs: u64,

    /// Strategy name for signals that do not carry one
    pub default_strategy: String,

    pub database_url: String,

    pub exchange_url: String,

    pub exchange_api_key: Option<String>,

    /// Period of the daily-reset and stale-order maintenance loop
    pub maintenance_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quote_currencies: vec![
                "USDT".to_string(),
                "USDC".to_string(),
                "BUSD".to_string(),
                "USD".to_string(),
            ],
            confidence_sizing: true,
            learning_rate: dec!(0.1),
            paper_fee_rate: dec!(0),         // Frictionless paper fills
            fill_timeout_secs: 300,          // 5 minutes
            capital_cache_secs: 5,
            default_strategy: "webhook_signal".to_string(),
            database_url: "sqlite:riskgate.db?mode=rwc".to_string(),
            exchange_url: "http://127.0.0.1:8080".to_string(),
            exchange_api_key: None,
            maintenance_interval_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `RISKGATE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("RISKGATE_QUOTE_CURRENCIES") {
            config.quote_currencies = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("RISKGATE_CONFIDENCE_SIZING") {
            config.confidence_sizing = parse_bool(&v)
                .with_context(|| format!("Invalid RISKGATE_CONFIDENCE_SIZING: {}", v))?;
        }
        if let Some(v) = lookup("RISKGATE_LEARNING_RATE") {
            config.learning_rate = Decimal::from_str(v.trim())
                .with_context(|| format!("Invalid RISKGATE_LEARNING_RATE: {}", v))?;
        }
        if let Some(v) = lookup("RISKGATE_PAPER_FEE_RATE") {
            config.paper_fee_rate = Decimal::from_str(v.trim())
                .with_context(|| format!("Invalid RISKGATE_PAPER_FEE_RATE: {}", v))?;
        }
        if let Some(v) = lookup("RISKGATE_FILL_TIMEOUT_SECS") {
            config.fill_timeout_secs = v.trim().parse()
                .with_context(|| format!("Invalid RISKGATE_FILL_TIMEOUT_SECS: {}", v))?;
        }
        if let Some(v) = lookup("RISKGATE_CAPITAL_CACHE_SECS") {
            config.capital_cache_secs = v.trim().parse()
                .with_context(|| format!("Invalid RISKGATE_CAPITAL_CACHE_SECS: {}", v))?;
        }
        if let Some(v) = lookup("RISKGATE_DEFAULT_STRATEGY") {
            config.default_strategy = v;
        }
        if let Some(v) = lookup("RISKGATE_DATABASE_URL") {
            config.database_url = v;
        }
        if let Some(v) = lookup("RISKGATE_EXCHANGE_URL") {
            config.exchange_url = v;
        }
        if let Some(v) = lookup("RISKGATE_EXCHANGE_API_KEY") {
            config.exchange_api_key = Some(v).filter(|k| !k.is_empty());
        }
        if let Some(v) = lookup("RISKGATE_MAINTENANCE_INTERVAL_SECS") {
            config.maintenance_interval_secs = v.trim().parse()
                .with_context(|| format!("Invalid RISKGATE_MAINTENANCE_INTERVAL_SECS: {}", v))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.learning_rate < Decimal::ZERO || self.learning_rate > Decimal::ONE {
            anyhow::bail!("learning_rate must be within [0, 1], got {}", self.learning_rate);
        }
        if self.paper_fee_rate < Decimal::ZERO {
            anyhow::bail!("paper_fee_rate must not be negative");
        }
        if self.default_strategy.trim().is_empty() {
            anyhow::bail!("default_strategy must not be empty");
        }
        if self.maintenance_interval_secs == 0 {
            anyhow::bail!("maintenance_interval_secs must be positive");
        }
        Ok(())
    }

    /// Quote currency used when building exchange pairs.
    pub fn primary_quote(&self) -> &str {
        self.quote_currencies.first().map(String::as_str).unwrap_or("USDT")
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.learning_rate, dec!(0.1));
        assert_eq!(config.primary_quote(), "USDT");
        assert_eq!(config.default_strategy, "webhook_signal");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("RISKGATE_QUOTE_CURRENCIES", "usdc, usdt"),
            ("RISKGATE_CONFIDENCE_SIZING", "off"),
            ("RISKGATE_LEARNING_RATE", "0.2"),
            ("RISKGATE_FILL_TIMEOUT_SECS", "60"),
            ("RISKGATE_EXCHANGE_API_KEY", ""),
        ]))
        .unwrap();

        assert_eq!(config.quote_currencies, vec!["USDC", "USDT"]);
        assert!(!config.confidence_sizing);
        assert_eq!(config.learning_rate, dec!(0.2));
        assert_eq!(config.fill_timeout_secs, 60);
        assert_eq!(config.exchange_api_key, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[("RISKGATE_LEARNING_RATE", "abc")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("RISKGATE_LEARNING_RATE", "1.5")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("RISKGATE_CONFIDENCE_SIZING", "maybe")])).is_err());
    }
}
