//! Per-user risk settings and the daily risk state aggregate.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Per-coin overrides. Percentages are expressed as 0-100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinSettings {
    pub enabled: bool,

    /// Max position size as a percentage of capital
    pub max_position_size: Decimal,

    #[serde(default)]
    pub stop_loss_pct: Option<Decimal>,

    #[serde(default)]
    pub take_profit_pct: Option<Decimal>,
}

impl Default for CoinSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_position_size: dec!(5),
            stop_loss_pct: Some(dec!(2)),
            take_profit_pct: Some(dec!(4)),
        }
    }
}

/// Daily trading window in a named timezone. The window is `[start, end)`;
/// when `start > end` it wraps past midnight, and `start == end` means
/// the whole day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub timezone: Tz,
}

impl TradingHours {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone).time();

        if self.start == self.end {
            true
        } else if self.start < self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}

/// User-editable risk limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSettings {
    /// Absolute daily P&L magnitude that halts trading
    pub daily_loss_cap: Decimal,

    pub max_trade_count_per_day: u32,

    /// Max trade size as a percentage of capital
    pub max_trade_size_percent: Decimal,

    pub max_leverage_cap: Decimal,

    /// Confidence floor (0-100) for AI-originated signals
    pub min_confidence_threshold: Decimal,

    pub enabled_coins: HashSet<String>,

    #[serde(default)]
    pub per_coin: HashMap<String, CoinSettings>,

    #[serde(default)]
    pub trading_hours: Option<TradingHours>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            daily_loss_cap: dec!(1000),
            max_trade_count_per_day: 10,
            max_trade_size_percent: dec!(5),
            max_leverage_cap: dec!(10),
            min_confidence_threshold: dec!(70),
            enabled_coins: ["BTC", "ETH"].iter().map(|s| s.to_string()).collect(),
            per_coin: HashMap::new(),
            trading_hours: None,
        }
    }
}

impl RiskSettings {
    pub fn coin(&self, symbol: &str) -> Option<&CoinSettings> {
        self.per_coin.get(symbol)
    }

    /// Rewrite coin keys through `normalize` (e.g. `btcusdt` -> `BTC`) so they
    /// match normalized signal symbols. Keys that normalize to nothing are dropped.
    pub fn normalize_coins(&mut self, normalize: impl Fn(&str) -> String) {
        self.enabled_coins = self
            .enabled_coins
            .iter()
            .map(|coin| normalize(coin))
            .filter(|coin| !coin.is_empty())
            .collect();
        self.per_coin = std::mem::take(&mut self.per_coin)
            .into_iter()
            .map(|(coin, settings)| (normalize(&coin), settings))
            .filter(|(coin, _)| !coin.is_empty())
            .collect();
    }

    /// Enabled globally and not switched off per coin.
    pub fn is_coin_enabled(&self, symbol: &str) -> bool {
        self.enabled_coins.contains(symbol) && self.coin(symbol).map_or(true, |c| c.enabled)
    }
}

/// Who tripped the emergency stop. Only `System` stops clear on daily reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopOrigin {
    System,
    User,
    Admin,
}

impl StopOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopOrigin::System => "system",
            StopOrigin::User => "user",
            StopOrigin::Admin => "admin",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "system" => Some(StopOrigin::System),
            "user" => Some(StopOrigin::User),
            "admin" => Some(StopOrigin::Admin),
            _ => None,
        }
    }
}

/// Mutable per-user risk aggregate, reset at the start of each trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub user_id: String,
    pub daily_pnl: Decimal,
    pub trade_count: u32,
    pub consecutive_losses: u32,
    pub emergency_stop: bool,
    pub emergency_stop_reason: Option<String>,
    pub emergency_stop_origin: Option<StopOrigin>,
    pub capital_conservation_mode: bool,
    pub last_reset_at: DateTime<Utc>,
}

/// Tolerated clock skew before a future `last_reset_at` is considered corrupt.
const MAX_CLOCK_SKEW_SECS: i64 = 300;

impl RiskState {
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            daily_pnl: Decimal::ZERO,
            trade_count: 0,
            consecutive_losses: 0,
            emergency_stop: false,
            emergency_stop_reason: None,
            emergency_stop_origin: None,
            capital_conservation_mode: false,
            last_reset_at: now,
        }
    }

    /// Start of the trading day containing `now` (UTC midnight).
    pub fn trading_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
        now.date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc())
            .unwrap_or(now)
    }

    pub fn needs_reset(&self, now: DateTime<Utc>) -> bool {
        self.last_reset_at < Self::trading_day_start(now)
    }

    /// Apply the daily rollover if the state belongs to a previous day.
    /// Returns whether anything changed; calling it twice in a day is a no-op.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        if !self.needs_reset(now) {
            return false;
        }

        self.daily_pnl = Decimal::ZERO;
        self.trade_count = 0;
        self.consecutive_losses = 0;

        if self.emergency_stop && !self.is_manual_stop() {
            self.clear_stop();
        }

        self.last_reset_at = now;
        true
    }

    /// Trip the emergency stop. An existing manual stop keeps its origin.
    pub fn trip(&mut self, reason: impl Into<String>, origin: StopOrigin) {
        if !(self.emergency_stop && self.is_manual_stop()) {
            self.emergency_stop_reason = Some(reason.into());
            self.emergency_stop_origin = Some(origin);
        }
        self.emergency_stop = true;
        if origin == StopOrigin::System {
            self.capital_conservation_mode = true;
        }
    }

    /// Stop placed by a user or admin rather than a breaker.
    pub fn is_manual_stop(&self) -> bool {
        matches!(self.emergency_stop_origin, Some(StopOrigin::User | StopOrigin::Admin))
    }

    pub fn clear_stop(&mut self) {
        self.emergency_stop = false;
        self.emergency_stop_reason = None;
        self.emergency_stop_origin = None;
        self.capital_conservation_mode = false;
    }

    pub fn loss_cap_reached(&self, daily_loss_cap: Decimal) -> bool {
        self.daily_pnl.abs() >= daily_loss_cap
    }

    /// Structural sanity check used to fail closed on bad records.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), String> {
        if self.user_id.is_empty() {
            return Err("risk state has no user id".to_string());
        }
        if self.last_reset_at > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return Err(format!(
                "last_reset_at {} is in the future",
                self.last_reset_at.to_rfc3339()
            ));
        }
        if self.emergency_stop_origin.is_some() && !self.emergency_stop {
            return Err("stop origin recorded without an active stop".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
    }

    #[test]
    fn test_rollover_is_idempotent() {
        let mut state = RiskState::new("u1", at(10, 0) - Duration::days(1));
        state.daily_pnl = dec!(-400);
        state.trade_count = 7;
        state.consecutive_losses = 2;

        assert!(state.roll_over(at(9, 0)));
        assert_eq!(state.daily_pnl, Decimal::ZERO);
        assert_eq!(state.trade_count, 0);
        assert_eq!(state.consecutive_losses, 0);
        assert_eq!(state.last_reset_at, at(9, 0));

        state.trade_count = 1;
        assert!(!state.roll_over(at(18, 0)));
        assert_eq!(state.trade_count, 1);
    }

    #[test]
    fn test_rollover_clears_system_stop_but_not_manual_stop() {
        let yesterday = at(12, 0) - Duration::days(1);

        let mut system = RiskState::new("u1", yesterday);
        system.trip("Daily loss limit reached", StopOrigin::System);
        system.roll_over(at(1, 0));
        assert!(!system.emergency_stop);
        assert!(!system.capital_conservation_mode);

        let mut manual = RiskState::new("u1", yesterday);
        manual.trip("going on holiday", StopOrigin::User);
        manual.roll_over(at(1, 0));
        assert!(manual.emergency_stop);
        assert_eq!(manual.emergency_stop_reason.as_deref(), Some("going on holiday"));
    }

    #[test]
    fn test_system_trip_does_not_overwrite_manual_reason() {
        let mut state = RiskState::new("u1", at(8, 0));
        state.trip("admin halt", StopOrigin::Admin);
        state.trip("Daily loss limit reached", StopOrigin::System);

        assert_eq!(state.emergency_stop_origin, Some(StopOrigin::Admin));
        assert_eq!(state.emergency_stop_reason.as_deref(), Some("admin halt"));
        assert!(state.capital_conservation_mode);
    }

    #[test]
    fn test_loss_cap_uses_magnitude() {
        let mut state = RiskState::new("u1", at(8, 0));
        state.daily_pnl = dec!(-999.99);
        assert!(!state.loss_cap_reached(dec!(1000)));
        state.daily_pnl = dec!(-1000);
        assert!(state.loss_cap_reached(dec!(1000)));
    }

    #[test]
    fn test_validate_rejects_future_reset() {
        let state = RiskState::new("u1", at(12, 0) + Duration::hours(2));
        assert!(state.validate(at(12, 0)).is_err());
        assert!(RiskState::new("u1", at(12, 0)).validate(at(12, 0)).is_ok());
    }

    #[test]
    fn test_trading_hours_window() {
        let hours = TradingHours {
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            timezone: chrono_tz::UTC,
        };
        assert!(hours.is_open(at(9, 0)));
        assert!(hours.is_open(at(16, 59)));
        assert!(!hours.is_open(at(17, 0)));
        assert!(!hours.is_open(at(8, 59)));
    }

    #[test]
    fn test_trading_hours_respect_timezone_and_wrap() {
        // 22:00-02:00 Tokyo (UTC+9) is 13:00-17:00 UTC
        let hours = TradingHours {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            timezone: chrono_tz::Asia::Tokyo,
        };
        assert!(hours.is_open(at(13, 0)));
        assert!(hours.is_open(at(16, 30)));
        assert!(!hours.is_open(at(17, 0)));
        assert!(!hours.is_open(at(12, 59)));
    }

    #[test]
    fn test_normalize_coins_rewrites_keys() {
        let mut settings = RiskSettings::default();
        settings.enabled_coins = ["btc", " eth ", ""].iter().map(|s| s.to_string()).collect();
        settings.per_coin.insert("sol".to_string(), CoinSettings::default());

        settings.normalize_coins(|raw| raw.trim().to_uppercase());

        assert!(settings.is_coin_enabled("BTC"));
        assert!(settings.is_coin_enabled("ETH"));
        assert_eq!(settings.enabled_coins.len(), 2);
        assert!(settings.coin("SOL").is_some());
        assert!(settings.coin("sol").is_none());
    }

    #[test]
    fn test_coin_enablement() {
        let mut settings = RiskSettings::default();
        assert!(settings.is_coin_enabled("BTC"));
        assert!(!settings.is_coin_enabled("DOGE"));

        settings.per_coin.insert(
            "BTC".to_string(),
            CoinSettings { enabled: false, ..Default::default() },
        );
        assert!(!settings.is_coin_enabled("BTC"));
    }
}
