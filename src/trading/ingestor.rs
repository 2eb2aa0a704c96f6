//! Signal ingestion: raw webhook/AI payloads into canonical `Signal`s.
//!
//! Two payload shapes are accepted:
//! - a JSON object with `symbol`, `action`/`side`, `price`, `quantity`, `type`,
//!   `confidence`, `strategy`/`strategyName`, `source` (keys case-insensitive)
//! - line-oriented text with `KEY: value` lines (`ACTION`, `SYMBOL`, `PRICE`,
//!   `QUANTITY`, `TYPE`, `CONFIDENCE`, `STRATEGY`, `SOURCE`)

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::SignalError;
use crate::models::{OrderType, Side, Signal, SignalSource};

use super::EngineConfig;

/// Raw request body as received at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Structured(Map<String, Value>),
    Text(String),
}

impl RawPayload {
    /// A body that parses as a JSON object is structured; anything else is text.
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => RawPayload::Structured(map),
            _ => RawPayload::Text(body.to_string()),
        }
    }
}

impl From<Value> for RawPayload {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => RawPayload::Structured(map),
            Value::String(text) => RawPayload::Text(text),
            other => RawPayload::Text(other.to_string()),
        }
    }
}

/// Converts payloads to signals. Stateless apart from configuration.
#[derive(Debug, Clone)]
pub struct SignalIngestor {
    /// Longest first, so `USDT` wins over `USD`
    quote_currencies: Vec<String>,
    default_strategy: String,
}

impl SignalIngestor {
    pub fn new(config: &EngineConfig) -> Self {
        let mut quote_currencies: Vec<String> = config
            .quote_currencies
            .iter()
            .map(|q| q.trim().to_uppercase())
            .filter(|q| !q.is_empty())
            .collect();
        quote_currencies.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        quote_currencies.dedup();

        Self {
            quote_currencies,
            default_strategy: config.default_strategy.clone(),
        }
    }

    /// Upper-case, drop separators, then strip quote suffixes while something remains.
    /// `normalize_symbol(normalize_symbol(s)) == normalize_symbol(s)`.
    pub fn normalize_symbol(&self, raw: &str) -> String {
        let mut symbol: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '/' | '-' | '_') && !c.is_whitespace())
            .collect::<String>()
            .to_uppercase();

        loop {
            let stripped = self.quote_currencies.iter().find_map(|quote| {
                symbol
                    .strip_suffix(quote.as_str())
                    .filter(|rest| !rest.is_empty())
                    .map(str::to_string)
            });

            match stripped {
                Some(rest) => symbol = rest,
                None => return symbol,
            }
        }
    }

    pub fn ingest(&self, payload: &RawPayload) -> Result<Signal, SignalError> {
        let fields = match payload {
            RawPayload::Structured(map) => structured_fields(map)?,
            RawPayload::Text(text) => text_fields(text),
        };
        self.build(fields)
    }

    fn build(&self, fields: HashMap<String, String>) -> Result<Signal, SignalError> {
        let raw_symbol = field(&fields, &["symbol", "ticker"])
            .ok_or_else(|| SignalError::invalid("missing symbol"))?;
        let symbol = self.normalize_symbol(raw_symbol);
        if symbol.is_empty() {
            return Err(SignalError::invalid("empty symbol"));
        }

        let raw_side = field(&fields, &["action", "side"])
            .ok_or_else(|| SignalError::invalid("missing action"))?;
        let side = Side::parse(raw_side)
            .ok_or_else(|| SignalError::invalid(format!("unsupported action: {}", raw_side)))?;

        let order_type = match field(&fields, &["type", "ordertype", "order_type"]) {
            Some(t) => OrderType::parse(t)
                .ok_or_else(|| SignalError::invalid(format!("unsupported order type: {}", t)))?,
            None => OrderType::Market,
        };

        let price = positive_decimal(&fields, "price")?;
        let quantity = positive_decimal(&fields, "quantity")?;
        let confidence = confidence(&fields)?;

        let source = match field(&fields, &["source"]) {
            Some(s) => SignalSource::parse(s)
                .ok_or_else(|| SignalError::invalid(format!("unsupported source: {}", s)))?,
            None => SignalSource::Webhook,
        };

        let strategy_name = field(&fields, &["strategy", "strategyname", "strategy_name"])
            .map(str::to_string)
            .unwrap_or_else(|| self.default_strategy.clone());

        Ok(Signal {
            symbol,
            side,
            order_type,
            price,
            quantity,
            confidence,
            strategy_name,
            source,
        })
    }
}

fn structured_fields(map: &Map<String, Value>) -> Result<HashMap<String, String>, SignalError> {
    let mut fields = HashMap::new();
    for (key, value) in map {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(SignalError::invalid(format!("field {} must be a scalar", key)))
            }
        };
        fields.insert(key.to_ascii_lowercase(), text);
    }
    Ok(fields)
}

fn text_fields(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}

fn field<'a>(fields: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| fields.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

fn positive_decimal(fields: &HashMap<String, String>, key: &str) -> Result<Option<Decimal>, SignalError> {
    let Some(raw) = field(fields, &[key]) else {
        return Ok(None);
    };
    let value = parse_decimal(raw)
        .ok_or_else(|| SignalError::invalid(format!("{} is not a number: {}", key, raw)))?;
    if value <= Decimal::ZERO {
        return Err(SignalError::invalid(format!("{} must be positive", key)));
    }
    Ok(Some(value))
}

/// Confidence on a 0-100 scale. Values below 1 are fractions and get scaled
/// up; exactly 1 is only a fraction when written with a decimal point
/// (`1.0`), a bare `1` is rejected as ambiguous. A `%` suffix is always a percentage.
fn confidence(fields: &HashMap<String, String>) -> Result<Option<Decimal>, SignalError> {
    let Some(raw) = field(fields, &["confidence"]) else {
        return Ok(None);
    };
    let percent = raw.ends_with('%');
    let raw = raw.trim_end_matches('%').trim();
    let value = parse_decimal(raw)
        .ok_or_else(|| SignalError::invalid(format!("confidence is not a number: {}", raw)))?;

    let hundred = Decimal::ONE_HUNDRED;
    let scaled = if percent {
        value
    } else if value < Decimal::ONE {
        value * hundred
    } else if value == Decimal::ONE {
        if !raw.contains('.') {
            return Err(SignalError::invalid(
                "confidence 1 is ambiguous, use 1.0 for a fraction or 100 for a percentage",
            ));
        }
        hundred
    } else {
        value
    };
    if scaled < Decimal::ZERO || scaled > hundred {
        return Err(SignalError::invalid(format!("confidence out of range: {}", raw)));
    }
    Ok(Some(scaled))
}
