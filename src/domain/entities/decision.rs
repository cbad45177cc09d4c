//! Trading decisions returned by the decision oracle.
//!
//! The oracle response is an untyped JSON object keyed by asset. Each entry
//! is parsed leniently: unknown signal strings are preserved (not rejected at
//! parse time) so the executor can report them per asset without aborting the
//! rest of the batch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The known decision kinds, plus a catch-all carrying the raw string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    BuyToEnter,
    SellToEnter,
    ClosePosition,
    Hold,
    Unrecognized(String),
}

impl Signal {
    /// Case-insensitive parse; anything unknown is kept verbatim.
    pub fn parse(raw: &str) -> Signal {
        match raw.to_lowercase().as_str() {
            "buy_to_enter" => Signal::BuyToEnter,
            "sell_to_enter" => Signal::SellToEnter,
            "close_position" => Signal::ClosePosition,
            "hold" => Signal::Hold,
            other => Signal::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Signal::BuyToEnter => "buy_to_enter",
            Signal::SellToEnter => "sell_to_enter",
            Signal::ClosePosition => "close_position",
            Signal::Hold => "hold",
            Signal::Unrecognized(raw) => raw,
        }
    }
}

/// One per-asset decision as produced by the oracle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub signal: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub justification: Option<String>,
    #[serde(default)]
    pub profit_target: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
}

impl Decision {
    pub fn signal(&self) -> Signal {
        Signal::parse(&self.signal)
    }

    /// Requested leverage, truncated to an integer and clamped up to 1.
    pub fn clamped_leverage(&self) -> i64 {
        (self.leverage.unwrap_or(1.0).trunc() as i64).max(1)
    }
}

/// Parse an oracle response object into per-asset decisions.
///
/// Non-object responses yield an empty map; entries that do not look like a
/// decision fall back to `Decision::default()`, whose empty signal string is
/// reported downstream as unrecognized.
pub fn parse_decisions(raw: &serde_json::Value) -> HashMap<String, Decision> {
    let Some(entries) = raw.as_object() else {
        return HashMap::new();
    };

    entries
        .iter()
        .map(|(asset, value)| {
            let decision =
                serde_json::from_value::<Decision>(value.clone()).unwrap_or_default();
            (asset.clone(), decision)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_parse_known_kinds() {
        assert_eq!(Signal::parse("buy_to_enter"), Signal::BuyToEnter);
        assert_eq!(Signal::parse("SELL_TO_ENTER"), Signal::SellToEnter);
        assert_eq!(Signal::parse("close_position"), Signal::ClosePosition);
        assert_eq!(Signal::parse("Hold"), Signal::Hold);
    }

    #[test]
    fn test_signal_parse_unrecognized_keeps_raw() {
        let signal = Signal::parse("double_down");
        assert_eq!(signal, Signal::Unrecognized("double_down".to_string()));
        assert_eq!(signal.as_str(), "double_down");
    }

    #[test]
    fn test_clamped_leverage() {
        let mut decision = Decision::default();
        assert_eq!(decision.clamped_leverage(), 1);

        decision.leverage = Some(10.0);
        assert_eq!(decision.clamped_leverage(), 10);

        decision.leverage = Some(0.5);
        assert_eq!(decision.clamped_leverage(), 1);

        decision.leverage = Some(-3.0);
        assert_eq!(decision.clamped_leverage(), 1);

        decision.leverage = Some(7.9);
        assert_eq!(decision.clamped_leverage(), 7);
    }

    #[test]
    fn test_parse_decisions_object() {
        let raw = json!({
            "BTC": {"signal": "buy_to_enter", "quantity": 0.5, "leverage": 10, "confidence": 0.8},
            "ETH": {"signal": "hold"}
        });

        let decisions = parse_decisions(&raw);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions["BTC"].signal(), Signal::BuyToEnter);
        assert_eq!(decisions["BTC"].quantity, Some(0.5));
        assert_eq!(decisions["BTC"].clamped_leverage(), 10);
        assert_eq!(decisions["ETH"].signal(), Signal::Hold);
    }

    #[test]
    fn test_parse_decisions_tolerates_garbage() {
        assert!(parse_decisions(&json!("not an object")).is_empty());
        assert!(parse_decisions(&json!(null)).is_empty());

        // A malformed entry degrades to a default decision rather than
        // poisoning the whole map
        let decisions = parse_decisions(&json!({"BTC": "yolo", "ETH": {"signal": "hold"}}));
        assert_eq!(decisions.len(), 2);
        assert!(matches!(decisions["BTC"].signal(), Signal::Unrecognized(_)));
        assert_eq!(decisions["ETH"].signal(), Signal::Hold);
    }
}
