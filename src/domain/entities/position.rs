//! Open leveraged exposure to one asset on one side.

use serde::{Deserialize, Serialize};

use crate::persistence::models::PositionRecord;

/// Side of an open position.
///
/// An agent may hold a long and a short on the same asset simultaneously,
/// but never two independent lots on the same side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(PositionSide::Long),
            "short" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open leveraged position.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub asset: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub avg_price: f64,
    pub leverage: i64,
}

impl Position {
    /// Build from a persisted row. Rows with an unrecognized side are treated
    /// as long, matching the schema default.
    pub fn from_record(record: &PositionRecord) -> Self {
        Position {
            asset: record.asset.clone(),
            side: PositionSide::parse(&record.side).unwrap_or(PositionSide::Long),
            quantity: record.quantity,
            avg_price: record.avg_price,
            leverage: record.leverage,
        }
    }

    /// Notional exposure at entry: quantity x avg_price.
    pub fn notional(&self) -> f64 {
        self.quantity * self.avg_price
    }

    /// Capital reserved against this position, released when it closes.
    pub fn margin(&self) -> f64 {
        self.notional() / self.leverage.max(1) as f64
    }

    /// Mark-to-market P&L at the given price.
    pub fn pnl_at(&self, current_price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (current_price - self.avg_price) * self.quantity,
            PositionSide::Short => (self.avg_price - current_price) * self.quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_long() -> Position {
        Position {
            asset: "BTC".to_string(),
            side: PositionSide::Long,
            quantity: 1.0,
            avg_price: 50_000.0,
            leverage: 10,
        }
    }

    #[test]
    fn test_side_roundtrip() {
        assert_eq!(PositionSide::parse("long"), Some(PositionSide::Long));
        assert_eq!(PositionSide::parse("short"), Some(PositionSide::Short));
        assert_eq!(PositionSide::parse("LONG"), None);
        assert_eq!(PositionSide::Long.to_string(), "long");
        assert_eq!(PositionSide::Short.to_string(), "short");
    }

    #[test]
    fn test_margin_divides_notional_by_leverage() {
        let position = btc_long();
        assert_eq!(position.notional(), 50_000.0);
        assert_eq!(position.margin(), 5_000.0);
    }

    #[test]
    fn test_margin_guards_against_zero_leverage() {
        let mut position = btc_long();
        position.leverage = 0;
        assert_eq!(position.margin(), 50_000.0);
    }

    #[test]
    fn test_pnl_long() {
        let position = btc_long();
        assert_eq!(position.pnl_at(55_000.0), 5_000.0);
        assert_eq!(position.pnl_at(45_000.0), -5_000.0);
    }

    #[test]
    fn test_pnl_short() {
        let mut position = btc_long();
        position.side = PositionSide::Short;
        assert_eq!(position.pnl_at(45_000.0), 5_000.0);
        assert_eq!(position.pnl_at(55_000.0), -5_000.0);
    }
}
