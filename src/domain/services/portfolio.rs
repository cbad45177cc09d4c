//! Portfolio Calculator
//!
//! Read-only valuation of one agent's account. Everything here is derived
//! from the immutable trade log, the open-position set, and the agent's
//! initial capital; there is no running balance that can drift from its
//! derivation:
//!
//!   cash        = initial_capital + realized_pnl - margin_used
//!   total_value = initial_capital + realized_pnl + unrealized_pnl

use std::collections::HashMap;

use serde::Serialize;

use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::errors::EngineError;
use crate::persistence::repository::LedgerRepository;

/// One open position as reported in a valuation.
#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    pub asset: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub avg_price: f64,
    pub leverage: i64,
    /// Market price used for mark-to-market; unset when no price map was
    /// supplied or the asset was missing from it.
    pub current_price: Option<f64>,
    /// Unrealized P&L; 0 whenever `current_price` is unset.
    pub pnl: f64,
}

impl PositionView {
    pub fn position(&self) -> Position {
        Position {
            asset: self.asset.clone(),
            side: self.side,
            quantity: self.quantity,
            avg_price: self.avg_price,
            leverage: self.leverage,
        }
    }
}

/// Point-in-time account valuation for one agent.
#[derive(Debug, Clone, Serialize)]
pub struct Valuation {
    pub agent_id: i64,
    pub cash: f64,
    pub positions: Vec<PositionView>,
    pub positions_value: f64,
    pub margin_used: f64,
    pub total_value: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

impl Valuation {
    /// First open position on the asset, either side.
    pub fn find_position(&self, asset: &str) -> Option<&PositionView> {
        self.positions.iter().find(|p| p.asset == asset)
    }
}

/// Computes valuations against the ledger. Read-only.
#[derive(Clone)]
pub struct PortfolioCalculator {
    ledger: LedgerRepository,
}

impl PortfolioCalculator {
    pub fn new(ledger: LedgerRepository) -> Self {
        Self { ledger }
    }

    /// Value the agent's account, marking open positions to market when a
    /// price map is supplied. Omitting the prices is not an error: unrealized
    /// P&L is then reported as 0 and current prices are left unset.
    pub async fn valuation(
        &self,
        agent_id: i64,
        current_prices: Option<&HashMap<String, f64>>,
    ) -> Result<Valuation, EngineError> {
        let agent = self
            .ledger
            .get_agent(agent_id)
            .await?
            .ok_or(EngineError::AgentNotFound(agent_id))?;

        let records = self.ledger.open_positions(agent_id).await?;
        let realized_pnl = self.ledger.sum_realized_pnl(agent_id).await?;

        let mut positions = Vec::with_capacity(records.len());
        let mut margin_used = 0.0;
        let mut positions_value = 0.0;
        let mut unrealized_pnl = 0.0;

        for record in &records {
            let position = Position::from_record(record);
            margin_used += position.margin();
            positions_value += position.notional();

            let current_price =
                current_prices.and_then(|prices| prices.get(&position.asset).copied());
            let pnl = current_price.map_or(0.0, |price| position.pnl_at(price));
            unrealized_pnl += pnl;

            positions.push(PositionView {
                asset: position.asset,
                side: position.side,
                quantity: position.quantity,
                avg_price: position.avg_price,
                leverage: position.leverage,
                current_price,
                pnl,
            });
        }

        let cash = agent.initial_capital + realized_pnl - margin_used;
        let total_value = agent.initial_capital + realized_pnl + unrealized_pnl;

        Ok(Valuation {
            agent_id,
            cash,
            positions,
            positions_value,
            margin_used,
            total_value,
            realized_pnl,
            unrealized_pnl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::models::{CreateAgent, NewTrade};
    use crate::persistence::init_database;

    async fn setup() -> (LedgerRepository, i64) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let ledger = LedgerRepository::new(pool);
        let agent = ledger
            .create_agent(CreateAgent {
                name: "alpha".to_string(),
                api_key: "sk-test".to_string(),
                api_url: "https://api.example.com".to_string(),
                model_name: "test-model".to_string(),
                initial_capital: 100_000.0,
            })
            .await
            .unwrap();
        (ledger, agent.id)
    }

    #[tokio::test]
    async fn test_valuation_unknown_agent() {
        let (ledger, _) = setup().await;
        let calculator = PortfolioCalculator::new(ledger);
        let err = calculator.valuation(9_999, None).await.unwrap_err();
        assert!(matches!(err, EngineError::AgentNotFound(9_999)));
    }

    #[tokio::test]
    async fn test_valuation_empty_account() {
        let (ledger, agent_id) = setup().await;
        let calculator = PortfolioCalculator::new(ledger);

        let valuation = calculator.valuation(agent_id, None).await.unwrap();
        assert_eq!(valuation.cash, 100_000.0);
        assert_eq!(valuation.total_value, 100_000.0);
        assert_eq!(valuation.margin_used, 0.0);
        assert!(valuation.positions.is_empty());
    }

    #[tokio::test]
    async fn test_valuation_with_open_position() {
        let (ledger, agent_id) = setup().await;
        ledger
            .upsert_position(agent_id, "BTC", 1.0, 50_000.0, 10, "long")
            .await
            .unwrap();
        let calculator = PortfolioCalculator::new(ledger);

        let prices = HashMap::from([("BTC".to_string(), 55_000.0)]);
        let valuation = calculator.valuation(agent_id, Some(&prices)).await.unwrap();

        assert_eq!(valuation.margin_used, 5_000.0);
        assert_eq!(valuation.cash, 95_000.0);
        assert_eq!(valuation.positions_value, 50_000.0);
        assert_eq!(valuation.unrealized_pnl, 5_000.0);
        assert_eq!(valuation.total_value, 105_000.0);

        let view = valuation.find_position("BTC").unwrap();
        assert_eq!(view.current_price, Some(55_000.0));
        assert_eq!(view.pnl, 5_000.0);
    }

    #[tokio::test]
    async fn test_valuation_without_prices_reports_zero_unrealized() {
        let (ledger, agent_id) = setup().await;
        ledger
            .upsert_position(agent_id, "BTC", 1.0, 50_000.0, 10, "long")
            .await
            .unwrap();
        let calculator = PortfolioCalculator::new(ledger);

        let valuation = calculator.valuation(agent_id, None).await.unwrap();
        assert_eq!(valuation.unrealized_pnl, 0.0);
        assert_eq!(valuation.total_value, 100_000.0);

        let view = valuation.find_position("BTC").unwrap();
        assert!(view.current_price.is_none());
        assert_eq!(view.pnl, 0.0);

        // Same when a price map is supplied but misses the asset
        let prices = HashMap::from([("ETH".to_string(), 3_000.0)]);
        let valuation = calculator.valuation(agent_id, Some(&prices)).await.unwrap();
        assert_eq!(valuation.unrealized_pnl, 0.0);
    }

    #[tokio::test]
    async fn test_valuation_includes_realized_pnl() {
        let (ledger, agent_id) = setup().await;
        ledger
            .append_trade(NewTrade {
                agent_id,
                asset: "BTC".to_string(),
                signal: "close_position".to_string(),
                quantity: 1.0,
                price: 55_000.0,
                leverage: 10,
                side: "long".to_string(),
                pnl: 5_000.0,
            })
            .await
            .unwrap();
        let calculator = PortfolioCalculator::new(ledger);

        let valuation = calculator.valuation(agent_id, None).await.unwrap();
        assert_eq!(valuation.realized_pnl, 5_000.0);
        assert_eq!(valuation.cash, 105_000.0);
        assert_eq!(valuation.total_value, 105_000.0);
    }

    #[tokio::test]
    async fn test_valuation_short_position_marks_inverted() {
        let (ledger, agent_id) = setup().await;
        ledger
            .upsert_position(agent_id, "ETH", 10.0, 3_000.0, 5, "short")
            .await
            .unwrap();
        let calculator = PortfolioCalculator::new(ledger);

        let prices = HashMap::from([("ETH".to_string(), 2_800.0)]);
        let valuation = calculator.valuation(agent_id, Some(&prices)).await.unwrap();

        // 10 * 3000 / 5 margin, (3000 - 2800) * 10 profit
        assert_eq!(valuation.margin_used, 6_000.0);
        assert_eq!(valuation.unrealized_pnl, 2_000.0);
        assert_eq!(valuation.total_value, 102_000.0);
    }
}
