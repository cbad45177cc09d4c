//! Decision Executor
//!
//! Applies one cycle's decision map to the ledger. Every asset is handled
//! independently: a failed entry or close is reported in that asset's result
//! and never aborts the rest of the batch. Margin checks for entries are made
//! against the valuation snapshot captured at cycle start -- the snapshot is
//! an immutable input, deliberately not re-read between assets, so several
//! entries in one cycle may jointly overcommit cash even though each passes
//! individually.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::entities::decision::{Decision, Signal};
use crate::domain::entities::position::PositionSide;
use crate::domain::errors::EngineError;
use crate::domain::oracles::MarketSnapshot;
use crate::domain::services::portfolio::Valuation;
use crate::persistence::models::NewTrade;
use crate::persistence::repository::LedgerRepository;

/// Per-asset outcome of executing one decision.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub asset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leverage: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    fn error(asset: &str, err: &EngineError) -> Self {
        ExecutionOutcome {
            asset: asset.to_string(),
            signal: None,
            quantity: None,
            price: None,
            leverage: None,
            pnl: None,
            message: None,
            error: Some(err.to_string()),
        }
    }

    fn hold(asset: &str) -> Self {
        ExecutionOutcome {
            asset: asset.to_string(),
            signal: Some("hold".to_string()),
            quantity: None,
            price: None,
            leverage: None,
            pnl: None,
            message: Some("Hold position".to_string()),
            error: None,
        }
    }
}

/// Executes a decision map against one agent's ledger.
pub struct DecisionExecutor {
    ledger: LedgerRepository,
    agent_id: i64,
    tracked_assets: Vec<String>,
}

impl DecisionExecutor {
    pub fn new(ledger: LedgerRepository, agent_id: i64, tracked_assets: Vec<String>) -> Self {
        Self {
            ledger,
            agent_id,
            tracked_assets,
        }
    }

    /// Execute every decision for a tracked asset, in map-iteration order.
    /// Assets outside the tracked set are silently skipped.
    pub async fn execute(
        &self,
        decisions: &HashMap<String, Decision>,
        market: &MarketSnapshot,
        valuation: &Valuation,
    ) -> Vec<ExecutionOutcome> {
        let mut outcomes = Vec::new();

        for (asset, decision) in decisions {
            if !self.tracked_assets.iter().any(|a| a == asset) {
                debug!("Skipping decision for untracked asset {}", asset);
                continue;
            }

            let result = match decision.signal() {
                Signal::BuyToEnter => {
                    self.enter(asset, PositionSide::Long, decision, market, valuation)
                        .await
                }
                Signal::SellToEnter => {
                    self.enter(asset, PositionSide::Short, decision, market, valuation)
                        .await
                }
                Signal::ClosePosition => self.close(asset, market, valuation).await,
                Signal::Hold => Ok(ExecutionOutcome::hold(asset)),
                Signal::Unrecognized(raw) => Err(EngineError::UnknownSignal(raw)),
            };

            outcomes.push(result.unwrap_or_else(|err| {
                warn!(
                    "Decision for {} failed (agent {}): {}",
                    asset, self.agent_id, err
                );
                ExecutionOutcome::error(asset, &err)
            }));
        }

        outcomes
    }

    /// Open (or replace) a position on one side of an asset.
    async fn enter(
        &self,
        asset: &str,
        side: PositionSide,
        decision: &Decision,
        market: &MarketSnapshot,
        valuation: &Valuation,
    ) -> Result<ExecutionOutcome, EngineError> {
        let quantity = decision.quantity.unwrap_or(0.0);
        let leverage = decision.clamped_leverage();
        let price = market
            .get(asset)
            .map(|quote| quote.price)
            .ok_or_else(|| EngineError::PriceUnavailable(asset.to_string()))?;

        if quantity <= 0.0 {
            return Err(EngineError::InvalidQuantity(quantity));
        }

        let required_margin = quantity * price / leverage as f64;
        if required_margin > valuation.cash {
            return Err(EngineError::InsufficientCash {
                required: required_margin,
                available: valuation.cash,
            });
        }

        self.ledger
            .upsert_position(self.agent_id, asset, quantity, price, leverage, side.as_str())
            .await?;

        let signal = match side {
            PositionSide::Long => Signal::BuyToEnter,
            PositionSide::Short => Signal::SellToEnter,
        };
        self.ledger
            .append_trade(NewTrade {
                agent_id: self.agent_id,
                asset: asset.to_string(),
                signal: signal.as_str().to_string(),
                quantity,
                price,
                leverage,
                side: side.as_str().to_string(),
                pnl: 0.0,
            })
            .await?;

        let verb = match side {
            PositionSide::Long => "Long",
            PositionSide::Short => "Short",
        };
        Ok(ExecutionOutcome {
            asset: asset.to_string(),
            signal: Some(signal.as_str().to_string()),
            quantity: Some(quantity),
            price: Some(price),
            leverage: Some(leverage),
            pnl: None,
            message: Some(format!("{} {:.4} {} @ ${:.2}", verb, quantity, asset, price)),
            error: None,
        })
    }

    /// Close the open position on an asset, booking realized P&L.
    ///
    /// The side comes from the position found in the valuation snapshot, not
    /// from the decision.
    async fn close(
        &self,
        asset: &str,
        market: &MarketSnapshot,
        valuation: &Valuation,
    ) -> Result<ExecutionOutcome, EngineError> {
        let view = valuation
            .find_position(asset)
            .ok_or_else(|| EngineError::PositionNotFound(asset.to_string()))?;
        let position = view.position();

        let current_price = market
            .get(asset)
            .map(|quote| quote.price)
            .ok_or_else(|| EngineError::PriceUnavailable(asset.to_string()))?;

        let pnl = position.pnl_at(current_price);

        self.ledger
            .delete_position(self.agent_id, asset, position.side.as_str())
            .await?;
        self.ledger
            .append_trade(NewTrade {
                agent_id: self.agent_id,
                asset: asset.to_string(),
                signal: Signal::ClosePosition.as_str().to_string(),
                quantity: position.quantity,
                price: current_price,
                leverage: position.leverage,
                side: position.side.as_str().to_string(),
                pnl,
            })
            .await?;

        Ok(ExecutionOutcome {
            asset: asset.to_string(),
            signal: Some(Signal::ClosePosition.as_str().to_string()),
            quantity: Some(position.quantity),
            price: Some(current_price),
            leverage: Some(position.leverage),
            pnl: Some(pnl),
            message: Some(format!("Close {}, P&L: ${:.2}", asset, pnl)),
            error: None,
        })
    }
}
