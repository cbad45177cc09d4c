//! Ports to the external market-data and decision oracles.
//!
//! Both collaborators block on network I/O and are consumed behind traits so
//! engines can be driven by in-process fakes in tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::entities::agent::AgentMeta;
use crate::domain::errors::EngineError;
use crate::domain::services::portfolio::Valuation;
use crate::persistence::models::AgentRecord;

/// Latest traded price and 24h change for one asset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceTick {
    pub price: f64,
    pub change_24h: f64,
}

/// One asset's market state as presented to the decision oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetQuote {
    pub price: f64,
    pub change_24h: f64,
    /// Technical indicators by name; omitted entirely when unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indicators: Option<HashMap<String, f64>>,
}

/// Market state for all tracked assets with a known price.
pub type MarketSnapshot = HashMap<String, AssetQuote>;

/// Price + indicator source.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Current prices for the given assets. Assets without a quote are
    /// omitted from the result; a total failure of every source is an error.
    async fn current_prices(
        &self,
        assets: &[String],
    ) -> Result<HashMap<String, PriceTick>, EngineError>;

    /// Technical indicators for one asset; empty when history is unavailable.
    async fn indicators(&self, asset: &str) -> HashMap<String, f64>;
}

/// Produces a per-asset decision map from market and portfolio state.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    /// Returns the parsed decision object. A malformed or empty oracle
    /// response yields an empty object (no decisions this cycle), not an
    /// error; transport and API failures are errors.
    async fn decide(
        &self,
        market: &MarketSnapshot,
        valuation: &Valuation,
        meta: &AgentMeta,
    ) -> Result<serde_json::Value, EngineError>;
}

/// Builds a decision oracle from an agent's stored credentials.
pub trait OracleFactory: Send + Sync {
    fn build(&self, agent: &AgentRecord) -> Arc<dyn DecisionOracle>;
}
