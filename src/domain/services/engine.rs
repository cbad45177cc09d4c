//! Trading Engine
//!
//! Runs one full trading cycle for a single agent: gather market state,
//! value the account, obtain a decision from the oracle, execute the
//! decisions against the pre-decision valuation, revalue, and record an
//! account snapshot.
//!
//! Nothing escapes `run_cycle` as an error: every failure is converted into
//! a `CycleResult { success: false, .. }` at the engine boundary. Trades
//! committed before a later step fails are not rolled back; the trade log is
//! the source of truth and the snapshot series may lag it by one failed
//! cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::domain::entities::agent::AgentMeta;
use crate::domain::entities::decision::parse_decisions;
use crate::domain::errors::EngineError;
use crate::domain::oracles::{AssetQuote, DecisionOracle, MarketDataProvider, MarketSnapshot};
use crate::domain::services::executor::{DecisionExecutor, ExecutionOutcome};
use crate::domain::services::portfolio::{PortfolioCalculator, Valuation};
use crate::persistence::repository::LedgerRepository;

/// Result of one trading cycle.
#[derive(Debug, Serialize)]
pub struct CycleResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decisions: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executions: Option<Vec<ExecutionOutcome>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portfolio: Option<Valuation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CycleResult {
    fn failure(error: String) -> Self {
        CycleResult {
            success: false,
            decisions: None,
            executions: None,
            portfolio: None,
            error: Some(error),
        }
    }
}

/// Executes trading cycles for a specific agent.
impl std::fmt::Debug for TradingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingEngine")
            .field("agent_id", &self.agent_id)
            .field("assets", &self.assets)
            .field("oracle_timeout", &self.oracle_timeout)
            .finish_non_exhaustive()
    }
}

pub struct TradingEngine {
    agent_id: i64,
    ledger: LedgerRepository,
    portfolio: PortfolioCalculator,
    executor: DecisionExecutor,
    market: Arc<dyn MarketDataProvider>,
    oracle: Arc<dyn DecisionOracle>,
    assets: Vec<String>,
    oracle_timeout: Duration,
    /// Serializes cycles for this agent: the background pass and an ad hoc
    /// trigger must never mutate the same ledger concurrently. Shared across
    /// engine rebuilds, so a replacement engine cannot run alongside its
    /// predecessor either.
    cycle_lock: Arc<tokio::sync::Mutex<()>>,
}

impl TradingEngine {
    pub fn new(
        agent_id: i64,
        ledger: LedgerRepository,
        market: Arc<dyn MarketDataProvider>,
        oracle: Arc<dyn DecisionOracle>,
        assets: Vec<String>,
        oracle_timeout: Duration,
        cycle_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        let portfolio = PortfolioCalculator::new(ledger.clone());
        let executor = DecisionExecutor::new(ledger.clone(), agent_id, assets.clone());
        Self {
            agent_id,
            ledger,
            portfolio,
            executor,
            market,
            oracle,
            assets,
            oracle_timeout,
            cycle_lock,
        }
    }

    pub fn agent_id(&self) -> i64 {
        self.agent_id
    }

    /// Run one full cycle to completion or internal failure.
    pub async fn run_cycle(&self) -> CycleResult {
        let _guard = self.cycle_lock.lock().await;

        match self.cycle().await {
            Ok(result) => result,
            Err(err) => {
                error!("Trading cycle failed for agent {}: {}", self.agent_id, err);
                CycleResult::failure(err.to_string())
            }
        }
    }

    async fn cycle(&self) -> Result<CycleResult, EngineError> {
        debug!("Starting trading cycle for agent {}", self.agent_id);

        let market_state = self.gather_market().await?;
        let current_prices: HashMap<String, f64> = market_state
            .iter()
            .map(|(asset, quote)| (asset.clone(), quote.price))
            .collect();

        let valuation = self
            .portfolio
            .valuation(self.agent_id, Some(&current_prices))
            .await?;
        let meta = self.account_meta(&valuation).await?;

        let raw_decisions = tokio::time::timeout(
            self.oracle_timeout,
            self.oracle.decide(&market_state, &valuation, &meta),
        )
        .await
        .map_err(|_| EngineError::Oracle("decision oracle timed out".to_string()))??;

        self.ledger
            .append_conversation(
                self.agent_id,
                &self.prompt_summary(&market_state, &valuation, &meta),
                &raw_decisions.to_string(),
            )
            .await?;

        let decisions = parse_decisions(&raw_decisions);
        info!(
            "Agent {}: executing {} decision(s)",
            self.agent_id,
            decisions.len()
        );

        // Executed against the pre-decision valuation snapshot, on purpose
        let executions = self
            .executor
            .execute(&decisions, &market_state, &valuation)
            .await;

        let updated = self
            .portfolio
            .valuation(self.agent_id, Some(&current_prices))
            .await?;
        self.ledger
            .append_account_snapshot(
                self.agent_id,
                updated.total_value,
                updated.cash,
                updated.positions_value,
            )
            .await?;

        Ok(CycleResult {
            success: true,
            decisions: Some(raw_decisions),
            executions: Some(executions),
            portfolio: Some(updated),
            error: None,
        })
    }

    /// Fetch prices for the tracked assets and attach indicators where
    /// available. Assets without a quote are left out of the snapshot.
    async fn gather_market(&self) -> Result<MarketSnapshot, EngineError> {
        let prices = self.market.current_prices(&self.assets).await?;

        let mut snapshot = MarketSnapshot::new();
        for asset in &self.assets {
            let Some(tick) = prices.get(asset) else {
                continue;
            };
            let indicators = self.market.indicators(asset).await;
            snapshot.insert(
                asset.clone(),
                AssetQuote {
                    price: tick.price,
                    change_24h: tick.change_24h,
                    indicators: (!indicators.is_empty()).then_some(indicators),
                },
            );
        }
        Ok(snapshot)
    }

    async fn account_meta(&self, valuation: &Valuation) -> Result<AgentMeta, EngineError> {
        let agent = self
            .ledger
            .get_agent(self.agent_id)
            .await?
            .ok_or(EngineError::AgentNotFound(self.agent_id))?;
        Ok(AgentMeta::new(&agent, valuation.total_value))
    }

    fn prompt_summary(
        &self,
        market: &MarketSnapshot,
        valuation: &Valuation,
        meta: &AgentMeta,
    ) -> String {
        format!(
            "Market State: {} assets, Portfolio: {} positions, Return: {:.2}%",
            market.len(),
            valuation.positions.len(),
            meta.total_return
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::oracles::PriceTick;
    use crate::persistence::init_database;
    use crate::persistence::models::CreateAgent;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct FixedMarket {
        prices: HashMap<String, PriceTick>,
    }

    impl FixedMarket {
        fn new(entries: &[(&str, f64)]) -> Self {
            Self {
                prices: entries
                    .iter()
                    .map(|(asset, price)| {
                        (
                            asset.to_string(),
                            PriceTick {
                                price: *price,
                                change_24h: 1.5,
                            },
                        )
                    })
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl MarketDataProvider for FixedMarket {
        async fn current_prices(
            &self,
            assets: &[String],
        ) -> Result<HashMap<String, PriceTick>, EngineError> {
            Ok(self
                .prices
                .iter()
                .filter(|(asset, _)| assets.contains(asset))
                .map(|(asset, tick)| (asset.clone(), *tick))
                .collect())
        }

        async fn indicators(&self, _asset: &str) -> HashMap<String, f64> {
            HashMap::new()
        }
    }

    struct FailingMarket;

    #[async_trait]
    impl MarketDataProvider for FailingMarket {
        async fn current_prices(
            &self,
            _assets: &[String],
        ) -> Result<HashMap<String, PriceTick>, EngineError> {
            Err(EngineError::MarketUnavailable("all sources down".to_string()))
        }

        async fn indicators(&self, _asset: &str) -> HashMap<String, f64> {
            HashMap::new()
        }
    }

    struct ScriptedOracle {
        responses: Mutex<Vec<serde_json::Value>>,
    }

    impl ScriptedOracle {
        fn new(responses: Vec<serde_json::Value>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl DecisionOracle for ScriptedOracle {
        async fn decide(
            &self,
            _market: &MarketSnapshot,
            _valuation: &Valuation,
            _meta: &AgentMeta,
        ) -> Result<serde_json::Value, EngineError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(json!({}))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    struct FailingOracle;

    #[async_trait]
    impl DecisionOracle for FailingOracle {
        async fn decide(
            &self,
            _market: &MarketSnapshot,
            _valuation: &Valuation,
            _meta: &AgentMeta,
        ) -> Result<serde_json::Value, EngineError> {
            Err(EngineError::Oracle("connection refused".to_string()))
        }
    }

    async fn ledger_with_agent(capital: f64) -> (LedgerRepository, i64) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let ledger = LedgerRepository::new(pool);
        let agent = ledger
            .create_agent(CreateAgent {
                name: "alpha".to_string(),
                api_key: "sk-test".to_string(),
                api_url: "https://api.example.com".to_string(),
                model_name: "test-model".to_string(),
                initial_capital: capital,
            })
            .await
            .unwrap();
        (ledger, agent.id)
    }

    fn engine(
        ledger: &LedgerRepository,
        agent_id: i64,
        market: Arc<dyn MarketDataProvider>,
        oracle: Arc<dyn DecisionOracle>,
    ) -> TradingEngine {
        TradingEngine::new(
            agent_id,
            ledger.clone(),
            market,
            oracle,
            vec!["BTC".to_string(), "ETH".to_string()],
            Duration::from_secs(5),
            Arc::new(tokio::sync::Mutex::new(())),
        )
    }

    #[tokio::test]
    async fn test_cycle_executes_and_snapshots() {
        let (ledger, agent_id) = ledger_with_agent(100_000.0).await;
        let oracle = Arc::new(ScriptedOracle::new(vec![json!({
            "BTC": {"signal": "buy_to_enter", "quantity": 1.0, "leverage": 10}
        })]));
        let market = Arc::new(FixedMarket::new(&[("BTC", 50_000.0)]));
        let engine = engine(&ledger, agent_id, market, oracle);

        let result = engine.run_cycle().await;
        assert!(result.success, "cycle failed: {:?}", result.error);

        let portfolio = result.portfolio.unwrap();
        assert_eq!(portfolio.cash, 95_000.0);
        assert_eq!(portfolio.total_value, 100_000.0);

        let snapshots = ledger.list_account_snapshots(agent_id, 10).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].total_value, 100_000.0);
        assert_eq!(snapshots[0].cash, 95_000.0);

        let conversations = ledger.list_conversations(agent_id, 10).await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert!(conversations[0].response_json.contains("buy_to_enter"));
    }

    #[tokio::test]
    async fn test_oracle_failure_becomes_failure_result() {
        let (ledger, agent_id) = ledger_with_agent(100_000.0).await;
        let market = Arc::new(FixedMarket::new(&[("BTC", 50_000.0)]));
        let engine = engine(&ledger, agent_id, market, Arc::new(FailingOracle));

        let result = engine.run_cycle().await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("connection refused"));

        // Cycle aborted before execution: no snapshot, no conversation
        assert!(ledger
            .list_account_snapshots(agent_id, 10)
            .await
            .unwrap()
            .is_empty());
        assert!(ledger.list_conversations(agent_id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_market_failure_becomes_failure_result() {
        let (ledger, agent_id) = ledger_with_agent(100_000.0).await;
        let oracle = Arc::new(ScriptedOracle::new(vec![]));
        let engine = engine(&ledger, agent_id, Arc::new(FailingMarket), oracle);

        let result = engine.run_cycle().await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Market data unavailable"));
    }

    #[tokio::test]
    async fn test_empty_decisions_still_snapshot() {
        let (ledger, agent_id) = ledger_with_agent(100_000.0).await;
        let oracle = Arc::new(ScriptedOracle::new(vec![json!({})]));
        let market = Arc::new(FixedMarket::new(&[("BTC", 50_000.0)]));
        let engine = engine(&ledger, agent_id, market, oracle);

        let result = engine.run_cycle().await;
        assert!(result.success);
        assert!(result.executions.unwrap().is_empty());

        let snapshots = ledger.list_account_snapshots(agent_id, 10).await.unwrap();
        assert_eq!(snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_for_missing_agent_fails() {
        let (ledger, _) = ledger_with_agent(100_000.0).await;
        let oracle = Arc::new(ScriptedOracle::new(vec![]));
        let market = Arc::new(FixedMarket::new(&[("BTC", 50_000.0)]));
        let engine = engine(&ledger, 9_999, market, oracle);

        let result = engine.run_cycle().await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
    }
}
