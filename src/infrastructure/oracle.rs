//! LLM-backed trading decision oracle.
//!
//! Talks to an OpenAI-compatible chat-completions endpoint using the
//! credentials stored on each agent. The response is expected to be a JSON
//! object keyed by asset; a malformed or empty response degrades to "no
//! decisions this cycle" rather than failing the cycle.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::domain::entities::agent::AgentMeta;
use crate::domain::errors::EngineError;
use crate::domain::oracles::{DecisionOracle, MarketSnapshot, OracleFactory};
use crate::domain::services::portfolio::Valuation;
use crate::persistence::models::AgentRecord;

const SYSTEM_PROMPT: &str =
    "You are a professional cryptocurrency trader. Output JSON format only.";
const TEMPERATURE: f64 = 0.7;
const MAX_TOKENS: u32 = 2000;

/// Decision oracle backed by a chat-completions API.
pub struct LlmOracle {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmOracle {
    pub fn new(http: reqwest::Client, api_key: &str, api_url: &str, model: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            base_url: normalize_base_url(api_url),
            model: model.to_string(),
        }
    }

    fn build_prompt(market: &MarketSnapshot, valuation: &Valuation, meta: &AgentMeta) -> String {
        let mut prompt = String::from(
            "You are a professional cryptocurrency trader. Analyze the market and make trading decisions.\n\n",
        );

        prompt.push_str("MARKET DATA:\n");
        let mut assets: Vec<&String> = market.keys().collect();
        assets.sort();
        for asset in assets {
            let quote = &market[asset];
            prompt.push_str(&format!(
                "{}: ${:.2} ({:+.2}%)\n",
                asset, quote.price, quote.change_24h
            ));
            if let Some(indicators) = &quote.indicators {
                prompt.push_str(&format!(
                    "  SMA7: ${:.2}, SMA14: ${:.2}, RSI: {:.1}\n",
                    indicators.get("sma_7").copied().unwrap_or(0.0),
                    indicators.get("sma_14").copied().unwrap_or(0.0),
                    indicators.get("rsi_14").copied().unwrap_or(0.0),
                ));
            }
        }

        prompt.push_str("\nACCOUNT STATUS:\n");
        prompt.push_str(&format!("- Initial Capital: ${:.2}\n", meta.initial_capital));
        prompt.push_str(&format!("- Total Value: ${:.2}\n", valuation.total_value));
        prompt.push_str(&format!("- Cash: ${:.2}\n", valuation.cash));
        prompt.push_str(&format!("- Total Return: {:.2}%\n\n", meta.total_return));

        prompt.push_str("CURRENT POSITIONS:\n");
        if valuation.positions.is_empty() {
            prompt.push_str("None\n");
        } else {
            for position in &valuation.positions {
                prompt.push_str(&format!(
                    "- {} {}: {:.4} @ ${:.2} ({}x)\n",
                    position.asset,
                    position.side,
                    position.quantity,
                    position.avg_price,
                    position.leverage
                ));
            }
        }

        prompt.push_str("\nTRADING RULES:\n");
        prompt.push_str(
            "1. Signals: buy_to_enter (long), sell_to_enter (short), close_position, hold\n",
        );
        prompt.push_str(
            "2. Risk Management:\n   - Max 3 positions\n   - Risk 1-5% per trade\n   - Use appropriate leverage (1-20x)\n",
        );
        prompt.push_str(
            "3. Position Sizing:\n   - Conservative: 1-2% risk\n   - Moderate: 2-4% risk\n   - Aggressive: 4-5% risk\n",
        );
        prompt.push_str(
            "4. Exit Strategy:\n   - Close losing positions quickly\n   - Let winners run\n   - Use technical indicators\n\n",
        );

        prompt.push_str(
            "OUTPUT FORMAT (JSON only):\n```json\n{\n  \"COIN\": {\n    \"signal\": \"buy_to_enter|sell_to_enter|hold|close_position\",\n    \"quantity\": 0.5,\n    \"leverage\": 10,\n    \"profit_target\": 45000.0,\n    \"stop_loss\": 42000.0,\n    \"confidence\": 0.75,\n    \"justification\": \"Brief reason\"\n  }\n}\n```\n\nAnalyze and output JSON only.",
        );

        prompt
    }

    async fn call_llm(&self, prompt: &str) -> Result<String, EngineError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "temperature": TEMPERATURE,
            "max_tokens": MAX_TOKENS,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Oracle(format!("API connection failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::Oracle(format!(
                "API error ({}): {}",
                status, detail
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Oracle(format!("API response malformed: {}", e)))?;

        Ok(payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl DecisionOracle for LlmOracle {
    async fn decide(
        &self,
        market: &MarketSnapshot,
        valuation: &Valuation,
        meta: &AgentMeta,
    ) -> Result<Value, EngineError> {
        let prompt = Self::build_prompt(market, valuation, meta);
        debug!("Requesting decisions from {} ({})", self.base_url, self.model);
        let content = self.call_llm(&prompt).await?;
        Ok(extract_json(&content))
    }
}

/// Normalize a user-supplied endpoint so the path always ends in `/v1`.
fn normalize_base_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        base.to_string()
    } else if let Some(prefix) = base.split_once("/v1").map(|(prefix, _)| prefix) {
        format!("{}/v1", prefix)
    } else {
        format!("{}/v1", base)
    }
}

/// Pull the decision object out of a model response, stripping Markdown code
/// fences. Anything unparseable becomes an empty object.
fn extract_json(content: &str) -> Value {
    let mut text = content.trim();

    if let Some(start) = text.find("```json") {
        text = &text[start + 7..];
        if let Some(end) = text.find("```") {
            text = &text[..end];
        }
    } else if let Some(start) = text.find("```") {
        text = &text[start + 3..];
        if let Some(end) = text.find("```") {
            text = &text[..end];
        }
    }

    match serde_json::from_str(text.trim()) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to parse oracle response as JSON: {}", e);
            json!({})
        }
    }
}

/// Builds an `LlmOracle` per agent, sharing one HTTP client.
pub struct LlmOracleFactory {
    http: reqwest::Client,
}

impl LlmOracleFactory {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for LlmOracleFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl OracleFactory for LlmOracleFactory {
    fn build(&self, agent: &AgentRecord) -> Arc<dyn DecisionOracle> {
        Arc::new(LlmOracle::new(
            self.http.clone(),
            &agent.api_key,
            &agent.api_url,
            &agent.model_name,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::oracles::AssetQuote;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://api.example.com"),
            "https://api.example.com/v1"
        );
        assert_eq!(
            normalize_base_url("https://api.example.com/"),
            "https://api.example.com/v1"
        );
        assert_eq!(
            normalize_base_url("https://api.example.com/v1"),
            "https://api.example.com/v1"
        );
        assert_eq!(
            normalize_base_url("https://api.example.com/v1/chat/completions"),
            "https://api.example.com/v1"
        );
    }

    #[test]
    fn test_extract_json_plain() {
        let value = extract_json(r#"{"BTC": {"signal": "hold"}}"#);
        assert_eq!(value["BTC"]["signal"], "hold");
    }

    #[test]
    fn test_extract_json_fenced() {
        let content = "Here are my decisions:\n```json\n{\"BTC\": {\"signal\": \"hold\"}}\n```";
        let value = extract_json(content);
        assert_eq!(value["BTC"]["signal"], "hold");

        let content = "```\n{\"ETH\": {\"signal\": \"buy_to_enter\"}}\n```";
        let value = extract_json(content);
        assert_eq!(value["ETH"]["signal"], "buy_to_enter");
    }

    #[test]
    fn test_extract_json_malformed_is_empty_object() {
        assert_eq!(extract_json("I refuse to answer."), json!({}));
        assert_eq!(extract_json(""), json!({}));
    }

    #[test]
    fn test_build_prompt_sections() {
        let market = MarketSnapshot::from([(
            "BTC".to_string(),
            AssetQuote {
                price: 50_000.0,
                change_24h: 2.5,
                indicators: Some(HashMap::from([
                    ("sma_7".to_string(), 49_000.0),
                    ("sma_14".to_string(), 48_000.0),
                    ("rsi_14".to_string(), 61.0),
                ])),
            },
        )]);
        let valuation = Valuation {
            agent_id: 1,
            cash: 95_000.0,
            positions: vec![],
            positions_value: 0.0,
            margin_used: 0.0,
            total_value: 100_000.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        };
        let meta = AgentMeta {
            current_time: "2026-01-01 00:00:00".to_string(),
            initial_capital: 100_000.0,
            total_return: 0.0,
        };

        let prompt = LlmOracle::build_prompt(&market, &valuation, &meta);
        assert!(prompt.contains("MARKET DATA:"));
        assert!(prompt.contains("BTC: $50000.00 (+2.50%)"));
        assert!(prompt.contains("RSI: 61.0"));
        assert!(prompt.contains("ACCOUNT STATUS:"));
        assert!(prompt.contains("- Cash: $95000.00"));
        assert!(prompt.contains("CURRENT POSITIONS:\nNone"));
        assert!(prompt.contains("OUTPUT FORMAT (JSON only):"));
    }
}
