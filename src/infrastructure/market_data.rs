//! Market data access layer built on top of public crypto APIs.
//!
//! Binance is the primary price source; on failure the fetcher degrades to
//! CoinGecko instead of aborting the cycle. Price lookups are cached for a
//! few seconds since every registered agent asks for the same tracked assets
//! in quick succession.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::errors::EngineError;
use crate::domain::oracles::{MarketDataProvider, PriceTick};

const BINANCE_BASE_URL: &str = "https://api.binance.com/api/v3";
const COINGECKO_BASE_URL: &str = "https://api.coingecko.com/api/v3";

const BINANCE_TIMEOUT: Duration = Duration::from_secs(5);
const COINGECKO_TIMEOUT: Duration = Duration::from_secs(10);
const CACHE_TTL: Duration = Duration::from_secs(5);

/// Days of history used for indicator computation.
const INDICATOR_WINDOW_DAYS: u32 = 14;

#[derive(Deserialize)]
struct BinanceTicker {
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: String,
    #[serde(rename = "priceChangePercent")]
    price_change_percent: String,
}

#[derive(Deserialize)]
struct CoinGeckoQuote {
    usd: f64,
    #[serde(default)]
    usd_24h_change: Option<f64>,
}

#[derive(Deserialize)]
struct CoinGeckoChart {
    #[serde(default)]
    prices: Vec<(f64, f64)>,
}

#[derive(Clone)]
struct CachedPrices {
    fetched_at: Instant,
    prices: HashMap<String, PriceTick>,
}

/// Fetch real-time prices and technical indicators for tracked assets.
pub struct MarketDataFetcher {
    http: reqwest::Client,
    cache: DashMap<String, CachedPrices>,
}

impl MarketDataFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            cache: DashMap::new(),
        }
    }

    fn binance_symbol(asset: &str) -> Option<&'static str> {
        match asset {
            "BTC" => Some("BTCUSDT"),
            "ETH" => Some("ETHUSDT"),
            "SOL" => Some("SOLUSDT"),
            "BNB" => Some("BNBUSDT"),
            "XRP" => Some("XRPUSDT"),
            "DOGE" => Some("DOGEUSDT"),
            _ => None,
        }
    }

    fn coingecko_id(asset: &str) -> String {
        match asset {
            "BTC" => "bitcoin".to_string(),
            "ETH" => "ethereum".to_string(),
            "SOL" => "solana".to_string(),
            "BNB" => "binancecoin".to_string(),
            "XRP" => "ripple".to_string(),
            "DOGE" => "dogecoin".to_string(),
            other => other.to_lowercase(),
        }
    }

    async fn fetch_from_binance(
        &self,
        assets: &[String],
    ) -> Result<HashMap<String, PriceTick>, EngineError> {
        let symbols: Vec<&str> = assets
            .iter()
            .filter_map(|asset| Self::binance_symbol(asset))
            .collect();
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let symbols_param = format!(
            "[{}]",
            symbols
                .iter()
                .map(|s| format!("\"{}\"", s))
                .collect::<Vec<_>>()
                .join(",")
        );

        let tickers: Vec<BinanceTicker> = self
            .http
            .get(format!("{}/ticker/24hr", BINANCE_BASE_URL))
            .query(&[("symbols", symbols_param)])
            .timeout(BINANCE_TIMEOUT)
            .send()
            .await
            .map_err(|e| EngineError::MarketUnavailable(format!("Binance request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| EngineError::MarketUnavailable(format!("Binance API error: {}", e)))?
            .json()
            .await
            .map_err(|e| {
                EngineError::MarketUnavailable(format!("Binance response malformed: {}", e))
            })?;

        let mut prices = HashMap::new();
        for ticker in tickers {
            let Some(asset) = assets
                .iter()
                .find(|asset| Self::binance_symbol(asset) == Some(ticker.symbol.as_str()))
            else {
                continue;
            };
            let (Ok(price), Ok(change_24h)) = (
                ticker.last_price.parse::<f64>(),
                ticker.price_change_percent.parse::<f64>(),
            ) else {
                continue;
            };
            prices.insert(asset.clone(), PriceTick { price, change_24h });
        }

        Ok(prices)
    }

    async fn fetch_from_coingecko(
        &self,
        assets: &[String],
    ) -> Result<HashMap<String, PriceTick>, EngineError> {
        let ids = assets
            .iter()
            .map(|asset| Self::coingecko_id(asset))
            .collect::<Vec<_>>()
            .join(",");

        let quotes: HashMap<String, CoinGeckoQuote> = self
            .http
            .get(format!("{}/simple/price", COINGECKO_BASE_URL))
            .query(&[
                ("ids", ids.as_str()),
                ("vs_currencies", "usd"),
                ("include_24hr_change", "true"),
            ])
            .timeout(COINGECKO_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                EngineError::MarketUnavailable(format!("CoinGecko request failed: {}", e))
            })?
            .error_for_status()
            .map_err(|e| EngineError::MarketUnavailable(format!("CoinGecko API error: {}", e)))?
            .json()
            .await
            .map_err(|e| {
                EngineError::MarketUnavailable(format!("CoinGecko response malformed: {}", e))
            })?;

        let mut prices = HashMap::new();
        for asset in assets {
            if let Some(quote) = quotes.get(&Self::coingecko_id(asset)) {
                prices.insert(
                    asset.clone(),
                    PriceTick {
                        price: quote.usd,
                        change_24h: quote.usd_24h_change.unwrap_or(0.0),
                    },
                );
            }
        }

        Ok(prices)
    }

    async fn historical_prices(&self, asset: &str) -> Result<Vec<f64>, EngineError> {
        let days = INDICATOR_WINDOW_DAYS.to_string();
        let chart: CoinGeckoChart = self
            .http
            .get(format!(
                "{}/coins/{}/market_chart",
                COINGECKO_BASE_URL,
                Self::coingecko_id(asset)
            ))
            .query(&[("vs_currency", "usd"), ("days", days.as_str())])
            .timeout(COINGECKO_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                EngineError::MarketUnavailable(format!("CoinGecko request failed: {}", e))
            })?
            .error_for_status()
            .map_err(|e| EngineError::MarketUnavailable(format!("CoinGecko API error: {}", e)))?
            .json()
            .await
            .map_err(|e| {
                EngineError::MarketUnavailable(format!("CoinGecko response malformed: {}", e))
            })?;

        Ok(chart.prices.into_iter().map(|(_, price)| price).collect())
    }
}

impl Default for MarketDataFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for MarketDataFetcher {
    async fn current_prices(
        &self,
        assets: &[String],
    ) -> Result<HashMap<String, PriceTick>, EngineError> {
        let mut sorted = assets.to_vec();
        sorted.sort();
        let cache_key = format!("prices_{}", sorted.join("_"));

        if let Some(cached) = self.cache.get(&cache_key) {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return Ok(cached.prices.clone());
            }
        }

        match self.fetch_from_binance(assets).await {
            Ok(prices) => {
                self.cache.insert(
                    cache_key,
                    CachedPrices {
                        fetched_at: Instant::now(),
                        prices: prices.clone(),
                    },
                );
                Ok(prices)
            }
            Err(e) => {
                warn!("Binance API failed, falling back to CoinGecko: {}", e);
                self.fetch_from_coingecko(assets).await
            }
        }
    }

    async fn indicators(&self, asset: &str) -> HashMap<String, f64> {
        match self.historical_prices(asset).await {
            Ok(prices) => compute_indicators(&prices),
            Err(e) => {
                debug!("No indicator history for {}: {}", asset, e);
                HashMap::new()
            }
        }
    }
}

/// Compute SMA-7, SMA-14, RSI-14, and the 7-day change from a daily price
/// series. Returns an empty map when there is not enough history.
pub fn compute_indicators(prices: &[f64]) -> HashMap<String, f64> {
    if prices.len() < INDICATOR_WINDOW_DAYS as usize {
        return HashMap::new();
    }

    let sma_7 = prices[prices.len() - 7..].iter().sum::<f64>() / 7.0;
    let sma_14 = prices[prices.len() - 14..].iter().sum::<f64>() / 14.0;

    let changes: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
    let gains: Vec<f64> = changes.iter().map(|c| c.max(0.0)).collect();
    let losses: Vec<f64> = changes.iter().map(|c| (-c).max(0.0)).collect();

    let avg_gain = gains[gains.len().saturating_sub(14)..].iter().sum::<f64>() / 14.0;
    let avg_loss = losses[losses.len().saturating_sub(14)..].iter().sum::<f64>() / 14.0;

    let rsi = if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };

    let first = prices[0];
    let last = prices[prices.len() - 1];
    let price_change_7d = if first > 0.0 {
        (last - first) / first * 100.0
    } else {
        0.0
    };

    HashMap::from([
        ("sma_7".to_string(), sma_7),
        ("sma_14".to_string(), sma_14),
        ("rsi_14".to_string(), rsi),
        ("current_price".to_string(), last),
        ("price_change_7d".to_string(), price_change_7d),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_indicators_requires_history() {
        assert!(compute_indicators(&[]).is_empty());
        assert!(compute_indicators(&[100.0; 13]).is_empty());
    }

    #[test]
    fn test_compute_indicators_flat_series() {
        let indicators = compute_indicators(&[100.0; 14]);
        assert_eq!(indicators["sma_7"], 100.0);
        assert_eq!(indicators["sma_14"], 100.0);
        // No losses at all reads as maximally overbought
        assert_eq!(indicators["rsi_14"], 100.0);
        assert_eq!(indicators["price_change_7d"], 0.0);
        assert_eq!(indicators["current_price"], 100.0);
    }

    #[test]
    fn test_compute_indicators_rising_series() {
        let prices: Vec<f64> = (1..=14).map(|i| i as f64 * 10.0).collect();
        let indicators = compute_indicators(&prices);

        assert_eq!(indicators["sma_7"], 110.0); // mean of 80..140
        assert_eq!(indicators["sma_14"], 75.0); // mean of 10..140
        assert_eq!(indicators["rsi_14"], 100.0);
        assert_eq!(indicators["current_price"], 140.0);
        assert_eq!(indicators["price_change_7d"], 1_300.0);
    }

    #[test]
    fn test_compute_indicators_falling_series_rsi_zero() {
        let prices: Vec<f64> = (1..=14).rev().map(|i| i as f64 * 10.0).collect();
        let indicators = compute_indicators(&prices);
        assert_eq!(indicators["rsi_14"], 0.0);
    }

    #[test]
    fn test_binance_symbol_mapping() {
        assert_eq!(MarketDataFetcher::binance_symbol("BTC"), Some("BTCUSDT"));
        assert_eq!(MarketDataFetcher::binance_symbol("SHIB"), None);
    }

    #[test]
    fn test_coingecko_id_mapping() {
        assert_eq!(MarketDataFetcher::coingecko_id("BTC"), "bitcoin");
        assert_eq!(MarketDataFetcher::coingecko_id("XRP"), "ripple");
        assert_eq!(MarketDataFetcher::coingecko_id("SHIB"), "shib");
    }
}
