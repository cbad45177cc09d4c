//! Application configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Runtime configuration for the trading server.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Assets every engine tracks and trades.
    pub tracked_assets: Vec<String>,
    /// Pause between automated scheduling passes.
    pub loop_interval: Duration,
    /// Pause when no engines are registered.
    pub idle_interval: Duration,
    /// Upper bound on a single decision-oracle call.
    pub oracle_timeout: Duration,
    /// Default number of trades returned by the API.
    pub max_trades_returned: i64,
    /// Default number of conversations returned by the API.
    pub max_conversations_returned: i64,
    /// Default number of account-value entries returned by the API.
    pub account_history_limit: i64,
    pub bind_addr: SocketAddr,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            tracked_assets: ["BTC", "ETH", "SOL", "BNB", "XRP", "DOGE"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            loop_interval: Duration::from_secs(180),
            idle_interval: Duration::from_secs(30),
            oracle_timeout: Duration::from_secs(60),
            max_trades_returned: 50,
            max_conversations_returned: 20,
            account_history_limit: 100,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
        }
    }
}

impl ArenaConfig {
    /// Load configuration from environment variables, keeping defaults for
    /// anything unset or out of range.
    pub fn from_env() -> ArenaConfig {
        let mut config = ArenaConfig::default();

        if let Ok(assets) = std::env::var("TRACKED_ASSETS") {
            let parsed: Vec<String> = assets
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if parsed.is_empty() {
                tracing::warn!("TRACKED_ASSETS is empty, using defaults");
            } else {
                config.tracked_assets = parsed;
            }
        }

        if let Ok(interval) = std::env::var("LOOP_INTERVAL_SECS") {
            match interval.parse::<u64>() {
                Ok(value) if (10..=3600).contains(&value) => {
                    config.loop_interval = Duration::from_secs(value);
                }
                Ok(value) => {
                    tracing::warn!(
                        "Invalid LOOP_INTERVAL_SECS value: {} (must be between 10 and 3600), using default",
                        value
                    );
                }
                Err(e) => {
                    tracing::warn!("Failed to parse LOOP_INTERVAL_SECS '{}': {}", interval, e);
                }
            }
        }

        if let Ok(interval) = std::env::var("IDLE_INTERVAL_SECS") {
            if let Ok(value) = interval.parse::<u64>() {
                if (1..=3600).contains(&value) {
                    config.idle_interval = Duration::from_secs(value);
                }
            }
        }

        if let Ok(timeout) = std::env::var("ORACLE_TIMEOUT_SECS") {
            if let Ok(value) = timeout.parse::<u64>() {
                if (5..=600).contains(&value) {
                    config.oracle_timeout = Duration::from_secs(value);
                }
            }
        }

        if let Ok(limit) = std::env::var("MAX_TRADES_RETURNED") {
            if let Ok(value) = limit.parse::<i64>() {
                if value > 0 {
                    config.max_trades_returned = value;
                }
            }
        }

        if let Ok(limit) = std::env::var("MAX_CONVERSATIONS_RETURNED") {
            if let Ok(value) = limit.parse::<i64>() {
                if value > 0 {
                    config.max_conversations_returned = value;
                }
            }
        }

        if let Ok(limit) = std::env::var("ACCOUNT_HISTORY_LIMIT") {
            if let Ok(value) = limit.parse::<i64>() {
                if value > 0 {
                    config.account_history_limit = value;
                }
            }
        }

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(value) => config.bind_addr = value,
                Err(e) => tracing::warn!("Failed to parse BIND_ADDR '{}': {}", addr, e),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ArenaConfig::default();
        assert_eq!(config.tracked_assets.len(), 6);
        assert!(config.tracked_assets.contains(&"BTC".to_string()));
        assert_eq!(config.loop_interval, Duration::from_secs(180));
        assert_eq!(config.idle_interval, Duration::from_secs(30));
        assert_eq!(config.max_trades_returned, 50);
    }
}
