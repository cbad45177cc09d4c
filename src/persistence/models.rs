//! Database Models
//!
//! Persistent data structures for agents, positions, trades, oracle
//! conversations, and account-value snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Agent record in database
///
/// `initial_capital` is immutable after creation; every valuation is derived
/// from it plus the agent's trade log and open positions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentRecord {
    pub id: i64,
    pub name: String,
    /// Decision-oracle credential, never serialized out through the API.
    #[serde(skip_serializing)]
    pub api_key: String,
    pub api_url: String,
    pub model_name: String,
    pub initial_capital: f64,
    pub created_at: DateTime<Utc>,
}

/// Create agent input
#[derive(Debug, Clone)]
pub struct CreateAgent {
    pub name: String,
    pub api_key: String,
    pub api_url: String,
    pub model_name: String,
    pub initial_capital: f64,
}

/// Open position record in database
///
/// At most one row exists per (agent_id, asset, side); re-entering an already
/// open side replaces quantity/avg_price/leverage rather than averaging them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub id: i64,
    pub agent_id: i64,
    pub asset: String,
    pub quantity: f64,
    pub avg_price: f64,
    pub leverage: i64,
    pub side: String, // "long" or "short"
    pub updated_at: DateTime<Utc>,
}

/// Trade record in database (append-only)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRecord {
    pub id: i64,
    pub agent_id: i64,
    pub asset: String,
    pub signal: String,
    pub quantity: f64,
    pub price: f64,
    pub leverage: i64,
    pub side: String,
    /// Realized P&L booked by this trade; 0 for entries.
    pub pnl: f64,
    pub executed_at: DateTime<Utc>,
}

/// Append trade input
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub agent_id: i64,
    pub asset: String,
    pub signal: String,
    pub quantity: f64,
    pub price: f64,
    pub leverage: i64,
    pub side: String,
    pub pnl: f64,
}

/// Oracle conversation record in database (append-only audit trail)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConversationRecord {
    pub id: i64,
    pub agent_id: i64,
    pub prompt_summary: String,
    pub response_json: String,
    pub created_at: DateTime<Utc>,
}

/// Account-value snapshot record in database (append-only time series)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccountSnapshotRecord {
    pub id: i64,
    pub agent_id: i64,
    pub total_value: f64,
    pub cash: f64,
    pub positions_value: f64,
    pub recorded_at: DateTime<Utc>,
}
