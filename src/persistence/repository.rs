//! Ledger Repository
//!
//! Data access layer for the per-agent trading ledger. All keys are
//! agent-scoped, so two engines working on different agents never touch the
//! same rows.

use super::models::*;
use super::{DatabaseError, DbPool};
use chrono::Utc;
use tracing::{debug, error};

/// Repository over the agent ledger (agents, positions, trades,
/// conversations, account snapshots).
#[derive(Clone)]
pub struct LedgerRepository {
    pool: DbPool,
}

impl LedgerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Create a new agent
    pub async fn create_agent(&self, agent: CreateAgent) -> Result<AgentRecord, DatabaseError> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, AgentRecord>(
            r#"
            INSERT INTO agents (name, api_key, api_url, model_name, initial_capital, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING *
            "#,
        )
        .bind(&agent.name)
        .bind(&agent.api_key)
        .bind(&agent.api_url)
        .bind(&agent.model_name)
        .bind(agent.initial_capital)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create agent: {}", e);
            DatabaseError::QueryError(format!("Failed to create agent: {}", e))
        })?;

        debug!("Created agent {} ({})", record.id, record.name);
        Ok(record)
    }

    /// Get agent by ID
    pub async fn get_agent(&self, id: i64) -> Result<Option<AgentRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, AgentRecord>("SELECT * FROM agents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get agent {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get agent: {}", e))
            })?;

        Ok(record)
    }

    /// Get all agents, newest first
    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>, DatabaseError> {
        let records =
            sqlx::query_as::<_, AgentRecord>("SELECT * FROM agents ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to list agents: {}", e);
                    DatabaseError::QueryError(format!("Failed to list agents: {}", e))
                })?;

        Ok(records)
    }

    /// Delete an agent and all dependent ledger rows
    ///
    /// Returns whether an agent row existed.
    pub async fn delete_agent(&self, id: i64) -> Result<bool, DatabaseError> {
        let deleted = sqlx::query("DELETE FROM agents WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete agent {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to delete agent: {}", e))
            })?
            .rows_affected();

        for table in [
            "positions",
            "trades",
            "conversations",
            "account_snapshots",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE agent_id = ?1", table))
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to cascade delete {} for agent {}: {}", table, id, e);
                    DatabaseError::QueryError(format!("Failed to delete {}: {}", table, e))
                })?;
        }

        debug!("Deleted agent {} (existed: {})", id, deleted > 0);
        Ok(deleted > 0)
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    /// Upsert the open position for (agent, asset, side)
    ///
    /// An existing row is overwritten: quantity, avg_price, and leverage are
    /// replaced, not averaged with the prior entry.
    pub async fn upsert_position(
        &self,
        agent_id: i64,
        asset: &str,
        quantity: f64,
        avg_price: f64,
        leverage: i64,
        side: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO positions (agent_id, asset, quantity, avg_price, leverage, side, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(agent_id, asset, side) DO UPDATE SET
                quantity = excluded.quantity,
                avg_price = excluded.avg_price,
                leverage = excluded.leverage,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(agent_id)
        .bind(asset)
        .bind(quantity)
        .bind(avg_price)
        .bind(leverage)
        .bind(side)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to upsert position for agent {}: {}", agent_id, e);
            DatabaseError::QueryError(format!("Failed to upsert position: {}", e))
        })?;

        debug!(
            "Upserted position: agent {} {} {} x{}",
            agent_id, side, asset, quantity
        );
        Ok(())
    }

    /// Get all open positions for an agent
    pub async fn open_positions(&self, agent_id: i64) -> Result<Vec<PositionRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE agent_id = ?1 AND quantity > 0",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get positions for agent {}: {}", agent_id, e);
            DatabaseError::QueryError(format!("Failed to get positions: {}", e))
        })?;

        Ok(records)
    }

    /// Delete the open position for (agent, asset, side)
    pub async fn delete_position(
        &self,
        agent_id: i64,
        asset: &str,
        side: &str,
    ) -> Result<u64, DatabaseError> {
        let rows = sqlx::query(
            "DELETE FROM positions WHERE agent_id = ?1 AND asset = ?2 AND side = ?3",
        )
        .bind(agent_id)
        .bind(asset)
        .bind(side)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to delete position for agent {}: {}", agent_id, e);
            DatabaseError::QueryError(format!("Failed to delete position: {}", e))
        })?
        .rows_affected();

        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Trades
    // ------------------------------------------------------------------

    /// Append a trade record
    pub async fn append_trade(&self, trade: NewTrade) -> Result<TradeRecord, DatabaseError> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, TradeRecord>(
            r#"
            INSERT INTO trades (agent_id, asset, signal, quantity, price, leverage, side, pnl, executed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            RETURNING *
            "#,
        )
        .bind(trade.agent_id)
        .bind(&trade.asset)
        .bind(&trade.signal)
        .bind(trade.quantity)
        .bind(trade.price)
        .bind(trade.leverage)
        .bind(&trade.side)
        .bind(trade.pnl)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to append trade for agent {}: {}", trade.agent_id, e);
            DatabaseError::QueryError(format!("Failed to append trade: {}", e))
        })?;

        debug!(
            "Recorded trade {} for agent {}: {} {}",
            record.id, record.agent_id, record.signal, record.asset
        );
        Ok(record)
    }

    /// Get recent trades for an agent, newest first
    pub async fn list_trades(
        &self,
        agent_id: i64,
        limit: i64,
    ) -> Result<Vec<TradeRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE agent_id = ?1 ORDER BY executed_at DESC, id DESC LIMIT ?2",
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get trades for agent {}: {}", agent_id, e);
            DatabaseError::QueryError(format!("Failed to get trades: {}", e))
        })?;

        Ok(records)
    }

    /// Sum of realized P&L over the agent's whole trade log
    pub async fn sum_realized_pnl(&self, agent_id: i64) -> Result<f64, DatabaseError> {
        let row: (f64,) =
            sqlx::query_as("SELECT COALESCE(SUM(pnl), 0.0) FROM trades WHERE agent_id = ?1")
                .bind(agent_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to sum realized pnl for agent {}: {}", agent_id, e);
                    DatabaseError::QueryError(format!("Failed to sum realized pnl: {}", e))
                })?;

        Ok(row.0)
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Append an oracle conversation record
    pub async fn append_conversation(
        &self,
        agent_id: i64,
        prompt_summary: &str,
        response_json: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO conversations (agent_id, prompt_summary, response_json, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(agent_id)
        .bind(prompt_summary)
        .bind(response_json)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(
                "Failed to append conversation for agent {}: {}",
                agent_id, e
            );
            DatabaseError::QueryError(format!("Failed to append conversation: {}", e))
        })?;

        Ok(())
    }

    /// Get recent conversations for an agent, newest first
    pub async fn list_conversations(
        &self,
        agent_id: i64,
        limit: i64,
    ) -> Result<Vec<ConversationRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, ConversationRecord>(
            "SELECT * FROM conversations WHERE agent_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get conversations for agent {}: {}", agent_id, e);
            DatabaseError::QueryError(format!("Failed to get conversations: {}", e))
        })?;

        Ok(records)
    }

    // ------------------------------------------------------------------
    // Account snapshots
    // ------------------------------------------------------------------

    /// Append an account-value snapshot
    pub async fn append_account_snapshot(
        &self,
        agent_id: i64,
        total_value: f64,
        cash: f64,
        positions_value: f64,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO account_snapshots (agent_id, total_value, cash, positions_value, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(agent_id)
        .bind(total_value)
        .bind(cash)
        .bind(positions_value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record snapshot for agent {}: {}", agent_id, e);
            DatabaseError::QueryError(format!("Failed to record snapshot: {}", e))
        })?;

        Ok(())
    }

    /// Get recent account snapshots for an agent, newest first
    pub async fn list_account_snapshots(
        &self,
        agent_id: i64,
        limit: i64,
    ) -> Result<Vec<AccountSnapshotRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, AccountSnapshotRecord>(
            "SELECT * FROM account_snapshots WHERE agent_id = ?1 ORDER BY recorded_at DESC, id DESC LIMIT ?2",
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get snapshots for agent {}: {}", agent_id, e);
            DatabaseError::QueryError(format!("Failed to get snapshots: {}", e))
        })?;

        Ok(records)
    }
}
