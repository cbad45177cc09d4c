use thiserror::Error;

use crate::persistence::DatabaseError;

/// Errors produced while valuing portfolios and executing trading cycles.
///
/// Per-asset execution errors (invalid quantity, insufficient cash, missing
/// position, unknown signal) are caught by the executor and reported inline
/// in that asset's result; cycle-level errors (missing agent, oracle or
/// market failure, storage failure) abort the whole cycle and surface as a
/// structured failure result at the engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Agent {0} not found")]
    AgentNotFound(i64),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(f64),

    #[error("Insufficient cash: required margin {required:.2}, available {available:.2}")]
    InsufficientCash { required: f64, available: f64 },

    #[error("No open position for {0}")]
    PositionNotFound(String),

    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    #[error("No market price for {0}")]
    PriceUnavailable(String),

    #[error("Market data unavailable: {0}")]
    MarketUnavailable(String),

    #[error("Decision oracle failed: {0}")]
    Oracle(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
