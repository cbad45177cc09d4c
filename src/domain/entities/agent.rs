//! Agent account metadata passed to the decision oracle.

use chrono::Utc;
use serde::Serialize;

use crate::persistence::models::AgentRecord;

/// Per-cycle account summary for one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentMeta {
    pub current_time: String,
    pub initial_capital: f64,
    /// Cumulative return over initial capital, in percent.
    pub total_return: f64,
}

impl AgentMeta {
    pub fn new(agent: &AgentRecord, total_value: f64) -> Self {
        AgentMeta {
            current_time: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            initial_capital: agent.initial_capital,
            total_return: total_return_pct(agent.initial_capital, total_value),
        }
    }
}

/// Cumulative return in percent; 0 when initial capital is zero.
pub fn total_return_pct(initial_capital: f64, total_value: f64) -> f64 {
    if initial_capital == 0.0 {
        0.0
    } else {
        (total_value - initial_capital) / initial_capital * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_return_pct() {
        assert_eq!(total_return_pct(100_000.0, 105_000.0), 5.0);
        assert_eq!(total_return_pct(100_000.0, 95_000.0), -5.0);
        assert_eq!(total_return_pct(100_000.0, 100_000.0), 0.0);
    }

    #[test]
    fn test_total_return_pct_zero_capital() {
        assert_eq!(total_return_pct(0.0, 1_000.0), 0.0);
    }
}
