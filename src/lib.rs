//! Arena Trading Simulation Library
//!
//! This library provides the core components for the Arena multi-agent
//! simulated trading server: the persisted ledger, portfolio valuation,
//! decision execution, and the engine/manager pair that runs trading
//! cycles for every registered agent.

pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
