//! Trading Manager
//!
//! Owns the registry of active trading engines and the single background
//! scheduling loop that periodically runs a cycle for every registered
//! agent.
//!
//! The registry mutex is held only for map access; each scheduling pass and
//! every ad hoc trigger works on a point-in-time copy of the registry, so a
//! long cycle never blocks register/unregister calls from request handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ArenaConfig;
use crate::domain::errors::EngineError;
use crate::domain::oracles::{MarketDataProvider, OracleFactory};
use crate::domain::services::engine::{CycleResult, TradingEngine};
use crate::persistence::models::AgentRecord;
use crate::persistence::repository::LedgerRepository;

/// Manage lifecycle and background execution of trading engines.
pub struct TradingManager {
    ledger: LedgerRepository,
    market: Arc<dyn MarketDataProvider>,
    oracles: Arc<dyn OracleFactory>,
    assets: Vec<String>,
    loop_interval: Duration,
    idle_interval: Duration,
    oracle_timeout: Duration,
    engines: Mutex<HashMap<i64, Arc<TradingEngine>>>,
    /// One cycle lock per agent id, handed to every engine built for that
    /// agent. Entries outlive unregister so a re-registered agent keeps the
    /// same lock.
    cycle_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TradingManager {
    pub fn new(
        ledger: LedgerRepository,
        market: Arc<dyn MarketDataProvider>,
        oracles: Arc<dyn OracleFactory>,
        config: &ArenaConfig,
    ) -> Self {
        Self {
            ledger,
            market,
            oracles,
            assets: config.tracked_assets.clone(),
            loop_interval: config.loop_interval,
            idle_interval: config.idle_interval,
            oracle_timeout: config.oracle_timeout,
            engines: Mutex::new(HashMap::new()),
            cycle_locks: Mutex::new(HashMap::new()),
            stop_tx: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Engine lifecycle management
    // ------------------------------------------------------------------

    /// Build engines for every persisted agent. Called once at startup;
    /// failures are logged per agent and never abort initialization.
    pub async fn initialize_engines(&self) {
        let agents = match self.ledger.list_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                warn!("Failed to list agents during initialization: {}", e);
                return;
            }
        };

        if agents.is_empty() {
            warn!("No trading agents found during initialization");
            return;
        }

        info!("Initializing trading engines");
        for agent in &agents {
            let engine = Arc::new(self.build_engine(agent).await);
            self.engines.lock().await.insert(agent.id, engine);
            info!("  [OK] Agent {} ({})", agent.id, agent.name);
        }
        info!("Initialized {} engine(s)", agents.len());
    }

    /// Register (or replace) the engine for an agent.
    pub async fn register(&self, agent_id: i64) -> Result<Arc<TradingEngine>, EngineError> {
        let agent = self
            .ledger
            .get_agent(agent_id)
            .await?
            .ok_or(EngineError::AgentNotFound(agent_id))?;

        let engine = Arc::new(self.build_engine(&agent).await);
        self.engines
            .lock()
            .await
            .insert(agent_id, Arc::clone(&engine));
        info!("Registered trading engine for agent {}", agent_id);
        Ok(engine)
    }

    /// Remove the engine for an agent; no-op when none is registered.
    pub async fn unregister(&self, agent_id: i64) {
        if self.engines.lock().await.remove(&agent_id).is_some() {
            info!("Unregistered trading engine for agent {}", agent_id);
        }
    }

    /// Return the registered engine, lazily registering one if needed.
    pub async fn ensure(&self, agent_id: i64) -> Result<Arc<TradingEngine>, EngineError> {
        if let Some(engine) = self.engines.lock().await.get(&agent_id) {
            return Ok(Arc::clone(engine));
        }
        self.register(agent_id).await
    }

    /// Synchronously run one cycle for an agent. Safe to call from request
    /// handlers while the background loop is running; the engine's own cycle
    /// lock serializes concurrent cycles for the same agent.
    pub async fn execute_now(&self, agent_id: i64) -> Result<CycleResult, EngineError> {
        let engine = self.ensure(agent_id).await?;
        Ok(engine.run_cycle().await)
    }

    /// Snapshot of currently registered agent ids.
    pub async fn list_ids(&self) -> Vec<i64> {
        self.engines.lock().await.keys().copied().collect()
    }

    // ------------------------------------------------------------------
    // Background loop management
    // ------------------------------------------------------------------

    /// Start the background scheduling loop. No-op if already running.
    pub async fn start(self: &Arc<Self>) {
        let mut handle_guard = self.loop_handle.lock().await;
        if let Some(handle) = handle_guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().await = Some(stop_tx);

        let manager = Arc::clone(self);
        *handle_guard = Some(tokio::spawn(async move {
            manager.run_loop(stop_rx).await;
        }));
        info!("Background trading loop started");
    }

    /// Signal the loop to stop and wait for it with a bounded timeout. The
    /// stop signal only interrupts the sleeps; an in-flight cycle always runs
    /// to completion first.
    pub async fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().await.take() {
            let _ = stop_tx.send(true);
        }

        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(_) => info!("Background trading loop stopped"),
                Err(_) => warn!("Background trading loop did not stop within 10s"),
            }
        }
    }

    async fn run_loop(&self, mut stop: watch::Receiver<bool>) {
        info!("Trading loop running");

        loop {
            if *stop.borrow() {
                break;
            }

            // Copy-out under lock; cycles run on the snapshot so the
            // registry stays available throughout the pass
            let snapshot: Vec<(i64, Arc<TradingEngine>)> = {
                let engines = self.engines.lock().await;
                engines
                    .iter()
                    .map(|(id, engine)| (*id, Arc::clone(engine)))
                    .collect()
            };

            if snapshot.is_empty() {
                debug!("No engines registered; sleeping");
                if wait_or_stop(&mut stop, self.idle_interval).await {
                    break;
                }
                continue;
            }

            info!("Executing trading cycle for {} agent(s)", snapshot.len());
            for (agent_id, engine) in snapshot {
                if *stop.borrow() {
                    break;
                }
                debug!("[EXEC] Agent {}", agent_id);
                let result = engine.run_cycle().await;
                if !result.success {
                    warn!(
                        "Agent {} cycle failed: {}",
                        agent_id,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }

            if wait_or_stop(&mut stop, self.loop_interval).await {
                break;
            }
        }

        info!("Trading loop terminated");
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    async fn build_engine(&self, agent: &AgentRecord) -> TradingEngine {
        let oracle = self.oracles.build(agent);
        let cycle_lock = {
            let mut locks = self.cycle_locks.lock().await;
            Arc::clone(locks.entry(agent.id).or_default())
        };
        TradingEngine::new(
            agent.id,
            self.ledger.clone(),
            Arc::clone(&self.market),
            oracle,
            self.assets.clone(),
            self.oracle_timeout,
            cycle_lock,
        )
    }
}

/// Sleep for `duration`, returning early with `true` when the stop signal
/// fires (or its sender is gone).
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}
