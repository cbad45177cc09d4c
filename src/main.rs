use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arena::config::ArenaConfig;
use arena::domain::errors::EngineError;
use arena::domain::oracles::{MarketDataProvider, OracleFactory};
use arena::domain::services::manager::TradingManager;
use arena::domain::services::portfolio::PortfolioCalculator;
use arena::infrastructure::market_data::MarketDataFetcher;
use arena::infrastructure::oracle::LlmOracleFactory;
use arena::persistence::repository::LedgerRepository;
use arena::persistence::{init_database, DatabaseConfig};

#[derive(Clone)]
struct AppState {
    ledger: LedgerRepository,
    portfolio: PortfolioCalculator,
    market: Arc<dyn MarketDataProvider>,
    manager: Arc<TradingManager>,
    config: Arc<ArenaConfig>,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

fn internal_error(err: impl std::fmt::Display) -> ApiError {
    error!("Request failed: {}", err);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arena=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Arena trading server starting...");

    let config = Arc::new(ArenaConfig::from_env());
    info!("Tracked assets: {}", config.tracked_assets.join(", "));

    let db_config = DatabaseConfig::from_env();
    let pool = init_database(&db_config.url).await?;
    let ledger = LedgerRepository::new(pool);

    let market: Arc<dyn MarketDataProvider> = Arc::new(MarketDataFetcher::new());
    let oracles: Arc<dyn OracleFactory> = Arc::new(LlmOracleFactory::new());
    let manager = Arc::new(TradingManager::new(
        ledger.clone(),
        Arc::clone(&market),
        oracles,
        &config,
    ));
    manager.initialize_engines().await;

    let auto_trading = std::env::var("AUTO_TRADING")
        .map(|v| v.to_lowercase() != "false" && v != "0")
        .unwrap_or(true);
    if auto_trading {
        manager.start().await;
    } else {
        info!("Automated trading disabled; cycles run only on manual trigger");
    }

    let state = AppState {
        portfolio: PortfolioCalculator::new(ledger.clone()),
        ledger,
        market,
        manager: Arc::clone(&manager),
        config: Arc::clone(&config),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/agents", get(list_agents).post(create_agent))
        .route("/api/agents/:agent_id", delete(delete_agent))
        .route("/api/agents/:agent_id/portfolio", get(get_portfolio))
        .route("/api/agents/:agent_id/trades", get(get_trades))
        .route("/api/agents/:agent_id/conversations", get(get_conversations))
        .route("/api/agents/:agent_id/execute", post(execute_cycle))
        .route("/api/market/prices", get(get_market_prices))
        .route("/api/leaderboard", get(get_leaderboard))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("Listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let server = axum::serve(listener, app);

    let shutdown_signal = async {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    info!("Server started successfully. Press Ctrl+C to stop.");
    server.with_graceful_shutdown(shutdown_signal).await?;

    info!("Server shutting down gracefully...");
    manager.stop().await;
    info!("Shutdown complete");
    Ok(())
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let active = state.manager.list_ids().await;
    Json(json!({
        "status": "running",
        "active_engines": active.len(),
    }))
}

/// List all agents, flagging those with an active engine
async fn list_agents(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let agents = state.ledger.list_agents().await.map_err(internal_error)?;
    let active: std::collections::HashSet<i64> =
        state.manager.list_ids().await.into_iter().collect();

    let payload: Vec<Value> = agents
        .iter()
        .map(|agent| {
            let mut value = serde_json::to_value(agent).unwrap_or_else(|_| json!({}));
            value["engine_active"] = json!(active.contains(&agent.id));
            value
        })
        .collect();

    Ok(Json(json!(payload)))
}

#[derive(Deserialize)]
struct CreateAgentRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    initial_capital: Option<f64>,
}

/// Create an agent and register a trading engine for it
async fn create_agent(
    State(state): State<AppState>,
    Json(payload): Json<CreateAgentRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut missing = Vec::new();
    let required = [
        ("name", &payload.name),
        ("api_key", &payload.api_key),
        ("api_url", &payload.api_url),
        ("model_name", &payload.model_name),
    ];
    for (field, value) in &required {
        if value.as_deref().map_or(true, |v| v.is_empty()) {
            missing.push(*field);
        }
    }
    if !missing.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Missing required fields: {}", missing.join(", ")),
        ));
    }

    let agent = state
        .ledger
        .create_agent(arena::persistence::models::CreateAgent {
            name: payload.name.unwrap_or_default(),
            api_key: payload.api_key.unwrap_or_default(),
            api_url: payload.api_url.unwrap_or_default(),
            model_name: payload.model_name.unwrap_or_default(),
            initial_capital: payload.initial_capital.unwrap_or(100_000.0),
        })
        .await
        .map_err(internal_error)?;

    match state.manager.register(agent.id).await {
        Ok(_) => {
            info!("Agent {} registered successfully", agent.id);
            Ok((
                StatusCode::CREATED,
                Json(json!({ "id": agent.id, "message": "Agent added successfully" })),
            ))
        }
        Err(e) => {
            error!("Failed to initialize trading engine for agent {}: {}", agent.id, e);
            Ok((
                StatusCode::CREATED,
                Json(json!({ "id": agent.id, "warning": e.to_string() })),
            ))
        }
    }
}

/// Delete an agent, its ledger rows, and its engine
async fn delete_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let agent = state
        .ledger
        .get_agent(agent_id)
        .await
        .map_err(internal_error)?;
    if agent.is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, "Agent not found"));
    }

    state
        .ledger
        .delete_agent(agent_id)
        .await
        .map_err(internal_error)?;
    state.manager.unregister(agent_id).await;

    info!("Agent {} deleted", agent_id);
    Ok(Json(json!({ "message": "Agent deleted successfully" })))
}

#[derive(Deserialize)]
struct HistoryQuery {
    history_limit: Option<i64>,
}

/// Live valuation plus the account-value time series
async fn get_portfolio(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    if state
        .ledger
        .get_agent(agent_id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        return Err(api_error(StatusCode::NOT_FOUND, "Agent not found"));
    }

    let ticks = state
        .market
        .current_prices(&state.config.tracked_assets)
        .await
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e))?;
    let current_prices: HashMap<String, f64> = ticks
        .iter()
        .map(|(asset, tick)| (asset.clone(), tick.price))
        .collect();

    let valuation = state
        .portfolio
        .valuation(agent_id, Some(&current_prices))
        .await
        .map_err(|e| match e {
            EngineError::AgentNotFound(_) => api_error(StatusCode::NOT_FOUND, e),
            other => internal_error(other),
        })?;

    let limit = query
        .history_limit
        .unwrap_or(state.config.account_history_limit);
    let history = state
        .ledger
        .list_account_snapshots(agent_id, limit)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "portfolio": valuation,
        "account_value_history": history,
    })))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

/// Recent trades, newest first
async fn get_trades(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(state.config.max_trades_returned);
    let trades = state
        .ledger
        .list_trades(agent_id, limit)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(trades)))
}

/// Recent oracle conversations, newest first
async fn get_conversations(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(state.config.max_conversations_returned);
    let conversations = state
        .ledger
        .list_conversations(agent_id, limit)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(conversations)))
}

/// Synchronously run one trading cycle for an agent
async fn execute_cycle(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if state
        .ledger
        .get_agent(agent_id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        return Err(api_error(StatusCode::NOT_FOUND, "Agent not found"));
    }

    let result = state.manager.execute_now(agent_id).await.map_err(|e| {
        error!("Manual trading execution failed for agent {}: {}", agent_id, e);
        internal_error(e)
    })?;

    Ok(Json(serde_json::to_value(result).map_err(internal_error)?))
}

/// Current prices for the tracked assets
async fn get_market_prices(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let ticks = state
        .market
        .current_prices(&state.config.tracked_assets)
        .await
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e))?;
    Ok(Json(json!(ticks)))
}

/// All agents ranked by cumulative return
async fn get_leaderboard(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let agents = state.ledger.list_agents().await.map_err(internal_error)?;
    let ticks = state
        .market
        .current_prices(&state.config.tracked_assets)
        .await
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e))?;
    let current_prices: HashMap<String, f64> = ticks
        .iter()
        .map(|(asset, tick)| (asset.clone(), tick.price))
        .collect();

    let mut leaderboard = Vec::with_capacity(agents.len());
    for agent in &agents {
        let valuation = state
            .portfolio
            .valuation(agent.id, Some(&current_prices))
            .await
            .map_err(internal_error)?;
        let returns = arena::domain::entities::agent::total_return_pct(
            agent.initial_capital,
            valuation.total_value,
        );
        leaderboard.push(json!({
            "agent_id": agent.id,
            "agent_name": agent.name,
            "account_value": valuation.total_value,
            "returns": returns,
            "initial_capital": agent.initial_capital,
        }));
    }

    leaderboard.sort_by(|a, b| {
        let ra = a["returns"].as_f64().unwrap_or(0.0);
        let rb = b["returns"].as_f64().unwrap_or(0.0);
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(Json(json!(leaderboard)))
}
