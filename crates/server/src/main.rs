//! Strategy-Bots: backtesting and live trading bots for declarative strategies
//!
//! Usage:
//!   strategy-bots serve --port 3002                      - Launch the HTTP API and bot supervisor
//!   strategy-bots backtest --strategy s.json --pair KRW-BTC - Backtest a strategy from the CLI
//!   strategy-bots validate --strategy s.json             - Check a strategy definition

mod credentials;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use engine::{
    catalog, run_backtest, validate, BacktestError, BacktestResult, BotSupervisor, Candle,
    EngineSettings, Exchange, RateLimitConfig, RateLimiter, ReconcilePolicy, SqliteBotStore,
    StrategyConfig, Timeframe, UpbitClient, UpbitConnector, Violation,
};
use persistence::repository::StrategyRepository;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use credentials::EnvCredentialProvider;

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

const DEFAULT_CAPITAL: Decimal = dec!(1000000);
const DEFAULT_CANDLE_COUNT: usize = 500;
const MAX_CANDLE_COUNT: usize = 10_000;

#[derive(Parser)]
#[command(name = "strategy-bots")]
#[command(about = "Backtesting and live trading bots for declarative strategies", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the HTTP API and the bot supervisor
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3002)]
        port: u16,
    },
    /// Backtest a strategy file against stored or fetched candles
    Backtest {
        /// Strategy config JSON file
        #[arg(long)]
        strategy: PathBuf,
        /// Candle JSON file; fetched from the exchange when omitted
        #[arg(long)]
        candles: Option<PathBuf>,
        /// Market pair to fetch, e.g. KRW-BTC
        #[arg(long, default_value = "KRW-BTC")]
        pair: String,
        /// Candle timeframe: 1m, 3m, 5m, 15m, 30m, 1h, 4h, 1d
        #[arg(long, default_value = "15m")]
        timeframe: String,
        /// Number of candles to fetch
        #[arg(long, default_value_t = DEFAULT_CANDLE_COUNT)]
        count: usize,
        /// Initial capital in quote currency
        #[arg(long, default_value_t = DEFAULT_CAPITAL)]
        capital: Decimal,
        /// Optional JSON export path for the full result
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Validate a strategy file and list every violation
    Validate {
        /// Strategy config JSON file
        #[arg(long)]
        strategy: PathBuf,
    },
}

#[derive(Clone)]
struct AppState {
    db: Arc<persistence::Database>,
    store: SqliteBotStore,
    supervisor: Arc<BotSupervisor>,
    market: Arc<UpbitClient>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,strategy_bots=debug")
    } else {
        EnvFilter::new("info,engine=info,strategy_bots=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn db_path() -> String {
    std::env::var("BOTS_DB_PATH").unwrap_or_else(|_| "data/bots.db".to_string())
}

fn exchange_base_url() -> String {
    std::env::var("EXCHANGE_BASE_URL")
        .unwrap_or_else(|_| engine::api::upbit::DEFAULT_BASE_URL.to_string())
}

fn reconcile_policy() -> ReconcilePolicy {
    match std::env::var("RESUME_RUNNING_BOTS") {
        Ok(v) if matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes") => {
            ReconcilePolicy::Resume
        }
        _ => ReconcilePolicy::MarkStopped,
    }
}

fn connector() -> anyhow::Result<UpbitConnector> {
    let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
    let connector = UpbitConnector::new(
        &exchange_base_url(),
        limiter,
        Arc::new(EnvCredentialProvider::new()),
    )?;
    Ok(connector)
}

fn format_time(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
        Commands::Backtest {
            strategy,
            candles,
            pair,
            timeframe,
            count,
            capital,
            export,
        } => {
            cmd_backtest(strategy, candles, pair, timeframe, count, capital, export).await?;
        }
        Commands::Validate { strategy } => {
            cmd_validate(strategy)?;
        }
    }

    Ok(())
}

// ============================================================================
// Serve command: Axum web server + bot supervisor
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Strategy-Bots v{} starting...", APP_VERSION);

    let db_path = db_path();
    let db = persistence::Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", db_path);

    let connector = Arc::new(connector()?);
    let store = SqliteBotStore::new(db.pool_clone());
    let supervisor = Arc::new(BotSupervisor::new(
        Arc::new(store.clone()),
        connector.clone(),
        EngineSettings::default(),
    ));

    let policy = reconcile_policy();
    match supervisor.reconcile(policy).await {
        Ok(responses) => {
            for r in responses.iter().filter(|r| r.error.is_some()) {
                warn!(bot_id = r.bot_id, error = ?r.error, "Bot could not be resumed");
            }
            info!(policy = ?policy, bots = responses.len(), "Reconciled persisted bots");
        }
        Err(e) => error!("Failed to reconcile bots: {}", e),
    }

    let state = AppState {
        db: Arc::new(db),
        store,
        supervisor: supervisor.clone(),
        market: Arc::new(connector.public_client()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/indicators", get(api_indicators))
        .route("/strategies/validate", post(api_validate))
        .route("/backtest", post(api_backtest))
        .route("/bots/active", get(api_active_bots))
        .route("/bots/:id/start", post(api_start_bot))
        .route("/bots/:id/stop", post(api_stop_bot))
        .route("/bots/:id/pause", post(api_pause_bot))
        .route("/bots/:id/trades", get(api_bot_trades))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Strategy-Bots v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health               - Health check");
    println!("  GET  /api/indicators           - Indicator catalog");
    println!("  POST /api/strategies/validate  - Validate a strategy config");
    println!("  POST /api/backtest             - Run a backtest");
    println!("  GET  /api/bots/active          - Bots with a live loop");
    println!("  POST /api/bots/:id/start       - Start a bot");
    println!("  POST /api/bots/:id/stop        - Stop a bot");
    println!("  POST /api/bots/:id/pause       - Pause a bot");
    println!("  GET  /api/bots/:id/trades      - Live trade log");
    println!("\n  Database: {}", db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl+C received, shutting down...");
        })
        .await?;

    supervisor.shutdown().await;
    info!("All bot loops stopped");

    Ok(())
}

// ============================================================================
// Backtest / Validate commands: CLI mode (no web server)
// ============================================================================

fn read_strategy(path: &FsPath) -> anyhow::Result<StrategyConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    let config = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("Invalid strategy JSON in {}: {}", path.display(), e))?;
    Ok(config)
}

fn print_violations(violations: &[Violation]) {
    for v in violations {
        println!("  - {}", v);
    }
}

async fn cmd_backtest(
    strategy: PathBuf,
    candles: Option<PathBuf>,
    pair: String,
    timeframe: String,
    count: usize,
    capital: Decimal,
    export: Option<PathBuf>,
) -> anyhow::Result<()> {
    println!("\n=== Strategy-Bots v{} ===", APP_VERSION);

    let config = read_strategy(&strategy)?;

    let candles: Vec<Candle> = match candles {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
            serde_json::from_str(&raw)?
        }
        None => {
            let timeframe = Timeframe::from_str(&timeframe).map_err(anyhow::Error::msg)?;
            let count = count.min(MAX_CANDLE_COUNT);
            println!("Fetching {} {} candles for {}...", count, timeframe, pair);
            connector()?
                .public_client()
                .candles(&pair, timeframe, count)
                .await?
        }
    };

    let result = match run_backtest(&candles, &config, capital) {
        Ok(r) => r,
        Err(BacktestError::InvalidStrategy(violations)) => {
            println!("Strategy is invalid:");
            print_violations(&violations);
            anyhow::bail!("{} violation(s)", violations.len());
        }
    };

    print_summary(&result);

    if let Some(path) = export {
        std::fs::write(&path, serde_json::to_string_pretty(&result)?)?;
        println!("\nExported to {}", path.display());
    }

    Ok(())
}

fn print_summary(r: &BacktestResult) {
    if let Some(missing) = &r.insufficient_data {
        println!(
            "Not enough data: {} candles available, {} required",
            missing.available, missing.required
        );
        return;
    }

    println!(
        "Period: {} → {} ({} bars)",
        format_time(r.start_time),
        format_time(r.end_time),
        r.bars
    );
    println!("Capital: {} → {}", r.initial_capital, r.final_capital.round_dp(0));
    println!(
        "Return: {}% (buy & hold {}%)",
        r.total_return_pct, r.buy_and_hold_return_pct
    );
    println!(
        "Trades: {} | Win rate: {}% | Profit factor: {}",
        r.total_trades, r.win_rate, r.profit_factor
    );
    println!(
        "Max drawdown: {}% | Sharpe: {} | Fees: {}",
        r.max_drawdown_pct, r.sharpe_ratio, r.total_fees
    );
}

fn cmd_validate(strategy: PathBuf) -> anyhow::Result<()> {
    let config = read_strategy(&strategy)?;
    let violations = validate(&config);
    if violations.is_empty() {
        println!("{}: OK", strategy.display());
        return Ok(());
    }

    println!("{}: {} violation(s)", strategy.display(), violations.len());
    print_violations(&violations);
    anyhow::bail!("strategy is invalid")
}

// ============================================================================
// API Handlers: Strategies and backtests
// ============================================================================

async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "strategy-bots",
        "version": APP_VERSION,
    }))
}

/// GET /api/indicators: indicator catalog with parameter ranges
async fn api_indicators() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "data": catalog(),
    }))
}

/// Parse a strategy body, reporting shape errors as a single violation
fn parse_config(value: serde_json::Value) -> Result<StrategyConfig, Vec<Violation>> {
    serde_json::from_value(value).map_err(|e| {
        vec![Violation {
            field: String::new(),
            message: format!("malformed strategy: {e}"),
        }]
    })
}

/// POST /api/strategies/validate: list every violation of a strategy config
async fn api_validate(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
    let violations = match parse_config(body) {
        Ok(config) => validate(&config),
        Err(v) => v,
    };

    Json(serde_json::json!({
        "valid": violations.is_empty(),
        "violations": violations,
    }))
}

#[derive(Debug, Deserialize)]
struct BacktestRequest {
    /// Load config, pair and timeframe from a stored strategy and cache the result on it
    strategy_id: Option<i64>,
    config: Option<serde_json::Value>,
    candles: Option<Vec<Candle>>,
    pair: Option<String>,
    timeframe: Option<String>,
    count: Option<usize>,
    initial_capital: Option<Decimal>,
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "success": false, "error": message.into() })),
    )
}

/// POST /api/backtest: run a backtest on inline or freshly fetched candles
async fn api_backtest(
    State(state): State<AppState>,
    Json(request): Json<BacktestRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let mut pair = request.pair.clone();
    let mut timeframe = request.timeframe.clone();

    let config_value = match (request.strategy_id, request.config) {
        (_, Some(config)) => config,
        (Some(id), None) => {
            match StrategyRepository::new(state.db.pool()).get(id).await {
                Ok(Some(row)) => {
                    pair = pair.or(Some(row.pair));
                    timeframe = timeframe.or(Some(row.timeframe));
                    match serde_json::from_str(&row.config) {
                        Ok(v) => v,
                        Err(e) => return bad_request(format!("stored strategy {id} is corrupt: {e}")),
                    }
                }
                Ok(None) => return bad_request(format!("strategy {id} not found")),
                Err(e) => {
                    error!("Failed to load strategy {}: {}", id, e);
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(serde_json::json!({ "success": false, "error": e.to_string() })),
                    );
                }
            }
        }
        (None, None) => return bad_request("either config or strategy_id is required"),
    };

    let config = match parse_config(config_value) {
        Ok(c) => c,
        Err(violations) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({ "success": false, "violations": violations })),
            )
        }
    };

    let candles = match request.candles {
        Some(c) => c,
        None => {
            let Some(pair) = pair else {
                return bad_request("either candles or pair is required");
            };
            let timeframe = match Timeframe::from_str(timeframe.as_deref().unwrap_or("15m")) {
                Ok(t) => t,
                Err(e) => return bad_request(e),
            };
            let count = request
                .count
                .unwrap_or(DEFAULT_CANDLE_COUNT)
                .min(MAX_CANDLE_COUNT);

            match state.market.candles(&pair, timeframe, count).await {
                Ok(c) => c,
                Err(e) => {
                    error!("Failed to fetch candles for backtest: {}", e);
                    return (
                        StatusCode::BAD_GATEWAY,
                        Json(serde_json::json!({
                            "success": false,
                            "error": format!("Failed to fetch market data: {}", e),
                        })),
                    );
                }
            }
        }
    };

    let capital = request.initial_capital.unwrap_or(DEFAULT_CAPITAL);
    info!(candles = candles.len(), capital = %capital, "Starting backtest");

    let outcome =
        tokio::task::spawn_blocking(move || run_backtest(&candles, &config, capital)).await;

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(BacktestError::InvalidStrategy(violations))) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({ "success": false, "violations": violations })),
            )
        }
        Err(e) => {
            error!("Backtest task failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "success": false, "error": "backtest task failed" })),
            );
        }
    };

    info!(
        trades = result.total_trades,
        return_pct = %result.total_return_pct,
        "Backtest complete"
    );

    if let Some(id) = request.strategy_id {
        let cached = serde_json::to_string(&result).map_err(|e| e.to_string());
        let saved = match cached {
            Ok(json) => StrategyRepository::new(state.db.pool())
                .save_backtest(id, &json)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            warn!(strategy_id = id, "Failed to cache backtest result: {}", e);
        }
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({ "success": true, "result": result })),
    )
}

// ============================================================================
// API Handlers: Bot control
// ============================================================================

/// POST /api/bots/:id/start
async fn api_start_bot(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Json<engine::ControlResponse> {
    Json(state.supervisor.start(id).await)
}

/// POST /api/bots/:id/stop
async fn api_stop_bot(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Json<engine::ControlResponse> {
    Json(state.supervisor.stop(id).await)
}

/// POST /api/bots/:id/pause
async fn api_pause_bot(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Json<engine::ControlResponse> {
    Json(state.supervisor.pause(id).await)
}

/// GET /api/bots/active: ids of bots with a live loop in this process
async fn api_active_bots(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ids = state.supervisor.active_bot_ids().await;
    Json(serde_json::json!({
        "success": true,
        "data": ids,
        "total": ids.len(),
    }))
}

/// GET /api/bots/:id/trades: live trade log, newest first
async fn api_bot_trades(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(50)
        .clamp(1, 1000);

    match state.store.recent_trades(id, limit).await {
        Ok(trades) => Json(serde_json::json!({
            "success": true,
            "data": trades,
            "total": trades.len(),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query trades: {}", e),
            "data": [],
            "total": 0,
        })),
    }
}
