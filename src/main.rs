// =============================================================================
// Perpetual Daemon — Main Entry Point
// =============================================================================
//
// Boots the trading core: loads config, constructs the venue Broker adapter,
// builds AppState, spawns one Executor per configured instrument/strategy
// pair through the Orchestrator, starts the health sweep, and serves the
// REST + WebSocket API. The engine always starts with zero running
// strategies — operators opt a strategy in via `POST /strategy/start`.
// =============================================================================

mod api;
mod app_state;
mod bracket;
mod broker;
mod config;
mod error;
mod executor;
mod health;
mod history;
mod indicators;
mod lifecycle;
mod orchestrator;
mod reconcile;
mod risk;
mod strategy;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::{Broker, BrokerCredentials, Environment};
use crate::config::DaemonConfig;
use crate::history::{file::FileTradeHistoryStore, TradeHistoryStore};

const CONFIG_PATH: &str = "daemon_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Perpetual Strategy Daemon — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = DaemonConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        DaemonConfig::default()
    });

    // ── Build the history store ──────────────────────────────────────────
    let history_dir = std::env::var("PERP_DAEMON_HISTORY_DIR").unwrap_or_else(|_| "trade_history".into());
    let history: Arc<dyn TradeHistoryStore> =
        Arc::new(FileTradeHistoryStore::open(&history_dir).unwrap_or_else(|e| panic!("failed to open trade history store at {history_dir}: {e}")));

    // ── Build the venue broker and connect ───────────────────────────────
    let broker: Arc<dyn Broker> = build_broker();
    let api_key = std::env::var("PERP_DAEMON_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("PERP_DAEMON_API_SECRET").unwrap_or_default();
    let env = match config.broker_env {
        config::BrokerEnv::Live => Environment::Live,
        config::BrokerEnv::Testnet => Environment::Testnet,
    };
    if let Err(e) = broker.connect(&BrokerCredentials { api_key, api_secret }, env).await {
        warn!(error = %e, "broker connect failed at startup — will retry on first use");
    }

    let state = Arc::new(AppState::new(config.clone(), broker.clone(), history.clone()));

    // ── Auto-resume strategies from env, if configured ───────────────────
    if let Ok(spec) = std::env::var("PERP_DAEMON_AUTOSTART") {
        for pair in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((strategy_name, instrument)) = pair.split_once(':') else {
                warn!(pair, "ignoring malformed PERP_DAEMON_AUTOSTART entry, expected strategy:instrument");
                continue;
            };
            if let Err(e) = state.start_strategy("default", strategy_name, instrument) {
                error!(strategy = strategy_name, instrument, error = %e, "autostart failed");
            }
        }
    }

    // ── Health sweep ──────────────────────────────────────────────────────
    {
        let sweep_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                let snapshots: Vec<_> = sweep_state.lifecycles.read().values().map(|l| l.snapshot()).collect();
                let status = health::aggregate_status(&snapshots);
                if status != health::HealthStatus::Healthy {
                    warn!(status = %status, "health sweep: degraded or unhealthy strategies present");
                }

                let reaped = sweep_state.cull_finished_workers().await;
                if !reaped.is_empty() {
                    warn!(strategy_ids = ?reaped, "health sweep: reaped finished executors");
                }
            }
        });
    }

    // ── API server ────────────────────────────────────────────────────────
    let bind_addr: SocketAddr = std::env::var("PERP_DAEMON_BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:3001".into())
        .parse()
        .expect("PERP_DAEMON_BIND_ADDR must be a valid socket address");

    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind_addr).await.expect("failed to bind API server");
    info!(addr = %bind_addr, "API server listening");

    let serve = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        res = serve => {
            if let Err(e) = res {
                error!(error = %e, "API server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — stopping gracefully");
        }
    }

    info!("perpetual strategy daemon shut down complete.");
    Ok(())
}

fn build_broker() -> Arc<dyn Broker> {
    match std::env::var("PERP_DAEMON_VENUE").as_deref() {
        Ok("stub") => Arc::new(broker::stub::UnimplementedBroker::new("stub")),
        _ => {
            let base_url = std::env::var("PERP_DAEMON_VENUE_BASE_URL").unwrap_or_else(|_| "https://fapi.binance.com".into());
            Arc::new(broker::perpetual::PerpetualBroker::new(base_url))
        }
    }
}
