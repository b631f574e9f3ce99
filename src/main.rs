mod api;
mod client;
mod config;
mod controller;
mod dispatch;
mod error;
mod refresh;
mod state;
mod types;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::routes::{router, ApiState};
use crate::client::{HttpScenarioService, ScenarioService};
use crate::config::{Config, GateMode, CHANNEL_CAPACITY};
use crate::controller::{AnalysisGate, ScenarioController};
use crate::dispatch::{BatchTrigger, ErrorHandler};
use crate::error::Result;
use crate::refresh::{CacheSweeper, CatalogRefresher};
use crate::state::scenario_store::AnalysisSettings;
use crate::state::ScenarioStore;
use crate::types::{ControlMsg, ServiceFailure};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Backend client ---
    let service: Arc<dyn ScenarioService> = Arc::new(HttpScenarioService::new(&cfg)?);
    info!("Scenario backend at {}", cfg.scenario_api_url);

    // --- Store + gate ---
    let store = ScenarioStore::new(AnalysisSettings::from_config(&cfg));
    let gate = AnalysisGate::new(cfg.max_concurrent_analyses, cfg.gate_mode);
    match cfg.gate_mode {
        GateMode::Reject => info!(
            "Analysis gate: max {} concurrent, rejecting at capacity",
            cfg.max_concurrent_analyses
        ),
        GateMode::Requeue { delay, max_attempts } => info!(
            "Analysis gate: max {} concurrent, requeue every {delay:?} up to {max_attempts} times",
            cfg.max_concurrent_analyses
        ),
    }

    // --- Channels ---
    let (failure_tx, failure_rx) = mpsc::channel::<ServiceFailure>(CHANNEL_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel::<ControlMsg>(CHANNEL_CAPACITY);

    let controller = Arc::new(
        ScenarioController::new(service, Arc::clone(&store), gate)
            .with_channels(failure_tx, control_tx),
    );

    // --- Bootstrap: first catalog load ---
    match controller.load_scenarios().await {
        Ok(outcome) => info!("Bootstrap catalog load: {outcome:?}"),
        Err(e) => warn!("Bootstrap catalog load failed, error handler will retry: {e}"),
    }

    // --- Spawn tasks ---

    // Error handler (network / rate-limit retries)
    let error_handler = ErrorHandler::new(Arc::clone(&controller), failure_rx);
    tokio::spawn(async move { error_handler.run().await });

    // Batch trigger (portfolio / settings changes)
    let batch_trigger = BatchTrigger::new(Arc::clone(&controller), control_rx);
    tokio::spawn(async move { batch_trigger.run().await });

    // Catalog refresher (every cache timeout)
    let refresher = CatalogRefresher::new(Arc::clone(&controller));
    tokio::spawn(async move { refresher.run().await });

    // Cache sweeper (every 10 min)
    let sweeper = CacheSweeper::new(Arc::clone(&controller));
    tokio::spawn(async move { sweeper.run().await });

    // HTTP API server
    let app = router(ApiState { controller });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
