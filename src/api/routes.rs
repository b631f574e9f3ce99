use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::latency::LatencySnapshot;
use crate::controller::{BatchReport, LoadOutcome, ScenarioController};
use crate::error::AppError;
use crate::state::scenario_store::{AnalysisSettings, SettingsUpdate};
use crate::state::selectors::{ChainComplexity, ScenarioSummary};
use crate::types::{
    ChainRequest, ImpactRequest, ImpactResult, ScenarioChain, ScenarioId, SimulationRequest,
    SimulationResult, VisualizationData,
};

#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<ScenarioController>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .route("/summary", get(get_summary))
        .route("/scenarios", get(get_scenarios))
        .route("/scenarios/refresh", post(refresh_scenarios))
        .route("/simulations", post(run_simulation))
        .route("/simulations/:id", get(get_simulation))
        .route("/impact", post(analyze_impact))
        .route("/impact/:portfolio_id", get(get_impact))
        .route("/analyses/batch", post(run_batch))
        .route("/chains", get(get_chain_ranking).post(create_chain))
        .route(
            "/chains/:name",
            get(load_chain).put(modify_chain).delete(delete_chain),
        )
        .route("/chains/:name/visualization", get(get_visualization))
        .route("/selection/scenarios", put(select_scenarios))
        .route("/selection/chain", get(get_selected_chain).put(select_chain))
        .route("/selection/portfolio", put(select_portfolio))
        .route("/settings", get(get_settings).put(update_settings))
        .route("/cache/:category", delete(clear_cache))
        .route("/errors", delete(clear_errors))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSimulationBody {
    #[serde(flatten)]
    pub request: SimulationRequest,
    /// Minted by the controller when absent.
    pub simulation_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ImpactQuery {
    /// Only return a result younger than the cache timeout.
    #[serde(default)]
    pub fresh: bool,
}

#[derive(Deserialize)]
pub struct ChainQuery {
    /// Serve the locally cached chain instead of fetching it from the backend.
    #[serde(default)]
    pub cached: bool,
}

#[derive(Deserialize)]
pub struct SelectScenariosBody {
    pub scenarios: Vec<ScenarioId>,
}

#[derive(Deserialize)]
pub struct SelectChainBody {
    pub name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectPortfolioBody {
    pub portfolio_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend_reachable: bool,
    pub last_catalog_at_ms: Option<u64>,
    pub failures_total: u64,
    pub retries_pending: u64,
    pub active_analyses: usize,
    pub has_errors: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let health = state.controller.health();
    let reachable = health.backend_reachable();
    let last = health.last_catalog_at_ms();
    let has_errors = !state.controller.store().errors().is_empty();
    Json(HealthResponse {
        status: if reachable && !has_errors { "ok" } else { "degraded" },
        backend_reachable: reachable,
        last_catalog_at_ms: (last > 0).then_some(last),
        failures_total: health.failures_total(),
        retries_pending: health.retries_pending(),
        active_analyses: state.controller.active_analyses(),
        has_errors,
    })
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySnapshot> {
    Json(state.controller.latency().snapshot())
}

async fn get_summary(State(state): State<ApiState>) -> Json<ScenarioSummary> {
    Json(state.controller.store().summary())
}

async fn get_scenarios(State(state): State<ApiState>) -> Json<Vec<ScenarioId>> {
    Json(state.controller.store().available_scenarios())
}

async fn refresh_scenarios(
    State(state): State<ApiState>,
) -> Result<Json<LoadOutcome>, AppError> {
    Ok(Json(state.controller.load_scenarios().await?))
}

async fn run_simulation(
    State(state): State<ApiState>,
    Json(body): Json<RunSimulationBody>,
) -> Result<Json<SimulationResult>, AppError> {
    let ctl = &state.controller;
    let simulation_id = body.simulation_id.unwrap_or_else(|| {
        ctl.new_simulation_id(&body.request.portfolio_id, &body.request.starting_scenario)
    });
    Ok(Json(ctl.run_simulation(body.request, simulation_id).await?))
}

async fn get_simulation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SimulationResult>, AppError> {
    state
        .controller
        .store()
        .simulation(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("simulation {id}")))
}

async fn analyze_impact(
    State(state): State<ApiState>,
    Json(request): Json<ImpactRequest>,
) -> Result<Json<ImpactResult>, AppError> {
    let portfolio_id = request.portfolio_id.clone();
    Ok(Json(state.controller.analyze_impact(request, portfolio_id).await?))
}

async fn get_impact(
    State(state): State<ApiState>,
    Path(portfolio_id): Path<String>,
    Query(query): Query<ImpactQuery>,
) -> Result<Json<ImpactResult>, AppError> {
    let store = state.controller.store();
    let found = if query.fresh {
        store.fresh_impact_at(&portfolio_id, Instant::now())
    } else {
        store.impact(&portfolio_id)
    };
    found
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("impact analysis for {portfolio_id}")))
}

async fn run_batch(State(state): State<ApiState>) -> Json<BatchReport> {
    Json(state.controller.run_selected().await)
}

async fn get_chain_ranking(State(state): State<ApiState>) -> Json<Vec<ChainComplexity>> {
    Json(state.controller.store().chain_complexity_ranking())
}

async fn create_chain(
    State(state): State<ApiState>,
    Json(request): Json<ChainRequest>,
) -> Result<(StatusCode, Json<ScenarioChain>), AppError> {
    let chain = state.controller.create_chain(request).await?;
    Ok((StatusCode::CREATED, Json(chain)))
}

async fn modify_chain(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(mut request): Json<ChainRequest>,
) -> Result<Json<ScenarioChain>, AppError> {
    // The path is authoritative for which chain is being modified.
    request.name = name;
    Ok(Json(state.controller.modify_chain(request).await?))
}

async fn load_chain(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<ChainQuery>,
) -> Result<Json<ScenarioChain>, AppError> {
    if query.cached {
        return state
            .controller
            .store()
            .chain(&name)
            .map(Json)
            .ok_or_else(|| AppError::NotFound(format!("chain {name}")));
    }
    Ok(Json(state.controller.load_chain(&name).await?))
}

async fn delete_chain(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.controller.delete_chain(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_visualization(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<VisualizationData>, AppError> {
    state
        .controller
        .store()
        .visualization(&name)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("chain {name}")))
}

async fn select_scenarios(
    State(state): State<ApiState>,
    Json(body): Json<SelectScenariosBody>,
) -> Json<Vec<ScenarioId>> {
    let store = state.controller.store();
    store.set_selected_scenarios(body.scenarios);
    Json(store.selected_scenarios())
}

async fn get_selected_chain(
    State(state): State<ApiState>,
) -> Result<Json<ScenarioChain>, AppError> {
    state
        .controller
        .store()
        .selected_chain()
        .map(Json)
        .ok_or_else(|| AppError::NotFound("no chain selected".to_string()))
}

async fn select_chain(
    State(state): State<ApiState>,
    Json(body): Json<SelectChainBody>,
) -> StatusCode {
    state.controller.store().set_selected_chain(body.name);
    StatusCode::NO_CONTENT
}

async fn select_portfolio(
    State(state): State<ApiState>,
    Json(body): Json<SelectPortfolioBody>,
) -> StatusCode {
    state.controller.set_current_portfolio(body.portfolio_id);
    StatusCode::NO_CONTENT
}

async fn get_settings(State(state): State<ApiState>) -> Json<AnalysisSettings> {
    Json(state.controller.store().settings())
}

async fn update_settings(
    State(state): State<ApiState>,
    Json(update): Json<SettingsUpdate>,
) -> Json<AnalysisSettings> {
    Json(state.controller.update_settings(&update))
}

async fn clear_cache(
    State(state): State<ApiState>,
    Path(category): Path<String>,
) -> Result<StatusCode, AppError> {
    let store = state.controller.store();
    match category.as_str() {
        "simulations" => store.clear_simulation_cache(),
        "impacts" => store.clear_impact_cache(),
        "all" => store.clear_all_cache(),
        other => return Err(AppError::NotFound(format!("cache category {other}"))),
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_errors(State(state): State<ApiState>) -> StatusCode {
    state.controller.store().clear_errors();
    StatusCode::NO_CONTENT
}
