pub mod gate;
pub mod visualization;

pub use gate::{AnalysisGate, AnalysisPermit};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::client::validate::{
    validate_chain_request, validate_impact_request, validate_simulation_request,
};
use crate::client::ScenarioService;
use crate::error::{AppError, Result, ServiceError};
use crate::state::scenario_store::{AnalysisSettings, SettingsUpdate};
use crate::state::ScenarioStore;
use crate::types::{
    ChainRequest, ControlMsg, ImpactRequest, ImpactResult, RetryableOp, ScenarioChain,
    ServiceFailure, SimulationRequest, SimulationResult,
};
use visualization::build_visualization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOutcome {
    Loaded(usize),
    /// Another catalog load was already running; nothing was sent.
    AlreadyInFlight,
}

/// Result of one batch of impact + simulation requests.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub portfolio_id: Option<String>,
    pub impact_succeeded: bool,
    pub simulation_ids: Vec<String>,
    pub simulations_failed: usize,
    pub errors: Vec<String>,
}

/// How an analysis claims its gate slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Per the configured `GateMode`.
    Configured,
    /// Wait for a slot; batch members only.
    Queued,
}

/// Orchestrates every request against the scenario backend and writes the
/// outcomes into the store.
pub struct ScenarioController {
    service: Arc<dyn ScenarioService>,
    store: Arc<ScenarioStore>,
    gate: Arc<AnalysisGate>,
    latency: Arc<LatencyStats>,
    health: Arc<HealthState>,
    failure_tx: Option<mpsc::Sender<ServiceFailure>>,
    control_tx: Option<mpsc::Sender<ControlMsg>>,
    /// Disambiguates simulation ids minted within the same millisecond.
    sim_seq: AtomicU64,
}

impl ScenarioController {
    pub fn new(
        service: Arc<dyn ScenarioService>,
        store: Arc<ScenarioStore>,
        gate: Arc<AnalysisGate>,
    ) -> Self {
        Self {
            service,
            store,
            gate,
            latency: Arc::new(LatencyStats::new()),
            health: Arc::new(HealthState::new()),
            failure_tx: None,
            control_tx: None,
            sim_seq: AtomicU64::new(0),
        }
    }

    /// Route backend failures to the error handler and input changes to the batch trigger.
    pub fn with_channels(
        mut self,
        failure_tx: mpsc::Sender<ServiceFailure>,
        control_tx: mpsc::Sender<ControlMsg>,
    ) -> Self {
        self.failure_tx = Some(failure_tx);
        self.control_tx = Some(control_tx);
        self
    }

    pub fn store(&self) -> &Arc<ScenarioStore> {
        &self.store
    }

    pub fn latency(&self) -> &Arc<LatencyStats> {
        &self.latency
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub fn active_analyses(&self) -> usize {
        self.gate.active()
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    pub async fn load_scenarios(&self) -> Result<LoadOutcome> {
        self.load_scenarios_attempt(0).await
    }

    async fn load_scenarios_attempt(&self, attempt: u32) -> Result<LoadOutcome> {
        if !self.store.scenarios_started() {
            debug!("Scenario catalog load already in flight, skipping");
            return Ok(LoadOutcome::AlreadyInFlight);
        }

        // The catalog is stamped with the time of the call, not of the response.
        let requested_at = Instant::now();
        match self.service.available_scenarios().await {
            Ok(catalog) => {
                let count = catalog.scenarios.len();
                self.store.scenarios_loaded(catalog.scenarios, requested_at);
                self.health.set_backend_reachable(true);
                self.health.set_last_catalog_at_ms(now_ms());
                info!(scenarios = count, "Scenario catalog loaded: {count} scenarios");
                Ok(LoadOutcome::Loaded(count))
            }
            Err(e) => {
                warn!(status = e.status, "Scenario catalog load failed: {}", e.message);
                self.store.scenarios_failed(e.message.clone());
                self.report_failure(RetryableOp::LoadScenarios, &e, attempt);
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Simulation
    // -----------------------------------------------------------------------

    /// `{portfolio}_{scenario}_{epoch ms}_{seq}`
    pub fn new_simulation_id(&self, portfolio_id: &str, scenario: &str) -> String {
        let seq = self.sim_seq.fetch_add(1, Ordering::Relaxed);
        format!("{portfolio_id}_{scenario}_{}_{seq}", now_ms())
    }

    /// Build a request from the current default settings and run it under a fresh id.
    async fn simulate(
        &self,
        portfolio_id: &str,
        scenario: &str,
        admission: Admission,
    ) -> Result<SimulationResult> {
        let settings = self.store.settings();
        let request = SimulationRequest {
            portfolio_id: portfolio_id.to_string(),
            starting_scenario: scenario.to_string(),
            num_simulations: settings.default_num_simulations,
            time_horizon: settings.default_time_horizon,
            include_custom_chains: true,
        };
        let simulation_id = self.new_simulation_id(portfolio_id, scenario);
        self.run_simulation_attempt(request, simulation_id, 0, admission).await
    }

    pub async fn run_simulation(
        &self,
        request: SimulationRequest,
        simulation_id: String,
    ) -> Result<SimulationResult> {
        self.run_simulation_attempt(request, simulation_id, 0, Admission::Configured).await
    }

    async fn run_simulation_attempt(
        &self,
        request: SimulationRequest,
        simulation_id: String,
        attempt: u32,
        admission: Admission,
    ) -> Result<SimulationResult> {
        let report = validate_simulation_request(&request);
        if !report.is_valid {
            let message = report.joined();
            self.store.simulation_failed(message.clone(), false);
            return Err(AppError::Validation(message));
        }

        // Held until this function returns, on every path.
        let _permit = match self.admit(admission).await {
            Ok(p) => p,
            Err(e) => {
                warn!(simulation_id = %simulation_id, "Simulation not started: {e}");
                self.store.simulation_failed(e.to_string(), false);
                return Err(e);
            }
        };

        let generation = self.store.simulation_started();
        let started = Instant::now();
        let outcome = self.service.simulate_chain(&request).await;
        self.latency.record(started.elapsed());

        match outcome {
            Ok(mut result) => {
                result.simulation_id = simulation_id.clone();
                let stored =
                    self.store.simulation_succeeded(&simulation_id, result.clone(), generation);
                if !stored {
                    debug!(
                        simulation_id = %simulation_id,
                        "Simulation cache cleared mid-flight, result not cached"
                    );
                }
                self.health.set_backend_reachable(true);
                info!(
                    simulation_id = %simulation_id,
                    scenario = %request.starting_scenario,
                    expected_return = result.expected_return,
                    var_95 = result.var_95,
                    "Simulation complete: {simulation_id}",
                );
                Ok(result)
            }
            Err(e) => {
                warn!(
                    simulation_id = %simulation_id,
                    status = e.status,
                    "Simulation failed: {}",
                    e.message,
                );
                self.store.simulation_failed(e.message.clone(), true);
                self.report_failure(
                    RetryableOp::Simulation { request, simulation_id },
                    &e,
                    attempt,
                );
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Impact analysis
    // -----------------------------------------------------------------------

    pub async fn analyze_impact(
        &self,
        request: ImpactRequest,
        portfolio_id: String,
    ) -> Result<ImpactResult> {
        self.analyze_impact_attempt(request, portfolio_id, 0, Admission::Configured).await
    }

    async fn analyze_impact_attempt(
        &self,
        request: ImpactRequest,
        portfolio_id: String,
        attempt: u32,
        admission: Admission,
    ) -> Result<ImpactResult> {
        let report = validate_impact_request(&request);
        if !report.is_valid {
            let message = report.joined();
            self.store.impact_failed(message.clone(), false);
            return Err(AppError::Validation(message));
        }

        let _permit = match self.admit(admission).await {
            Ok(p) => p,
            Err(e) => {
                warn!(portfolio_id = %portfolio_id, "Impact analysis not started: {e}");
                self.store.impact_failed(e.to_string(), false);
                return Err(e);
            }
        };

        let generation = self.store.impact_started();
        let started = Instant::now();
        let outcome = self.service.analyze_impact(&request).await;
        self.latency.record(started.elapsed());

        match outcome {
            Ok(result) => {
                if !self.store.impact_succeeded(&portfolio_id, result.clone(), generation) {
                    debug!(
                        portfolio_id = %portfolio_id,
                        "Impact cache cleared mid-flight, result not cached"
                    );
                }
                self.health.set_backend_reachable(true);
                info!(
                    portfolio_id = %portfolio_id,
                    scenarios = result.scenario_impacts.len(),
                    vulnerabilities = result.vulnerabilities.len(),
                    "Impact analysis complete for {portfolio_id}",
                );
                Ok(result)
            }
            Err(e) => {
                warn!(
                    portfolio_id = %portfolio_id,
                    status = e.status,
                    "Impact analysis failed: {}",
                    e.message,
                );
                self.store.impact_failed(e.message.clone(), true);
                self.report_failure(RetryableOp::Impact { request, portfolio_id }, &e, attempt);
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Chains
    // -----------------------------------------------------------------------

    pub async fn create_chain(&self, request: ChainRequest) -> Result<ScenarioChain> {
        self.validate_chain(&request)?;
        self.store.chain_started();
        let outcome = self.service.create_chain(&request).await;
        self.finish_chain_write(outcome, "created")
    }

    pub async fn modify_chain(&self, request: ChainRequest) -> Result<ScenarioChain> {
        self.validate_chain(&request)?;
        self.store.chain_started();
        let outcome = self.service.modify_chain(&request).await;
        self.finish_chain_write(outcome, "modified")
    }

    pub async fn load_chain(&self, name: &str) -> Result<ScenarioChain> {
        self.require_chain_name(name)?;
        self.store.chain_started();
        let outcome = self.service.get_chain(name).await;
        self.finish_chain_write(outcome, "loaded")
    }

    pub async fn delete_chain(&self, name: &str) -> Result<()> {
        self.require_chain_name(name)?;
        self.store.chain_started();
        match self.service.delete_chain(name).await {
            Ok(()) => {
                self.store.chain_deleted(name);
                info!(chain = %name, "Chain deleted: {name}");
                Ok(())
            }
            Err(e) => Err(self.chain_failed(e)),
        }
    }

    fn validate_chain(&self, request: &ChainRequest) -> Result<()> {
        let report = validate_chain_request(request);
        if report.is_valid {
            return Ok(());
        }
        let message = report.joined();
        self.store.chain_failed(message.clone());
        Err(AppError::Validation(message))
    }

    fn require_chain_name(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            let message = "Chain name is required".to_string();
            self.store.chain_failed(message.clone());
            return Err(AppError::Validation(message));
        }
        Ok(())
    }

    /// Store a chain returned by the backend and regenerate its layout.
    fn finish_chain_write(
        &self,
        outcome: std::result::Result<ScenarioChain, ServiceError>,
        verb: &str,
    ) -> Result<ScenarioChain> {
        match outcome {
            Ok(chain) => {
                let viz = build_visualization(&chain);
                info!(
                    chain = %chain.name,
                    events = chain.leads_to.len(),
                    nodes = viz.nodes.len(),
                    "Chain {verb}: {}",
                    chain.name,
                );
                self.store.chain_stored(chain.clone(), viz);
                Ok(chain)
            }
            Err(e) => Err(self.chain_failed(e)),
        }
    }

    fn chain_failed(&self, e: ServiceError) -> AppError {
        warn!(status = e.status, "Chain request failed: {}", e.message);
        self.store.chain_failed(e.message.clone());
        e.into()
    }

    // -----------------------------------------------------------------------
    // Selection, settings and batch runs
    // -----------------------------------------------------------------------

    /// Switch portfolio. A real change is announced to the batch trigger.
    pub fn set_current_portfolio(&self, portfolio_id: Option<String>) {
        if !self.store.set_current_portfolio(portfolio_id.clone()) {
            return;
        }
        if let Some(id) = portfolio_id {
            self.send_control(ControlMsg::PortfolioChanged(id));
        }
    }

    pub fn update_settings(&self, update: &SettingsUpdate) -> AnalysisSettings {
        let settings = self.store.update_settings(update);
        self.gate.set_max(settings.max_concurrent_analyses);
        info!(
            max_concurrent = settings.max_concurrent_analyses,
            cache_timeout_secs = settings.cache_timeout.as_secs(),
            auto_refresh = settings.auto_refresh,
            auto_analyze = settings.auto_analyze,
            "Analysis settings updated",
        );
        self.send_control(ControlMsg::SettingsChanged);
        settings
    }

    /// One impact analysis for the whole selection plus one simulation per
    /// selected scenario. All are launched together; each waits for its own
    /// gate slot, so a batch larger than the gate never rejects its members.
    pub async fn run_selected(&self) -> BatchReport {
        let Some(portfolio_id) = self.store.current_portfolio_id() else {
            return BatchReport::default();
        };
        let scenarios = self.store.selected_scenarios();
        if scenarios.is_empty() {
            return BatchReport { portfolio_id: Some(portfolio_id), ..BatchReport::default() };
        }

        let impact_request = ImpactRequest {
            portfolio_id: portfolio_id.clone(),
            scenarios: scenarios.clone(),
            include_recommendations: true,
        };
        let impact = self.analyze_impact_attempt(
            impact_request,
            portfolio_id.clone(),
            0,
            Admission::Queued,
        );
        let simulations = join_all(
            scenarios.iter().map(|s| self.simulate(&portfolio_id, s, Admission::Queued)),
        );
        let (impact, simulations) = tokio::join!(impact, simulations);

        let mut report = BatchReport {
            portfolio_id: Some(portfolio_id),
            impact_succeeded: impact.is_ok(),
            ..BatchReport::default()
        };
        if let Err(e) = impact {
            report.errors.push(e.to_string());
        }
        for outcome in simulations {
            match outcome {
                Ok(result) => report.simulation_ids.push(result.simulation_id),
                Err(e) => {
                    report.simulations_failed += 1;
                    report.errors.push(e.to_string());
                }
            }
        }

        info!(
            portfolio_id = ?report.portfolio_id,
            impact_ok = report.impact_succeeded,
            simulations_ok = report.simulation_ids.len(),
            simulations_failed = report.simulations_failed,
            "Batch analysis finished",
        );
        report
    }

    // -----------------------------------------------------------------------
    // Failure routing
    // -----------------------------------------------------------------------

    /// Replay an operation on behalf of the error handler.
    pub async fn replay(&self, op: RetryableOp, attempt: u32) -> Result<()> {
        match op {
            RetryableOp::LoadScenarios => self.load_scenarios_attempt(attempt).await.map(|_| ()),
            RetryableOp::Simulation { request, simulation_id } => self
                .run_simulation_attempt(request, simulation_id, attempt, Admission::Configured)
                .await
                .map(|_| ()),
            RetryableOp::Impact { request, portfolio_id } => self
                .analyze_impact_attempt(request, portfolio_id, attempt, Admission::Configured)
                .await
                .map(|_| ()),
        }
    }

    async fn admit(&self, admission: Admission) -> Result<AnalysisPermit> {
        match admission {
            Admission::Configured => self.gate.acquire().await,
            Admission::Queued => Ok(self.gate.acquire_queued().await),
        }
    }

    fn report_failure(&self, op: RetryableOp, e: &ServiceError, attempt: u32) {
        self.health.inc_failures();
        if e.is_network() {
            self.health.set_backend_reachable(false);
        }
        let Some(tx) = &self.failure_tx else { return };
        let failure = ServiceFailure { op, message: e.message.clone(), status: e.status, attempt };
        if let Err(err) = tx.try_send(failure) {
            warn!("Error handler channel full, dropping failure: {err}");
        }
    }

    fn send_control(&self, msg: ControlMsg) {
        let Some(tx) = &self.control_tx else { return };
        if let Err(e) = tx.try_send(msg) {
            warn!("Batch trigger channel full: {e}");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::client::fake::FakeScenarioService;
    use crate::config::GateMode;
    use crate::state::scenario_store::SliceErrors;
    use crate::types::ScenarioEvent;

    fn controller_with(service: FakeScenarioService, max: usize) -> ScenarioController {
        let store = ScenarioStore::new(AnalysisSettings {
            max_concurrent_analyses: max,
            ..AnalysisSettings::default()
        });
        ScenarioController::new(Arc::new(service), store, AnalysisGate::new(max, GateMode::Reject))
    }

    fn sim_request(scenario: &str) -> SimulationRequest {
        SimulationRequest {
            portfolio_id: "p1".to_string(),
            starting_scenario: scenario.to_string(),
            num_simulations: 500,
            time_horizon: 12,
            include_custom_chains: false,
        }
    }

    fn chain(name: &str) -> ChainRequest {
        ChainRequest {
            name: name.to_string(),
            initial_impact: BTreeMap::from([("equities".to_string(), -0.2)]),
            leads_to: vec![ScenarioEvent {
                scenario: "recession".to_string(),
                probability: 0.4,
                delay: 2,
                magnitude_modifier: 1.5,
            }],
        }
    }

    #[tokio::test]
    async fn load_scenarios_populates_catalog() {
        let ctl = controller_with(FakeScenarioService::with_catalog(&["recession", "rally"]), 3);
        let before = Instant::now();

        let outcome = ctl.load_scenarios().await.unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded(2));
        assert_eq!(ctl.store().available_scenarios(), vec!["recession", "rally"]);

        let stamped = ctl.store().session().catalog_fetched_at.unwrap();
        assert!(stamped >= before);
        assert!(!ctl.store().should_refresh_scenarios());
    }

    #[tokio::test]
    async fn catalog_is_stamped_with_call_time() {
        let service =
            FakeScenarioService::with_catalog(&["recession"]).with_delay(Duration::from_millis(50));
        let ctl = controller_with(service, 3);

        ctl.load_scenarios().await.unwrap();
        let answered = Instant::now();
        let stamped = ctl.store().session().catalog_fetched_at.unwrap();
        assert!(answered.duration_since(stamped) >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn concurrent_catalog_loads_are_deduplicated() {
        let service = Arc::new(FakeScenarioService::with_catalog(&["recession"]));
        let store = ScenarioStore::new(AnalysisSettings::default());
        let ctl = ScenarioController::new(
            Arc::clone(&service) as Arc<dyn ScenarioService>,
            store,
            AnalysisGate::new(3, GateMode::Reject),
        );

        let (a, b) = tokio::join!(ctl.load_scenarios(), ctl.load_scenarios());
        let outcomes = [a.unwrap(), b.unwrap()];
        assert!(outcomes.contains(&LoadOutcome::AlreadyInFlight));
        assert!(outcomes.contains(&LoadOutcome::Loaded(1)));
        assert_eq!(service.catalog_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_catalog_load_keeps_previous_list() {
        let service = Arc::new(FakeScenarioService::with_catalog(&["recession"]));
        let ctl = ScenarioController::new(
            Arc::clone(&service) as Arc<dyn ScenarioService>,
            ScenarioStore::new(AnalysisSettings::default()),
            AnalysisGate::new(3, GateMode::Reject),
        );
        ctl.load_scenarios().await.unwrap();

        service.fail_next("backend down", 503);
        assert!(ctl.load_scenarios().await.is_err());
        assert_eq!(ctl.store().available_scenarios(), vec!["recession"]);
        assert_eq!(ctl.store().errors().scenarios.as_deref(), Some("backend down"));
    }

    #[tokio::test]
    async fn invalid_simulation_fails_before_network_and_gate() {
        let service = Arc::new(FakeScenarioService::default());
        let ctl = ScenarioController::new(
            Arc::clone(&service) as Arc<dyn ScenarioService>,
            ScenarioStore::new(AnalysisSettings::default()),
            AnalysisGate::new(3, GateMode::Reject),
        );

        let mut req = sim_request("");
        req.num_simulations = 0;
        let err = ctl.run_simulation(req, "sim-1".to_string()).await.unwrap_err();
        match err {
            AppError::Validation(msg) => assert_eq!(
                msg,
                "Starting scenario is required, Number of simulations must be greater than 0"
            ),
            other => panic!("expected validation error, got {other}"),
        }
        assert_eq!(service.simulate_calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctl.active_analyses(), 0);
        assert!(ctl.store().errors().simulation.is_some());
    }

    #[tokio::test]
    async fn simulation_result_is_stored_under_caller_id() {
        let ctl = controller_with(FakeScenarioService::default(), 3);
        let result = ctl
            .run_simulation(sim_request("recession"), "p1_recession_1".to_string())
            .await
            .unwrap();
        assert_eq!(result.simulation_id, "p1_recession_1");
        assert_eq!(ctl.store().simulation("p1_recession_1"), Some(result));
        assert_eq!(ctl.active_analyses(), 0);
        assert_eq!(ctl.latency().snapshot().samples, 1);
    }

    #[tokio::test]
    async fn gate_counter_returns_to_zero_after_failure() {
        let service = FakeScenarioService::default();
        service.fail_next("simulation engine crashed", 500);
        let ctl = controller_with(service, 3);

        let err = ctl.run_simulation(sim_request("recession"), "s1".to_string()).await;
        assert!(matches!(err, Err(AppError::Service(ServiceError { status: 500, .. }))));
        assert_eq!(ctl.active_analyses(), 0);
        assert!(!ctl.store().is_any_loading());
        assert_eq!(ctl.store().errors().simulation.as_deref(), Some("simulation engine crashed"));
    }

    #[tokio::test]
    async fn fourth_concurrent_simulation_is_rejected() {
        let service = FakeScenarioService::default().with_delay(Duration::from_millis(50));
        let ctl = controller_with(service, 3);

        let (a, b, c, d) = tokio::join!(
            ctl.run_simulation(sim_request("recession"), "s1".to_string()),
            ctl.run_simulation(sim_request("rally"), "s2".to_string()),
            ctl.run_simulation(sim_request("rate_hike"), "s3".to_string()),
            ctl.run_simulation(sim_request("oil_shock"), "s4".to_string()),
        );

        let outcomes = [a, b, c, d];
        let rejected = outcomes
            .iter()
            .filter(|r| matches!(r, Err(AppError::CapacityReached(3))))
            .count();
        let ok = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(rejected, 1);
        assert_eq!(ok, 3);
        assert_eq!(ctl.active_analyses(), 0);
    }

    #[tokio::test]
    async fn impact_overwrites_previous_result_for_portfolio() {
        let ctl = controller_with(FakeScenarioService::default(), 3);
        let req = |scenarios: &[&str]| ImpactRequest {
            portfolio_id: "p1".to_string(),
            scenarios: scenarios.iter().map(|s| s.to_string()).collect(),
            include_recommendations: false,
        };

        ctl.analyze_impact(req(&["recession"]), "p1".to_string()).await.unwrap();
        ctl.analyze_impact(req(&["rally", "rate_hike"]), "p1".to_string()).await.unwrap();

        let stored = ctl.store().impact("p1").unwrap();
        assert_eq!(stored.scenario_impacts.len(), 2);
        assert_eq!(stored.scenario_impacts[0].scenario, "rally");
    }

    #[tokio::test]
    async fn chain_crud_keeps_visualization_in_step() {
        let ctl = controller_with(FakeScenarioService::default(), 3);

        ctl.create_chain(chain("stagflation")).await.unwrap();
        let viz = ctl.store().visualization("stagflation").unwrap();
        assert_eq!(viz.nodes.len(), 2);

        let mut modified = chain("stagflation");
        modified.leads_to.push(ScenarioEvent {
            scenario: "rally".to_string(),
            probability: 0.1,
            delay: 8,
            magnitude_modifier: 0.5,
        });
        ctl.modify_chain(modified).await.unwrap();
        assert_eq!(ctl.store().visualization("stagflation").unwrap().nodes.len(), 3);

        ctl.store().set_selected_chain(Some("stagflation".to_string()));
        ctl.delete_chain("stagflation").await.unwrap();
        assert!(ctl.store().chain("stagflation").is_none());
        assert!(ctl.store().visualization("stagflation").is_none());
        assert!(ctl.store().selected_chain().is_none());
        assert_eq!(ctl.store().session().selected_chain, None);
    }

    #[tokio::test]
    async fn invalid_chain_records_error_without_loading() {
        let ctl = controller_with(FakeScenarioService::default(), 3);
        let mut bad = chain("");
        bad.initial_impact.clear();
        let err = ctl.create_chain(bad).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(ctl.store().errors().chains.is_some());
        assert!(!ctl.store().is_any_loading());
    }

    #[tokio::test]
    async fn run_selected_fans_out_through_the_gate() {
        let service = FakeScenarioService::default().with_delay(Duration::from_millis(20));
        let ctl = controller_with(service, 3);
        ctl.store().set_selected_scenarios(vec!["recession".to_string(), "rally".to_string()]);
        ctl.set_current_portfolio(Some("p1".to_string()));

        let report = ctl.run_selected().await;
        assert!(report.impact_succeeded);
        assert_eq!(report.simulation_ids.len(), 2);
        assert_eq!(report.simulations_failed, 0);
        assert!(ctl.store().impact("p1").is_some());
        assert!(report.simulation_ids.iter().all(|id| id.starts_with("p1_")));
        assert_eq!(ctl.active_analyses(), 0);
    }

    #[tokio::test]
    async fn clearing_cache_mid_flight_drops_the_late_result() {
        let service = FakeScenarioService::default().with_delay(Duration::from_millis(50));
        let ctl = controller_with(service, 3);

        let clear = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            ctl.store().clear_simulation_cache();
        };
        let (result, ()) = tokio::join!(
            ctl.run_simulation(sim_request("recession"), "s1".to_string()),
            clear,
        );

        // The caller still gets its answer; the cache does not.
        assert_eq!(result.unwrap().simulation_id, "s1");
        assert!(ctl.store().simulation("s1").is_none());
        assert!(!ctl.store().is_any_loading());
    }

    #[tokio::test]
    async fn batch_larger_than_gate_queues_instead_of_rejecting() {
        let service = FakeScenarioService::default().with_delay(Duration::from_millis(20));
        let ctl = controller_with(service, 3);
        ctl.store().set_selected_scenarios(vec![
            "recession".to_string(),
            "rally".to_string(),
            "rate_hike".to_string(),
        ]);
        ctl.set_current_portfolio(Some("p1".to_string()));

        let report = ctl.run_selected().await;
        assert!(report.impact_succeeded);
        assert_eq!(report.simulation_ids.len(), 3);
        assert_eq!(report.simulations_failed, 0);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(ctl.store().errors(), SliceErrors::default());
        assert_eq!(ctl.active_analyses(), 0);
    }

    #[tokio::test]
    async fn run_selected_without_portfolio_is_a_no_op() {
        let ctl = controller_with(FakeScenarioService::default(), 3);
        ctl.store().set_selected_scenarios(vec!["recession".to_string()]);
        let report = ctl.run_selected().await;
        assert!(report.portfolio_id.is_none());
        assert!(report.simulation_ids.is_empty());
    }

    #[tokio::test]
    async fn failures_and_control_messages_are_routed() {
        let service = FakeScenarioService::default();
        service.fail_next("offline", 0);
        let (failure_tx, mut failure_rx) = mpsc::channel(8);
        let (control_tx, mut control_rx) = mpsc::channel(8);
        let ctl = controller_with(service, 3).with_channels(failure_tx, control_tx);

        let _ = ctl.load_scenarios().await;
        let failure = failure_rx.try_recv().expect("failure routed");
        assert_eq!(failure.op, RetryableOp::LoadScenarios);
        assert_eq!(failure.status, 0);
        assert_eq!(failure.attempt, 0);
        assert!(!ctl.health().backend_reachable());

        ctl.set_current_portfolio(Some("p9".to_string()));
        ctl.set_current_portfolio(Some("p9".to_string()));
        assert_eq!(control_rx.try_recv().unwrap(), ControlMsg::PortfolioChanged("p9".to_string()));
        assert!(control_rx.try_recv().is_err(), "unchanged portfolio must not re-trigger");
    }

    #[test]
    fn simulation_ids_are_unique_within_a_millisecond() {
        let ctl = controller_with(FakeScenarioService::default(), 3);
        let a = ctl.new_simulation_id("p1", "recession");
        let b = ctl.new_simulation_id("p1", "recession");
        assert_ne!(a, b);
        assert!(a.starts_with("p1_recession_"));
    }

    #[test]
    fn settings_update_resizes_gate() {
        let ctl = controller_with(FakeScenarioService::default(), 3);
        ctl.update_settings(&SettingsUpdate {
            max_concurrent_analyses: Some(5),
            ..SettingsUpdate::default()
        });
        assert_eq!(ctl.gate.max(), 5);
    }
}
