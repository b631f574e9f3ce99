//! In-memory `ScenarioService` for controller tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{ScenarioService, ServiceResult};
use crate::error::ServiceError;
use crate::types::{
    ChainRequest, ImpactRequest, ImpactResult, ScenarioCatalog, ScenarioChain, ScenarioImpact,
    SimulationRequest, SimulationResult,
};

#[derive(Default)]
pub struct FakeScenarioService {
    pub catalog: Mutex<Vec<String>>,
    pub chains: Mutex<HashMap<String, ScenarioChain>>,
    /// Failures handed out (front first) before calls start succeeding.
    pub failures: Mutex<VecDeque<ServiceError>>,
    /// Artificial latency for catalog, simulate and impact calls.
    pub delay: Option<Duration>,
    pub catalog_calls: AtomicUsize,
    pub simulate_calls: AtomicUsize,
    pub impact_calls: AtomicUsize,
}

impl FakeScenarioService {
    pub fn with_catalog(scenarios: &[&str]) -> Self {
        Self {
            catalog: Mutex::new(scenarios.iter().map(|s| s.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_next(&self, message: &str, status: u16) {
        self.failures
            .lock()
            .unwrap()
            .push_back(ServiceError { message: message.to_string(), status });
    }

    fn take_failure(&self) -> ServiceResult<()> {
        match self.failures.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn pause(&self) {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
    }
}

/// Deterministic impact for a scenario id: longer ids hurt more.
pub fn fake_impact(scenario: &str) -> f64 {
    -(scenario.len() as f64) / 100.0
}

#[async_trait::async_trait]
impl ScenarioService for FakeScenarioService {
    async fn available_scenarios(&self) -> ServiceResult<ScenarioCatalog> {
        self.catalog_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.pause().await;
        self.take_failure()?;
        Ok(ScenarioCatalog { scenarios: self.catalog.lock().unwrap().clone() })
    }

    async fn simulate_chain(&self, req: &SimulationRequest) -> ServiceResult<SimulationResult> {
        self.simulate_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.take_failure()?;
        let shock = fake_impact(&req.starting_scenario);
        Ok(SimulationResult {
            simulation_id: String::new(),
            starting_scenario: req.starting_scenario.clone(),
            expected_return: shock / 2.0,
            var_95: shock,
            cvar_95: shock * 1.2,
            worst_case: shock * 1.5,
            best_case: 0.05,
            probability_of_loss: 0.6,
            event_frequencies: HashMap::from([(req.starting_scenario.clone(), 1.0)]),
        })
    }

    async fn analyze_impact(&self, req: &ImpactRequest) -> ServiceResult<ImpactResult> {
        self.impact_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.take_failure()?;
        Ok(ImpactResult {
            portfolio_id: req.portfolio_id.clone(),
            scenario_impacts: req
                .scenarios
                .iter()
                .map(|s| ScenarioImpact {
                    scenario: s.clone(),
                    portfolio_impact: fake_impact(s),
                    asset_impacts: HashMap::new(),
                })
                .collect(),
            vulnerabilities: vec![],
            recommended_actions: vec![],
        })
    }

    async fn create_chain(&self, req: &ChainRequest) -> ServiceResult<ScenarioChain> {
        self.take_failure()?;
        self.chains.lock().unwrap().insert(req.name.clone(), req.clone());
        Ok(req.clone())
    }

    async fn modify_chain(&self, req: &ChainRequest) -> ServiceResult<ScenarioChain> {
        self.take_failure()?;
        let mut chains = self.chains.lock().unwrap();
        if !chains.contains_key(&req.name) {
            return Err(ServiceError { message: "chain not found".to_string(), status: 404 });
        }
        chains.insert(req.name.clone(), req.clone());
        Ok(req.clone())
    }

    async fn get_chain(&self, name: &str) -> ServiceResult<ScenarioChain> {
        self.take_failure()?;
        self.chains
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError { message: "chain not found".to_string(), status: 404 })
    }

    async fn delete_chain(&self, name: &str) -> ServiceResult<()> {
        self.take_failure()?;
        self.chains.lock().unwrap().remove(name);
        Ok(())
    }
}
