//! Read-only derivations over `ScenarioStore`.

use std::time::Instant;

use serde::Serialize;

use crate::state::scenario_store::{AnalysisSettings, ScenarioStore, SliceErrors};
use crate::types::{
    ImpactResult, ScenarioChain, ScenarioId, ScenarioImpact, SimulationResult, VisualizationData,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainComplexity {
    pub name: String,
    pub complexity: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingSummary {
    pub scenarios: bool,
    pub simulation: bool,
    pub impact: bool,
    pub chains: bool,
}

/// Everything the UI needs for one render, in one read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSummary {
    pub available_scenarios: Vec<ScenarioId>,
    /// Age of the catalog in milliseconds; None before the first load.
    pub catalog_age_ms: Option<u64>,
    pub selected_scenarios: Vec<ScenarioId>,
    pub selected_chain: Option<String>,
    pub current_portfolio_id: Option<String>,
    pub loading: LoadingSummary,
    pub is_any_loading: bool,
    pub errors: SliceErrors,
    pub settings: AnalysisSettings,
    pub worst_case: Option<ScenarioImpact>,
    pub best_case: Option<ScenarioImpact>,
    pub average_impact: Option<f64>,
    pub chain_complexity: Vec<ChainComplexity>,
    pub cached_simulations: usize,
    pub cached_impacts: usize,
    pub can_run_simulation: bool,
    pub can_analyze_impact: bool,
}

impl ScenarioStore {
    // --- per-key lookups ---

    pub fn simulation(&self, simulation_id: &str) -> Option<SimulationResult> {
        self.simulations.get(simulation_id)
    }

    pub fn impact(&self, portfolio_id: &str) -> Option<ImpactResult> {
        self.impacts.get(portfolio_id)
    }

    /// Impact result for `portfolio_id` only if younger than the cache timeout.
    pub fn fresh_impact_at(&self, portfolio_id: &str, now: Instant) -> Option<ImpactResult> {
        let ttl = self.settings().cache_timeout;
        self.impacts.get_fresh_at(portfolio_id, now, ttl)
    }

    pub fn chain(&self, name: &str) -> Option<ScenarioChain> {
        self.chains.get(name).map(|c| c.clone())
    }

    pub fn visualization(&self, name: &str) -> Option<VisualizationData> {
        self.visualizations.get(name).map(|v| v.clone())
    }

    pub fn selected_chain(&self) -> Option<ScenarioChain> {
        let name = self.session().selected_chain.clone()?;
        self.chain(&name)
    }

    // --- plain session reads ---

    pub fn available_scenarios(&self) -> Vec<ScenarioId> {
        self.session().available_scenarios.clone()
    }

    pub fn selected_scenarios(&self) -> Vec<ScenarioId> {
        self.session().selected_scenarios.clone()
    }

    pub fn current_portfolio_id(&self) -> Option<String> {
        self.session().current_portfolio_id.clone()
    }

    pub fn settings(&self) -> AnalysisSettings {
        self.session().settings.clone()
    }

    pub fn errors(&self) -> SliceErrors {
        self.session().errors.clone()
    }

    pub fn is_any_loading(&self) -> bool {
        let s = self.session();
        s.loading.scenarios
            || s.loading.simulations_in_flight > 0
            || s.loading.impacts_in_flight > 0
            || s.loading.chains
    }

    // --- aggregates over the current portfolio's impact result ---

    fn current_impacts(&self) -> Vec<ScenarioImpact> {
        self.current_portfolio_id()
            .and_then(|p| self.impact(&p))
            .map(|r| r.scenario_impacts)
            .unwrap_or_default()
    }

    /// Most negative portfolio impact.
    pub fn worst_case_scenario(&self) -> Option<ScenarioImpact> {
        self.current_impacts()
            .into_iter()
            .min_by(|a, b| a.portfolio_impact.total_cmp(&b.portfolio_impact))
    }

    pub fn best_case_scenario(&self) -> Option<ScenarioImpact> {
        self.current_impacts()
            .into_iter()
            .max_by(|a, b| a.portfolio_impact.total_cmp(&b.portfolio_impact))
    }

    pub fn average_impact(&self) -> Option<f64> {
        let impacts = self.current_impacts();
        if impacts.is_empty() {
            return None;
        }
        let total: f64 = impacts.iter().map(|i| i.portfolio_impact).sum();
        Some(total / impacts.len() as f64)
    }

    /// Chains ordered by descending complexity, ties broken by name.
    pub fn chain_complexity_ranking(&self) -> Vec<ChainComplexity> {
        let mut ranking: Vec<ChainComplexity> = self
            .chains
            .iter()
            .map(|c| ChainComplexity { name: c.key().clone(), complexity: c.complexity() })
            .collect();
        ranking.sort_by(|a, b| b.complexity.cmp(&a.complexity).then_with(|| a.name.cmp(&b.name)));
        ranking
    }

    // --- capability predicates ---

    pub fn can_run_simulation(&self) -> bool {
        let s = self.session();
        !s.selected_scenarios.is_empty()
            && s.current_portfolio_id.is_some()
            && s.loading.simulations_in_flight == 0
    }

    pub fn can_analyze_impact(&self) -> bool {
        let s = self.session();
        !s.selected_scenarios.is_empty()
            && s.current_portfolio_id.is_some()
            && s.loading.impacts_in_flight == 0
    }

    /// True when there is no catalog yet or it is older than the cache timeout.
    pub fn should_refresh_scenarios_at(&self, now: Instant) -> bool {
        let s = self.session();
        match s.catalog_fetched_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) > s.settings.cache_timeout,
        }
    }

    pub fn should_refresh_scenarios(&self) -> bool {
        self.should_refresh_scenarios_at(Instant::now())
    }

    pub fn summary(&self) -> ScenarioSummary {
        // Aggregates take the session lock themselves, so compute them first.
        let worst_case = self.worst_case_scenario();
        let best_case = self.best_case_scenario();
        let average_impact = self.average_impact();
        let chain_complexity = self.chain_complexity_ranking();
        let can_run_simulation = self.can_run_simulation();
        let can_analyze_impact = self.can_analyze_impact();
        let is_any_loading = self.is_any_loading();

        let now = Instant::now();
        let s = self.session();
        ScenarioSummary {
            available_scenarios: s.available_scenarios.clone(),
            catalog_age_ms: s
                .catalog_fetched_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            selected_scenarios: s.selected_scenarios.clone(),
            selected_chain: s.selected_chain.clone(),
            current_portfolio_id: s.current_portfolio_id.clone(),
            loading: LoadingSummary {
                scenarios: s.loading.scenarios,
                simulation: s.loading.simulations_in_flight > 0,
                impact: s.loading.impacts_in_flight > 0,
                chains: s.loading.chains,
            },
            is_any_loading,
            errors: s.errors.clone(),
            settings: s.settings.clone(),
            worst_case,
            best_case,
            average_impact,
            chain_complexity,
            cached_simulations: self.simulations.len(),
            cached_impacts: self.impacts.len(),
            can_run_simulation,
            can_analyze_impact,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;

    use super::*;
    use crate::types::ScenarioEvent;

    fn impact(scenario: &str, value: f64) -> ScenarioImpact {
        ScenarioImpact {
            scenario: scenario.to_string(),
            portfolio_impact: value,
            asset_impacts: HashMap::new(),
        }
    }

    fn store_with_impacts() -> ScenarioStore {
        let store = ScenarioStore::default();
        store.set_current_portfolio(Some("p1".to_string()));
        store.impacts.insert(
            "p1",
            ImpactResult {
                portfolio_id: "p1".to_string(),
                scenario_impacts: vec![
                    impact("recession", -0.18),
                    impact("rally", 0.07),
                    impact("rate_hike", -0.04),
                ],
                vulnerabilities: vec![],
                recommended_actions: vec![],
            },
        );
        store
    }

    #[test]
    fn worst_and_best_case_follow_portfolio_impact() {
        let store = store_with_impacts();
        assert_eq!(store.worst_case_scenario().unwrap().scenario, "recession");
        assert_eq!(store.best_case_scenario().unwrap().scenario, "rally");
        let avg = store.average_impact().unwrap();
        assert!((avg - (-0.05)).abs() < 1e-9, "avg={avg}");
    }

    #[test]
    fn aggregates_are_empty_without_current_portfolio() {
        let store = store_with_impacts();
        store.set_current_portfolio(None);
        assert!(store.worst_case_scenario().is_none());
        assert!(store.average_impact().is_none());
    }

    #[test]
    fn can_run_simulation_needs_selection_portfolio_and_idle() {
        let store = ScenarioStore::default();
        assert!(!store.can_run_simulation());

        store.set_selected_scenarios(vec!["recession".to_string()]);
        assert!(!store.can_run_simulation());

        store.set_current_portfolio(Some("p1".to_string()));
        assert!(store.can_run_simulation());

        store.simulation_started();
        assert!(!store.can_run_simulation());
        // Impact gating is independent of simulation loading.
        assert!(store.can_analyze_impact());
    }

    #[test]
    fn should_refresh_is_strictly_greater_than_timeout() {
        let store = ScenarioStore::default();
        let t0 = Instant::now();
        assert!(store.should_refresh_scenarios_at(t0));

        store.scenarios_loaded(vec!["recession".to_string()], t0);
        let ttl = Duration::from_secs(300);
        assert!(!store.should_refresh_scenarios_at(t0 + ttl));
        assert!(store.should_refresh_scenarios_at(t0 + ttl + Duration::from_millis(1)));
    }

    #[test]
    fn complexity_ranking_orders_desc_then_by_name() {
        let store = ScenarioStore::default();
        let event = ScenarioEvent {
            scenario: "recession".to_string(),
            probability: 0.5,
            delay: 2,
            magnitude_modifier: 1.0,
        };
        for (name, events) in [("beta", 0usize), ("alpha", 0), ("gamma", 2)] {
            store.chains.insert(
                name.to_string(),
                ScenarioChain {
                    name: name.to_string(),
                    initial_impact: BTreeMap::from([("equities".to_string(), -0.1)]),
                    leads_to: vec![event.clone(); events],
                },
            );
        }

        let names: Vec<String> =
            store.chain_complexity_ranking().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["gamma", "alpha", "beta"]);
    }

    #[test]
    fn summary_reports_loading_and_selected_chain() {
        let store = store_with_impacts();
        store.chains.insert(
            "stagflation".to_string(),
            ScenarioChain {
                name: "stagflation".to_string(),
                initial_impact: BTreeMap::from([("equities".to_string(), -0.2)]),
                leads_to: vec![],
            },
        );
        store.set_selected_chain(Some("stagflation".to_string()));
        store.impact_started();

        let summary = store.summary();
        assert!(summary.is_any_loading);
        assert!(summary.loading.impact);
        assert_eq!(summary.worst_case.unwrap().scenario, "recession");
        assert_eq!(store.selected_chain().unwrap().name, "stagflation");

        store.set_selected_chain(Some("missing".to_string()));
        assert!(store.selected_chain().is_none());
    }

    #[test]
    fn fresh_impact_hides_stale_entries() {
        let store = store_with_impacts();
        let later = Instant::now() + Duration::from_secs(301);
        assert!(store.fresh_impact_at("p1", later).is_none());
        assert!(store.impact("p1").is_some());
    }
}
