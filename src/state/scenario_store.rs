use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::{Config, DEFAULT_NUM_SIMULATIONS, DEFAULT_TIME_HORIZON};
use crate::state::cache::TtlCache;
use crate::types::{ImpactResult, ScenarioChain, ScenarioId, SimulationResult, VisualizationData};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSettings {
    pub max_concurrent_analyses: usize,
    #[serde(rename = "cacheTimeoutSecs", serialize_with = "serialize_secs")]
    pub cache_timeout: Duration,
    pub auto_refresh: bool,
    pub auto_analyze: bool,
    pub default_num_simulations: u32,
    pub default_time_horizon: u32,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl AnalysisSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_concurrent_analyses: cfg.max_concurrent_analyses,
            cache_timeout: cfg.cache_timeout,
            auto_refresh: cfg.auto_refresh,
            auto_analyze: cfg.auto_analyze,
            ..Self::default()
        }
    }
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            max_concurrent_analyses: crate::config::DEFAULT_MAX_CONCURRENT_ANALYSES,
            cache_timeout: Duration::from_secs(crate::config::DEFAULT_CACHE_TIMEOUT_SECS),
            auto_refresh: true,
            auto_analyze: true,
            default_num_simulations: DEFAULT_NUM_SIMULATIONS,
            default_time_horizon: DEFAULT_TIME_HORIZON,
        }
    }
}

/// Partial settings patch; `None` fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub max_concurrent_analyses: Option<usize>,
    pub cache_timeout_secs: Option<u64>,
    pub auto_refresh: Option<bool>,
    pub auto_analyze: Option<bool>,
    pub default_num_simulations: Option<u32>,
    pub default_time_horizon: Option<u32>,
}

// ---------------------------------------------------------------------------
// Loading flags and error slots
// ---------------------------------------------------------------------------

/// Analyses can overlap, so those two flags are in-flight counts.
#[derive(Debug, Clone, Default)]
pub(crate) struct LoadingFlags {
    pub scenarios: bool,
    pub simulations_in_flight: usize,
    pub impacts_in_flight: usize,
    pub chains: bool,
}

/// One error message per slice of state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SliceErrors {
    pub scenarios: Option<String>,
    pub simulation: Option<String>,
    pub impact: Option<String>,
    pub chains: Option<String>,
}

impl SliceErrors {
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_none()
            && self.simulation.is_none()
            && self.impact.is_none()
            && self.chains.is_none()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Session {
    pub available_scenarios: Vec<ScenarioId>,
    /// When the catalog was last fetched successfully. None until the first load.
    pub catalog_fetched_at: Option<Instant>,
    pub selected_scenarios: Vec<ScenarioId>,
    pub selected_chain: Option<String>,
    pub current_portfolio_id: Option<String>,
    pub loading: LoadingFlags,
    pub errors: SliceErrors,
    pub settings: AnalysisSettings,
    /// Bumped by every clear of the matching cache.
    pub simulation_generation: u64,
    pub impact_generation: u64,
}

// ---------------------------------------------------------------------------
// ScenarioStore
// ---------------------------------------------------------------------------

/// Client-side scenario state. Each method is one state transition; reads
/// live in `selectors.rs`.
pub struct ScenarioStore {
    /// simulation_id → result
    pub(crate) simulations: TtlCache<SimulationResult>,
    /// portfolio_id → latest impact analysis
    pub(crate) impacts: TtlCache<ImpactResult>,
    /// chain name → chain
    pub(crate) chains: DashMap<String, ScenarioChain>,
    /// chain name → layout, regenerated whenever the chain is written
    pub(crate) visualizations: DashMap<String, VisualizationData>,
    session: Mutex<Session>,
}

impl ScenarioStore {
    pub fn new(settings: AnalysisSettings) -> Arc<Self> {
        Arc::new(Self::with_settings(settings))
    }

    fn with_settings(settings: AnalysisSettings) -> Self {
        Self {
            simulations: TtlCache::new(),
            impacts: TtlCache::new(),
            chains: DashMap::new(),
            visualizations: DashMap::new(),
            session: Mutex::new(Session { settings, ..Session::default() }),
        }
    }

    pub(crate) fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- catalog ---

    /// Marks the catalog load as started. Returns false if one is already in flight.
    pub fn scenarios_started(&self) -> bool {
        let mut s = self.session();
        if s.loading.scenarios {
            return false;
        }
        s.loading.scenarios = true;
        s.errors.scenarios = None;
        true
    }

    pub fn scenarios_loaded(&self, scenarios: Vec<ScenarioId>, fetched_at: Instant) {
        let mut s = self.session();
        s.loading.scenarios = false;
        s.available_scenarios = scenarios;
        s.catalog_fetched_at = Some(fetched_at);
    }

    pub fn scenarios_failed(&self, message: String) {
        let mut s = self.session();
        s.loading.scenarios = false;
        s.errors.scenarios = Some(message);
    }

    // --- simulations ---

    /// Returns the cache generation the result must be written back under.
    pub fn simulation_started(&self) -> u64 {
        let mut s = self.session();
        s.loading.simulations_in_flight += 1;
        s.errors.simulation = None;
        s.simulation_generation
    }

    /// Stores the result unless the cache was cleared since `generation`.
    /// Returns whether it was stored.
    pub fn simulation_succeeded(
        &self,
        simulation_id: &str,
        result: SimulationResult,
        generation: u64,
    ) -> bool {
        let mut s = self.session();
        s.loading.simulations_in_flight = s.loading.simulations_in_flight.saturating_sub(1);
        let current = s.simulation_generation == generation;
        if current {
            self.simulations.insert(simulation_id, result);
        }
        current
    }

    /// `in_flight` is false for failures raised before the request started
    /// (validation, gate), which never bumped the counter.
    pub fn simulation_failed(&self, message: String, in_flight: bool) {
        let mut s = self.session();
        if in_flight {
            s.loading.simulations_in_flight = s.loading.simulations_in_flight.saturating_sub(1);
        }
        s.errors.simulation = Some(message);
    }

    // --- impact ---

    pub fn impact_started(&self) -> u64 {
        let mut s = self.session();
        s.loading.impacts_in_flight += 1;
        s.errors.impact = None;
        s.impact_generation
    }

    pub fn impact_succeeded(
        &self,
        portfolio_id: &str,
        result: ImpactResult,
        generation: u64,
    ) -> bool {
        let mut s = self.session();
        s.loading.impacts_in_flight = s.loading.impacts_in_flight.saturating_sub(1);
        let current = s.impact_generation == generation;
        if current {
            self.impacts.insert(portfolio_id, result);
        }
        current
    }

    pub fn impact_failed(&self, message: String, in_flight: bool) {
        let mut s = self.session();
        if in_flight {
            s.loading.impacts_in_flight = s.loading.impacts_in_flight.saturating_sub(1);
        }
        s.errors.impact = Some(message);
    }

    // --- chains ---

    pub fn chain_started(&self) {
        let mut s = self.session();
        s.loading.chains = true;
        s.errors.chains = None;
    }

    pub fn chain_stored(&self, chain: ScenarioChain, visualization: VisualizationData) {
        self.visualizations.insert(chain.name.clone(), visualization);
        self.chains.insert(chain.name.clone(), chain);
        self.session().loading.chains = false;
    }

    pub fn chain_deleted(&self, name: &str) {
        self.chains.remove(name);
        self.visualizations.remove(name);
        let mut s = self.session();
        s.loading.chains = false;
        if s.selected_chain.as_deref() == Some(name) {
            s.selected_chain = None;
        }
    }

    pub fn chain_failed(&self, message: String) {
        let mut s = self.session();
        s.loading.chains = false;
        s.errors.chains = Some(message);
    }

    // --- selection ---

    pub fn set_selected_scenarios(&self, scenarios: Vec<ScenarioId>) {
        let mut deduped: Vec<ScenarioId> = Vec::with_capacity(scenarios.len());
        for s in scenarios {
            if !deduped.contains(&s) {
                deduped.push(s);
            }
        }
        self.session().selected_scenarios = deduped;
    }

    pub fn set_selected_chain(&self, name: Option<String>) {
        self.session().selected_chain = name;
    }

    /// Returns true if the portfolio actually changed.
    pub fn set_current_portfolio(&self, portfolio_id: Option<String>) -> bool {
        let mut s = self.session();
        if s.current_portfolio_id == portfolio_id {
            return false;
        }
        s.current_portfolio_id = portfolio_id;
        true
    }

    // --- settings ---

    pub fn update_settings(&self, update: &SettingsUpdate) -> AnalysisSettings {
        let mut s = self.session();
        let settings = &mut s.settings;
        if let Some(max) = update.max_concurrent_analyses {
            settings.max_concurrent_analyses = max.max(1);
        }
        if let Some(secs) = update.cache_timeout_secs {
            settings.cache_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = update.auto_refresh {
            settings.auto_refresh = v;
        }
        if let Some(v) = update.auto_analyze {
            settings.auto_analyze = v;
        }
        if let Some(n) = update.default_num_simulations {
            settings.default_num_simulations = n;
        }
        if let Some(h) = update.default_time_horizon {
            settings.default_time_horizon = h;
        }
        settings.clone()
    }

    // --- cache maintenance ---

    // Clears hold the session lock so a completing request cannot slip its
    // result in between the generation bump and the clear.

    /// Requests still in flight finish normally but their results are dropped.
    pub fn clear_simulation_cache(&self) {
        let mut s = self.session();
        s.simulation_generation += 1;
        self.simulations.clear();
    }

    pub fn clear_impact_cache(&self) {
        let mut s = self.session();
        s.impact_generation += 1;
        self.impacts.clear();
    }

    /// Clears every result cache and forgets the catalog timestamp so the
    /// next refresh tick reloads it.
    pub fn clear_all_cache(&self) {
        let mut s = self.session();
        s.simulation_generation += 1;
        s.impact_generation += 1;
        s.catalog_fetched_at = None;
        self.simulations.clear();
        self.impacts.clear();
    }

    pub fn clear_errors(&self) {
        self.session().errors = SliceErrors::default();
    }

    /// Per-key TTL eviction. Returns `(simulations_removed, impacts_removed)`.
    pub fn evict_expired(&self, now: Instant) -> (usize, usize) {
        let ttl = self.session().settings.cache_timeout;
        (
            self.simulations.evict_expired_at(now, ttl),
            self.impacts.evict_expired_at(now, ttl),
        )
    }
}

impl Default for ScenarioStore {
    fn default() -> Self {
        Self::with_settings(AnalysisSettings::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
