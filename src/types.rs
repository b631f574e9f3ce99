use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Scenario catalog and chains
// ---------------------------------------------------------------------------

/// Scenario identifiers are plain strings (`"recession"`, `"rate_hike"`).
pub type ScenarioId = String;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioCatalog {
    pub scenarios: Vec<ScenarioId>,
}

/// A conditional follow-on event inside a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioEvent {
    pub scenario: ScenarioId,
    /// 0.0–1.0
    pub probability: f64,
    /// Periods after the parent event.
    pub delay: u32,
    pub magnitude_modifier: f64,
}

/// Named composite scenario. The name is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioChain {
    pub name: String,
    /// factor → impact (e.g. `"equities" → -0.25`)
    #[serde(default)]
    pub initial_impact: BTreeMap<String, f64>,
    #[serde(default)]
    pub leads_to: Vec<ScenarioEvent>,
}

impl ScenarioChain {
    /// Events + impact factors + events that fire after a delay.
    pub fn complexity(&self) -> usize {
        let delayed = self.leads_to.iter().filter(|e| e.delay > 0).count();
        self.leads_to.len() + self.initial_impact.len() + delayed
    }
}

/// Create/modify payload. Same shape as the chain itself.
pub type ChainRequest = ScenarioChain;

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    pub portfolio_id: String,
    pub starting_scenario: ScenarioId,
    pub num_simulations: u32,
    /// Periods to simulate forward.
    pub time_horizon: u32,
    #[serde(default)]
    pub include_custom_chains: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    #[serde(default)]
    pub simulation_id: String,
    pub starting_scenario: ScenarioId,
    pub expected_return: f64,
    pub var_95: f64,
    pub cvar_95: f64,
    pub worst_case: f64,
    pub best_case: f64,
    pub probability_of_loss: f64,
    /// scenario → fraction of paths in which it fired
    #[serde(default)]
    pub event_frequencies: HashMap<ScenarioId, f64>,
}

// ---------------------------------------------------------------------------
// Impact analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactRequest {
    pub portfolio_id: String,
    pub scenarios: Vec<ScenarioId>,
    #[serde(default)]
    pub include_recommendations: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioImpact {
    pub scenario: ScenarioId,
    /// Fractional change in portfolio value (-0.12 = -12%).
    pub portfolio_impact: f64,
    #[serde(default)]
    pub asset_impacts: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactResult {
    pub portfolio_id: String,
    pub scenario_impacts: Vec<ScenarioImpact>,
    #[serde(default)]
    pub vulnerabilities: Vec<String>,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self { is_valid: errors.is_empty(), errors }
    }

    /// Human-readable message for the error slot, e.g. `"a, b"`.
    pub fn joined(&self) -> String {
        self.errors.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Chain visualization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VizNode {
    pub id: String,
    pub label: String,
    /// Tree depth: 0 for the chain root, 1 for its follow-on events.
    pub level: u32,
    /// Horizontal slot within the level.
    pub column: u32,
    /// Periods after the root event.
    pub at_period: u32,
    pub probability: f64,
    pub magnitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VizEdge {
    pub from: String,
    pub to: String,
    pub probability: f64,
    pub delay: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationData {
    pub chain: String,
    pub nodes: Vec<VizNode>,
    pub edges: Vec<VizEdge>,
}

// ---------------------------------------------------------------------------
// Channel message types
// ---------------------------------------------------------------------------

/// Sent to the batch trigger when analysis inputs change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    PortfolioChanged(String),
    SettingsChanged,
}

/// An operation the error handler may replay after a backoff.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryableOp {
    LoadScenarios,
    Simulation { request: SimulationRequest, simulation_id: String },
    Impact { request: ImpactRequest, portfolio_id: String },
}

impl std::fmt::Display for RetryableOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryableOp::LoadScenarios => write!(f, "load_scenarios"),
            RetryableOp::Simulation { simulation_id, .. } => {
                write!(f, "run_simulation({simulation_id})")
            }
            RetryableOp::Impact { portfolio_id, .. } => write!(f, "analyze_impact({portfolio_id})"),
        }
    }
}

/// Routed from the controller to the error handler on backend failures.
#[derive(Debug, Clone)]
pub struct ServiceFailure {
    pub op: RetryableOp,
    pub message: String,
    pub status: u16,
    /// 0 for the first failure, 1 once the handler has already replayed it.
    pub attempt: u32,
}
