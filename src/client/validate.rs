//! Client-side request checks, run before anything goes on the wire.

use crate::config::MAX_SIMULATIONS_PER_REQUEST;
use crate::types::{ChainRequest, ImpactRequest, SimulationRequest, ValidationReport};

pub fn validate_simulation_request(req: &SimulationRequest) -> ValidationReport {
    let mut errors = Vec::new();
    if req.starting_scenario.trim().is_empty() {
        errors.push("Starting scenario is required".to_string());
    }
    if req.num_simulations == 0 {
        errors.push("Number of simulations must be greater than 0".to_string());
    } else if req.num_simulations > MAX_SIMULATIONS_PER_REQUEST {
        errors.push(format!(
            "Number of simulations must not exceed {MAX_SIMULATIONS_PER_REQUEST}"
        ));
    }
    if req.time_horizon == 0 {
        errors.push("Time horizon must be at least 1 period".to_string());
    }
    ValidationReport::from_errors(errors)
}

pub fn validate_impact_request(req: &ImpactRequest) -> ValidationReport {
    let mut errors = Vec::new();
    if req.portfolio_id.trim().is_empty() {
        errors.push("Portfolio is required".to_string());
    }
    if req.scenarios.is_empty() {
        errors.push("At least one scenario is required".to_string());
    }
    if req.scenarios.iter().any(|s| s.trim().is_empty()) {
        errors.push("Scenario ids must not be empty".to_string());
    }
    ValidationReport::from_errors(errors)
}

pub fn validate_chain_request(req: &ChainRequest) -> ValidationReport {
    let mut errors = Vec::new();
    if req.name.trim().is_empty() {
        errors.push("Chain name is required".to_string());
    }
    if req.initial_impact.is_empty() {
        errors.push("At least one initial impact factor is required".to_string());
    }
    if req.initial_impact.values().any(|v| !v.is_finite()) {
        errors.push("Initial impacts must be finite numbers".to_string());
    }
    for (i, event) in req.leads_to.iter().enumerate() {
        if event.scenario.trim().is_empty() {
            errors.push(format!("Event {}: scenario is required", i + 1));
        }
        if !(0.0..=1.0).contains(&event.probability) {
            errors.push(format!("Event {}: probability must be between 0 and 1", i + 1));
        }
        if !(event.magnitude_modifier.is_finite() && event.magnitude_modifier > 0.0) {
            errors.push(format!("Event {}: magnitude modifier must be positive", i + 1));
        }
    }
    ValidationReport::from_errors(errors)
}
