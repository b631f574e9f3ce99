pub mod http;
pub mod validate;

#[cfg(test)]
pub mod fake;

pub use http::HttpScenarioService;

use crate::error::ServiceError;
use crate::types::{
    ChainRequest, ImpactRequest, ImpactResult, ScenarioCatalog, ScenarioChain, SimulationRequest,
    SimulationResult,
};

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// The remote scenario-analysis backend.
#[async_trait::async_trait]
pub trait ScenarioService: Send + Sync {
    async fn available_scenarios(&self) -> ServiceResult<ScenarioCatalog>;

    async fn simulate_chain(&self, req: &SimulationRequest) -> ServiceResult<SimulationResult>;

    async fn analyze_impact(&self, req: &ImpactRequest) -> ServiceResult<ImpactResult>;

    async fn create_chain(&self, req: &ChainRequest) -> ServiceResult<ScenarioChain>;

    async fn modify_chain(&self, req: &ChainRequest) -> ServiceResult<ScenarioChain>;

    async fn get_chain(&self, name: &str) -> ServiceResult<ScenarioChain>;

    async fn delete_chain(&self, name: &str) -> ServiceResult<()>;
}
