pub mod cache;
pub mod scenario_store;
pub mod selectors;

pub use scenario_store::ScenarioStore;
