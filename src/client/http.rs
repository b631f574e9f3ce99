use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{ScenarioService, ServiceResult};
use crate::config::{Config, HTTP_TIMEOUT_SECS};
use crate::error::{AppError, Result, ServiceError};
use crate::types::{
    ChainRequest, ImpactRequest, ImpactResult, ScenarioCatalog, ScenarioChain, SimulationRequest,
    SimulationResult,
};

/// reqwest-backed client for the scenario REST backend.
pub struct HttpScenarioService {
    client: Client,
    base_url: Url,
}

impl HttpScenarioService {
    pub fn new(cfg: &Config) -> Result<Self> {
        Self::with_base_url(&cfg.scenario_api_url)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("SCENARIO_API_URL is not a valid URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "SCENARIO_API_URL must be an http(s) base URL, got '{base_url}'"
            )));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, base_url })
    }

    /// Base URL with `segments` appended, each percent-encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.client.request(method, self.url(segments))
    }

    async fn send(&self, builder: RequestBuilder) -> ServiceResult<Response> {
        let resp = builder.send().await.map_err(|e| {
            warn!("Scenario backend unreachable: {e}");
            ServiceError::from(e)
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        // Prefer the backend's own message when it sends one.
        let body = resp.text().await.unwrap_or_default();
        let message = error_message_from_body(&body)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        debug!(status = status.as_u16(), "Scenario backend returned error: {message}");
        Err(ServiceError { message, status: status.as_u16() })
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ServiceResult<T> {
        let resp = self.send(builder).await?;
        let status = resp.status().as_u16();
        resp.json::<T>().await.map_err(|e| ServiceError {
            message: format!("malformed response body: {e}"),
            status,
        })
    }
}

#[async_trait::async_trait]
impl ScenarioService for HttpScenarioService {
    async fn available_scenarios(&self) -> ServiceResult<ScenarioCatalog> {
        self.json(self.request(Method::GET, &["scenarios"])).await
    }

    async fn simulate_chain(&self, req: &SimulationRequest) -> ServiceResult<SimulationResult> {
        self.json(self.request(Method::POST, &["scenarios", "simulate"]).json(req)).await
    }

    async fn analyze_impact(&self, req: &ImpactRequest) -> ServiceResult<ImpactResult> {
        self.json(self.request(Method::POST, &["scenarios", "impact"]).json(req)).await
    }

    async fn create_chain(&self, req: &ChainRequest) -> ServiceResult<ScenarioChain> {
        self.json(self.request(Method::POST, &["scenarios", "chains"]).json(req)).await
    }

    async fn modify_chain(&self, req: &ChainRequest) -> ServiceResult<ScenarioChain> {
        let segments = ["scenarios", "chains", req.name.as_str()];
        self.json(self.request(Method::PUT, &segments).json(req)).await
    }

    async fn get_chain(&self, name: &str) -> ServiceResult<ScenarioChain> {
        self.json(self.request(Method::GET, &["scenarios", "chains", name])).await
    }

    async fn delete_chain(&self, name: &str) -> ServiceResult<()> {
        self.send(self.request(Method::DELETE, &["scenarios", "chains", name])).await?;
        Ok(())
    }
}

/// Pull `message`, `detail` or `error` out of a JSON error body.
fn error_message_from_body(body: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    ["message", "detail", "error"]
        .iter()
        .find_map(|k| v.get(*k).and_then(|m| m.as_str()))
        .map(|s| s.to_string())
}
