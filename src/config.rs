use std::time::Duration;

use crate::error::{AppError, Result};

pub const SCENARIO_API_URL: &str = "http://localhost:8000/api";

/// Default cap on simultaneous simulation + impact requests.
pub const DEFAULT_MAX_CONCURRENT_ANALYSES: usize = 3;

/// Default cache TTL (seconds). Also the auto-refresh polling period.
pub const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 300;

/// Cache sweep cadence (seconds).
pub const CACHE_SWEEP_INTERVAL_SECS: u64 = 600;

/// Channel capacity for internal message routing.
pub const CHANNEL_CAPACITY: usize = 256;

/// HTTP timeout for calls to the scenario backend (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Backoff before retrying an operation that failed with a network error (status 0).
pub const NETWORK_RETRY_BACKOFF_MS: u64 = 5_000;

/// Backoff before retrying an operation that was rate limited (status 429).
pub const RATE_LIMIT_RETRY_BACKOFF_MS: u64 = 30_000;

/// Upper bound accepted for `num_simulations` by the client-side validator.
pub const MAX_SIMULATIONS_PER_REQUEST: u32 = 100_000;

pub const DEFAULT_NUM_SIMULATIONS: u32 = 1_000;
pub const DEFAULT_TIME_HORIZON: u32 = 12;

/// What the concurrency gate does when every analysis slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Fail the request immediately.
    Reject,
    /// Sleep and retry until a slot frees up or attempts run out.
    Requeue { delay: Duration, max_attempts: u32 },
}

impl GateMode {
    fn parse(mode: &str, delay_ms: u64, max_attempts: u32) -> Result<Self> {
        match mode.trim().to_lowercase().as_str() {
            "reject" => Ok(GateMode::Reject),
            "requeue" => Ok(GateMode::Requeue {
                delay: Duration::from_millis(delay_ms),
                max_attempts,
            }),
            other => Err(AppError::Config(format!(
                "GATE_MODE must be 'reject' or 'requeue', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub scenario_api_url: String,
    pub log_level: String,
    pub api_port: u16,
    /// MAX_CONCURRENT_ANALYSES
    pub max_concurrent_analyses: usize,
    /// CACHE_TIMEOUT_SECS
    pub cache_timeout: Duration,
    /// GATE_MODE (+ REQUEUE_DELAY_MS, MAX_REQUEUE_ATTEMPTS for requeue)
    pub gate_mode: GateMode,
    /// AUTO_REFRESH: poll the scenario catalog while stale
    pub auto_refresh: bool,
    /// AUTO_ANALYZE: re-run analyses when the portfolio or settings change
    pub auto_analyze: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let requeue_delay_ms = std::env::var("REQUEUE_DELAY_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse::<u64>()
            .unwrap_or(1000);
        let max_requeue_attempts = std::env::var("MAX_REQUEUE_ATTEMPTS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u32>()
            .unwrap_or(10);

        let max_concurrent_analyses = std::env::var("MAX_CONCURRENT_ANALYSES")
            .unwrap_or_else(|_| DEFAULT_MAX_CONCURRENT_ANALYSES.to_string())
            .parse::<usize>()
            .map_err(|_| {
                AppError::Config("MAX_CONCURRENT_ANALYSES must be a positive integer".to_string())
            })?;
        if max_concurrent_analyses == 0 {
            return Err(AppError::Config(
                "MAX_CONCURRENT_ANALYSES must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            scenario_api_url: std::env::var("SCENARIO_API_URL")
                .unwrap_or_else(|_| SCENARIO_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            max_concurrent_analyses,
            cache_timeout: Duration::from_secs(
                std::env::var("CACHE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| DEFAULT_CACHE_TIMEOUT_SECS.to_string())
                    .parse::<u64>()
                    .unwrap_or(DEFAULT_CACHE_TIMEOUT_SECS),
            ),
            gate_mode: GateMode::parse(
                &std::env::var("GATE_MODE").unwrap_or_else(|_| "reject".to_string()),
                requeue_delay_ms,
                max_requeue_attempts,
            )?,
            auto_refresh: parse_flag(std::env::var("AUTO_REFRESH").ok(), true),
            auto_analyze: parse_flag(std::env::var("AUTO_ANALYZE").ok(), true),
        })
    }
}

fn parse_flag(raw: Option<String>, default: bool) -> bool {
    match raw.as_deref().map(str::trim) {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default,
    }
}
