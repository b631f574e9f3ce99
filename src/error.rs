use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

/// Normalised failure from the scenario backend. `status` is 0 when the
/// request never produced an HTTP response (DNS, connect, timeout).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (status {status})")]
pub struct ServiceError {
    pub message: String,
    pub status: u16,
}

impl ServiceError {
    pub fn network(message: impl Into<String>) -> Self {
        Self { message: message.into(), status: 0 }
    }

    pub fn is_network(&self) -> bool {
        self.status == 0
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self { message: e.to_string(), status: status.as_u16() },
            None => Self::network(e.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Scenario service error: {0}")]
    Service(#[from] ServiceError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Maximum concurrent analyses reached ({0})")]
    CapacityReached(usize),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::CapacityReached(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Service(e) if e.is_network() => StatusCode::BAD_GATEWAY,
            AppError::Service(e) => {
                StatusCode::from_u16(e.status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
