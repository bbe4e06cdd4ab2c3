//! Server error type and its JSON rendering.

use agentbox_agent::AgentError;
use agentbox_core::{ConfigError, ProviderError};
use agentbox_sandbox::SandboxError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    /// No provider of the category can run on this host.
    #[error("no {0} provider is available")]
    NoProvider(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ServerError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ServerError::NoProvider(_) => (StatusCode::SERVICE_UNAVAILABLE, "NO_PROVIDER"),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ServerError::Provider(e) | ServerError::Sandbox(SandboxError::Provider(e)) => {
                provider_status(e)
            }
            ServerError::Agent(AgentError::Provider(e)) => provider_status(e),
            ServerError::Agent(AgentError::NotAvailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
            }
            ServerError::Agent(AgentError::InvalidRequest(_)) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST")
            }
            ServerError::Sandbox(SandboxError::RuntimeNotAvailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

fn provider_status(error: &ProviderError) -> (StatusCode, &'static str) {
    match error {
        ProviderError::UnknownProviderType { .. } => (StatusCode::BAD_REQUEST, "UNKNOWN_PROVIDER"),
        ProviderError::UnknownCategory(_) => (StatusCode::NOT_FOUND, "UNKNOWN_CATEGORY"),
        ProviderError::InvalidConfig { .. } => (StatusCode::BAD_REQUEST, "INVALID_CONFIG"),
        ProviderError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
        ProviderError::InitFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INIT_FAILED"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

/// JSON error body: `{"error": "...", "code": "..."}`.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::warn!(status = %status, error = %self, "Request failed");
        }
        let body = ApiError {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
