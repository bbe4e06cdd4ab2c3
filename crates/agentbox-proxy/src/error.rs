//! Proxy error types.

use crate::anthropic::ErrorBody;
use thiserror::Error;

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors that can occur while proxying a request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The upstream answered with a non-success status.
    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The incoming request cannot be translated.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The upstream response could not be translated.
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    /// HTTP request failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error while reading the upstream stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// HTTP status to answer the downstream client with.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::InvalidRequest(_) | ProxyError::Json(_) => 400,
            _ => 502,
        }
    }

    /// Anthropic error `type` matching this error.
    pub fn error_type(&self) -> &'static str {
        match self.status_code() {
            400 => "invalid_request_error",
            401 => "authentication_error",
            403 => "permission_error",
            404 => "not_found_error",
            413 => "request_too_large",
            429 => "rate_limit_error",
            529 => "overloaded_error",
            _ => "api_error",
        }
    }

    /// The Anthropic-format error envelope.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.error_type(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_error_body() {
        let err = ProxyError::upstream(429, "Too Many Requests: slow down");
        assert_eq!(err.status_code(), 429);
        let body = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(
            body["error"]["message"],
            "upstream error 429: Too Many Requests: slow down"
        );
    }

    #[test]
    fn test_invalid_request_is_400() {
        let err = ProxyError::invalid_request("no messages");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.error_type(), "invalid_request_error");
    }
}
