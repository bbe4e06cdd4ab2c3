//! Error types for agent providers.

use agentbox_core::ProviderError;
use thiserror::Error;

/// Errors returned before an agent run starts streaming.
///
/// Failures after the first event are reported in-band as
/// [`AgentEvent::Error`](crate::AgentEvent::Error).
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent binary is not installed.
    #[error("agent not available: {0}")]
    NotAvailable(String),

    /// The request cannot be run.
    #[error("invalid agent request: {0}")]
    InvalidRequest(String),

    /// The agent process could not be started.
    #[error("failed to spawn agent: {0}")]
    SpawnFailed(String),

    /// Provider lifecycle error
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }
}

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;
