//! Error types for sandbox operations.

use agentbox_core::ProviderError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during sandbox lifecycle operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Sandbox runtime is not installed or not usable on this host
    #[error("sandbox runtime not available: {0}")]
    RuntimeNotAvailable(String),

    /// The provider does not support the requested operation
    #[error("operation not supported by this sandbox: {0}")]
    Unsupported(String),

    /// Failed to create an isolated environment
    #[error("failed to create sandbox: {0}")]
    CreateFailed(String),

    /// Failed to start an isolated environment
    #[error("failed to start sandbox: {0}")]
    StartFailed(String),

    /// Failed to stop an isolated environment
    #[error("failed to stop sandbox: {0}")]
    StopFailed(String),

    /// Command execution failed
    #[error("command execution failed: {0}")]
    ExecFailed(String),

    /// Copying a file back to the host failed
    #[error("failed to sync '{path}': {message}")]
    SyncFailed { path: PathBuf, message: String },

    /// Invalid path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Invalid configuration
    #[error("invalid sandbox configuration: {0}")]
    Config(String),

    /// Provider lifecycle error
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SandboxError {
    pub fn create_failed(msg: impl Into<String>) -> Self {
        Self::CreateFailed(msg.into())
    }

    pub fn start_failed(msg: impl Into<String>) -> Self {
        Self::StartFailed(msg.into())
    }

    pub fn stop_failed(msg: impl Into<String>) -> Self {
        Self::StopFailed(msg.into())
    }

    pub fn exec_failed(msg: impl Into<String>) -> Self {
        Self::ExecFailed(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Convert into a provider error attributed to `provider_type`.
    pub fn into_init_error(self, provider_type: &str) -> ProviderError {
        match self {
            SandboxError::Provider(e) => e,
            other => ProviderError::init_failed(provider_type, other.to_string()),
        }
    }

    pub fn into_stop_error(self, provider_type: &str) -> ProviderError {
        match self {
            SandboxError::Provider(e) => e,
            other => ProviderError::stop_failed(provider_type, other.to_string()),
        }
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;
