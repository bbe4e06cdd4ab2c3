//! Error types for provider lifecycle and configuration.

use thiserror::Error;

/// Errors raised by provider registration, creation and lifecycle calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No plugin is registered under the requested type.
    #[error("unknown {category} provider type '{provider_type}' (available: {})", available.join(", "))]
    UnknownProviderType {
        category: String,
        provider_type: String,
        available: Vec<String>,
    },

    /// No registry exists for the requested category.
    #[error("unknown provider category '{0}'")]
    UnknownCategory(String),

    /// The registry for a category holds a different provider trait.
    #[error("provider category '{0}' has a different provider type")]
    CategoryTypeMismatch(String),

    /// Provider reported itself unavailable on this host.
    #[error("provider '{0}' is not available")]
    Unavailable(String),

    /// The factory rejected the supplied configuration.
    #[error("invalid configuration for provider '{provider_type}': {message}")]
    InvalidConfig {
        provider_type: String,
        message: String,
    },

    /// `init()` failed.
    #[error("provider '{provider_type}' failed to initialize: {message}")]
    InitFailed {
        provider_type: String,
        message: String,
    },

    /// `shutdown()` failed.
    #[error("provider '{provider_type}' failed to stop: {message}")]
    StopFailed {
        provider_type: String,
        message: String,
    },

    /// Plugin manifest could not be used.
    #[error("invalid plugin manifest: {0}")]
    InvalidManifest(String),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    pub fn init_failed(provider_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InitFailed {
            provider_type: provider_type.into(),
            message: message.into(),
        }
    }

    pub fn stop_failed(provider_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StopFailed {
            provider_type: provider_type.into(),
            message: message.into(),
        }
    }

    pub fn invalid_config(provider_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            provider_type: provider_type.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid JSON in {path}: {message}")]
    InvalidJson { path: String, message: String },

    #[error("environment variable not found: {name}")]
    EnvVarNotFound { name: String },

    #[error("file reference not found: {path}")]
    FileRefNotFound { path: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
