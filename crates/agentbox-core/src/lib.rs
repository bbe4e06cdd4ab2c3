//! Core provider abstractions for agentbox.
//!
//! This crate provides:
//! - The [`Provider`] contract shared by sandbox and agent backends
//! - A generic, category-scoped [`ProviderRegistry`] with singleton lifecycle tracking
//! - The [`ProviderManager`] facade that resolves the active provider per category
//! - The [`PluginLoader`] for manifest-declared plugins with hot reload
//! - Layered configuration ([`AppConfig`], [`ConfigStore`])

pub mod config;
pub mod error;
pub mod loader;
pub mod manager;
pub mod provider;
pub mod registry;
mod sync;

pub use config::{
    AgentSettings, AppConfig, ConfigStore, PluginsConfig, PoolConfig, ProviderSelection,
    ProvidersConfig, ProxyConfig, ServerConfig,
};
pub use error::{ConfigError, ConfigResult, ProviderError, ProviderResult};
pub use loader::{LoadFailure, LoadSummary, ManifestBuilder, PluginLoader, PluginManifest};
pub use manager::{CategoryStatus, Degradation, ProviderManager, ProviderStatus};
pub use provider::{
    AgentCapabilities, IsolationLevel, Provider, ProviderCapabilities, ProviderFactory,
    ProviderInstance, ProviderMetadata, ProviderPlugin, ProviderState, SandboxCapabilities,
};
pub use registry::{
    CategoryRegistry, InstanceInfo, ListenerId, ProviderRegistry, RegistryEvent,
    RegistryListener,
};

/// Category key for sandbox providers.
pub const SANDBOX_CATEGORY: &str = "sandbox";

/// Category key for agent providers.
pub const AGENT_CATEGORY: &str = "agent";
