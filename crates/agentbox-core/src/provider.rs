//! Provider contracts shared by every backend category.
//!
//! A *plugin* pairs immutable [`ProviderMetadata`] with a factory. The
//! registry invokes the factory to build provider objects, and wraps the
//! long-lived one in a [`ProviderInstance`] that tracks its lifecycle.

use crate::error::ProviderResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How strongly a sandbox separates executed code from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Runs directly on the host.
    None,
    /// OS-level process sandboxing.
    Process,
    /// Hardware virtualization.
    Vm,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::None => write!(f, "none"),
            IsolationLevel::Process => write!(f, "process"),
            IsolationLevel::Vm => write!(f, "vm"),
        }
    }
}

/// Capability flags of a sandbox provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxCapabilities {
    pub isolation: IsolationLevel,
    /// Script runtimes the provider can execute (`python`, `node`, ...).
    pub runtimes: Vec<String>,
    /// Whether instances may be cached and reused by a pool.
    pub pooling: bool,
    pub volume_mounts: bool,
    pub networking: bool,
}

/// Capability flags of an agent provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub tool_use: bool,
    pub mcp: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
}

/// Capabilities, one variant per provider category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum ProviderCapabilities {
    Sandbox(SandboxCapabilities),
    Agent(AgentCapabilities),
    /// Extension categories report free-form flags.
    Other { flags: HashMap<String, Value> },
}

impl ProviderCapabilities {
    pub fn as_sandbox(&self) -> Option<&SandboxCapabilities> {
        match self {
            ProviderCapabilities::Sandbox(caps) => Some(caps),
            _ => None,
        }
    }

    pub fn as_agent(&self) -> Option<&AgentCapabilities> {
        match self {
            ProviderCapabilities::Agent(caps) => Some(caps),
            _ => None,
        }
    }
}

/// Immutable descriptor of a provider plugin. `provider_type` is its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetadata {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub capabilities: ProviderCapabilities,
    /// JSON schema of the config object the factory accepts.
    #[serde(default)]
    pub config_schema: Value,
}

/// Contract implemented by every provider.
///
/// All methods take `&self`; providers hold their mutable state behind
/// interior locks so a single instance can be shared through `Arc`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Type key this provider was registered under.
    fn provider_type(&self) -> &str;

    /// Check whether the backend can run on this host. Must not fail.
    async fn is_available(&self) -> bool;

    /// Prepare the provider for use.
    async fn init(&self, config: &Value) -> ProviderResult<()>;

    /// Release every resource. Idempotent, and safe to call without `init`.
    async fn shutdown(&self) -> ProviderResult<()>;

    /// Capability flags reported to callers.
    fn capabilities(&self) -> ProviderCapabilities;
}

/// Factory building a provider object from a config value.
pub type ProviderFactory<P> = Arc<dyn Fn(&Value) -> ProviderResult<Arc<P>> + Send + Sync>;

/// Plugin definition: metadata plus factory.
pub struct ProviderPlugin<P: ?Sized> {
    pub metadata: ProviderMetadata,
    pub factory: ProviderFactory<P>,
}

impl<P: ?Sized> Clone for ProviderPlugin<P> {
    fn clone(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<P: ?Sized> ProviderPlugin<P> {
    pub fn new<F>(metadata: ProviderMetadata, factory: F) -> Self
    where
        F: Fn(&Value) -> ProviderResult<Arc<P>> + Send + Sync + 'static,
    {
        Self {
            metadata,
            factory: Arc::new(factory),
        }
    }

    pub fn provider_type(&self) -> &str {
        &self.metadata.provider_type
    }
}

impl<P: ?Sized> fmt::Debug for ProviderPlugin<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderPlugin")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Lifecycle state of a singleton instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    Uninitialized,
    Initializing,
    Ready,
    Error,
    Stopping,
    Stopped,
}

impl ProviderState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProviderState::Ready)
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderState::Uninitialized => "uninitialized",
            ProviderState::Initializing => "initializing",
            ProviderState::Ready => "ready",
            ProviderState::Error => "error",
            ProviderState::Stopping => "stopping",
            ProviderState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Registry-owned wrapper around the live provider of a type.
pub struct ProviderInstance<P: ?Sized> {
    pub provider: Arc<P>,
    pub state: ProviderState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl<P: ?Sized> ProviderInstance<P> {
    pub fn new(provider: Arc<P>) -> Self {
        let now = Utc::now();
        Self {
            provider,
            state: ProviderState::Uninitialized,
            error: None,
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_serialize_tagged() {
        let caps = ProviderCapabilities::Sandbox(SandboxCapabilities {
            isolation: IsolationLevel::Vm,
            runtimes: vec!["python".to_string()],
            pooling: true,
            volume_mounts: true,
            networking: true,
        });
        let json = serde_json::to_value(&caps).unwrap();
        assert_eq!(json["category"], "sandbox");
        assert_eq!(json["isolation"], "vm");
        assert_eq!(json["volumeMounts"], true);
        assert!(caps.as_sandbox().is_some());
        assert!(caps.as_agent().is_none());
    }

    #[test]
    fn test_metadata_type_field() {
        let meta = ProviderMetadata {
            provider_type: "native".to_string(),
            name: "Native".to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            capabilities: ProviderCapabilities::Other {
                flags: HashMap::new(),
            },
            config_schema: Value::Null,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "native");
        assert!(json.get("providerType").is_none());
    }

    #[test]
    fn test_isolation_ordering() {
        assert!(IsolationLevel::Vm > IsolationLevel::Process);
        assert!(IsolationLevel::Process > IsolationLevel::None);
        assert_eq!(IsolationLevel::None.to_string(), "none");
    }
}
