//! Built-in agent plugins and manifests for Claude-compatible CLIs.

use crate::claude::{self, ClaudeCliAgent};
use crate::config::ClaudeCliConfig;
use crate::AgentProvider;
use agentbox_core::config::merge_json;
use agentbox_core::{
    ManifestBuilder, PluginLoader, PluginManifest, ProviderCapabilities, ProviderMetadata,
    ProviderPlugin, ProviderRegistry, ProviderResult,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Registry of agent providers.
pub type AgentRegistry = ProviderRegistry<dyn AgentProvider>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn builtin_plugins() -> Vec<ProviderPlugin<dyn AgentProvider>> {
    vec![claude_plugin()]
}

pub fn claude_plugin() -> ProviderPlugin<dyn AgentProvider> {
    claude_plugin_for(
        claude::PROVIDER_TYPE,
        "Claude Code",
        "Runs tasks through the Claude Code CLI in stream-json mode",
        VERSION,
        ClaudeCliConfig::default(),
    )
}

fn claude_plugin_for(
    provider_type: &str,
    name: &str,
    description: &str,
    version: &str,
    defaults: ClaudeCliConfig,
) -> ProviderPlugin<dyn AgentProvider> {
    let capabilities = ProviderCapabilities::Agent(
        ClaudeCliAgent::with_type(provider_type, defaults.clone()).agent_capabilities(),
    );
    let owned_type = provider_type.to_string();
    ProviderPlugin::new(
        ProviderMetadata {
            provider_type: provider_type.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            version: version.to_string(),
            capabilities,
            config_schema: json!({
                "type": "object",
                "properties": {
                    "binary": {"type": "string"},
                    "apiKey": {"type": "string"},
                    "baseUrl": {"type": "string"},
                    "model": {"type": "string"},
                    "mcpConfig": {"type": "string"},
                    "allowedTools": {"type": "array", "items": {"type": "string"}},
                    "disallowedTools": {"type": "array", "items": {"type": "string"}},
                    "permissionMode": {"type": "string"},
                    "extraArgs": {"type": "array", "items": {"type": "string"}}
                }
            }),
        },
        move |config| {
            let merged = merge_json(serde_json::to_value(&defaults)?, config.clone());
            let config = ClaudeCliConfig::from_value(&owned_type, &merged)?;
            Ok(Arc::new(ClaudeCliAgent::with_type(owned_type.clone(), config)) as Arc<dyn AgentProvider>)
        },
    )
}

/// Builds agent plugins from manifests of kind `claude-cli`, for wrappers
/// and forks that speak the same stream-json protocol.
#[derive(Debug, Default)]
pub struct ClaudeManifestBuilder;

impl ManifestBuilder<dyn AgentProvider> for ClaudeManifestBuilder {
    fn kinds(&self) -> Vec<&'static str> {
        vec!["claude-cli"]
    }

    fn build(&self, manifest: &PluginManifest) -> ProviderResult<ProviderPlugin<dyn AgentProvider>> {
        let defaults = ClaudeCliConfig::from_value(&manifest.provider_type, &manifest.config)?;
        Ok(claude_plugin_for(
            &manifest.provider_type,
            &manifest.name,
            &manifest.description,
            &manifest.version,
            defaults,
        ))
    }
}

pub fn agent_loader(
    registry: Arc<AgentRegistry>,
    dir: Option<PathBuf>,
) -> PluginLoader<dyn AgentProvider> {
    let mut loader = PluginLoader::new(registry, Arc::new(ClaudeManifestBuilder));
    for plugin in builtin_plugins() {
        loader = loader.with_builtin(plugin);
    }
    if let Some(dir) = dir {
        loader = loader.with_dir(dir);
    }
    loader
}
