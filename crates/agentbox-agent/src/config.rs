//! Claude CLI agent options.

use agentbox_core::config::merge_json;
use agentbox_core::{ProviderError, ProviderResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Options of [`ClaudeCliAgent`](crate::ClaudeCliAgent).
///
/// `apiKey`, `baseUrl` and `model` are filled from the `agent` section of the
/// application config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClaudeCliConfig {
    /// Binary name or absolute path.
    pub binary: String,
    /// Extra directories searched for the binary.
    pub search_dirs: Vec<PathBuf>,
    /// Environment variable holding an explicit binary path. Empty disables it.
    pub path_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// MCP server config file handed to `--mcp-config`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<PathBuf>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    /// Appended verbatim after the generated arguments.
    pub extra_args: Vec<String>,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            search_dirs: Vec::new(),
            path_env: "CLAUDE_CLI_PATH".to_string(),
            api_key: None,
            base_url: None,
            model: None,
            mcp_config: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            permission_mode: None,
            extra_args: Vec::new(),
        }
    }
}

impl ClaudeCliConfig {
    /// Parse a provider config value. `null` yields the defaults.
    pub fn from_value(provider_type: &str, value: &Value) -> ProviderResult<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|e| ProviderError::invalid_config(provider_type, e.to_string()))
    }

    /// This config with `patch` applied on top; keys absent from `patch` are kept.
    pub fn patched(&self, provider_type: &str, patch: &Value) -> ProviderResult<Self> {
        if patch.is_null() {
            return Ok(self.clone());
        }
        let merged = merge_json(serde_json::to_value(self)?, patch.clone());
        Self::from_value(provider_type, &merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_settings_fields() {
        let config = ClaudeCliConfig::from_value(
            "claude",
            &json!({"apiKey": "sk-1", "baseUrl": "http://127.0.0.1:2620", "model": "sonnet"}),
        )
        .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("sk-1"));
        assert_eq!(config.base_url.as_deref(), Some("http://127.0.0.1:2620"));
        assert_eq!(config.binary, "claude");
    }

    #[test]
    fn test_patched_keeps_manifest_binary() {
        let base = ClaudeCliConfig {
            binary: "claude-wrapper".to_string(),
            ..Default::default()
        };
        let patched = base.patched("wrapper", &json!({"model": "haiku"})).unwrap();
        assert_eq!(patched.binary, "claude-wrapper");
        assert_eq!(patched.model.as_deref(), Some("haiku"));
    }

    #[test]
    fn test_rejects_wrong_types() {
        let err = ClaudeCliConfig::from_value("claude", &json!({"allowedTools": "Bash"})).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig { .. }));
    }
}
