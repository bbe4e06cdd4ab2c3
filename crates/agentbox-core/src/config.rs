//! Layered configuration.
//!
//! Sources, later overriding earlier:
//! 1. Built-in defaults
//! 2. Global config file (`~/.config/agentbox/config.json[c]`)
//! 3. `AGENTBOX_CONFIG_CONTENT` environment variable
//! 4. Project config file (`agentbox.json[c]` in the project directory)
//! 5. Individual environment variables (`SANDBOX_PROVIDER`, ...)
//! 6. Runtime overrides held by [`ConfigStore`]
//!
//! Files are JSONC and support `{env:VAR}` and `{file:path}` substitution.

use crate::error::{ConfigError, ConfigResult};
use crate::sync::{read, write};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{OnceLock, RwLock};

/// Static regex for variable substitution, compiled once.
static VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

fn var_regex() -> &'static regex::Regex {
    VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\{(env|file):([^}]+)\}")
            .expect("Invalid regex pattern - this is a compile-time constant")
    })
}

/// Default pool capacity.
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Default HTTP listen address.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:2620";

/// Default upstream for the protocol proxy.
pub const DEFAULT_UPSTREAM_URL: &str = "https://api.openai.com/v1";

/// Provider choice for one category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSelection {
    /// Pinned provider type. `None` lets the manager pick the first available.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,
    /// Provider-specific options passed to the factory and `init()`.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl ProviderSelection {
    pub fn of_type(provider_type: impl Into<String>) -> Self {
        Self {
            provider_type: Some(provider_type.into()),
            config: Value::Null,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    fn merge(self, other: Self) -> Self {
        Self {
            provider_type: other.provider_type.or(self.provider_type),
            config: merge_json(self.config, other.config),
        }
    }
}

/// Category -> provider selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvidersConfig(pub HashMap<String, ProviderSelection>);

impl ProvidersConfig {
    pub fn get(&self, category: &str) -> Option<&ProviderSelection> {
        self.0.get(category)
    }

    pub fn selected_type(&self, category: &str) -> Option<&str> {
        self.0
            .get(category)
            .and_then(|s| s.provider_type.as_deref())
    }

    pub fn set(&mut self, category: impl Into<String>, selection: ProviderSelection) {
        self.0.insert(category.into(), selection);
    }

    fn entry(&mut self, category: &str) -> &mut ProviderSelection {
        self.0.entry(category.to_string()).or_default()
    }

    pub fn merge(mut self, other: Self) -> Self {
        for (category, selection) in other.0 {
            let merged = match self.0.remove(&category) {
                Some(existing) => existing.merge(selection),
                None => selection,
            };
            self.0.insert(category, merged);
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
}

impl PoolConfig {
    pub fn max_size(&self) -> usize {
        self.max_size.unwrap_or(DEFAULT_POOL_SIZE)
    }
}

/// Upstream target of the protocol proxy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Overrides the model named in incoming requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ProxyConfig {
    pub fn upstream_url(&self) -> &str {
        self.upstream_url.as_deref().unwrap_or(DEFAULT_UPSTREAM_URL)
    }
}

/// Credentials and model handed to agent providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl ServerConfig {
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(DEFAULT_ADDRESS)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginsConfig {
    /// Directory scanned for plugin manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Reload manifests when the directory changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch: Option<bool>,
}

impl PluginsConfig {
    pub fn dir(&self) -> Option<PathBuf> {
        self.dir
            .clone()
            .or_else(|| AppConfig::global_config_dir().map(|d| d.join("plugins")))
    }

    pub fn watch(&self) -> bool {
        self.watch.unwrap_or(false)
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub providers: ProvidersConfig,
    pub pool: PoolConfig,
    pub proxy: ProxyConfig,
    pub agent: AgentSettings,
    pub server: ServerConfig,
    pub plugins: PluginsConfig,
}

impl AppConfig {
    /// Load configuration from files and the process environment.
    ///
    /// Returns the merged config and the files that contributed to it.
    pub async fn load(project_dir: Option<&Path>) -> ConfigResult<(Self, Vec<PathBuf>)> {
        let mut config = AppConfig::default();
        let mut sources = Vec::new();

        if let Some(global_dir) = Self::global_config_dir() {
            if let Some(path) = first_existing(&global_dir, &["config.jsonc", "config.json"]) {
                config = config.merge(Self::load_file(&path).await?);
                sources.push(path);
            }
        }

        if let Ok(content) = std::env::var("AGENTBOX_CONFIG_CONTENT") {
            config = config.merge(Self::parse_jsonc(&content, "<env>")?);
        }

        if let Some(dir) = project_dir {
            if let Some(path) = first_existing(dir, &["agentbox.jsonc", "agentbox.json"]) {
                config = config.merge(Self::load_file(&path).await?);
                sources.push(path);
            }
        }

        config.apply_env(|key| std::env::var(key).ok())?;

        Ok((config, sources))
    }

    /// Get the global config directory.
    ///
    /// On Unix, prefers `~/.config/agentbox` over the platform directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            if let Some(home) = dirs::home_dir() {
                let xdg_config = home.join(".config").join("agentbox");
                if xdg_config.exists() {
                    return Some(xdg_config);
                }
            }
        }

        dirs::config_dir().map(|d| d.join("agentbox"))
    }

    /// Load configuration from a file.
    pub async fn load_file(path: &Path) -> ConfigResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let content = substitute_variables(&content, path)?;
        Self::parse_jsonc(&content, &path.display().to_string())
    }

    /// Parse JSONC (JSON with comments).
    pub fn parse_jsonc(content: &str, source: &str) -> ConfigResult<Self> {
        let stripped = strip_comments(content);
        serde_json::from_str(&stripped).map_err(|e| ConfigError::InvalidJson {
            path: source.to_string(),
            message: e.to_string(),
        })
    }

    /// Options every provider of a category receives, whatever its type.
    ///
    /// Agent providers get the credentials and model from the `agent` section.
    pub fn category_defaults(&self, category: &str) -> Value {
        if category == crate::AGENT_CATEGORY {
            serde_json::to_value(&self.agent).unwrap_or(Value::Null)
        } else {
            Value::Null
        }
    }

    /// Selection for a category with its category defaults folded into the
    /// provider config.
    pub fn selection_for(&self, category: &str) -> ProviderSelection {
        let mut selection = self.providers.get(category).cloned().unwrap_or_default();
        selection.config = merge_json(self.category_defaults(category), selection.config);
        selection
    }

    /// Apply individual environment variable overrides. Empty values are ignored.
    pub fn apply_env<F>(&mut self, get: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("SANDBOX_PROVIDER") {
            self.providers.entry(crate::SANDBOX_CATEGORY).provider_type = Some(v);
        }
        if let Some(v) = var("AGENT_PROVIDER") {
            self.providers.entry(crate::AGENT_CATEGORY).provider_type = Some(v);
        }
        if let Some(v) = var("ANTHROPIC_API_KEY") {
            self.agent.api_key = Some(v);
        }
        if let Some(v) = var("ANTHROPIC_BASE_URL") {
            self.agent.base_url = Some(v);
        }
        if let Some(v) = var("AGENT_MODEL") {
            self.agent.model = Some(v);
        }
        if let Some(v) = var("PROXY_UPSTREAM_URL") {
            self.proxy.upstream_url = Some(v);
        }
        if let Some(v) = var("PROXY_UPSTREAM_API_KEY") {
            self.proxy.api_key = Some(v);
        }
        if let Some(v) = var("PROXY_MODEL") {
            self.proxy.model = Some(v);
        }
        if let Some(v) = var("SANDBOX_POOL_SIZE") {
            let size = v.trim().parse::<usize>().map_err(|e| ConfigError::InvalidValue {
                key: "SANDBOX_POOL_SIZE".to_string(),
                message: e.to_string(),
            })?;
            self.pool.max_size = Some(size);
        }
        if let Some(v) = var("AGENTBOX_PLUGIN_DIR") {
            self.plugins.dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Merge another config into this one (`other` takes precedence).
    pub fn merge(self, other: Self) -> Self {
        Self {
            providers: self.providers.merge(other.providers),
            pool: PoolConfig {
                max_size: other.pool.max_size.or(self.pool.max_size),
            },
            proxy: ProxyConfig {
                upstream_url: other.proxy.upstream_url.or(self.proxy.upstream_url),
                api_key: other.proxy.api_key.or(self.proxy.api_key),
                model: other.proxy.model.or(self.proxy.model),
            },
            agent: AgentSettings {
                api_key: other.agent.api_key.or(self.agent.api_key),
                base_url: other.agent.base_url.or(self.agent.base_url),
                model: other.agent.model.or(self.agent.model),
            },
            server: ServerConfig {
                address: other.server.address.or(self.server.address),
            },
            plugins: PluginsConfig {
                dir: other.plugins.dir.or(self.plugins.dir),
                watch: other.plugins.watch.or(self.plugins.watch),
            },
        }
    }

    /// Write to `path`, merging into whatever the file already holds.
    pub async fn save_partial(&self, path: &Path) -> ConfigResult<()> {
        let existing = if path.exists() {
            Self::load_file(path).await.unwrap_or_default()
        } else {
            AppConfig::default()
        };
        let merged = existing.merge(self.clone());

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&merged).map_err(|e| ConfigError::InvalidJson {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        tokio::fs::write(path, content).await?;
        tracing::info!("Saved configuration to {}", path.display());
        Ok(())
    }
}

fn first_existing(dir: &Path, names: &[&str]) -> Option<PathBuf> {
    names.iter().map(|n| dir.join(n)).find(|p| p.exists())
}

/// Deep-merge JSON objects; non-object values in `other` replace `base`
/// unless `other` is null.
pub fn merge_json(base: Value, other: Value) -> Value {
    match (base, other) {
        (Value::Object(mut base), Value::Object(other)) => {
            for (key, value) in other {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (base, Value::Null) => base,
        (_, other) => other,
    }
}

/// Strip `//` and `/* */` comments outside of string literals.
fn strip_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            result.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        let next = chars.peek().copied();
        match (c, next) {
            ('"', _) => {
                in_string = true;
                result.push(c);
            }
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    // Keep line numbers stable for parse errors.
                    if c == '\n' {
                        result.push('\n');
                    }
                    prev = c;
                }
            }
            _ => result.push(c),
        }
    }

    result
}

/// Replace `{env:VAR}` and `{file:path}` references.
///
/// `file:` paths are relative to the config file's directory.
fn substitute_variables(content: &str, config_path: &Path) -> ConfigResult<String> {
    let config_dir = config_path.parent().unwrap_or(Path::new("."));
    let mut result = content.to_string();

    for cap in var_regex().captures_iter(content) {
        let (Some(full), Some(kind), Some(value)) = (cap.get(0), cap.get(1), cap.get(2)) else {
            continue;
        };

        let replacement = match kind.as_str() {
            "env" => std::env::var(value.as_str()).map_err(|_| ConfigError::EnvVarNotFound {
                name: value.as_str().to_string(),
            })?,
            "file" => {
                let file_path = config_dir.join(value.as_str());
                std::fs::read_to_string(&file_path)
                    .map(|v| v.trim().to_string())
                    .map_err(|_| ConfigError::FileRefNotFound {
                        path: file_path.display().to_string(),
                    })?
            }
            _ => continue,
        };

        // Values land inside JSON strings.
        let escaped = serde_json::to_string(&replacement)
            .map(|quoted| quoted[1..quoted.len() - 1].to_string())
            .unwrap_or(replacement);
        result = result.replace(full.as_str(), &escaped);
    }

    Ok(result)
}

/// Holds the file/env configuration plus runtime overrides.
///
/// Runtime overrides come from provider switches and settings sync. They
/// apply on top of everything else and can be persisted to the global file.
#[derive(Debug)]
pub struct ConfigStore {
    base: RwLock<AppConfig>,
    runtime: RwLock<AppConfig>,
    persist_path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn new(base: AppConfig) -> Self {
        Self {
            base: RwLock::new(base),
            runtime: RwLock::new(AppConfig::default()),
            persist_path: None,
        }
    }

    /// Persist runtime overrides to `path` on [`ConfigStore::persist`].
    pub fn with_persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    /// Effective configuration: base layers plus runtime overrides.
    pub fn effective(&self) -> AppConfig {
        let base = read(&self.base).clone();
        let runtime = read(&self.runtime).clone();
        base.merge(runtime)
    }

    pub fn runtime_overrides(&self) -> AppConfig {
        read(&self.runtime).clone()
    }

    /// Merge `patch` into the runtime layer.
    pub fn update_runtime(&self, patch: AppConfig) {
        let mut runtime = write(&self.runtime);
        let current = std::mem::take(&mut *runtime);
        *runtime = current.merge(patch);
    }

    /// Replace the runtime selection for a category.
    pub fn set_selection(&self, category: &str, selection: ProviderSelection) {
        write(&self.runtime).providers.set(category, selection);
    }

    /// The effective selection `category` would have if `selection` replaced
    /// its runtime override. Nothing is stored.
    pub fn preview_selection(&self, category: &str, selection: ProviderSelection) -> ProviderSelection {
        let base = read(&self.base).clone();
        let mut runtime = read(&self.runtime).clone();
        runtime.providers.set(category, selection);
        base.merge(runtime).selection_for(category)
    }

    /// Replace the file/env layers, keeping runtime overrides.
    pub fn replace_base(&self, base: AppConfig) {
        *write(&self.base) = base;
    }

    pub fn clear_runtime(&self) {
        *write(&self.runtime) = AppConfig::default();
    }

    /// Write runtime overrides to the persist path, if one is configured.
    pub async fn persist(&self) -> ConfigResult<()> {
        match &self.persist_path {
            Some(path) => self.runtime_overrides().save_partial(path).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_comments() {
        let input = r#"{
            // Line comment
            "key": "value", // trailing comment
            /* block comment */
            "key2": "val/*not a comment*/ue",
            "url": "http://example.com"
        }"#;

        let result = strip_comments(input);
        assert!(!result.contains("Line comment"));
        assert!(!result.contains("trailing comment"));
        assert!(!result.contains("block comment"));
        assert!(result.contains("val/*not a comment*/ue"));
        assert!(result.contains("http://example.com"));
    }

    #[test]
    fn test_parse_jsonc() {
        let input = r#"{
            // pick the VM sandbox
            "providers": { "sandbox": { "type": "vm", "config": { "vmName": "box" } } },
            "pool": { "maxSize": 2 }
        }"#;

        let config = AppConfig::parse_jsonc(input, "test").unwrap();
        assert_eq!(config.providers.selected_type("sandbox"), Some("vm"));
        assert_eq!(config.pool.max_size(), 2);
        assert_eq!(config.server.address(), DEFAULT_ADDRESS);
    }

    #[test]
    fn test_merge_precedence() {
        let file = AppConfig::parse_jsonc(
            r#"{"providers": {"sandbox": {"type": "vm", "config": {"cpus": 2, "image": "a"}}},
                "proxy": {"model": "gpt-4o"}}"#,
            "file",
        )
        .unwrap();

        let mut runtime = AppConfig::default();
        runtime.providers.set(
            "sandbox",
            ProviderSelection::of_type("native").with_config(json!({"image": "b"})),
        );

        let merged = file.merge(runtime);
        let sandbox = merged.providers.get("sandbox").unwrap();
        assert_eq!(sandbox.provider_type.as_deref(), Some("native"));
        assert_eq!(sandbox.config, json!({"cpus": 2, "image": "b"}));
        assert_eq!(merged.proxy.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_apply_env() {
        let env: HashMap<&str, &str> = [
            ("SANDBOX_PROVIDER", "native"),
            ("AGENT_PROVIDER", "claude"),
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("AGENT_MODEL", ""),
            ("SANDBOX_POOL_SIZE", "7"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.providers.selected_type("sandbox"), Some("native"));
        assert_eq!(config.providers.selected_type("agent"), Some("claude"));
        assert_eq!(config.agent.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.agent.model, None);
        assert_eq!(config.pool.max_size(), 7);
    }

    #[test]
    fn test_selection_for_agent_includes_settings() {
        let mut config = AppConfig::default();
        config.agent.api_key = Some("sk-abc".to_string());
        config.providers.set(
            "agent",
            ProviderSelection::of_type("claude").with_config(json!({"model": "opus"})),
        );

        let selection = config.selection_for("agent");
        assert_eq!(selection.provider_type.as_deref(), Some("claude"));
        assert_eq!(selection.config["apiKey"], "sk-abc");
        assert_eq!(selection.config["model"], "opus");

        assert_eq!(config.selection_for("sandbox"), ProviderSelection::default());
    }

    #[test]
    fn test_apply_env_rejects_bad_pool_size() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(|k| (k == "SANDBOX_POOL_SIZE").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_substitute_file_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("key.txt"), "secret\"value\n").unwrap();
        let config_path = dir.path().join("agentbox.json");

        let out = substitute_variables(r#"{"proxy": {"apiKey": "{file:key.txt}"}}"#, &config_path)
            .unwrap();
        let config = AppConfig::parse_jsonc(&out, "test").unwrap();
        assert_eq!(config.proxy.api_key.as_deref(), Some("secret\"value"));
    }

    #[test]
    fn test_substitute_missing_env() {
        let err = substitute_variables(
            r#"{"x": "{env:AGENTBOX_SURELY_UNSET_VAR}"}"#,
            Path::new("/tmp/agentbox.json"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::EnvVarNotFound { .. }));
    }

    #[test]
    fn test_store_runtime_overrides_win() {
        let mut base = AppConfig::default();
        base.providers
            .set("sandbox", ProviderSelection::of_type("vm"));
        let store = ConfigStore::new(base);

        store.set_selection("sandbox", ProviderSelection::of_type("native"));
        assert_eq!(
            store.effective().providers.selected_type("sandbox"),
            Some("native")
        );

        store.clear_runtime();
        assert_eq!(
            store.effective().providers.selected_type("sandbox"),
            Some("vm")
        );
    }

    #[tokio::test]
    async fn test_store_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(AppConfig::default()).with_persist_path(&path);

        store.update_runtime(AppConfig {
            pool: PoolConfig { max_size: Some(9) },
            ..Default::default()
        });
        store.persist().await.unwrap();

        let loaded = AppConfig::load_file(&path).await.unwrap();
        assert_eq!(loaded.pool.max_size(), 9);
    }
}
