//! Plugin discovery, validation and hot reload.
//!
//! Plugins come from two places:
//! - a compile-time catalog of built-in plugins, registered as-is;
//! - JSON manifests in a plugin directory, each naming an implementation
//!   `kind` that a [`ManifestBuilder`] turns into a [`ProviderPlugin`].
//!
//! Every manifest is validated on its own. One bad manifest never prevents the
//! others from loading; failures are collected into a [`LoadSummary`].

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{Provider, ProviderPlugin};
use crate::registry::ProviderRegistry;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const MANIFEST_EXTENSION: &str = "json";

/// On-disk description of a provider plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Registry category this plugin belongs to.
    pub category: String,
    /// Implementation the builder instantiates (`cli`, ...).
    pub kind: String,
    /// Kind-specific options.
    #[serde(default)]
    pub config: Value,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

impl PluginManifest {
    /// Check fields that do not depend on the builder.
    pub fn validate(&self) -> ProviderResult<()> {
        if self.provider_type.is_empty() {
            return Err(ProviderError::InvalidManifest("`type` is empty".to_string()));
        }
        if !self
            .provider_type
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(ProviderError::InvalidManifest(format!(
                "`type` '{}' must be lowercase alphanumeric, '-' or '_'",
                self.provider_type
            )));
        }
        if self.name.trim().is_empty() {
            return Err(ProviderError::InvalidManifest("`name` is empty".to_string()));
        }
        if self.kind.trim().is_empty() {
            return Err(ProviderError::InvalidManifest("`kind` is empty".to_string()));
        }
        if !(self.config.is_null() || self.config.is_object()) {
            return Err(ProviderError::InvalidManifest(
                "`config` must be an object".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builds plugins from manifests for one registry category.
pub trait ManifestBuilder<P: ?Sized>: Send + Sync {
    /// Manifest kinds this builder understands.
    fn kinds(&self) -> Vec<&'static str>;

    /// Build a plugin. Called only for manifests that passed validation.
    fn build(&self, manifest: &PluginManifest) -> ProviderResult<ProviderPlugin<P>>;
}

/// A manifest that could not be loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Outcome of a load pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSummary {
    pub loaded: usize,
    pub failed: usize,
    /// Provider types registered by this pass.
    pub providers: Vec<String>,
    pub errors: Vec<LoadFailure>,
}

impl LoadSummary {
    fn fail(&mut self, path: &Path, message: impl Into<String>) {
        let message = message.into();
        warn!(path = %path.display(), error = %message, "Failed to load plugin manifest");
        self.failed += 1;
        self.errors.push(LoadFailure {
            path: path.to_path_buf(),
            message,
        });
    }
}

/// Loads plugins into a registry.
pub struct PluginLoader<P: ?Sized> {
    registry: Arc<ProviderRegistry<P>>,
    builder: Arc<dyn ManifestBuilder<P>>,
    builtins: Vec<ProviderPlugin<P>>,
    dir: Option<PathBuf>,
    /// Manifest path -> provider type, for plugins loaded from disk.
    loaded: Mutex<HashMap<PathBuf, String>>,
}

impl<P: ?Sized + Provider + 'static> PluginLoader<P> {
    pub fn new(registry: Arc<ProviderRegistry<P>>, builder: Arc<dyn ManifestBuilder<P>>) -> Self {
        Self {
            registry,
            builder,
            builtins: Vec::new(),
            dir: None,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Add a plugin to the built-in catalog.
    pub fn with_builtin(mut self, plugin: ProviderPlugin<P>) -> Self {
        self.builtins.push(plugin);
        self
    }

    /// Directory to scan for manifests.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry<P>> {
        &self.registry
    }

    fn is_builtin(&self, provider_type: &str) -> bool {
        self.builtins
            .iter()
            .any(|p| p.provider_type() == provider_type)
    }

    /// Register the built-in catalog, then every manifest in the plugin directory.
    pub async fn load_all(&self) -> LoadSummary {
        for plugin in &self.builtins {
            self.registry.register(plugin.clone());
        }
        let mut summary = self.load_dir().await;
        summary.loaded += self.builtins.len();
        let mut providers: Vec<String> = self
            .builtins
            .iter()
            .map(|p| p.provider_type().to_string())
            .collect();
        providers.append(&mut summary.providers);
        summary.providers = providers;
        summary
    }

    /// Load every manifest in the plugin directory.
    ///
    /// A missing directory yields an empty summary.
    pub async fn load_dir(&self) -> LoadSummary {
        let mut summary = LoadSummary::default();
        let Some(dir) = self.dir.clone() else {
            return summary;
        };

        let mut paths = match manifest_paths(&dir).await {
            Ok(paths) => paths,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "Plugin directory does not exist");
                return summary;
            }
            Err(e) => {
                summary.fail(&dir, format!("cannot read plugin directory: {}", e));
                return summary;
            }
        };
        paths.sort();

        for path in paths {
            match self.load_manifest(&path).await {
                Ok(Some(provider_type)) => {
                    summary.loaded += 1;
                    summary.providers.push(provider_type);
                }
                Ok(None) => {}
                Err(e) => summary.fail(&path, e.to_string()),
            }
        }

        info!(
            dir = %dir.display(),
            loaded = summary.loaded,
            failed = summary.failed,
            "Loaded plugin manifests"
        );
        summary
    }

    /// Returns `None` for manifests of another category; one directory may
    /// serve several registries.
    async fn load_manifest(&self, path: &Path) -> ProviderResult<Option<String>> {
        let content = tokio::fs::read_to_string(path).await?;
        let manifest: PluginManifest = serde_json::from_str(&content)
            .map_err(|e| ProviderError::InvalidManifest(e.to_string()))?;
        manifest.validate()?;

        if manifest.category != self.registry.category() {
            debug!(
                path = %path.display(),
                category = %manifest.category,
                "Skipping manifest of another category"
            );
            return Ok(None);
        }
        if !self.builder.kinds().iter().any(|k| *k == manifest.kind) {
            return Err(ProviderError::InvalidManifest(format!(
                "unsupported kind '{}' (supported: {})",
                manifest.kind,
                self.builder.kinds().join(", ")
            )));
        }
        if self.is_builtin(&manifest.provider_type) {
            return Err(ProviderError::InvalidManifest(format!(
                "type '{}' conflicts with a built-in provider",
                manifest.provider_type
            )));
        }

        let mut loaded = self.loaded.lock().await;
        if let Some((other, _)) = loaded
            .iter()
            .find(|(p, t)| p.as_path() != path && **t == manifest.provider_type)
        {
            return Err(ProviderError::InvalidManifest(format!(
                "type '{}' already declared by {}",
                manifest.provider_type,
                other.display()
            )));
        }

        let plugin = self.builder.build(&manifest)?;
        self.registry.register(plugin);
        loaded.insert(path.to_path_buf(), manifest.provider_type.clone());
        debug!(path = %path.display(), provider_type = %manifest.provider_type, "Registered plugin from manifest");
        Ok(Some(manifest.provider_type))
    }

    /// Unregister every manifest-loaded plugin and load the directory again.
    ///
    /// Built-in plugins are left untouched.
    pub async fn reload(&self) -> LoadSummary {
        let previous: Vec<String> = {
            let mut loaded = self.loaded.lock().await;
            loaded.drain().map(|(_, t)| t).collect()
        };
        for provider_type in &previous {
            self.registry.unregister(provider_type).await;
        }
        self.load_dir().await
    }

    /// Reload manifests whenever the plugin directory changes.
    ///
    /// Must be called from inside a tokio runtime. The returned watcher stops
    /// watching when dropped.
    pub fn watch(self: &Arc<Self>) -> ProviderResult<PluginWatcher> {
        let dir = self
            .dir
            .clone()
            .ok_or_else(|| ProviderError::internal("no plugin directory configured"))?;
        std::fs::create_dir_all(&dir)?;

        let rt = tokio::runtime::Handle::try_current()
            .map_err(|e| ProviderError::internal(format!("no tokio runtime: {}", e)))?;
        let loader = Arc::clone(self);

        let mut debouncer = new_debouncer(
            Duration::from_millis(300),
            move |events: DebounceEventResult| {
                let events = match events {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "Plugin watcher error");
                        return;
                    }
                };
                let touches_manifest = events.iter().any(|event| {
                    event.path.extension().and_then(|e| e.to_str()) == Some(MANIFEST_EXTENSION)
                });
                if !touches_manifest {
                    return;
                }

                let loader = Arc::clone(&loader);
                rt.spawn(async move {
                    let summary = loader.reload().await;
                    info!(
                        loaded = summary.loaded,
                        failed = summary.failed,
                        "Reloaded plugins after change"
                    );
                });
            },
        )
        .map_err(|e| ProviderError::internal(format!("cannot create watcher: {}", e)))?;

        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ProviderError::internal(format!("cannot watch {}: {}", dir.display(), e)))?;

        info!(dir = %dir.display(), "Watching plugin directory");
        Ok(PluginWatcher {
            _debouncer: debouncer,
        })
    }
}

/// Keeps the plugin directory watched while alive.
pub struct PluginWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
}

async fn manifest_paths(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(MANIFEST_EXTENSION)
            && entry.file_type().await?.is_file()
        {
            paths.push(path);
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderCapabilities, ProviderMetadata};
    use async_trait::async_trait;
    use serde_json::json;

    struct Stub(String);

    #[async_trait]
    impl Provider for Stub {
        fn provider_type(&self) -> &str {
            &self.0
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn init(&self, _config: &Value) -> ProviderResult<()> {
            Ok(())
        }

        async fn shutdown(&self) -> ProviderResult<()> {
            Ok(())
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::Other {
                flags: HashMap::new(),
            }
        }
    }

    fn metadata(provider_type: &str, version: &str) -> ProviderMetadata {
        ProviderMetadata {
            provider_type: provider_type.to_string(),
            name: provider_type.to_string(),
            description: String::new(),
            version: version.to_string(),
            capabilities: ProviderCapabilities::Other {
                flags: HashMap::new(),
            },
            config_schema: Value::Null,
        }
    }

    fn stub_plugin(provider_type: &str, version: &str) -> ProviderPlugin<dyn Provider> {
        let t = provider_type.to_string();
        ProviderPlugin::new(metadata(provider_type, version), move |_: &Value| {
            let provider: Arc<dyn Provider> = Arc::new(Stub(t.clone()));
            Ok(provider)
        })
    }

    struct StubBuilder;

    impl ManifestBuilder<dyn Provider> for StubBuilder {
        fn kinds(&self) -> Vec<&'static str> {
            vec!["cli"]
        }

        fn build(&self, manifest: &PluginManifest) -> ProviderResult<ProviderPlugin<dyn Provider>> {
            if manifest.config.get("binary").is_none() {
                return Err(ProviderError::InvalidManifest(
                    "`config.binary` is required".to_string(),
                ));
            }
            Ok(stub_plugin(&manifest.provider_type, &manifest.version))
        }
    }

    fn write_manifest(dir: &Path, file: &str, value: Value) {
        std::fs::write(dir.join(file), serde_json::to_string(&value).unwrap()).unwrap();
    }

    fn loader(dir: &Path) -> PluginLoader<dyn Provider> {
        let registry = Arc::new(ProviderRegistry::<dyn Provider>::new("sandbox"));
        PluginLoader::new(registry, Arc::new(StubBuilder))
            .with_builtin(stub_plugin("native", "1.0.0"))
            .with_dir(dir)
    }

    fn cli_manifest(provider_type: &str) -> Value {
        json!({
            "type": provider_type,
            "name": "Firejail",
            "category": "sandbox",
            "kind": "cli",
            "version": "1.2.0",
            "config": { "binary": "firejail" }
        })
    }

    #[tokio::test]
    async fn test_load_all_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "a-good.json", cli_manifest("firejail"));
        write_manifest(dir.path(), "b-bad-kind.json", json!({
            "type": "wasm", "name": "Wasm", "category": "sandbox", "kind": "dylib"
        }));
        write_manifest(dir.path(), "c-other-category.json", json!({
            "type": "other", "name": "Other", "category": "agent", "kind": "cli"
        }));
        write_manifest(dir.path(), "d-shadow.json", cli_manifest("native"));
        write_manifest(dir.path(), "e-missing-binary.json", json!({
            "type": "nobinary", "name": "x", "category": "sandbox", "kind": "cli"
        }));
        std::fs::write(dir.path().join("f-broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loader = loader(dir.path());
        let summary = loader.load_all().await;

        assert_eq!(summary.loaded, 2);
        assert_eq!(summary.failed, 4);
        assert_eq!(summary.providers, vec!["native", "firejail"]);
        assert_eq!(loader.registry().types(), vec!["native", "firejail"]);
        assert!(summary.errors[0].message.contains("unsupported kind"));
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(&dir.path().join("absent"));
        let summary = loader.load_all().await;
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_reload_replaces_manifest_plugins() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "firejail.json", cli_manifest("firejail"));
        let loader = loader(dir.path());
        loader.load_all().await;
        assert!(loader.registry().has("firejail"));

        std::fs::remove_file(dir.path().join("firejail.json")).unwrap();
        write_manifest(dir.path(), "bwrap.json", cli_manifest("bwrap"));

        let summary = loader.reload().await;
        assert_eq!(summary.providers, vec!["bwrap"]);
        assert!(!loader.registry().has("firejail"));
        assert!(loader.registry().has("bwrap"));
        assert!(loader.registry().has("native"));
    }

    #[tokio::test]
    async fn test_duplicate_type_across_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "a.json", cli_manifest("firejail"));
        write_manifest(dir.path(), "b.json", cli_manifest("firejail"));

        let summary = loader(dir.path()).load_dir().await;
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].message.contains("already declared"));
    }

    #[test]
    fn test_manifest_validation() {
        let mut manifest: PluginManifest = serde_json::from_value(cli_manifest("ok-type_1")).unwrap();
        assert!(manifest.validate().is_ok());

        manifest.provider_type = "Bad Type".to_string();
        assert!(manifest.validate().is_err());

        manifest.provider_type = "ok".to_string();
        manifest.config = json!([1, 2]);
        assert!(manifest.validate().is_err());
    }
}
