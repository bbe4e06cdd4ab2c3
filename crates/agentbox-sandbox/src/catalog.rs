//! Built-in sandbox plugins and the manifest builder for CLI-wrapped tools.

use crate::config::{parse_config, CliSandboxConfig};
use crate::{cli, native, vm, CliSandbox, NativeSandbox, SandboxProvider, VmSandbox};
use agentbox_core::config::merge_json;
use agentbox_core::{
    ManifestBuilder, PluginLoader, PluginManifest, ProviderCapabilities, ProviderMetadata,
    ProviderPlugin, ProviderRegistry, ProviderResult, SANDBOX_CATEGORY,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Registry of sandbox providers.
pub type SandboxRegistry = ProviderRegistry<dyn SandboxProvider>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Built-in plugins in default priority order: strongest isolation first.
pub fn builtin_plugins() -> Vec<ProviderPlugin<dyn SandboxProvider>> {
    vec![vm_plugin(), cli_plugin(), native_plugin()]
}

pub fn native_plugin() -> ProviderPlugin<dyn SandboxProvider> {
    let capabilities = ProviderCapabilities::Sandbox(NativeSandbox::default().sandbox_capabilities());
    ProviderPlugin::new(
        ProviderMetadata {
            provider_type: native::PROVIDER_TYPE.to_string(),
            name: "Native".to_string(),
            description: "Runs commands directly on the host without isolation".to_string(),
            version: VERSION.to_string(),
            capabilities,
            config_schema: json!({
                "type": "object",
                "properties": {
                    "timeoutMs": {"type": "integer", "minimum": 1},
                    "shell": {"type": "string"}
                }
            }),
        },
        |config| Ok(Arc::new(NativeSandbox::from_value(config)?) as Arc<dyn SandboxProvider>),
    )
}

pub fn vm_plugin() -> ProviderPlugin<dyn SandboxProvider> {
    ProviderPlugin::new(
        ProviderMetadata {
            provider_type: vm::PROVIDER_TYPE.to_string(),
            name: "Micro-VM".to_string(),
            description: "Runs each image in a Lima micro-VM with volume mounts and file sync-back"
                .to_string(),
            version: VERSION.to_string(),
            capabilities: ProviderCapabilities::Sandbox(vm::capabilities()),
            config_schema: json!({
                "type": "object",
                "properties": {
                    "defaultImage": {"type": "string"},
                    "cpus": {"type": "integer", "minimum": 1},
                    "memory": {"type": "string"},
                    "namePrefix": {"type": "string"},
                    "timeoutMs": {"type": "integer", "minimum": 1},
                    "limactl": {"type": "string"}
                }
            }),
        },
        |config| Ok(Arc::new(VmSandbox::from_value(config)?) as Arc<dyn SandboxProvider>),
    )
}

pub fn cli_plugin() -> ProviderPlugin<dyn SandboxProvider> {
    cli_plugin_for(
        cli::PROVIDER_TYPE,
        "Sandbox CLI",
        "Wraps each command in an external sandboxing tool's `run` subcommand",
        VERSION,
        CliSandboxConfig::default(),
    )
}

fn cli_plugin_for(
    provider_type: &str,
    name: &str,
    description: &str,
    version: &str,
    defaults: CliSandboxConfig,
) -> ProviderPlugin<dyn SandboxProvider> {
    let capabilities = ProviderCapabilities::Sandbox(
        CliSandbox::with_type(provider_type, defaults.clone()).sandbox_capabilities(),
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
                    "runArgs": {"type": "array", "items": {"type": "string"}},
                    "pathEnv": {"type": "string"},
                    "searchDirs": {"type": "array", "items": {"type": "string"}},
                    "timeoutMs": {"type": "integer", "minimum": 1},
                    "networking": {"type": "boolean"}
                }
            }),
        },
        move |config| {
            let config = if config.is_null() {
                defaults.clone()
            } else {
                let merged = merge_json(serde_json::to_value(&defaults)?, config.clone());
                parse_config(&owned_type, &merged)?
            };
            Ok(Arc::new(CliSandbox::with_type(owned_type.clone(), config)) as Arc<dyn SandboxProvider>)
        },
    )
}

/// Builds sandbox plugins from manifests of kind `cli`.
///
/// ```json
/// {
///   "type": "firejail",
///   "name": "Firejail",
///   "category": "sandbox",
///   "kind": "cli",
///   "config": { "binary": "firejail", "runArgs": ["--quiet", "--"] }
/// }
/// ```
#[derive(Debug, Default)]
pub struct CliManifestBuilder;

impl ManifestBuilder<dyn SandboxProvider> for CliManifestBuilder {
    fn kinds(&self) -> Vec<&'static str> {
        vec!["cli"]
    }

    fn build(&self, manifest: &PluginManifest) -> ProviderResult<ProviderPlugin<dyn SandboxProvider>> {
        let defaults: CliSandboxConfig = parse_config(&manifest.provider_type, &manifest.config)?;
        Ok(cli_plugin_for(
            &manifest.provider_type,
            &manifest.name,
            &manifest.description,
            &manifest.version,
            defaults,
        ))
    }
}

/// A loader with the built-in catalog and, if given, a manifest directory.
pub fn sandbox_loader(
    registry: Arc<SandboxRegistry>,
    dir: Option<PathBuf>,
) -> PluginLoader<dyn SandboxProvider> {
    let mut loader = PluginLoader::new(registry, Arc::new(CliManifestBuilder));
    for plugin in builtin_plugins() {
        loader = loader.with_builtin(plugin);
    }
    if let Some(dir) = dir {
        loader = loader.with_dir(dir);
    }
    loader
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SandboxExecOptions;
    use agentbox_core::{IsolationLevel, Provider};
    use serde_json::Value;

    fn registry() -> Arc<SandboxRegistry> {
        Arc::new(SandboxRegistry::new(SANDBOX_CATEGORY))
    }

    #[tokio::test]
    async fn test_builtin_priority_order() {
        let registry = registry();
        let summary = sandbox_loader(registry.clone(), None).load_all().await;
        assert_eq!(summary.loaded, 3);
        assert_eq!(registry.types(), vec!["vm", "cli", "native"]);
        assert!(registry.get_available().await.contains(&"native".to_string()));
    }

    #[test]
    fn test_metadata_capabilities() {
        let vm = vm_plugin();
        let caps = vm.metadata.capabilities.as_sandbox().cloned().unwrap();
        assert_eq!(caps.isolation, IsolationLevel::Vm);
        assert!(caps.volume_mounts);

        let native = native_plugin();
        let caps = native.metadata.capabilities.as_sandbox().cloned().unwrap();
        assert_eq!(caps.isolation, IsolationLevel::None);
    }

    #[tokio::test]
    async fn test_manifest_builds_cli_provider() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("jail.json"),
            r#"{
                "type": "jail",
                "name": "Jail",
                "category": "sandbox",
                "kind": "cli",
                "config": {"binary": "agentbox-missing-jail", "pathEnv": "", "networking": false}
            }"#,
        )
        .unwrap();

        let registry = registry();
        let loader = sandbox_loader(registry.clone(), Some(dir.path().to_path_buf()));
        let summary = loader.load_all().await;
        assert_eq!(summary.failed, 0, "{:?}", summary.errors);
        assert!(registry.has("jail"));

        let provider = registry.create("jail", &Value::Null).unwrap();
        assert_eq!(provider.provider_type(), "jail");
        assert!(!provider.sandbox_capabilities().networking);
        assert!(!provider.is_available().await);
        assert!(!registry.get_available().await.contains(&"jail".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_manifest_defaults_survive_instance_config() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("jail-bin");
        std::fs::write(&tool, "#!/bin/sh\n[ \"$1\" = -- ] && shift\nexec \"$@\"\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let manifest = json!({
            "type": "jail",
            "name": "Jail",
            "category": "sandbox",
            "kind": "cli",
            "config": {
                "binary": "jail-bin",
                "runArgs": ["--"],
                "pathEnv": "",
                "searchDirs": [dir.path()]
            }
        });
        std::fs::write(dir.path().join("jail.json"), manifest.to_string()).unwrap();

        let registry = registry();
        let summary = sandbox_loader(registry.clone(), Some(dir.path().to_path_buf()))
            .load_all()
            .await;
        assert_eq!(summary.failed, 0, "{:?}", summary.errors);

        let provider = registry
            .get_instance("jail", &json!({"timeoutMs": 5000}))
            .await
            .unwrap();
        assert!(provider.is_available().await);

        let result = provider.exec(SandboxExecOptions::new("echo jailed")).await;
        assert!(result.success(), "stderr: {}", result.stderr);
        assert_eq!(result.stdout.trim(), "jailed");
    }

    #[tokio::test]
    async fn test_manifest_cannot_shadow_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("native.json"),
            r#"{"type": "native", "name": "Fake", "category": "sandbox", "kind": "cli"}"#,
        )
        .unwrap();

        let registry = registry();
        let summary = sandbox_loader(registry.clone(), Some(dir.path().to_path_buf()))
            .load_all()
            .await;
        assert_eq!(summary.failed, 1);
        assert_eq!(registry.metadata("native").unwrap().name, "Native");
    }
}
