//! Per-provider configuration.
//!
//! Each provider parses its options from the JSON value handed to its factory.

use agentbox_core::config::merge_json;
use agentbox_core::{ProviderError, ProviderResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Parse a provider config value. `null` yields the defaults.
pub fn parse_config<T>(provider_type: &str, value: &Value) -> ProviderResult<T>
where
    T: DeserializeOwned + Default,
{
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone())
        .map_err(|e| ProviderError::invalid_config(provider_type, e.to_string()))
}

/// Apply a config patch on top of `current`. Keys absent from `patch` keep
/// their current values; `null` leaves `current` untouched.
pub fn patch_config<T>(provider_type: &str, current: &T, patch: &Value) -> ProviderResult<T>
where
    T: Serialize + DeserializeOwned + Default + Clone,
{
    if patch.is_null() {
        return Ok(current.clone());
    }
    let merged = merge_json(serde_json::to_value(current)?, patch.clone());
    parse_config(provider_type, &merged)
}

/// Native provider options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NativeConfig {
    /// Timeout applied when a request carries none, in milliseconds.
    pub timeout_ms: u64,
    /// Shell used to interpret command lines.
    pub shell: String,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            shell: "sh".to_string(),
        }
    }
}

impl NativeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// VM provider options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VmConfig {
    /// Image used when a request names none.
    pub default_image: String,
    pub cpus: u32,
    /// Memory size, e.g. `"2GiB"`.
    pub memory: String,
    /// Prefix of VM names created by this provider.
    pub name_prefix: String,
    pub timeout_ms: u64,
    /// Explicit `limactl` path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limactl: Option<PathBuf>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            default_image: "node:18-alpine".to_string(),
            cpus: 2,
            memory: "2GiB".to_string(),
            name_prefix: "agentbox".to_string(),
            timeout_ms: 300_000,
            limactl: None,
        }
    }
}

impl VmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// External-CLI provider options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CliSandboxConfig {
    /// Binary name looked up on `PATH` and in well-known directories.
    pub binary: String,
    /// Arguments placed before `sh -c <command>`.
    pub run_args: Vec<String>,
    /// Environment variable holding an explicit binary path.
    pub path_env: String,
    /// Extra directories searched after `PATH`.
    pub search_dirs: Vec<PathBuf>,
    pub timeout_ms: u64,
    /// Whether the wrapped tool lets commands reach the network.
    pub networking: bool,
}

impl Default for CliSandboxConfig {
    fn default() -> Self {
        Self {
            binary: "srt".to_string(),
            run_args: vec!["run".to_string(), "--".to_string()],
            path_env: "SANDBOX_CLI_PATH".to_string(),
            search_dirs: Vec::new(),
            timeout_ms: 120_000,
            networking: true,
        }
    }
}

impl CliSandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_is_default() {
        let config: NativeConfig = parse_config("native", &Value::Null).unwrap();
        assert_eq!(config, NativeConfig::default());
    }

    #[test]
    fn test_partial_config() {
        let config: VmConfig = parse_config("vm", &json!({"cpus": 4})).unwrap();
        assert_eq!(config.cpus, 4);
        assert_eq!(config.memory, "2GiB");
    }

    #[test]
    fn test_patch_keeps_unpatched_fields() {
        let current = CliSandboxConfig {
            binary: "jail-bin".to_string(),
            search_dirs: vec![PathBuf::from("/opt/jail")],
            ..Default::default()
        };
        let patched = patch_config("jail", &current, &json!({"timeoutMs": 5000})).unwrap();
        assert_eq!(patched.binary, "jail-bin");
        assert_eq!(patched.search_dirs, vec![PathBuf::from("/opt/jail")]);
        assert_eq!(patched.timeout_ms, 5000);

        assert_eq!(patch_config("jail", &current, &Value::Null).unwrap(), current);
    }

    #[test]
    fn test_invalid_config() {
        let err = parse_config::<CliSandboxConfig>("cli", &json!({"runArgs": "run"})).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig { .. }));
    }
}
