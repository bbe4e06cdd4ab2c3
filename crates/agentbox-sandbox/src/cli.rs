//! External-CLI provider: wraps each command in a sandboxing tool's `run`
//! subcommand, `<binary> <runArgs..> sh -c <command>`.

use crate::config::{parse_config, patch_config, CliSandboxConfig};
use crate::error::{SandboxError, SandboxResult};
use crate::process::{run_captured, NON_INTERACTIVE_ENV};
use crate::script::ScriptRuntime;
use crate::{SandboxExecOptions, SandboxExecResult, SandboxProvider, VolumeMount};
use agentbox_core::{
    IsolationLevel, Provider, ProviderCapabilities, ProviderResult, SandboxCapabilities,
};
use agentbox_util::bin::{find_binary, well_known_dirs};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

pub const PROVIDER_TYPE: &str = "cli";

pub struct CliSandbox {
    provider_type: String,
    config: RwLock<CliSandboxConfig>,
}

impl CliSandbox {
    pub fn new(config: CliSandboxConfig) -> Self {
        Self::with_type(PROVIDER_TYPE, config)
    }

    /// A provider registered under a custom type, as built from a manifest.
    pub fn with_type(provider_type: impl Into<String>, config: CliSandboxConfig) -> Self {
        Self {
            provider_type: provider_type.into(),
            config: RwLock::new(config),
        }
    }

    pub fn from_value(value: &Value) -> ProviderResult<Self> {
        Ok(Self::new(parse_config(PROVIDER_TYPE, value)?))
    }

    fn config(&self) -> CliSandboxConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Locate the wrapped binary: `PATH`, then configured and well-known
    /// directories, then the path environment variable.
    pub fn binary_path(&self) -> Option<PathBuf> {
        let config = self.config();
        let mut dirs = config.search_dirs.clone();
        dirs.extend(well_known_dirs());
        let env_var = (!config.path_env.is_empty()).then_some(config.path_env.as_str());
        find_binary(&config.binary, &dirs, env_var)
    }
}

impl Default for CliSandbox {
    fn default() -> Self {
        Self::new(CliSandboxConfig::default())
    }
}

#[async_trait]
impl Provider for CliSandbox {
    fn provider_type(&self) -> &str {
        &self.provider_type
    }

    async fn is_available(&self) -> bool {
        self.binary_path().is_some()
    }

    async fn init(&self, config: &Value) -> ProviderResult<()> {
        let patched = patch_config(&self.provider_type, &self.config(), config)?;
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = patched;
        match self.binary_path() {
            Some(path) => debug!(binary = %path.display(), "CLI sandbox ready"),
            None => debug!(binary = %self.config().binary, "CLI sandbox binary not found yet"),
        }
        Ok(())
    }

    async fn shutdown(&self) -> ProviderResult<()> {
        Ok(())
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::Sandbox(self.sandbox_capabilities())
    }
}

#[async_trait]
impl SandboxProvider for CliSandbox {
    async fn exec(&self, options: SandboxExecOptions) -> SandboxExecResult {
        let started = Instant::now();
        let config = self.config();
        let Some(binary) = self.binary_path() else {
            return SandboxExecResult::failure(
                SandboxError::RuntimeNotAvailable(format!("'{}' not found", config.binary))
                    .to_string(),
                started.elapsed(),
            );
        };

        let command_line = options.command_line();
        debug!(binary = %binary.display(), command = %command_line, "CLI sandbox exec");

        let mut cmd = Command::new(&binary);
        cmd.args(&config.run_args).arg("sh").arg("-c").arg(&command_line);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(NON_INTERACTIVE_ENV.iter().copied());
        cmd.envs(&options.env);

        let timeout = options.timeout().unwrap_or_else(|| config.timeout());
        run_captured(cmd, Some(timeout), &config.binary).await
    }

    async fn set_volumes(&self, mounts: Vec<VolumeMount>) -> SandboxResult<()> {
        if mounts.is_empty() {
            return Ok(());
        }
        Err(SandboxError::unsupported(format!(
            "'{}' does not support volume mounts",
            self.provider_type
        )))
    }

    fn sandbox_capabilities(&self) -> SandboxCapabilities {
        SandboxCapabilities {
            isolation: IsolationLevel::Process,
            runtimes: ScriptRuntime::names(),
            pooling: false,
            volume_mounts: false,
            networking: self.config().networking,
        }
    }
}
