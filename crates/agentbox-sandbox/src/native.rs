//! Native provider: runs commands directly on the host.
//!
//! No isolation. Always available, which makes it the fallback when no
//! isolated provider can run.

use crate::config::{parse_config, patch_config, NativeConfig};
use crate::error::{SandboxError, SandboxResult};
use crate::process::{run_captured, NON_INTERACTIVE_ENV};
use crate::script::ScriptRuntime;
use crate::{SandboxExecOptions, SandboxExecResult, SandboxProvider, VolumeMount};
use agentbox_core::{
    IsolationLevel, Provider, ProviderCapabilities, ProviderResult, SandboxCapabilities,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::RwLock;
use tokio::process::Command;
use tracing::debug;

pub const PROVIDER_TYPE: &str = "native";

pub struct NativeSandbox {
    config: RwLock<NativeConfig>,
}

impl NativeSandbox {
    pub fn new(config: NativeConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn from_value(value: &Value) -> ProviderResult<Self> {
        Ok(Self::new(parse_config(PROVIDER_TYPE, value)?))
    }

    fn config(&self) -> NativeConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Default for NativeSandbox {
    fn default() -> Self {
        Self::new(NativeConfig::default())
    }
}

#[async_trait]
impl Provider for NativeSandbox {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn init(&self, config: &Value) -> ProviderResult<()> {
        let patched = patch_config(PROVIDER_TYPE, &self.config(), config)?;
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = patched;
        debug!("Native sandbox ready");
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
impl SandboxProvider for NativeSandbox {
    async fn exec(&self, options: SandboxExecOptions) -> SandboxExecResult {
        let config = self.config();
        let command_line = options.command_line();
        debug!(command = %command_line, cwd = ?options.cwd, "Native exec");

        let mut cmd = Command::new(&config.shell);
        cmd.arg("-c").arg(&command_line);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(NON_INTERACTIVE_ENV.iter().copied());
        cmd.envs(&options.env);

        let timeout = options.timeout().unwrap_or_else(|| config.timeout());
        run_captured(cmd, Some(timeout), &config.shell).await
    }

    async fn set_volumes(&self, mounts: Vec<VolumeMount>) -> SandboxResult<()> {
        if mounts.is_empty() {
            return Ok(());
        }
        Err(SandboxError::unsupported(
            "native sandbox runs on the host and has no volume mounts",
        ))
    }

    fn sandbox_capabilities(&self) -> SandboxCapabilities {
        SandboxCapabilities {
            isolation: IsolationLevel::None,
            runtimes: ScriptRuntime::names(),
            pooling: false,
            volume_mounts: false,
            networking: true,
        }
    }
}
