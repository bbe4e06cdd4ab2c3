//! VM-isolated provider.
//!
//! One micro-VM is kept per provider instance and keyed by image: a request
//! for a different image tears the VM down and boots a new one. Mounts are
//! fixed when a VM boots, so changing them also recreates it.

mod backend;
mod lima;
pub mod sync;

pub use backend::{VmBackend, VmCommand, VmHandle, VmSpec};
pub use lima::LimaBackend;

use crate::config::{parse_config, patch_config, VmConfig};
use crate::error::SandboxResult;
use crate::process::NON_INTERACTIVE_ENV;
use crate::script::{self, ScriptRuntime};
use crate::{
    SandboxExecOptions, SandboxExecResult, SandboxProvider, ScriptRunOptions, ScriptRunResult,
    VolumeMount,
};
use agentbox_core::{
    IsolationLevel, Provider, ProviderCapabilities, ProviderResult, SandboxCapabilities,
};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const PROVIDER_TYPE: &str = "vm";

pub(crate) fn capabilities() -> SandboxCapabilities {
    SandboxCapabilities {
        isolation: IsolationLevel::Vm,
        runtimes: ScriptRuntime::names(),
        pooling: true,
        volume_mounts: true,
        networking: true,
    }
}

struct ActiveVm {
    image: String,
    handle: Arc<dyn VmHandle>,
}

#[derive(Default)]
struct VmState {
    vm: Option<ActiveVm>,
    mounts: Vec<VolumeMount>,
}

pub struct VmSandbox {
    backend: Arc<dyn VmBackend>,
    config: RwLock<VmConfig>,
    state: Mutex<VmState>,
}

impl VmSandbox {
    pub fn new(backend: Arc<dyn VmBackend>, config: VmConfig) -> Self {
        Self {
            backend,
            config: RwLock::new(config),
            state: Mutex::new(VmState::default()),
        }
    }

    /// A Lima-backed provider configured from `value`.
    pub fn from_value(value: &Value) -> ProviderResult<Self> {
        let config: VmConfig = parse_config(PROVIDER_TYPE, value)?;
        Ok(Self::new(Arc::new(LimaBackend::new(&config)), config))
    }

    fn config(&self) -> VmConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// The running VM for `image`, booting one if needed.
    async fn ensure_vm(&self, image: &str) -> SandboxResult<Arc<dyn VmHandle>> {
        let mut state = self.state.lock().await;
        if let Some(active) = &state.vm {
            if active.image == image {
                return Ok(active.handle.clone());
            }
        }

        if let Some(previous) = state.vm.take() {
            info!(
                from = %previous.image,
                to = %image,
                "Image changed, recreating VM"
            );
            if let Err(e) = previous.handle.stop().await {
                warn!(vm = previous.handle.id(), error = %e, "Failed to stop previous VM");
            }
        }

        let config = self.config();
        let spec = VmSpec {
            image: image.to_string(),
            mounts: state.mounts.clone(),
            cpus: config.cpus,
            memory: config.memory,
        };
        let handle: Arc<dyn VmHandle> = Arc::from(self.backend.start(&spec).await?);
        state.vm = Some(ActiveVm {
            image: image.to_string(),
            handle: handle.clone(),
        });
        Ok(handle)
    }

    /// Mount `work_dir` at its own path unless an existing mount covers it.
    async fn ensure_mount(&self, work_dir: &Path) {
        let mut state = self.state.lock().await;
        if state.mounts.iter().any(|m| m.covers(work_dir)) {
            return;
        }
        debug!(path = %work_dir.display(), "Adding working directory mount");
        state.mounts.push(VolumeMount::same_path(work_dir));
        if let Some(previous) = state.vm.take() {
            if let Err(e) = previous.handle.stop().await {
                warn!(vm = previous.handle.id(), error = %e, "Failed to stop VM for remount");
            }
        }
    }

    async fn stop_vm(&self) -> SandboxResult<()> {
        let active = self.state.lock().await.vm.take();
        match active {
            Some(active) => active.handle.stop().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Provider for VmSandbox {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    async fn is_available(&self) -> bool {
        self.backend.is_available().await
    }

    async fn init(&self, config: &Value) -> ProviderResult<()> {
        let patched = patch_config(PROVIDER_TYPE, &self.config(), config)?;
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = patched;
        debug!(backend = self.backend.name(), "VM sandbox ready");
        Ok(())
    }

    async fn shutdown(&self) -> ProviderResult<()> {
        self.stop_vm()
            .await
            .map_err(|e| e.into_stop_error(PROVIDER_TYPE))
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::Sandbox(self.sandbox_capabilities())
    }
}

#[async_trait]
impl SandboxProvider for VmSandbox {
    async fn exec(&self, options: SandboxExecOptions) -> SandboxExecResult {
        let started = Instant::now();
        let config = self.config();
        let image = options
            .image
            .clone()
            .unwrap_or_else(|| config.default_image.clone());

        let handle = match self.ensure_vm(&image).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(image = %image, error = %e, "VM unavailable");
                return SandboxExecResult::failure(e.to_string(), started.elapsed());
            }
        };

        let mut env: std::collections::HashMap<String, String> = NON_INTERACTIVE_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.extend(options.env.clone());

        handle
            .exec(VmCommand {
                command_line: options.command_line(),
                cwd: options.cwd.clone(),
                env,
                timeout: Some(options.timeout().unwrap_or_else(|| config.timeout())),
            })
            .await
    }

    async fn run_script(
        &self,
        file_path: &Path,
        work_dir: &Path,
        options: ScriptRunOptions,
    ) -> ScriptRunResult {
        let started = Instant::now();
        let runtime = ScriptRuntime::detect(file_path);

        self.ensure_mount(work_dir).await;
        let handle = match self.ensure_vm(runtime.image()).await {
            Ok(handle) => handle,
            Err(e) => return ScriptRunResult::failure(runtime, e.to_string(), started.elapsed()),
        };

        let marker = sync::marker_path();
        let marked = match sync::touch_marker(handle.as_ref(), &marker).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Sync-back disabled for this run");
                false
            }
        };

        let result = script::run_script(self, file_path, work_dir, options).await;

        if marked {
            sync::sync_back(handle.as_ref(), work_dir, &marker).await;
        }
        result
    }

    async fn set_volumes(&self, mounts: Vec<VolumeMount>) -> SandboxResult<()> {
        let previous = {
            let mut state = self.state.lock().await;
            if state.mounts == mounts {
                return Ok(());
            }
            state.mounts = mounts;
            state.vm.take()
        };
        if let Some(previous) = previous {
            debug!(vm = previous.handle.id(), "Mounts changed, stopping VM");
            previous.handle.stop().await?;
        }
        Ok(())
    }

    fn sandbox_capabilities(&self) -> SandboxCapabilities {
        capabilities()
    }
}
