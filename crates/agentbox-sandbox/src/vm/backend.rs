//! Engine seam for VM-isolated sandboxes.

use crate::error::SandboxResult;
use crate::{SandboxExecResult, VolumeMount};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// What a VM is created with. Mounts are fixed for the VM's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub image: String,
    pub mounts: Vec<VolumeMount>,
    pub cpus: u32,
    pub memory: String,
}

/// A command to run inside a VM.
#[derive(Debug, Clone, Default)]
pub struct VmCommand {
    pub command_line: String,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl VmCommand {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            ..Default::default()
        }
    }
}

/// Creates VMs.
#[async_trait]
pub trait VmBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the engine is installed and usable.
    async fn is_available(&self) -> bool;

    /// Create and boot a VM.
    async fn start(&self, spec: &VmSpec) -> SandboxResult<Box<dyn VmHandle>>;
}

/// A running VM.
#[async_trait]
pub trait VmHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Run a shell command line. Failures are encoded in the result.
    async fn exec(&self, command: VmCommand) -> SandboxExecResult;

    /// Stop and delete the VM. Idempotent.
    async fn stop(&self) -> SandboxResult<()>;
}
