//! Sandboxed execution for agentbox.
//!
//! Three interchangeable providers implement [`SandboxProvider`]:
//!
//! - [`NativeSandbox`]: host subprocess, no isolation
//! - [`VmSandbox`]: micro-VM per image with volume mounts and file sync-back
//! - [`CliSandbox`]: wraps an external sandboxing binary
//!
//! [`SandboxPool`] caches live instances per image with LRU eviction.
//!
//! `exec` and `run_script` never return errors: every failure is encoded in
//! the result's exit code and stderr. Lifecycle calls (`init`, `shutdown`)
//! return `Result`.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod native;
pub mod pool;
pub mod process;
pub mod script;
pub mod vm;

pub use catalog::{builtin_plugins, sandbox_loader, CliManifestBuilder, SandboxRegistry};
pub use cli::CliSandbox;
pub use config::{CliSandboxConfig, NativeConfig, VmConfig};
pub use error::{SandboxError, SandboxResult};
pub use native::NativeSandbox;
pub use pool::{PoolLease, PoolStats, SandboxPool};
pub use script::ScriptRuntime;
pub use vm::{LimaBackend, VmBackend, VmHandle, VmSandbox, VmSpec};

use agentbox_core::{Provider, SandboxCapabilities};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Options for a single command execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxExecOptions {
    /// Shell command line.
    pub command: String,
    /// Extra arguments, shell-quoted and appended to `command`.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Image to run in, for providers that support images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Timeout in milliseconds.
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl SandboxExecOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// `command` followed by every argument, shell-quoted.
    pub fn command_line(&self) -> String {
        let mut line = self.command.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line
    }
}

/// Outcome of an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Wall time in milliseconds.
    #[serde(rename = "duration")]
    pub duration_ms: u64,
}

impl SandboxExecResult {
    /// A result for an execution that never started.
    pub fn failure(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: 1,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Stdout and stderr joined, for single-stream consumers.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Options for [`SandboxProvider::run_script`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRunOptions {
    #[serde(default)]
    pub args: Vec<String>,
    /// Packages installed before the script runs.
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Timeout in milliseconds, applied to installation and to the script.
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Wire form of a script run: the file, its working directory and options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRunRequest {
    pub file_path: PathBuf,
    pub work_dir: PathBuf,
    #[serde(flatten)]
    pub options: ScriptRunOptions,
}

/// Outcome of a script run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRunResult {
    pub success: bool,
    pub exit_code: i32,
    pub runtime: ScriptRuntime,
    /// Wall time in milliseconds, including package installation.
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptRunResult {
    pub fn from_exec(runtime: ScriptRuntime, result: SandboxExecResult, elapsed: Duration) -> Self {
        Self {
            success: result.success(),
            exit_code: result.exit_code,
            runtime,
            duration_ms: elapsed.as_millis() as u64,
            stdout: result.stdout,
            stderr: result.stderr,
        }
    }

    pub fn failure(runtime: ScriptRuntime, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            exit_code: 1,
            runtime,
            duration_ms: elapsed.as_millis() as u64,
            stdout: String::new(),
            stderr: message.into(),
        }
    }
}

/// A host directory exposed inside an isolated environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub guest_path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    /// Mount `path` at the same absolute path, writable.
    pub fn same_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            host_path: path.clone(),
            guest_path: path,
            read_only: false,
        }
    }

    /// Whether `path` on the host is visible through this mount.
    pub fn covers(&self, path: &Path) -> bool {
        path.starts_with(&self.host_path)
    }
}

/// Contract of a sandbox provider.
#[async_trait]
pub trait SandboxProvider: Provider {
    /// Run a command. Never fails: spawn errors become `exit_code = 1` with
    /// the error in stderr, timeouts keep captured output.
    async fn exec(&self, options: SandboxExecOptions) -> SandboxExecResult;

    /// Run a script file, detecting its runtime from the extension and
    /// installing `options.packages` first.
    async fn run_script(
        &self,
        file_path: &Path,
        work_dir: &Path,
        options: ScriptRunOptions,
    ) -> ScriptRunResult {
        script::run_script(self, file_path, work_dir, options).await
    }

    /// Replace the volume mounts used for subsequently created environments.
    async fn set_volumes(&self, mounts: Vec<VolumeMount>) -> SandboxResult<()>;

    fn sandbox_capabilities(&self) -> SandboxCapabilities;
}

/// Quote a string for POSIX `sh`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
