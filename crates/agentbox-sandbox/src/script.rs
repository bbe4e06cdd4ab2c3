//! Script runtime detection and the shared `run_script` flow.

use crate::{
    shell_quote, SandboxExecOptions, SandboxProvider, ScriptRunOptions, ScriptRunResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Timeout for package installation when the caller gives none.
const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Interpreter family a script file runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptRuntime {
    Python,
    #[serde(rename = "typescript")]
    TypeScript,
    #[serde(rename = "node")]
    JavaScript,
    Shell,
}

impl ScriptRuntime {
    /// Detect from the file extension. Unknown extensions run as JavaScript.
    pub fn detect(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("py") => ScriptRuntime::Python,
            Some("ts") | Some("mts") => ScriptRuntime::TypeScript,
            Some("js") | Some("mjs") | Some("cjs") => ScriptRuntime::JavaScript,
            Some("sh") => ScriptRuntime::Shell,
            _ => ScriptRuntime::JavaScript,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptRuntime::Python => "python",
            ScriptRuntime::TypeScript => "typescript",
            ScriptRuntime::JavaScript => "node",
            ScriptRuntime::Shell => "shell",
        }
    }

    /// Every runtime, for capability reports.
    pub fn all() -> [ScriptRuntime; 4] {
        [
            ScriptRuntime::Python,
            ScriptRuntime::TypeScript,
            ScriptRuntime::JavaScript,
            ScriptRuntime::Shell,
        ]
    }

    pub fn names() -> Vec<String> {
        Self::all().iter().map(|r| r.as_str().to_string()).collect()
    }

    /// Container image providing this runtime.
    pub fn image(&self) -> &'static str {
        match self {
            ScriptRuntime::Python => "python:3.12-slim",
            ScriptRuntime::TypeScript | ScriptRuntime::JavaScript => "node:18-alpine",
            ScriptRuntime::Shell => "alpine:3.19",
        }
    }

    /// Command line running `file` with `args`.
    pub fn command(&self, file: &Path, args: &[String]) -> String {
        let program = match self {
            ScriptRuntime::Python => "python3",
            ScriptRuntime::TypeScript => "npx -y tsx",
            ScriptRuntime::JavaScript => "node",
            ScriptRuntime::Shell => "sh",
        };
        let mut line = format!("{} {}", program, shell_quote(&file.to_string_lossy()));
        for arg in args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line
    }

    /// Command line installing `packages`: pip for Python, npm otherwise.
    pub fn install_command(&self, packages: &[String]) -> String {
        let quoted: Vec<String> = packages.iter().map(|p| shell_quote(p)).collect();
        match self {
            ScriptRuntime::Python => format!(
                "python3 -m pip install --quiet --disable-pip-version-check {}",
                quoted.join(" ")
            ),
            _ => format!(
                "npm install --no-save --no-audit --no-fund --silent {}",
                quoted.join(" ")
            ),
        }
    }
}

impl fmt::Display for ScriptRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install packages, then run the script through `sandbox.exec`.
///
/// An installation failure returns a failed result and the script is not run.
pub async fn run_script<S>(
    sandbox: &S,
    file_path: &Path,
    work_dir: &Path,
    options: ScriptRunOptions,
) -> ScriptRunResult
where
    S: SandboxProvider + ?Sized,
{
    let started = Instant::now();
    let runtime = ScriptRuntime::detect(file_path);
    let image = runtime.image();

    if !file_path.is_file() {
        return ScriptRunResult::failure(
            runtime,
            format!("script not found: {}", file_path.display()),
            started.elapsed(),
        );
    }

    if !options.packages.is_empty() {
        info!(
            runtime = %runtime,
            packages = ?options.packages,
            "Installing script packages"
        );
        let install = SandboxExecOptions {
            command: runtime.install_command(&options.packages),
            args: Vec::new(),
            cwd: Some(work_dir.to_path_buf()),
            env: options.env.clone(),
            image: Some(image.to_string()),
            timeout_ms: options
                .timeout_ms
                .or(Some(DEFAULT_INSTALL_TIMEOUT.as_millis() as u64)),
        };
        let installed = sandbox.exec(install).await;
        if !installed.success() {
            warn!(runtime = %runtime, exit_code = installed.exit_code, "Package installation failed");
            return ScriptRunResult {
                success: false,
                exit_code: installed.exit_code,
                runtime,
                duration_ms: started.elapsed().as_millis() as u64,
                stdout: installed.stdout,
                stderr: format!("package installation failed:\n{}", installed.stderr),
            };
        }
    }

    let command = runtime.command(file_path, &options.args);
    debug!(command = %command, "Running script");
    let run = SandboxExecOptions {
        command,
        args: Vec::new(),
        cwd: Some(work_dir.to_path_buf()),
        env: options.env,
        image: Some(image.to_string()),
        timeout_ms: options.timeout_ms,
    };
    let result = sandbox.exec(run).await;
    ScriptRunResult::from_exec(runtime, result, started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SandboxExecResult, SandboxResult, VolumeMount};
    use agentbox_core::{
        IsolationLevel, Provider, ProviderCapabilities, ProviderResult, SandboxCapabilities,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    /// Records commands and fails those containing `fail_on`.
    struct Recorder {
        commands: Mutex<Vec<SandboxExecOptions>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Provider for Recorder {
        fn provider_type(&self) -> &str {
            "recorder"
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
            ProviderCapabilities::Sandbox(self.sandbox_capabilities())
        }
    }

    #[async_trait]
    impl SandboxProvider for Recorder {
        async fn exec(&self, options: SandboxExecOptions) -> SandboxExecResult {
            let failing = self
                .fail_on
                .map(|needle| options.command.contains(needle))
                .unwrap_or(false);
            self.commands.lock().unwrap().push(options);
            SandboxExecResult {
                stdout: "out".to_string(),
                stderr: if failing { "E: no such package".to_string() } else { String::new() },
                exit_code: if failing { 1 } else { 0 },
                duration_ms: 1,
            }
        }

        async fn set_volumes(&self, _mounts: Vec<VolumeMount>) -> SandboxResult<()> {
            Ok(())
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

    fn recorder(fail_on: Option<&'static str>) -> Recorder {
        Recorder {
            commands: Mutex::new(Vec::new()),
            fail_on,
        }
    }

    #[test]
    fn test_detect_runtime() {
        assert_eq!(ScriptRuntime::detect(Path::new("foo.py")), ScriptRuntime::Python);
        assert_eq!(ScriptRuntime::detect(Path::new("foo.ts")), ScriptRuntime::TypeScript);
        assert_eq!(ScriptRuntime::detect(Path::new("foo.mts")), ScriptRuntime::TypeScript);
        assert_eq!(ScriptRuntime::detect(Path::new("foo.mjs")), ScriptRuntime::JavaScript);
        assert_eq!(ScriptRuntime::detect(Path::new("run.sh")), ScriptRuntime::Shell);
        assert_eq!(ScriptRuntime::detect(Path::new("foo.unknown")), ScriptRuntime::JavaScript);
        assert_eq!(ScriptRuntime::detect(Path::new("Makefile")), ScriptRuntime::JavaScript);
    }

    #[test]
    fn test_commands() {
        let cmd = ScriptRuntime::TypeScript.command(Path::new("/w/a b.ts"), &["--x".to_string()]);
        assert_eq!(cmd, "npx -y tsx '/w/a b.ts' --x");

        let install = ScriptRuntime::Python.install_command(&["requests".to_string()]);
        assert!(install.starts_with("python3 -m pip install"));
        assert!(install.ends_with("requests"));

        let install = ScriptRuntime::JavaScript.install_command(&["lodash".to_string()]);
        assert!(install.starts_with("npm install"));
    }

    #[tokio::test]
    async fn test_install_then_run() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("main.py");
        std::fs::write(&script, "print('hi')").unwrap();

        let sandbox = recorder(None);
        let result = run_script(
            &sandbox,
            &script,
            dir.path(),
            ScriptRunOptions {
                packages: vec!["requests".to_string()],
                ..Default::default()
            },
        )
        .await;

        assert!(result.success);
        assert_eq!(result.runtime, ScriptRuntime::Python);
        let commands = sandbox.commands.lock().unwrap();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].command.contains("pip install"));
        assert!(commands[1].command.starts_with("python3 "));
        assert_eq!(commands[1].image.as_deref(), Some("python:3.12-slim"));
        assert_eq!(commands[1].cwd.as_deref(), Some(dir.path()));
    }

    #[tokio::test]
    async fn test_install_failure_skips_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("main.js");
        std::fs::write(&script, "console.log(1)").unwrap();

        let sandbox = recorder(Some("npm install"));
        let result = run_script(
            &sandbox,
            &script,
            dir.path(),
            ScriptRunOptions {
                packages: vec!["left-pad".to_string()],
                ..Default::default()
            },
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("package installation failed"));
        assert!(result.stderr.contains("no such package"));
        assert_eq!(sandbox.commands.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_script() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = recorder(None);
        let result = run_script(
            &sandbox,
            &dir.path().join("nope.py"),
            dir.path(),
            ScriptRunOptions::default(),
        )
        .await;
        assert!(!result.success);
        assert!(result.stderr.contains("script not found"));
        assert!(sandbox.commands.lock().unwrap().is_empty());
    }

    #[test]
    fn test_runtime_serializes() {
        assert_eq!(
            serde_json::to_value(ScriptRuntime::TypeScript).unwrap(),
            "typescript"
        );
        assert_eq!(serde_json::to_value(ScriptRuntime::JavaScript).unwrap(), "node");
    }
}
