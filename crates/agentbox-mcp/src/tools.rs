//! The `run_script` and `run_command` tools.

use crate::client::SandboxApi;
use crate::error::{McpError, McpResult};
use crate::protocol::{McpTool, ToolCallResult};
use agentbox_sandbox::{
    ScriptRunOptions, ScriptRunRequest, ScriptRunResult, SandboxExecOptions, SandboxExecResult,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const RUN_SCRIPT: &str = "run_script";
pub const RUN_COMMAND: &str = "run_command";

pub fn definitions() -> Vec<McpTool> {
    vec![
        McpTool {
            name: RUN_SCRIPT.to_string(),
            description: "Run a script file in the agentbox sandbox. The runtime is picked from \
                          the extension: .py python, .ts/.mts TypeScript, .js/.mjs node, .sh shell."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "filePath": {"type": "string", "description": "Path of the script to run"},
                    "workDir": {"type": "string", "description": "Working directory, defaults to the script's directory"},
                    "args": {"type": "array", "items": {"type": "string"}},
                    "packages": {"type": "array", "items": {"type": "string"}, "description": "Packages to install first (pip or npm)"},
                    "timeout": {"type": "integer", "description": "Timeout in milliseconds"},
                    "env": {"type": "object", "additionalProperties": {"type": "string"}}
                },
                "required": ["filePath"]
            }),
        },
        McpTool {
            name: RUN_COMMAND.to_string(),
            description: "Run a shell command in the agentbox sandbox.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command line"},
                    "args": {"type": "array", "items": {"type": "string"}},
                    "cwd": {"type": "string"},
                    "image": {"type": "string", "description": "Sandbox image, for isolated providers"},
                    "timeout": {"type": "integer", "description": "Timeout in milliseconds"},
                    "env": {"type": "object", "additionalProperties": {"type": "string"}}
                },
                "required": ["command"]
            }),
        },
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunScriptArgs {
    file_path: PathBuf,
    #[serde(default)]
    work_dir: Option<PathBuf>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Dispatches tool calls to the agentbox API.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    api: SandboxApi,
    default_cwd: PathBuf,
}

impl ToolRunner {
    pub fn new(api: SandboxApi, default_cwd: impl Into<PathBuf>) -> Self {
        Self {
            api,
            default_cwd: default_cwd.into(),
        }
    }

    /// Run a tool. Unknown tools and malformed arguments are errors; API
    /// failures become an `isError` result.
    pub async fn call(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
        match name {
            RUN_SCRIPT => {
                let request = self.script_request(arguments)?;
                Ok(match self.api.run_file(&request).await {
                    Ok(result) => ToolCallResult::text(
                        format_script_result(&request.file_path, &result),
                        !result.success,
                    ),
                    Err(e) => api_failure(e),
                })
            }
            RUN_COMMAND => {
                let mut options: SandboxExecOptions = parse_args(arguments)?;
                if options.command.trim().is_empty() {
                    return Err(McpError::invalid_arguments("command must not be empty"));
                }
                options.cwd = Some(self.resolve(options.cwd.as_deref().unwrap_or(Path::new("."))));
                Ok(match self.api.exec(&options).await {
                    Ok(result) => ToolCallResult::text(
                        format_exec_result(&options.command_line(), &result),
                        !result.success(),
                    ),
                    Err(e) => api_failure(e),
                })
            }
            other => Err(McpError::ToolNotFound(other.to_string())),
        }
    }

    fn script_request(&self, arguments: Value) -> McpResult<ScriptRunRequest> {
        let args: RunScriptArgs = parse_args(arguments)?;
        let file_path = self.resolve(&args.file_path);
        let work_dir = match args.work_dir {
            Some(dir) => self.resolve(&dir),
            None => file_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.default_cwd.clone()),
        };
        Ok(ScriptRunRequest {
            file_path,
            work_dir,
            options: ScriptRunOptions {
                args: args.args,
                packages: args.packages,
                env: args.env,
                timeout_ms: args.timeout,
            },
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else if path == Path::new(".") {
            self.default_cwd.clone()
        } else {
            self.default_cwd.join(path)
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> McpResult<T> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| McpError::invalid_arguments(e.to_string()))
}

fn api_failure(error: McpError) -> ToolCallResult {
    ToolCallResult::text(format!("agentbox API request failed: {}", error), true)
}

fn status(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failed"
    }
}

fn push_sections(out: &mut String, stdout: &str, stderr: &str) {
    if stdout.is_empty() && stderr.is_empty() {
        out.push_str("\n(no output)");
        return;
    }
    if !stdout.is_empty() {
        out.push_str("\nSTDOUT:\n");
        out.push_str(stdout.trim_end());
        out.push('\n');
    }
    if !stderr.is_empty() {
        out.push_str("\nSTDERR:\n");
        out.push_str(stderr.trim_end());
        out.push('\n');
    }
}

pub fn format_script_result(file_path: &Path, result: &ScriptRunResult) -> String {
    let mut out = format!(
        "Script {} ({}) {} | exit code {} | {}ms\n",
        file_path.display(),
        result.runtime.as_str(),
        status(result.success),
        result.exit_code,
        result.duration_ms
    );
    push_sections(&mut out, &result.stdout, &result.stderr);
    out
}

pub fn format_exec_result(command: &str, result: &SandboxExecResult) -> String {
    let mut out = format!(
        "$ {}\n{} | exit code {} | {}ms\n",
        command,
        status(result.success()),
        result.exit_code,
        result.duration_ms
    );
    push_sections(&mut out, &result.stdout, &result.stderr);
    out
}
