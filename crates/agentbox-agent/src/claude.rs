//! Claude Code CLI agent.
//!
//! Spawns `claude -p <prompt> --output-format stream-json --verbose` and turns
//! each JSON line of its output into an [`AgentEvent`]. The CLI executes tools
//! itself, either its built-in ones or those of an MCP server named by
//! `mcpConfig`, so tool calls are only observed.

use crate::config::ClaudeCliConfig;
use crate::error::{AgentError, AgentResult};
use crate::{AgentEvent, AgentEventStream, AgentProvider, AgentRequest, AgentUsage};
use agentbox_core::{AgentCapabilities, Provider, ProviderCapabilities, ProviderError, ProviderResult};
use agentbox_util::bin::{find_binary, well_known_dirs};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const PROVIDER_TYPE: &str = "claude";

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ClaudeCliAgent {
    provider_type: String,
    config: RwLock<ClaudeCliConfig>,
}

impl ClaudeCliAgent {
    pub fn new(config: ClaudeCliConfig) -> Self {
        Self::with_type(PROVIDER_TYPE, config)
    }

    pub fn with_type(provider_type: impl Into<String>, config: ClaudeCliConfig) -> Self {
        Self {
            provider_type: provider_type.into(),
            config: RwLock::new(config),
        }
    }

    pub fn from_value(value: &Value) -> ProviderResult<Self> {
        Ok(Self::new(ClaudeCliConfig::from_value(PROVIDER_TYPE, value)?))
    }

    fn config(&self) -> ClaudeCliConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Locate the CLI. An absolute `binary` is used as-is.
    pub fn binary_path(&self) -> Option<PathBuf> {
        let config = self.config();
        let binary = Path::new(&config.binary);
        if binary.is_absolute() {
            return binary.is_file().then(|| binary.to_path_buf());
        }
        let mut dirs = config.search_dirs.clone();
        dirs.extend(well_known_dirs());
        let env_var = (!config.path_env.is_empty()).then_some(config.path_env.as_str());
        find_binary(&config.binary, &dirs, env_var)
    }
}

impl Default for ClaudeCliAgent {
    fn default() -> Self {
        Self::new(ClaudeCliConfig::default())
    }
}

/// CLI arguments for one run.
fn build_args(config: &ClaudeCliConfig, request: &AgentRequest) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        request.prompt.clone(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    if let Some(model) = request.model.as_ref().or(config.model.as_ref()) {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    // A resumed session already carries its system prompt.
    if let Some(session) = &request.resume {
        args.push("--resume".to_string());
        args.push(session.clone());
    } else if let Some(system) = request.system_prompt.as_ref().filter(|s| !s.is_empty()) {
        args.push("--system-prompt".to_string());
        args.push(system.clone());
    }

    if let Some(path) = &config.mcp_config {
        args.push("--mcp-config".to_string());
        args.push(path.to_string_lossy().to_string());
    }
    if !config.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(config.allowed_tools.join(","));
    }
    if !config.disallowed_tools.is_empty() {
        args.push("--disallowedTools".to_string());
        args.push(config.disallowed_tools.join(","));
    }
    if let Some(mode) = &config.permission_mode {
        args.push("--permission-mode".to_string());
        args.push(mode.clone());
    }

    args.extend(config.extra_args.iter().cloned());
    args
}

fn build_env(config: &ClaudeCliConfig) -> Vec<(&'static str, String)> {
    let mut env = Vec::new();
    if let Some(key) = config.api_key.as_ref().filter(|k| !k.is_empty()) {
        env.push(("ANTHROPIC_API_KEY", key.clone()));
    }
    if let Some(url) = config.base_url.as_ref().filter(|u| !u.is_empty()) {
        env.push(("ANTHROPIC_BASE_URL", url.clone()));
    }
    env
}

/// One line of `--output-format stream-json`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliLine {
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },
    User {
        message: UserMessage,
        /// Either `{stdout, stderr}` for built-in tools or content blocks
        /// for MCP tools.
        #[serde(default)]
        tool_use_result: Option<Value>,
    },
    Result {
        #[serde(default)]
        result: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        usage: Option<CliUsage>,
        #[serde(default)]
        session_id: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<AssistantBlock>,
    #[serde(default)]
    usage: Option<CliUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AssistantBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct UserMessage {
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ToolResultBlock {
    tool_use_id: String,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

/// Concatenated `text` of content blocks, or the string itself.
fn text_of(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn tool_result_output(result: &Value) -> Option<String> {
    if let Some(obj) = result.as_object() {
        for key in ["stdout", "stderr"] {
            if let Some(s) = obj.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()) {
                return Some(s.to_string());
            }
        }
    }
    if result.is_array() {
        return Some(text_of(result)).filter(|s| !s.is_empty());
    }
    None
}

/// Turns CLI output lines into events.
#[derive(Debug, Default)]
struct EventParser {
    session: Option<String>,
    saw_text: bool,
    usage: AgentUsage,
    finished: bool,
}

impl EventParser {
    fn is_finished(&self) -> bool {
        self.finished
    }

    fn session(&mut self, id: Option<String>, out: &mut Vec<AgentEvent>) {
        if self.session.is_some() {
            return;
        }
        if let Some(id) = id {
            debug!(session_id = %id, "Captured CLI session id");
            self.session = Some(id.clone());
            out.push(AgentEvent::Session { session_id: id });
        }
    }

    fn record_usage(&mut self, usage: Option<CliUsage>) {
        if let Some(usage) = usage {
            if let Some(i) = usage.input_tokens {
                self.usage.input_tokens = i;
            }
            if let Some(o) = usage.output_tokens {
                self.usage.output_tokens = o;
            }
        }
    }

    fn feed(&mut self, line: &str) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        if self.finished || line.trim().is_empty() {
            return out;
        }

        let parsed = match serde_json::from_str::<CliLine>(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                // The CLI also prints lines we do not model.
                debug!(error = %e, line_preview = %line.chars().take(100).collect::<String>(), "Skipping CLI line");
                return out;
            }
        };

        match parsed {
            CliLine::System { session_id } => self.session(session_id, &mut out),
            CliLine::Assistant {
                message,
                session_id,
            } => {
                self.session(session_id, &mut out);
                for block in message.content {
                    match block {
                        AssistantBlock::Text { text } if !text.is_empty() => {
                            self.saw_text = true;
                            out.push(AgentEvent::Text { text });
                        }
                        AssistantBlock::ToolUse { id, name, input } => {
                            debug!(id = %id, name = %name, "CLI tool use");
                            out.push(AgentEvent::ToolUse { id, name, input });
                        }
                        _ => {}
                    }
                }
                self.record_usage(message.usage);
            }
            CliLine::User {
                message,
                tool_use_result,
            } => {
                let blocks: Vec<ToolResultBlock> = match message.content {
                    Value::Array(items) => items
                        .into_iter()
                        .filter_map(|item| serde_json::from_value(item).ok())
                        .collect(),
                    _ => Vec::new(),
                };
                for (i, block) in blocks.into_iter().enumerate() {
                    let output = tool_use_result
                        .as_ref()
                        .filter(|_| i == 0)
                        .and_then(tool_result_output)
                        .unwrap_or_else(|| text_of(&block.content));
                    out.push(AgentEvent::ToolResult {
                        tool_use_id: block.tool_use_id,
                        output,
                        is_error: block.is_error,
                    });
                }
            }
            CliLine::Result {
                result,
                is_error,
                usage,
                session_id,
            } => {
                self.session(session_id, &mut out);
                self.record_usage(usage);
                if is_error {
                    warn!(error = %result, "Claude CLI reported an error");
                } else if !self.saw_text && !result.is_empty() {
                    out.push(AgentEvent::Text {
                        text: result.clone(),
                    });
                }
                out.push(AgentEvent::Result {
                    text: result,
                    is_error,
                    usage: self.usage,
                });
                self.finished = true;
            }
        }
        out
    }

    /// Terminal event for a run that ended without a result line.
    fn fail(&mut self, message: impl Into<String>) -> AgentEvent {
        self.finished = true;
        AgentEvent::Error {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Provider for ClaudeCliAgent {
    fn provider_type(&self) -> &str {
        &self.provider_type
    }

    async fn is_available(&self) -> bool {
        self.binary_path().is_some()
    }

    async fn init(&self, config: &Value) -> ProviderResult<()> {
        let patched = self.config().patched(&self.provider_type, config)?;
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = patched;

        let binary = self
            .binary_path()
            .ok_or_else(|| ProviderError::Unavailable(self.provider_type.clone()))?;

        let output = tokio::time::timeout(
            VERSION_CHECK_TIMEOUT,
            Command::new(&binary)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ProviderError::init_failed(&self.provider_type, "`--version` timed out"))?
        .map_err(|e| ProviderError::init_failed(&self.provider_type, e.to_string()))?;

        if !output.status.success() {
            return Err(ProviderError::init_failed(
                &self.provider_type,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        info!(
            binary = %binary.display(),
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "Claude CLI ready"
        );
        Ok(())
    }

    async fn shutdown(&self) -> ProviderResult<()> {
        Ok(())
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::Agent(self.agent_capabilities())
    }
}

#[async_trait]
impl AgentProvider for ClaudeCliAgent {
    async fn run(&self, request: AgentRequest) -> AgentResult<AgentEventStream> {
        if request.prompt.trim().is_empty() {
            return Err(AgentError::invalid_request("prompt is empty"));
        }
        let config = self.config();
        let binary = self
            .binary_path()
            .ok_or_else(|| AgentError::NotAvailable(format!("'{}' not found", config.binary)))?;

        let args = build_args(&config, &request);
        info!(
            binary = %binary.display(),
            prompt_len = request.prompt.len(),
            resume = ?request.resume,
            "Spawning Claude CLI"
        );

        let mut cmd = Command::new(&binary);
        cmd.args(&args)
            .envs(build_env(&config))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::spawn_failed(format!("{}: {}", binary.display(), e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::spawn_failed("stdout not captured"))?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        Ok(Box::pin(async_stream::stream! {
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = EventParser::default();
            let mut read_error = None;

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        for event in parser.feed(&line) {
                            yield event;
                        }
                        if parser.is_finished() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        read_error = Some(e.to_string());
                        break;
                    }
                }
            }

            let status = child.wait().await;
            let stderr = stderr_task.await.unwrap_or_default();
            if !parser.is_finished() {
                let message = match (read_error, status) {
                    (Some(e), _) => format!("failed to read agent output: {}", e),
                    (None, Ok(status)) if status.success() => {
                        "agent exited without a result".to_string()
                    }
                    (None, Ok(status)) => format!("agent exited with {}: {}", status, stderr.trim()),
                    (None, Err(e)) => format!("failed to wait for agent: {}", e),
                };
                warn!(error = %message, "Agent run failed");
                yield parser.fail(message);
            }
        }))
    }

    fn agent_capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            streaming: true,
            tool_use: true,
            mcp: true,
            models: vec!["sonnet".to_string(), "opus".to_string(), "haiku".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn test_build_args_new_session() {
        let config = ClaudeCliConfig {
            model: Some("sonnet".to_string()),
            mcp_config: Some(PathBuf::from("/tmp/mcp.json")),
            allowed_tools: vec!["mcp__agentbox__run_script".to_string(), "mcp__agentbox__run_command".to_string()],
            permission_mode: Some("acceptEdits".to_string()),
            ..Default::default()
        };
        let request = AgentRequest {
            system_prompt: Some("Be brief.".to_string()),
            ..AgentRequest::new("list files")
        };
        let args = build_args(&config, &request);
        assert_eq!(
            args,
            vec![
                "-p", "list files", "--output-format", "stream-json", "--verbose",
                "--model", "sonnet",
                "--system-prompt", "Be brief.",
                "--mcp-config", "/tmp/mcp.json",
                "--allowedTools", "mcp__agentbox__run_script,mcp__agentbox__run_command",
                "--permission-mode", "acceptEdits",
            ]
        );
    }

    #[test]
    fn test_build_args_resume_skips_system_prompt() {
        let request = AgentRequest {
            system_prompt: Some("ignored".to_string()),
            resume: Some("s-1".to_string()),
            model: Some("opus".to_string()),
            ..AgentRequest::new("go on")
        };
        let args = build_args(&ClaudeCliConfig::default(), &request);
        assert!(args.windows(2).any(|w| w == ["--resume", "s-1"]));
        assert!(args.windows(2).any(|w| w == ["--model", "opus"]));
        assert!(!args.iter().any(|a| a == "--system-prompt"));
    }

    #[test]
    fn test_env_carries_credentials() {
        let config = ClaudeCliConfig {
            api_key: Some("sk-1".to_string()),
            base_url: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(build_env(&config), vec![("ANTHROPIC_API_KEY", "sk-1".to_string())]);
    }

    #[test]
    fn test_parser_full_run() {
        let mut parser = EventParser::default();
        let lines = [
            json!({"type": "system", "subtype": "init", "session_id": "s-1"}),
            json!({"type": "assistant", "session_id": "s-1", "message": {"content": [
                {"type": "text", "text": "Looking"},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}}
            ], "usage": {"input_tokens": 5}}}),
            json!({"type": "user", "message": {"content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": [{"type": "text", "text": "a.txt"}]}
            ]}, "tool_use_result": {"stdout": "a.txt\n", "stderr": ""}}),
            json!({"type": "result", "subtype": "success", "result": "Done", "is_error": false,
                   "usage": {"output_tokens": 3}, "session_id": "s-1"}),
        ];

        let events: Vec<AgentEvent> = lines
            .iter()
            .flat_map(|l| parser.feed(&l.to_string()))
            .collect();

        assert_eq!(
            events,
            vec![
                AgentEvent::Session { session_id: "s-1".to_string() },
                AgentEvent::Text { text: "Looking".to_string() },
                AgentEvent::ToolUse {
                    id: "t1".to_string(),
                    name: "Bash".to_string(),
                    input: json!({"command": "ls"}),
                },
                AgentEvent::ToolResult {
                    tool_use_id: "t1".to_string(),
                    output: "a.txt\n".to_string(),
                    is_error: false,
                },
                AgentEvent::Result {
                    text: "Done".to_string(),
                    is_error: false,
                    usage: AgentUsage { input_tokens: 5, output_tokens: 3 },
                },
            ]
        );
        assert!(parser.is_finished());
        assert!(parser.feed(&lines[1].to_string()).is_empty());
    }

    #[test]
    fn test_parser_result_without_streamed_text() {
        let mut parser = EventParser::default();
        assert!(parser.feed("not json at all").is_empty());
        let events = parser.feed(r#"{"type":"result","result":"42","is_error":false}"#);
        assert_eq!(events[0], AgentEvent::Text { text: "42".to_string() });
        assert!(events[1].is_terminal());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn fake_cli(dir: &Path, body: &str) -> ClaudeCliAgent {
            let path = dir.join("fake-claude");
            let script = format!(
                "#!/bin/sh\n[ \"$1\" = --version ] && {{ echo '9.9.9 (fake)'; exit 0; }}\n{}\n",
                body
            );
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            ClaudeCliAgent::new(ClaudeCliConfig {
                binary: path.to_string_lossy().to_string(),
                api_key: Some("sk-fake".to_string()),
                ..Default::default()
            })
        }

        #[tokio::test]
        async fn test_run_streams_events() {
            let dir = tempfile::tempdir().unwrap();
            let agent = fake_cli(
                dir.path(),
                r#"echo "{\"type\":\"system\",\"session_id\":\"s-9\"}"
echo "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"key=$ANTHROPIC_API_KEY prompt=$2\"}]}}"
echo "{\"type\":\"result\",\"result\":\"ok\",\"is_error\":false}""#,
            );
            agent.init(&Value::Null).await.unwrap();

            let events: Vec<AgentEvent> = agent
                .run(AgentRequest::new("hello"))
                .await
                .unwrap()
                .collect()
                .await;

            assert_eq!(events.len(), 3);
            assert_eq!(events[0], AgentEvent::Session { session_id: "s-9".to_string() });
            assert_eq!(
                events[1],
                AgentEvent::Text { text: "key=sk-fake prompt=hello".to_string() }
            );
            assert!(matches!(events[2], AgentEvent::Result { is_error: false, .. }));
        }

        #[tokio::test]
        async fn test_failed_process_ends_with_error() {
            let dir = tempfile::tempdir().unwrap();
            let agent = fake_cli(dir.path(), "echo boom >&2\nexit 3");

            let events: Vec<AgentEvent> = agent
                .run(AgentRequest::new("hello"))
                .await
                .unwrap()
                .collect()
                .await;

            assert_eq!(events.len(), 1);
            let AgentEvent::Error { message } = &events[0] else {
                panic!("expected error event, got {:?}", events[0]);
            };
            assert!(message.contains("boom"), "{}", message);
        }

        #[tokio::test]
        async fn test_missing_binary() {
            let agent = ClaudeCliAgent::new(ClaudeCliConfig {
                binary: "/nonexistent/claude".to_string(),
                ..Default::default()
            });
            assert!(!agent.is_available().await);
            assert!(matches!(
                agent.init(&Value::Null).await,
                Err(ProviderError::Unavailable(_))
            ));
            assert!(matches!(
                agent.run(AgentRequest::new("x")).await,
                Err(AgentError::NotAvailable(_))
            ));
        }

        #[tokio::test]
        async fn test_empty_prompt_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let agent = fake_cli(dir.path(), "exit 0");
            assert!(matches!(
                agent.run(AgentRequest::new("  ")).await,
                Err(AgentError::InvalidRequest(_))
            ));
        }
    }
}
