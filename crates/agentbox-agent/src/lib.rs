//! Agent providers for agentbox.
//!
//! An agent takes a task prompt, works on it with its own tools (or the
//! sandbox tools exposed over MCP) and streams [`AgentEvent`]s back.
//! [`ClaudeCliAgent`] drives the Claude Code CLI in stream-json mode.

pub mod catalog;
pub mod claude;
pub mod config;
pub mod error;

pub use catalog::{agent_loader, builtin_plugins, AgentRegistry, ClaudeManifestBuilder};
pub use claude::ClaudeCliAgent;
pub use config::ClaudeCliConfig;
pub use error::{AgentError, AgentResult};

use agentbox_core::{AgentCapabilities, Provider};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// A task handed to an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub prompt: String,
    /// Working directory of the agent process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Overrides the provider's configured model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Session to continue instead of starting a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One event of an agent run.
///
/// Every run ends with exactly one `result` or `error` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    /// The agent assigned a session id.
    Session { session_id: String },
    Text { text: String },
    /// The agent invoked a tool. The agent executes it itself.
    ToolUse { id: String, name: String, input: Value },
    ToolResult {
        tool_use_id: String,
        output: String,
        is_error: bool,
    },
    /// Final answer.
    Result {
        text: String,
        is_error: bool,
        usage: AgentUsage,
    },
    Error { message: String },
}

impl AgentEvent {
    /// Name used for the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Session { .. } => "session",
            AgentEvent::Text { .. } => "text",
            AgentEvent::ToolUse { .. } => "tool_use",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::Result { .. } => "result",
            AgentEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Result { .. } | AgentEvent::Error { .. })
    }
}

/// Events of one run.
pub type AgentEventStream = BoxStream<'static, AgentEvent>;

/// Contract of an agent provider.
#[async_trait]
pub trait AgentProvider: Provider {
    /// Start a run. Dropping the stream stops the agent.
    async fn run(&self, request: AgentRequest) -> AgentResult<AgentEventStream>;

    fn agent_capabilities(&self) -> AgentCapabilities;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let event = AgentEvent::ToolResult {
            tool_use_id: "t1".to_string(),
            output: "ok".to_string(),
            is_error: false,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "tool_result", "toolUseId": "t1", "output": "ok", "isError": false})
        );
        assert_eq!(event.name(), "tool_result");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_request_defaults() {
        let request: AgentRequest = serde_json::from_value(json!({"prompt": "fix it"})).unwrap();
        assert_eq!(request, AgentRequest::new("fix it"));
    }
}
