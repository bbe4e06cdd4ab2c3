//! HTTP client for the agentbox sandbox endpoints.

use crate::error::{McpError, McpResult};
use agentbox_sandbox::{SandboxExecOptions, SandboxExecResult, ScriptRunRequest, ScriptRunResult};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Default address of a local `agentbox serve`.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:2620";

#[derive(Debug, Clone)]
pub struct SandboxApi {
    client: Client,
    base_url: String,
}

impl SandboxApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /sandbox/exec`.
    pub async fn exec(&self, options: &SandboxExecOptions) -> McpResult<SandboxExecResult> {
        self.post("/sandbox/exec", options).await
    }

    /// `POST /sandbox/run/file`.
    pub async fn run_file(&self, request: &ScriptRunRequest) -> McpResult<ScriptRunResult> {
        self.post("/sandbox/run/file", request).await
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> McpResult<R> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Calling agentbox API");
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::api(status.as_u16(), text));
        }
        Ok(response.json().await?)
    }
}

impl Default for SandboxApi {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}
