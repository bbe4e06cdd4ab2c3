//! `agentbox mcp`: stdio MCP server forwarding to a running agentbox server.

use agentbox_mcp::{McpServer, SandboxApi, ToolRunner};
use std::path::PathBuf;
use tracing::info;

pub async fn mcp(api_url: &str, cwd: PathBuf) -> anyhow::Result<()> {
    info!(api_url = %api_url, cwd = %cwd.display(), "Starting MCP server");
    let server = McpServer::new(ToolRunner::new(SandboxApi::new(api_url), cwd));
    server.serve_stdio().await?;
    Ok(())
}
