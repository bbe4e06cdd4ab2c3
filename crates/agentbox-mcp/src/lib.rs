//! MCP stdio server for agentbox.
//!
//! Exposes two tools, `run_script` and `run_command`, that forward to a
//! running agentbox HTTP server and format the outcome as text.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tools;

pub use client::{SandboxApi, DEFAULT_API_URL};
pub use error::{McpError, McpResult};
pub use server::McpServer;
pub use tools::ToolRunner;
