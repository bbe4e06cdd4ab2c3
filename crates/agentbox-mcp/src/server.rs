//! Line-delimited JSON-RPC server over stdio.

use crate::error::McpError;
use crate::protocol::{
    CallToolParams, InitializeResult, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    ServerCapabilities, ServerInfo, ToolsCapability, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION,
};
use crate::tools::{self, ToolRunner};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

pub struct McpServer {
    name: String,
    version: String,
    tools: ToolRunner,
}

impl McpServer {
    pub fn new(tools: ToolRunner) -> Self {
        Self {
            name: "agentbox".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            tools,
        }
    }

    /// Answer one request. Notifications get no response.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!(method = %request.method, id = ?request.id, "Handling MCP request");

        let Some(id) = request.id else {
            debug!(method = %request.method, "Received notification");
            return None;
        };
        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::failure(id, INVALID_REQUEST, "jsonrpc must be \"2.0\""));
        }

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(id, self.initialize()),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                let result = ListToolsResult {
                    tools: tools::definitions(),
                };
                JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
            }
            "tools/call" => self.call_tool(id, request.params).await,
            other => JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
        };
        Some(response)
    }

    fn initialize(&self) -> Value {
        info!(name = %self.name, version = %self.version, "Initializing MCP server");
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: ServerInfo {
                name: self.name.clone(),
                version: self.version.clone(),
            },
        };
        serde_json::to_value(result).unwrap_or_default()
    }

    async fn call_tool(&self, id: Value, params: Option<Value>) -> JsonRpcResponse {
        let params: CallToolParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::failure(id, INVALID_PARAMS, format!("Invalid params: {}", e))
            }
            None => return JsonRpcResponse::failure(id, INVALID_PARAMS, "Missing params"),
        };

        debug!(tool = %params.name, "Calling MCP tool");
        match self.tools.call(&params.name, params.arguments).await {
            Ok(result) => {
                if result.is_error {
                    warn!(tool = %params.name, "Tool reported failure");
                }
                JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
            }
            Err(e) => JsonRpcResponse::failure(id, e.rpc_code(), e.to_string()),
        }
    }

    /// Serve JSON-RPC lines from `reader` until EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<(), McpError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<JsonRpcRequest>(line) {
                Ok(request) => self.handle(request).await,
                Err(e) => {
                    warn!(error = %e, "Unparseable MCP message");
                    Some(JsonRpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {}", e)))
                }
            };
            if let Some(response) = response {
                let mut out = serde_json::to_vec(&response)?;
                out.push(b'\n');
                writer.write_all(&out).await?;
                writer.flush().await?;
            }
        }
        info!("MCP input closed");
        Ok(())
    }

    pub async fn serve_stdio(&self) -> Result<(), McpError> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.serve(stdin, tokio::io::stdout()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SandboxApi;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn server_for(url: &str) -> McpServer {
        McpServer::new(ToolRunner::new(SandboxApi::new(url), "/work"))
    }

    async fn roundtrip(server: &McpServer, input: &str) -> Vec<Value> {
        let mut output = Vec::new();
        server.serve(input.as_bytes(), &mut output).await.unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let server = server_for("http://127.0.0.1:1");
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#, "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#, "\n",
            "\n",
            r#"{"jsonrpc":"2.0","id":"t","method":"tools/list"}"#, "\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#, "\n",
            "not json\n",
        );
        let responses = roundtrip(&server, input).await;
        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0]["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(responses[0]["result"]["serverInfo"]["name"], "agentbox");
        assert_eq!(responses[1]["id"], "t");
        let names: Vec<&str> = responses[1]["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["run_script", "run_command"]);
        assert_eq!(responses[2]["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(responses[3]["error"]["code"], PARSE_ERROR);
        assert!(responses[3]["id"].is_null());
    }

    #[tokio::test]
    async fn test_run_command_failure_is_tool_error() {
        let api = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandbox/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "stdout": "", "stderr": "boom\n", "exitCode": 3, "duration": 7
            })))
            .mount(&api)
            .await;

        let server = server_for(&api.uri());
        let response = server
            .handle(JsonRpcRequest::new(
                9,
                "tools/call",
                Some(json!({"name": "run_command", "arguments": {"command": "false"}})),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("exit code 3"));
        assert!(text.contains("STDERR:\nboom"));
    }

    #[tokio::test]
    async fn test_unreachable_api_is_tool_error() {
        let server = server_for("http://127.0.0.1:1");
        let response = server
            .handle(JsonRpcRequest::new(
                2,
                "tools/call",
                Some(json!({"name": "run_script", "arguments": {"filePath": "/w/a.py"}})),
            ))
            .await
            .unwrap();
        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap()["isError"], true);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_params() {
        let server = server_for("http://127.0.0.1:1");
        let response = server
            .handle(JsonRpcRequest::new(4, "tools/call", Some(json!({"name": "rm_rf"}))))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }
}
