//! HTTP routes for the server.

use crate::context::AppContext;
use crate::error::{ServerError, ServerResult};
use crate::sse::{agent_events, proxy_events};
use agentbox_agent::{AgentProvider, AgentRequest};
use agentbox_core::{AppConfig, CategoryStatus};
use agentbox_proxy::{ErrorBody, MessagesRequest, ProxyError};
use agentbox_sandbox::{SandboxExecOptions, SandboxExecResult, ScriptRunRequest, ScriptRunResult};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub type SharedContext = Arc<AppContext>;

/// Create the router with all routes.
pub fn create_router(ctx: SharedContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        // Sandbox
        .route("/sandbox/exec", post(sandbox_exec))
        .route("/sandbox/run/file", post(sandbox_run_file))
        .route("/sandbox/info", get(sandbox_info))
        // Providers
        .route("/providers", get(providers))
        .route("/providers/reload", post(providers_reload))
        .route("/providers/{category}/available", get(providers_available))
        .route("/providers/{category}/switch", post(providers_switch))
        // Settings
        .route("/settings", get(settings_get).post(settings_update))
        // Proxy
        .route("/v1/messages", post(messages))
        // Agent
        .route("/agent/run", post(agent_run))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn sandbox_exec(
    State(ctx): State<SharedContext>,
    Json(options): Json<SandboxExecOptions>,
) -> ServerResult<Json<SandboxExecResult>> {
    Ok(Json(ctx.exec(options).await?))
}

async fn sandbox_run_file(
    State(ctx): State<SharedContext>,
    Json(request): Json<ScriptRunRequest>,
) -> ServerResult<Json<ScriptRunResult>> {
    Ok(Json(ctx.run_file(request).await?))
}

async fn sandbox_info(State(ctx): State<SharedContext>) -> ServerResult<impl IntoResponse> {
    Ok(Json(ctx.sandbox_info().await?))
}

async fn providers(State(ctx): State<SharedContext>) -> Json<Vec<CategoryStatus>> {
    Json(ctx.manager().status().await)
}

async fn providers_available(
    State(ctx): State<SharedContext>,
    Path(category): Path<String>,
) -> ServerResult<Json<Value>> {
    let available = ctx.available(&category).await?;
    Ok(Json(json!({ "category": category, "available": available })))
}

#[derive(Debug, Deserialize)]
struct SwitchRequest {
    #[serde(rename = "type")]
    provider_type: String,
    #[serde(default)]
    config: Value,
}

async fn providers_switch(
    State(ctx): State<SharedContext>,
    Path(category): Path<String>,
    Json(request): Json<SwitchRequest>,
) -> ServerResult<Json<Value>> {
    let capabilities = ctx
        .switch_provider(&category, &request.provider_type, request.config)
        .await?;
    Ok(Json(json!({
        "category": category,
        "type": request.provider_type,
        "capabilities": capabilities,
    })))
}

async fn providers_reload(State(ctx): State<SharedContext>) -> impl IntoResponse {
    Json(ctx.reload_plugins().await)
}

#[derive(Debug, Serialize)]
struct SettingsView {
    effective: AppConfig,
    runtime: AppConfig,
}

const REDACTED: &str = "********";

/// Mask secrets before a config leaves the process.
fn redacted(mut config: AppConfig) -> AppConfig {
    for key in [&mut config.proxy.api_key, &mut config.agent.api_key] {
        if key.is_some() {
            *key = Some(REDACTED.to_string());
        }
    }
    config
}

fn settings_view(ctx: &AppContext) -> SettingsView {
    SettingsView {
        effective: redacted(ctx.config().effective()),
        runtime: redacted(ctx.config().runtime_overrides()),
    }
}

async fn settings_get(State(ctx): State<SharedContext>) -> Json<SettingsView> {
    Json(settings_view(&ctx))
}

async fn settings_update(
    State(ctx): State<SharedContext>,
    Json(patch): Json<AppConfig>,
) -> ServerResult<Json<SettingsView>> {
    ctx.update_settings(patch).await?;
    Ok(Json(settings_view(&ctx)))
}

fn proxy_error(error: ProxyError) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    tracing::warn!(status = %status, error = %error, "Proxy request failed");
    (status, Json(error.to_body())).into_response()
}

/// Anthropic Messages endpoint backed by an OpenAI-compatible upstream.
async fn messages(
    State(ctx): State<SharedContext>,
    request: Result<Json<MessagesRequest>, JsonRejection>,
) -> Response {
    let request = match request {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let body = ErrorBody::new("invalid_request_error", rejection.body_text());
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };
    let client = match ctx.proxy_client() {
        Ok(client) => client,
        Err(e) => return proxy_error(e),
    };

    if request.is_streaming() {
        let cancel = CancellationToken::new();
        match client.stream(&request, cancel.clone()).await {
            Ok(events) => proxy_events(events, cancel).into_response(),
            Err(e) => proxy_error(e),
        }
    } else {
        match client.complete(&request).await {
            Ok(message) => Json(message).into_response(),
            Err(e) => proxy_error(e),
        }
    }
}

async fn agent_run(
    State(ctx): State<SharedContext>,
    Json(request): Json<AgentRequest>,
) -> ServerResult<Response> {
    if request.prompt.trim().is_empty() {
        return Err(ServerError::bad_request("`prompt` must not be empty"));
    }
    let agent = ctx.agent().await?;
    let events = agent.run(request).await?;
    Ok(agent_events(events).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbox_core::{ConfigStore, PluginsConfig, ProviderSelection, SANDBOX_CATEGORY};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct TestApp {
        router: Router,
        _dir: tempfile::TempDir,
    }

    async fn app_with(mut config: AppConfig) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        config.plugins = PluginsConfig {
            dir: Some(dir.path().join("plugins")),
            watch: Some(false),
        };
        config
            .providers
            .set(SANDBOX_CATEGORY, ProviderSelection::of_type("native"));
        let store = ConfigStore::new(config).with_persist_path(dir.path().join("config.json"));
        let ctx = Arc::new(AppContext::new(Arc::new(store)).await);
        TestApp {
            router: create_router(ctx),
            _dir: dir,
        }
    }

    async fn app() -> TestApp {
        app_with(AppConfig::default()).await
    }

    async fn send(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn send_json(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (status, bytes) = send(app, method, uri, body).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        let (status, body) = send_json(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sandbox_exec_on_native() {
        let app = app().await;
        let (status, body) = send_json(
            &app,
            "POST",
            "/sandbox/exec",
            Some(json!({"command": "echo", "args": ["hello world"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stdout"], "hello world\n");
        assert_eq!(body["exitCode"], 0);
    }

    #[tokio::test]
    async fn test_empty_command_is_bad_request() {
        let app = app().await;
        let (status, body) =
            send_json(&app, "POST", "/sandbox/exec", Some(json!({"command": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_sandbox_info_reports_native() {
        let app = app_with(AppConfig {
            pool: agentbox_core::PoolConfig { max_size: Some(2) },
            ..Default::default()
        })
        .await;
        let (status, body) = send_json(&app, "GET", "/sandbox/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["provider"], "native");
        assert_eq!(body["capabilities"]["isolation"], "none");
        assert_eq!(body["degraded"], false);
        assert_eq!(body["pool"]["maxSize"], 2);
        assert_eq!(body["pool"]["total"], 0);
    }

    #[tokio::test]
    async fn test_provider_listing_and_errors() {
        let app = app().await;
        let (status, body) = send_json(&app, "GET", "/providers", None).await;
        assert_eq!(status, StatusCode::OK);
        let categories: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["category"].as_str().unwrap())
            .collect();
        assert_eq!(categories, vec!["sandbox", "agent"]);

        let (status, body) = send_json(&app, "GET", "/providers/sandbox/available", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["available"]
            .as_array()
            .unwrap()
            .contains(&json!("native")));

        let (status, _) = send_json(&app, "GET", "/providers/gpu/available", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send_json(
            &app,
            "POST",
            "/providers/sandbox/switch",
            Some(json!({"type": "qemu"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "UNKNOWN_PROVIDER");
    }

    #[tokio::test]
    async fn test_switch_to_native() {
        let app = app().await;
        let (status, body) = send_json(
            &app,
            "POST",
            "/providers/sandbox/switch",
            Some(json!({"type": "native", "config": {"timeoutMs": 5000}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "native");
        assert_eq!(body["capabilities"]["isolation"], "none");

        let (_, settings) = send_json(&app, "GET", "/settings", None).await;
        assert_eq!(settings["runtime"]["providers"]["sandbox"]["type"], "native");
    }

    #[tokio::test]
    async fn test_settings_round_trip_redacts_keys() {
        let app = app().await;
        let (status, body) = send_json(
            &app,
            "POST",
            "/settings",
            Some(json!({"proxy": {"apiKey": "sk-secret", "model": "gpt-4o-mini"}, "pool": {"maxSize": 5}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["effective"]["proxy"]["apiKey"], REDACTED);
        assert_eq!(body["effective"]["proxy"]["model"], "gpt-4o-mini");
        assert_eq!(body["effective"]["pool"]["maxSize"], 5);

        let (_, info) = send_json(&app, "GET", "/sandbox/info", None).await;
        assert_eq!(info["pool"]["maxSize"], 5);
    }

    #[tokio::test]
    async fn test_reload_without_manifests() {
        let app = app().await;
        let (status, body) = send_json(&app, "POST", "/providers/reload", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sandbox"]["failed"], 0);
        assert_eq!(body["agent"]["loaded"], 0);
    }

    fn proxy_config(upstream: &MockServer) -> AppConfig {
        AppConfig {
            proxy: agentbox_core::ProxyConfig {
                upstream_url: Some(upstream.uri()),
                api_key: Some("sk-up".to_string()),
                model: None,
            },
            ..Default::default()
        }
    }

    fn anthropic_request(stream: bool) -> Value {
        json!({
            "model": "claude-sonnet",
            "max_tokens": 64,
            "stream": stream,
            "messages": [{"role": "user", "content": "Hi"}]
        })
    }

    #[tokio::test]
    async fn test_messages_non_streaming() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hello!"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            })))
            .mount(&upstream)
            .await;

        let app = app_with(proxy_config(&upstream)).await;
        let (status, body) = send_json(&app, "POST", "/v1/messages", Some(anthropic_request(false))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "message");
        assert_eq!(body["content"][0]["text"], "Hello!");
        assert_eq!(body["stop_reason"], "end_turn");
    }

    #[tokio::test]
    async fn test_messages_streaming_is_sse() {
        let upstream = MockServer::start().await;
        let sse = concat!(
            "data: {\"id\":\"c\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&upstream)
            .await;

        let app = app_with(proxy_config(&upstream)).await;
        let (status, bytes) = send(&app, "POST", "/v1/messages", Some(anthropic_request(true))).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(bytes).unwrap();
        let start = text.find("event: message_start").unwrap();
        let delta = text.find("event: content_block_delta").unwrap();
        let stop = text.find("event: message_stop").unwrap();
        assert!(start < delta && delta < stop);
    }

    #[tokio::test]
    async fn test_messages_upstream_error_envelope() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&upstream)
            .await;

        let app = app_with(proxy_config(&upstream)).await;
        let (status, body) = send_json(&app, "POST", "/v1/messages", Some(anthropic_request(false))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");
    }

    #[tokio::test]
    async fn test_messages_malformed_body() {
        let app = app().await;
        let (status, body) =
            send_json(&app, "POST", "/v1/messages", Some(json!({"messages": "nope"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn test_agent_run_requires_prompt() {
        let app = app().await;
        let (status, _) = send_json(&app, "POST", "/agent/run", Some(json!({"prompt": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_agent_run_streams_manifest_agent() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-agent");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "[ \"$1\" = --version ] && { echo '1.0.0'; exit 0; }\n",
                "echo '{\"type\":\"system\",\"session_id\":\"s-1\"}'\n",
                "echo '{\"type\":\"result\",\"result\":\"done\",\"is_error\":false}'\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let plugins = dir.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();
        std::fs::write(
            plugins.join("fake.json"),
            json!({
                "type": "fake",
                "name": "Fake agent",
                "category": "agent",
                "kind": "claude-cli",
                "config": {"binary": script.to_string_lossy()}
            })
            .to_string(),
        )
        .unwrap();

        let mut config = AppConfig::default();
        config.plugins.dir = Some(plugins);
        config
            .providers
            .set(agentbox_core::AGENT_CATEGORY, ProviderSelection::of_type("fake"));
        config
            .providers
            .set(SANDBOX_CATEGORY, ProviderSelection::of_type("native"));
        let store = ConfigStore::new(config);
        let ctx = Arc::new(AppContext::new(Arc::new(store)).await);
        let app = TestApp {
            router: create_router(ctx),
            _dir: dir,
        };

        let (status, bytes) =
            send(&app, "POST", "/agent/run", Some(json!({"prompt": "do it"}))).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("event: session"));
        assert!(text.contains("event: result"));
    }
}
