//! HTTP server for agentbox.
//!
//! Exposes sandbox execution, provider management, settings sync, the
//! Anthropic-to-OpenAI proxy and agent runs over REST and SSE.

pub mod context;
pub mod error;
pub mod routes;
pub mod sse;

pub use context::{AppContext, ReloadSummary, SandboxInfo};
pub use error::{ApiError, ServerError, ServerResult};
pub use routes::create_router;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Bind `address` and serve until `shutdown` resolves, then stop every provider.
pub async fn serve(
    ctx: Arc<AppContext>,
    address: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(address = %listener.local_addr()?, "agentbox server listening");
    let router = create_router(ctx.clone());
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await;
    ctx.shutdown().await;
    result
}
