//! `agentbox serve`.

use super::load_store;
use agentbox_server::AppContext;
use anyhow::Context;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn serve(project: &Path, address: Option<SocketAddr>) -> anyhow::Result<()> {
    let store = load_store(project).await?;
    let effective = store.effective();
    let address = match address {
        Some(address) => address,
        None => effective
            .server
            .address()
            .parse()
            .with_context(|| format!("invalid server address '{}'", effective.server.address()))?,
    };

    let ctx = Arc::new(AppContext::new(store).await);
    if effective.plugins.watch() {
        if let Err(e) = ctx.watch_plugins() {
            warn!(error = %e, "Plugin hot-reload disabled");
        }
    }

    agentbox_server::serve(ctx, address, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
    })
    .await
    .context("server failed")
}
