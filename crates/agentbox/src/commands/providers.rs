//! `agentbox providers`.

use super::load_store;
use agentbox_server::AppContext;
use std::path::Path;

pub async fn providers(project: &Path) -> anyhow::Result<()> {
    let ctx = AppContext::new(load_store(project).await?).await;

    for category in ctx.manager().status().await {
        println!("{}:", category.category);
        for provider in &category.providers {
            let marker = if provider.available { "+" } else { "-" };
            println!(
                "  {} {:<10} {} ({})",
                marker,
                provider.metadata.provider_type,
                provider.metadata.name,
                provider.metadata.description
            );
        }
    }
    println!();
    println!("+ available on this host, - unavailable");
    Ok(())
}
