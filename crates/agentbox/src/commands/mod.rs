//! Command handlers for the agentbox CLI.

pub mod config;
pub mod mcp;
pub mod providers;
pub mod serve;

pub use config::config;
pub use mcp::mcp;
pub use providers::providers;
pub use serve::serve;

use agentbox_core::{AppConfig, ConfigStore};
use std::path::Path;
use std::sync::Arc;

/// Load layered configuration. Runtime overrides persist to the global file.
pub async fn load_store(project: &Path) -> anyhow::Result<Arc<ConfigStore>> {
    let (config, sources) = AppConfig::load(Some(project)).await?;
    for source in &sources {
        tracing::debug!(path = %source.display(), "Loaded config file");
    }
    let mut store = ConfigStore::new(config);
    if let Some(dir) = AppConfig::global_config_dir() {
        store = store.with_persist_path(dir.join("config.json"));
    }
    Ok(Arc::new(store))
}
