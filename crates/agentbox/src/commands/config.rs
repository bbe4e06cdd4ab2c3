//! `agentbox config`.

use agentbox_core::AppConfig;
use std::path::Path;

pub async fn config(project: &Path) -> anyhow::Result<()> {
    let (mut config, sources) = AppConfig::load(Some(project)).await?;
    for key in [&mut config.proxy.api_key, &mut config.agent.api_key] {
        if key.is_some() {
            *key = Some("********".to_string());
        }
    }

    if sources.is_empty() {
        eprintln!("No config files found, showing defaults and environment overrides");
    } else {
        for source in &sources {
            eprintln!("Loaded {}", source.display());
        }
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
