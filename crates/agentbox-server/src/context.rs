//! Application context shared by every handler.
//!
//! Built once at startup. Registries, the provider manager, the sandbox pool
//! and the plugin loaders all live here instead of in globals.

use crate::error::{ServerError, ServerResult};
use agentbox_agent::{agent_loader, AgentProvider, AgentRegistry};
use agentbox_core::loader::PluginWatcher;
use agentbox_core::{
    AgentSettings, AppConfig, ConfigStore, Degradation, LoadSummary, PluginLoader, Provider,
    ProviderCapabilities, ProviderManager, SandboxCapabilities, AGENT_CATEGORY, SANDBOX_CATEGORY,
};
use agentbox_proxy::{ProxyClient, ProxyResult, UpstreamConfig};
use agentbox_sandbox::{
    sandbox_loader, PoolStats, SandboxExecOptions, SandboxExecResult, SandboxPool,
    SandboxProvider, SandboxRegistry, ScriptRunRequest, ScriptRunResult,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// What `GET /sandbox/info` reports.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub provider: String,
    pub capabilities: SandboxCapabilities,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation: Option<Degradation>,
    pub pool: PoolStats,
}

/// Outcome of `POST /providers/reload`.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadSummary {
    pub sandbox: LoadSummary,
    pub agent: LoadSummary,
}

struct ActivePool {
    provider_type: String,
    pool: SandboxPool,
}

pub struct AppContext {
    config: Arc<ConfigStore>,
    manager: Arc<ProviderManager>,
    sandboxes: Arc<SandboxRegistry>,
    agents: Arc<AgentRegistry>,
    sandbox_loader: Arc<PluginLoader<dyn SandboxProvider>>,
    agent_loader: Arc<PluginLoader<dyn AgentProvider>>,
    pool: AsyncMutex<Option<ActivePool>>,
    watchers: Mutex<Vec<PluginWatcher>>,
}

impl AppContext {
    /// Register the built-in catalogs, load plugin manifests and wire every
    /// category into a provider manager.
    pub async fn new(config: Arc<ConfigStore>) -> Self {
        let effective = config.effective();
        let plugin_dir = effective.plugins.dir();

        let sandboxes = Arc::new(SandboxRegistry::new(SANDBOX_CATEGORY));
        let agents = Arc::new(AgentRegistry::new(AGENT_CATEGORY));
        let sandbox_loader = Arc::new(sandbox_loader(sandboxes.clone(), plugin_dir.clone()));
        let agent_loader = Arc::new(agent_loader(agents.clone(), plugin_dir));

        let sandbox_summary = sandbox_loader.load_all().await;
        let agent_summary = agent_loader.load_all().await;
        info!(
            sandbox = sandbox_summary.loaded,
            agent = agent_summary.loaded,
            failed = sandbox_summary.failed + agent_summary.failed,
            "Loaded provider plugins"
        );

        let manager = Arc::new(ProviderManager::new(config.clone()));
        manager.register_category(sandboxes.clone());
        manager.register_category(agents.clone());

        Self {
            config,
            manager,
            sandboxes,
            agents,
            sandbox_loader,
            agent_loader,
            pool: AsyncMutex::new(None),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ProviderManager> {
        &self.manager
    }

    /// Start hot-reloading the plugin directory. Needs a tokio runtime.
    pub fn watch_plugins(&self) -> ServerResult<()> {
        let sandbox = self.sandbox_loader.watch()?;
        let agent = self.agent_loader.watch()?;
        let mut watchers = self.watchers.lock().unwrap_or_else(|p| p.into_inner());
        watchers.push(sandbox);
        watchers.push(agent);
        Ok(())
    }

    /// The active sandbox provider.
    pub async fn sandbox(&self) -> ServerResult<Arc<dyn SandboxProvider>> {
        self.manager
            .get_provider::<dyn SandboxProvider>(SANDBOX_CATEGORY)
            .await?
            .ok_or_else(|| ServerError::NoProvider(SANDBOX_CATEGORY.to_string()))
    }

    /// The active agent provider.
    pub async fn agent(&self) -> ServerResult<Arc<dyn AgentProvider>> {
        self.manager
            .get_provider::<dyn AgentProvider>(AGENT_CATEGORY)
            .await?
            .ok_or_else(|| ServerError::NoProvider(AGENT_CATEGORY.to_string()))
    }

    /// Run a command on the active sandbox. Requests naming an image go
    /// through the pool when the provider supports pooling.
    pub async fn exec(&self, options: SandboxExecOptions) -> ServerResult<SandboxExecResult> {
        if options.command.trim().is_empty() {
            return Err(ServerError::bad_request("`command` must not be empty"));
        }
        let provider = self.sandbox().await?;
        let image = options
            .image
            .clone()
            .filter(|_| provider.sandbox_capabilities().pooling);
        let Some(image) = image else {
            return Ok(provider.exec(options).await);
        };

        let provider_type = provider.provider_type().to_string();
        let pool = self.pool_for(&provider_type).await;
        let lease = pool
            .acquire(&image, &self.instance_config(&provider_type))
            .await?;
        let result = lease.exec(options).await;
        pool.release(lease);
        Ok(result)
    }

    pub async fn run_file(&self, request: ScriptRunRequest) -> ServerResult<ScriptRunResult> {
        if request.file_path.as_os_str().is_empty() {
            return Err(ServerError::bad_request("`filePath` must not be empty"));
        }
        let provider = self.sandbox().await?;
        Ok(provider
            .run_script(&request.file_path, &request.work_dir, request.options)
            .await)
    }

    pub async fn sandbox_info(&self) -> ServerResult<SandboxInfo> {
        let provider = self.sandbox().await?;
        let degradation = self.manager.degradation(SANDBOX_CATEGORY);
        let pool = match self.pool.lock().await.as_ref() {
            Some(active) => active.pool.stats(),
            None => PoolStats {
                max_size: self.config.effective().pool.max_size(),
                ..Default::default()
            },
        };
        Ok(SandboxInfo {
            provider: provider.provider_type().to_string(),
            capabilities: provider.sandbox_capabilities(),
            degraded: degradation.is_some(),
            degradation,
            pool,
        })
    }

    /// Switch the active provider of a category and persist the choice.
    pub async fn switch_provider(
        &self,
        category: &str,
        provider_type: &str,
        config: Value,
    ) -> ServerResult<ProviderCapabilities> {
        let capabilities = self
            .manager
            .switch_provider(category, provider_type, config)
            .await?;
        if category == SANDBOX_CATEGORY {
            self.reset_pool().await;
        }
        Ok(capabilities)
    }

    /// Available provider types of a category, in priority order.
    pub async fn available(&self, category: &str) -> ServerResult<Vec<String>> {
        self.manager
            .status()
            .await
            .into_iter()
            .find(|c| c.category == category)
            .map(|c| {
                c.providers
                    .into_iter()
                    .filter(|p| p.available)
                    .map(|p| p.metadata.provider_type)
                    .collect()
            })
            .ok_or_else(|| ServerError::not_found(format!("unknown provider category '{}'", category)))
    }

    pub async fn reload_plugins(&self) -> ReloadSummary {
        let summary = ReloadSummary {
            sandbox: self.sandbox_loader.reload().await,
            agent: self.agent_loader.reload().await,
        };
        info!(
            sandbox = summary.sandbox.loaded,
            agent = summary.agent.loaded,
            "Reloaded provider plugins"
        );
        summary
    }

    /// Apply a settings patch to the runtime layer and persist it.
    ///
    /// Categories whose settings changed have their active instance stopped
    /// so the next request starts one with the new configuration.
    pub async fn update_settings(&self, patch: AppConfig) -> ServerResult<AppConfig> {
        let agent_changed =
            patch.agent != AgentSettings::default() || patch.providers.get(AGENT_CATEGORY).is_some();
        let sandbox_changed = patch.providers.get(SANDBOX_CATEGORY).is_some();
        let pool_changed = patch.pool.max_size.is_some();

        self.config.update_runtime(patch);
        self.config.persist().await?;

        if agent_changed {
            if let Some(active) = self.manager.active_type(AGENT_CATEGORY) {
                if let Err(e) = self.agents.stop_instance(&active).await {
                    warn!(provider_type = %active, error = %e, "Failed to stop agent after settings change");
                }
            }
        }
        if sandbox_changed {
            if let Some(active) = self.manager.active_type(SANDBOX_CATEGORY) {
                if let Err(e) = self.sandboxes.stop_instance(&active).await {
                    warn!(provider_type = %active, error = %e, "Failed to stop sandbox after settings change");
                }
            }
        }
        if sandbox_changed || pool_changed {
            self.reset_pool().await;
        }
        Ok(self.config.effective())
    }

    /// Client for the protocol proxy, built from the current settings.
    pub fn proxy_client(&self) -> ProxyResult<ProxyClient> {
        let proxy = self.config.effective().proxy;
        ProxyClient::new(UpstreamConfig {
            base_url: proxy.upstream_url().to_string(),
            api_key: proxy.api_key,
            model: proxy.model,
        })
    }

    pub async fn shutdown(&self) {
        self.reset_pool().await;
        self.manager.shutdown().await;
    }

    /// Config handed to pooled instances of `provider_type`.
    fn instance_config(&self, provider_type: &str) -> Value {
        let selection = self.config.effective().selection_for(SANDBOX_CATEGORY);
        match selection.provider_type.as_deref() {
            None => selection.config,
            Some(t) if t == provider_type => selection.config,
            Some(_) => Value::Null,
        }
    }

    async fn pool_for(&self, provider_type: &str) -> SandboxPool {
        let mut guard = self.pool.lock().await;
        if let Some(active) = guard.as_ref().filter(|a| a.provider_type == provider_type) {
            return active.pool.clone();
        }
        if let Some(previous) = guard.take() {
            previous.pool.stop_all().await;
        }
        let max_size = self.config.effective().pool.max_size();
        let pool = SandboxPool::for_registry(self.sandboxes.clone(), provider_type, max_size);
        info!(provider_type = %provider_type, max_size, "Created sandbox pool");
        *guard = Some(ActivePool {
            provider_type: provider_type.to_string(),
            pool: pool.clone(),
        });
        pool
    }

    async fn reset_pool(&self) {
        if let Some(previous) = self.pool.lock().await.take() {
            previous.pool.stop_all().await;
        }
    }
}
