//! Provider manager: resolves the active provider of each category.

use crate::config::{ConfigStore, ProviderSelection};
use crate::error::{ProviderError, ProviderResult};
use crate::provider::{Provider, ProviderCapabilities, ProviderMetadata};
use crate::registry::{CategoryRegistry, InstanceInfo, ProviderRegistry};
use crate::sync::{lock, read, write};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// Recorded when the configured provider of a category could not be used and
/// another one was activated instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Degradation {
    pub requested: String,
    pub actual: String,
    pub reason: String,
}

/// One provider as reported by [`ProviderManager::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    #[serde(flatten)]
    pub metadata: ProviderMetadata,
    pub available: bool,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceInfo>,
}

/// Aggregated view of a category.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStatus {
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<Degradation>,
    pub providers: Vec<ProviderStatus>,
}

/// Facade over the per-category registries.
///
/// At most one instance per category is active. Switching stops the active
/// instance before starting the new one.
pub struct ProviderManager {
    registries: RwLock<Vec<Arc<dyn CategoryRegistry>>>,
    config: Arc<ConfigStore>,
    active: Mutex<HashMap<String, String>>,
    degraded: Mutex<HashMap<String, Degradation>>,
    category_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ProviderManager {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            registries: RwLock::new(Vec::new()),
            config,
            active: Mutex::new(HashMap::new()),
            degraded: Mutex::new(HashMap::new()),
            category_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Add a category registry. Replaces an existing registry of the same category.
    pub fn register_category<P>(&self, registry: Arc<ProviderRegistry<P>>)
    where
        P: ?Sized + Provider + 'static,
    {
        let erased: Arc<dyn CategoryRegistry> = registry;
        let mut registries = write(&self.registries);
        registries.retain(|r| r.category() != erased.category());
        registries.push(erased);
    }

    pub fn categories(&self) -> Vec<String> {
        read(&self.registries)
            .iter()
            .map(|r| r.category().to_string())
            .collect()
    }

    fn erased(&self, category: &str) -> ProviderResult<Arc<dyn CategoryRegistry>> {
        read(&self.registries)
            .iter()
            .find(|r| r.category() == category)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownCategory(category.to_string()))
    }

    /// Typed access to a category's registry.
    pub fn registry<P>(&self, category: &str) -> ProviderResult<Arc<ProviderRegistry<P>>>
    where
        P: ?Sized + Provider + 'static,
    {
        self.erased(category)?
            .into_any()
            .downcast::<ProviderRegistry<P>>()
            .map_err(|_| ProviderError::CategoryTypeMismatch(category.to_string()))
    }

    fn category_lock(&self, category: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            lock(&self.category_locks)
                .entry(category.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Pick the type to activate: the configured one if it is available,
    /// otherwise the first available type.
    async fn resolve(
        &self,
        category: &str,
        registry: &Arc<dyn CategoryRegistry>,
    ) -> Option<(String, Value)> {
        let effective = self.config.effective();
        let selection = effective.selection_for(category);

        let Some(requested) = selection.provider_type else {
            lock(&self.degraded).remove(category);
            let first = registry.available_types().await.into_iter().next()?;
            return Some((first, selection.config));
        };

        if registry.has(&requested) && registry.is_type_available(&requested).await {
            lock(&self.degraded).remove(category);
            return Some((requested, selection.config));
        }

        let reason = if registry.has(&requested) {
            "not available on this host"
        } else {
            "not registered"
        };
        let fallback = registry
            .available_types()
            .await
            .into_iter()
            .find(|t| *t != requested);

        match fallback {
            Some(actual) => {
                warn!(
                    category = %category,
                    requested = %requested,
                    actual = %actual,
                    reason = reason,
                    "Configured provider unusable, falling back"
                );
                lock(&self.degraded).insert(
                    category.to_string(),
                    Degradation {
                        requested,
                        actual: actual.clone(),
                        reason: reason.to_string(),
                    },
                );
                Some((actual, effective.category_defaults(category)))
            }
            None => {
                warn!(category = %category, requested = %requested, "No provider available");
                None
            }
        }
    }

    /// The active provider of `category`, activating it if needed.
    ///
    /// Returns `Ok(None)` when no provider of the category is available.
    /// Initialization failures are returned as errors.
    pub async fn get_provider<P>(&self, category: &str) -> ProviderResult<Option<Arc<P>>>
    where
        P: ?Sized + Provider + 'static,
    {
        let registry = self.registry::<P>(category)?;
        let erased = self.erased(category)?;

        let guard = self.category_lock(category);
        let _guard = guard.lock().await;

        let Some((provider_type, config)) = self.resolve(category, &erased).await else {
            return Ok(None);
        };

        let previous = lock(&self.active).get(category).cloned();
        if let Some(previous) = previous.filter(|p| *p != provider_type) {
            if let Err(e) = registry.stop_instance(&previous).await {
                warn!(category = %category, provider_type = %previous, error = %e, "Failed to stop previous provider");
            }
        }

        let provider = registry.get_instance(&provider_type, &config).await?;
        lock(&self.active).insert(category.to_string(), provider_type);
        Ok(Some(provider))
    }

    /// Stop the active provider of `category`, activate `provider_type` and
    /// persist the selection.
    ///
    /// The selection is only recorded once activation succeeds; on failure
    /// later lookups resolve the previous selection again.
    pub async fn switch_provider(
        &self,
        category: &str,
        provider_type: &str,
        config: Value,
    ) -> ProviderResult<ProviderCapabilities> {
        let registry = self.erased(category)?;
        if !registry.has(provider_type) {
            return Err(ProviderError::UnknownProviderType {
                category: category.to_string(),
                provider_type: provider_type.to_string(),
                available: registry
                    .list()
                    .into_iter()
                    .map(|m| m.provider_type)
                    .collect(),
            });
        }

        let guard = self.category_lock(category);
        let _guard = guard.lock().await;

        let previous = lock(&self.active).remove(category);
        if let Some(previous) = previous {
            info!(category = %category, from = %previous, to = %provider_type, "Switching provider");
            if let Err(e) = registry.deactivate(&previous).await {
                warn!(category = %category, provider_type = %previous, error = %e, "Failed to stop previous provider");
            }
        }

        let selection = ProviderSelection::of_type(provider_type).with_config(config);
        let effective = self.config.preview_selection(category, selection.clone());
        let capabilities = match registry.activate(provider_type, &effective.config).await {
            Ok(capabilities) => capabilities,
            Err(e) => {
                warn!(category = %category, provider_type = %provider_type, error = %e, "Provider switch failed");
                return Err(e);
            }
        };
        self.config.set_selection(category, selection);

        lock(&self.active).insert(category.to_string(), provider_type.to_string());
        lock(&self.degraded).remove(category);

        if let Err(e) = self.config.persist().await {
            warn!(category = %category, error = %e, "Failed to persist provider selection");
        }

        Ok(capabilities)
    }

    pub fn active_type(&self, category: &str) -> Option<String> {
        lock(&self.active).get(category).cloned()
    }

    pub fn degradation(&self, category: &str) -> Option<Degradation> {
        lock(&self.degraded).get(category).cloned()
    }

    /// Metadata, availability and instance state across every category.
    pub async fn status(&self) -> Vec<CategoryStatus> {
        let registries: Vec<Arc<dyn CategoryRegistry>> = read(&self.registries).clone();
        let mut out = Vec::with_capacity(registries.len());

        for registry in registries {
            let category = registry.category().to_string();
            let available = registry.available_types().await;
            let active = self.active_type(&category);

            let providers = registry
                .list()
                .into_iter()
                .map(|metadata| {
                    let t = metadata.provider_type.clone();
                    ProviderStatus {
                        available: available.contains(&t),
                        active: active.as_deref() == Some(t.as_str()),
                        instance: registry.instance_info(&t),
                        metadata,
                    }
                })
                .collect();

            out.push(CategoryStatus {
                degraded: self.degradation(&category),
                active,
                category,
                providers,
            });
        }
        out
    }

    /// Stop every provider in every category.
    pub async fn shutdown(&self) {
        let registries: Vec<Arc<dyn CategoryRegistry>> = read(&self.registries).clone();
        for registry in registries {
            registry.deactivate_all().await;
        }
        lock(&self.active).clear();
        info!("Provider manager shut down");
    }
}
