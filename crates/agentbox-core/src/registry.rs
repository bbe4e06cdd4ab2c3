//! Category-scoped provider registry.
//!
//! The registry owns plugin definitions and at most one live singleton per
//! provider type. `get_instance` is single-flight per type: a per-type async
//! lock is held across creation and `init()`, so concurrent callers all
//! observe the same instance.

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{
    Provider, ProviderCapabilities, ProviderInstance, ProviderMetadata, ProviderPlugin,
    ProviderState,
};
use crate::sync::{lock, read, write};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Lifecycle notification broadcast to registry listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RegistryEvent {
    #[serde(rename = "provider:registered", rename_all = "camelCase")]
    Registered {
        category: String,
        provider_type: String,
    },
    #[serde(rename = "provider:unregistered", rename_all = "camelCase")]
    Unregistered {
        category: String,
        provider_type: String,
    },
    #[serde(rename = "provider:state", rename_all = "camelCase")]
    StateChanged {
        category: String,
        provider_type: String,
        state: ProviderState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RegistryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RegistryEvent::Registered { .. } => "provider:registered",
            RegistryEvent::Unregistered { .. } => "provider:unregistered",
            RegistryEvent::StateChanged { .. } => "provider:state",
        }
    }

    pub fn provider_type(&self) -> &str {
        match self {
            RegistryEvent::Registered { provider_type, .. }
            | RegistryEvent::Unregistered { provider_type, .. }
            | RegistryEvent::StateChanged { provider_type, .. } => provider_type,
        }
    }
}

/// Synchronous event callback.
pub type RegistryListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Handle returned by [`ProviderRegistry::on_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Snapshot of a singleton instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub state: ProviderState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Generic provider registry for one category.
pub struct ProviderRegistry<P: ?Sized> {
    category: String,
    /// Kept in registration order; `get_available` reports in this order.
    plugins: RwLock<Vec<ProviderPlugin<P>>>,
    instances: Mutex<HashMap<String, ProviderInstance<P>>>,
    flights: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    listeners: RwLock<Vec<(ListenerId, RegistryListener)>>,
    next_listener: AtomicU64,
}

impl<P: ?Sized + Provider + 'static> ProviderRegistry<P> {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            plugins: RwLock::new(Vec::new()),
            instances: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Register a plugin. An existing plugin of the same type is replaced.
    pub fn register(&self, plugin: ProviderPlugin<P>) {
        let provider_type = plugin.provider_type().to_string();
        {
            let mut plugins = write(&self.plugins);
            match plugins
                .iter_mut()
                .find(|p| p.provider_type() == provider_type)
            {
                Some(existing) => {
                    warn!(
                        category = %self.category,
                        provider_type = %provider_type,
                        "Provider already registered, overwriting"
                    );
                    *existing = plugin;
                }
                None => {
                    debug!(category = %self.category, provider_type = %provider_type, "Registered provider");
                    plugins.push(plugin);
                }
            }
        }
        self.emit(RegistryEvent::Registered {
            category: self.category.clone(),
            provider_type,
        });
    }

    /// Remove a plugin, stopping its live instance first.
    ///
    /// Shutdown errors are logged, not returned. Returns whether a plugin was
    /// removed.
    pub async fn unregister(&self, provider_type: &str) -> bool {
        if let Err(e) = self.stop_instance(provider_type).await {
            warn!(
                category = %self.category,
                provider_type = %provider_type,
                error = %e,
                "Failed to stop provider while unregistering"
            );
        }

        let removed = {
            let mut plugins = write(&self.plugins);
            let before = plugins.len();
            plugins.retain(|p| p.provider_type() != provider_type);
            plugins.len() != before
        };

        if removed {
            debug!(category = %self.category, provider_type = %provider_type, "Unregistered provider");
            self.emit(RegistryEvent::Unregistered {
                category: self.category.clone(),
                provider_type: provider_type.to_string(),
            });
        }
        removed
    }

    pub fn has(&self, provider_type: &str) -> bool {
        read(&self.plugins)
            .iter()
            .any(|p| p.provider_type() == provider_type)
    }

    /// Registered types in registration order.
    pub fn types(&self) -> Vec<String> {
        read(&self.plugins)
            .iter()
            .map(|p| p.provider_type().to_string())
            .collect()
    }

    pub fn list(&self) -> Vec<ProviderMetadata> {
        read(&self.plugins)
            .iter()
            .map(|p| p.metadata.clone())
            .collect()
    }

    pub fn metadata(&self, provider_type: &str) -> Option<ProviderMetadata> {
        self.plugin(provider_type).map(|p| p.metadata)
    }

    fn plugin(&self, provider_type: &str) -> Option<ProviderPlugin<P>> {
        read(&self.plugins)
            .iter()
            .find(|p| p.provider_type() == provider_type)
            .cloned()
    }

    fn unknown(&self, provider_type: &str) -> ProviderError {
        ProviderError::UnknownProviderType {
            category: self.category.clone(),
            provider_type: provider_type.to_string(),
            available: self.types(),
        }
    }

    /// Build a transient provider. Not tracked by the registry.
    pub fn create(&self, provider_type: &str, config: &Value) -> ProviderResult<Arc<P>> {
        let plugin = self
            .plugin(provider_type)
            .ok_or_else(|| self.unknown(provider_type))?;
        (plugin.factory)(config)
    }

    fn flight(&self, provider_type: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            lock(&self.flights)
                .entry(provider_type.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Return the singleton for `provider_type`, creating and initializing it
    /// if needed.
    ///
    /// A cached instance in the `error` state is discarded and recreated. An
    /// `init()` failure leaves the instance in `error` with the message
    /// retained, and the error is returned.
    pub async fn get_instance(&self, provider_type: &str, config: &Value) -> ProviderResult<Arc<P>> {
        let flight = self.flight(provider_type);
        let _guard = flight.lock().await;

        {
            let mut instances = lock(&self.instances);
            if let Some(instance) = instances.get_mut(provider_type) {
                if instance.state.is_ready() {
                    instance.touch();
                    return Ok(Arc::clone(&instance.provider));
                }
            }
            if let Some(stale) = instances.remove(provider_type) {
                if stale.state == ProviderState::Error {
                    warn!(
                        category = %self.category,
                        provider_type = %provider_type,
                        error = stale.error.as_deref().unwrap_or("unknown"),
                        "Recreating provider after failed initialization"
                    );
                }
            }
        }

        let provider = self.create(provider_type, config)?;
        {
            let mut instance = ProviderInstance::new(Arc::clone(&provider));
            instance.state = ProviderState::Initializing;
            lock(&self.instances).insert(provider_type.to_string(), instance);
        }
        self.emit_state(provider_type, ProviderState::Initializing, None);

        match provider.init(config).await {
            Ok(()) => {
                if let Some(instance) = lock(&self.instances).get_mut(provider_type) {
                    instance.state = ProviderState::Ready;
                    instance.touch();
                }
                info!(category = %self.category, provider_type = %provider_type, "Provider ready");
                self.emit_state(provider_type, ProviderState::Ready, None);
                Ok(provider)
            }
            Err(e) => {
                let message = e.to_string();
                if let Some(instance) = lock(&self.instances).get_mut(provider_type) {
                    instance.state = ProviderState::Error;
                    instance.error = Some(message.clone());
                }
                warn!(
                    category = %self.category,
                    provider_type = %provider_type,
                    error = %message,
                    "Provider initialization failed"
                );
                self.emit_state(provider_type, ProviderState::Error, Some(message));
                Err(e)
            }
        }
    }

    /// The live instance if it is ready. Never creates one.
    pub fn ready_instance(&self, provider_type: &str) -> Option<Arc<P>> {
        lock(&self.instances)
            .get(provider_type)
            .filter(|i| i.state.is_ready())
            .map(|i| Arc::clone(&i.provider))
    }

    pub fn instance_info(&self, provider_type: &str) -> Option<InstanceInfo> {
        lock(&self.instances)
            .get(provider_type)
            .map(|i| Self::info_of(provider_type, i))
    }

    pub fn instance_infos(&self) -> Vec<InstanceInfo> {
        let mut infos: Vec<InstanceInfo> = lock(&self.instances)
            .iter()
            .map(|(t, i)| Self::info_of(t, i))
            .collect();
        infos.sort_by(|a, b| a.provider_type.cmp(&b.provider_type));
        infos
    }

    fn info_of(provider_type: &str, instance: &ProviderInstance<P>) -> InstanceInfo {
        InstanceInfo {
            provider_type: provider_type.to_string(),
            state: instance.state,
            error: instance.error.clone(),
            created_at: instance.created_at,
            last_used_at: instance.last_used_at,
        }
    }

    /// Check one plugin. Factory errors and panics count as unavailable.
    async fn check_availability(&self, plugin: &ProviderPlugin<P>) -> bool {
        let provider = match self.ready_instance(plugin.provider_type()) {
            Some(live) => live,
            None => {
                let factory = Arc::clone(&plugin.factory);
                match std::panic::catch_unwind(AssertUnwindSafe(|| factory(&Value::Null))) {
                    Ok(Ok(provider)) => provider,
                    Ok(Err(e)) => {
                        debug!(provider_type = %plugin.provider_type(), error = %e, "Provider factory failed during availability check");
                        return false;
                    }
                    Err(_) => {
                        warn!(provider_type = %plugin.provider_type(), "Provider factory panicked during availability check");
                        return false;
                    }
                }
            }
        };

        match AssertUnwindSafe(provider.is_available()).catch_unwind().await {
            Ok(available) => available,
            Err(_) => {
                warn!(provider_type = %plugin.provider_type(), "Provider availability check panicked");
                false
            }
        }
    }

    /// Whether a registered type reports itself available right now.
    pub async fn is_available(&self, provider_type: &str) -> bool {
        match self.plugin(provider_type) {
            Some(plugin) => self.check_availability(&plugin).await,
            None => false,
        }
    }

    /// Types whose availability check succeeds, in registration order.
    ///
    /// Checks run on every call; results are never cached.
    pub async fn get_available(&self) -> Vec<String> {
        let plugins: Vec<ProviderPlugin<P>> = read(&self.plugins).clone();
        let checks = plugins.iter().map(|p| self.check_availability(p));
        let results = futures::future::join_all(checks).await;
        plugins
            .iter()
            .zip(results)
            .filter(|(_, available)| *available)
            .map(|(p, _)| p.provider_type().to_string())
            .collect()
    }

    /// First type in `types` that is registered and available.
    pub async fn get_by_priority(&self, types: &[&str]) -> Option<String> {
        for provider_type in types {
            if self.is_available(provider_type).await {
                return Some((*provider_type).to_string());
            }
        }
        None
    }

    /// Stop and remove the singleton of `provider_type`.
    ///
    /// The entry is removed whether or not `shutdown()` succeeds.
    pub async fn stop_instance(&self, provider_type: &str) -> ProviderResult<()> {
        let flight = self.flight(provider_type);
        let _guard = flight.lock().await;

        let provider = {
            let mut instances = lock(&self.instances);
            match instances.get_mut(provider_type) {
                Some(instance) => {
                    instance.state = ProviderState::Stopping;
                    Arc::clone(&instance.provider)
                }
                None => return Ok(()),
            }
        };
        self.emit_state(provider_type, ProviderState::Stopping, None);

        let result = provider.shutdown().await;
        lock(&self.instances).remove(provider_type);

        match result {
            Ok(()) => {
                info!(category = %self.category, provider_type = %provider_type, "Provider stopped");
                self.emit_state(provider_type, ProviderState::Stopped, None);
                Ok(())
            }
            Err(e) => {
                self.emit_state(provider_type, ProviderState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stop every live singleton. Individual failures are logged.
    pub async fn stop_all(&self) {
        let types: Vec<String> = lock(&self.instances).keys().cloned().collect();
        let stops = types.iter().map(|t| async move { (t, self.stop_instance(t).await) });
        for (provider_type, result) in futures::future::join_all(stops).await {
            if let Err(e) = result {
                warn!(category = %self.category, provider_type = %provider_type, error = %e, "Failed to stop provider");
            }
        }
    }

    /// Subscribe to lifecycle events.
    pub fn on_event(&self, listener: RegistryListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        write(&self.listeners).push((id, listener));
        id
    }

    pub fn off_event(&self, id: ListenerId) {
        write(&self.listeners).retain(|(existing, _)| *existing != id);
    }

    fn emit_state(&self, provider_type: &str, state: ProviderState, error: Option<String>) {
        self.emit(RegistryEvent::StateChanged {
            category: self.category.clone(),
            provider_type: provider_type.to_string(),
            state,
            error,
        });
    }

    /// Deliver an event to every listener. A panicking listener is logged and
    /// does not prevent delivery to the rest.
    fn emit(&self, event: RegistryEvent) {
        let listeners: Vec<RegistryListener> = read(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(event = event.name(), "Registry listener panicked");
            }
        }
    }
}

/// Type-erased view of a registry, used by the provider manager to operate on
/// categories without knowing their provider trait.
#[async_trait]
pub trait CategoryRegistry: Send + Sync {
    fn category(&self) -> &str;

    fn list(&self) -> Vec<ProviderMetadata>;

    fn has(&self, provider_type: &str) -> bool;

    fn instance_info(&self, provider_type: &str) -> Option<InstanceInfo>;

    async fn available_types(&self) -> Vec<String>;

    async fn is_type_available(&self, provider_type: &str) -> bool;

    /// Bring the singleton of `provider_type` to `ready`, returning its capabilities.
    async fn activate(&self, provider_type: &str, config: &Value)
        -> ProviderResult<ProviderCapabilities>;

    async fn deactivate(&self, provider_type: &str) -> ProviderResult<()>;

    async fn deactivate_all(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
impl<P: ?Sized + Provider + 'static> CategoryRegistry for ProviderRegistry<P> {
    fn category(&self) -> &str {
        &self.category
    }

    fn list(&self) -> Vec<ProviderMetadata> {
        ProviderRegistry::list(self)
    }

    fn has(&self, provider_type: &str) -> bool {
        ProviderRegistry::has(self, provider_type)
    }

    fn instance_info(&self, provider_type: &str) -> Option<InstanceInfo> {
        ProviderRegistry::instance_info(self, provider_type)
    }

    async fn available_types(&self) -> Vec<String> {
        self.get_available().await
    }

    async fn is_type_available(&self, provider_type: &str) -> bool {
        self.is_available(provider_type).await
    }

    async fn activate(
        &self,
        provider_type: &str,
        config: &Value,
    ) -> ProviderResult<ProviderCapabilities> {
        let provider = self.get_instance(provider_type, config).await?;
        Ok(provider.capabilities())
    }

    async fn deactivate(&self, provider_type: &str) -> ProviderResult<()> {
        self.stop_instance(provider_type).await
    }

    async fn deactivate_all(&self) {
        self.stop_all().await
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
