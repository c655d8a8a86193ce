//! In-process adapter backed by async handler functions.

use super::{AdapterFeature, CapabilityAdapter, FeatureSet};
use crate::capability::Capability;
use crate::types::{AdapterId, ConnectError, InvokeError};
use agent_fabric_config::AdapterConfig;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Handler invoked for one local capability.
pub type Handler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, InvokeError>> + Send + Sync>;

struct LocalCapability {
    capability: Capability,
    handler: Handler,
}

/// Adapter exposing capabilities implemented inside the current process.
pub struct LocalAdapter {
    id: AdapterId,
    namespace: String,
    capabilities: RwLock<HashMap<String, LocalCapability>>,
    connected: AtomicBool,
    cancelled: Mutex<Vec<String>>,
}

impl LocalAdapter {
    pub fn new(id: impl Into<AdapterId>, namespace: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            capabilities: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// Build an adapter from its config entry.
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self::new(config.id.clone(), config.namespace())
    }

    /// Add a capability handled by `handler`.
    pub fn with_handler<F, Fut>(mut self, local_name: &str, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, InvokeError>> + Send + 'static,
    {
        let capability = Capability::new(&self.namespace, local_name, self.id.clone());
        self.capabilities
            .get_mut()
            .insert(local_name.to_string(), entry(capability, handler));
        self
    }

    /// Add a capability with a fully described [`Capability`].
    pub fn with_capability<F, Fut>(mut self, capability: Capability, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, InvokeError>> + Send + 'static,
    {
        let local = capability.local_name().to_string();
        self.capabilities
            .get_mut()
            .insert(local, entry(capability, handler));
        self
    }

    /// Add or replace a capability on a shared adapter. Picked up on the next
    /// discovery refresh.
    pub async fn add_handler<F, Fut>(&self, local_name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, InvokeError>> + Send + 'static,
    {
        let capability = Capability::new(&self.namespace, local_name, self.id.clone());
        self.capabilities
            .write()
            .await
            .insert(local_name.to_string(), entry(capability, handler));
    }

    pub async fn remove_handler(&self, local_name: &str) -> bool {
        self.capabilities.write().await.remove(local_name).is_some()
    }

    /// Invocation ids that received a cancel signal.
    pub async fn cancelled_invocations(&self) -> Vec<String> {
        self.cancelled.lock().await.clone()
    }
}

fn entry<F, Fut>(capability: Capability, handler: F) -> LocalCapability
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, InvokeError>> + Send + 'static,
{
    let handler: Handler = Arc::new(move |payload| Box::pin(handler(payload)));
    LocalCapability {
        capability,
        handler,
    }
}

#[async_trait]
impl CapabilityAdapter for LocalAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn features(&self) -> FeatureSet {
        [
            AdapterFeature::Invoke,
            AdapterFeature::Discovery,
            AdapterFeature::Cancellation,
        ]
        .into_iter()
        .collect()
    }

    async fn connect(&self, _config: &AdapterConfig) -> Result<(), ConnectError> {
        self.connected.store(true, Ordering::SeqCst);
        debug!("Local adapter {} connected", self.id);
        Ok(())
    }

    async fn discover_capabilities(&self) -> Result<Vec<Capability>, ConnectError> {
        if !self.is_connected() {
            return Err(ConnectError::NotConnected);
        }
        let capabilities = self.capabilities.read().await;
        let mut list: Vec<Capability> = capabilities
            .values()
            .map(|c| c.capability.clone())
            .collect();
        list.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        Ok(list)
    }

    async fn invoke(
        &self,
        capability: &Capability,
        _invocation_id: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, InvokeError> {
        if !self.is_connected() {
            return Err(InvokeError::Unreachable(format!(
                "adapter {} is disconnected",
                self.id
            )));
        }

        let handler = {
            let capabilities = self.capabilities.read().await;
            capabilities
                .get(capability.local_name())
                .map(|c| c.handler.clone())
                .ok_or_else(|| InvokeError::CapabilityNotFound(capability.qualified_name.clone()))?
        };

        tokio::time::timeout(timeout, handler(payload))
            .await
            .map_err(|_| InvokeError::Timeout(timeout))?
    }

    async fn cancel(&self, invocation_id: &str) {
        self.cancelled.lock().await.push(invocation_id.to_string());
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        debug!("Local adapter {} disconnected", self.id);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> LocalAdapter {
        LocalAdapter::new("local-1", "tools")
            .with_handler("echo", |payload| async move { Ok(payload) })
            .with_handler("fail", |_| async move {
                Err(InvokeError::RemoteError("boom".to_string()))
            })
    }

    #[tokio::test]
    async fn discovery_requires_connection() {
        let adapter = adapter();
        assert_eq!(
            adapter.discover_capabilities().await,
            Err(ConnectError::NotConnected)
        );

        adapter.connect(&AdapterConfig::local("local-1")).await.unwrap();
        let caps = adapter.discover_capabilities().await.unwrap();
        let names: Vec<_> = caps.iter().map(|c| c.qualified_name.as_str()).collect();
        assert_eq!(names, vec!["tools:echo", "tools:fail"]);
    }

    #[tokio::test]
    async fn invoke_routes_to_handler() {
        let adapter = adapter();
        adapter.connect(&AdapterConfig::local("local-1")).await.unwrap();
        let cap = Capability::new("tools", "echo", "local-1");

        let out = adapter
            .invoke(&cap, "inv-1", json!({"x": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));

        let fail = Capability::new("tools", "fail", "local-1");
        let err = adapter
            .invoke(&fail, "inv-2", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, InvokeError::RemoteError("boom".to_string()));
    }

    #[tokio::test]
    async fn unknown_capability_is_reported() {
        let adapter = adapter();
        adapter.connect(&AdapterConfig::local("local-1")).await.unwrap();
        let cap = Capability::new("tools", "missing", "local-1");
        let err = adapter
            .invoke(&cap, "inv", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::CapabilityNotFound(_)));
    }

    #[tokio::test]
    async fn disconnected_adapter_is_unreachable() {
        let adapter = adapter();
        let cap = Capability::new("tools", "echo", "local-1");
        let err = adapter
            .invoke(&cap, "inv", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Unreachable(_)));
    }

    #[tokio::test]
    async fn handlers_can_be_added_after_sharing() {
        let adapter = Arc::new(adapter());
        adapter.connect(&AdapterConfig::local("local-1")).await.unwrap();
        adapter
            .add_handler("late", |_| async move { Ok(json!("late")) })
            .await;
        assert_eq!(adapter.discover_capabilities().await.unwrap().len(), 3);
        assert!(adapter.remove_handler("late").await);
        assert_eq!(adapter.discover_capabilities().await.unwrap().len(), 2);
    }
}
