//! Registry resolution followed by dispatch to the owning adapter.

use crate::error::{FabricError, Result};
use agent_fabric_collective::{ExecutionError, Task, TaskExecutor};
use agent_fabric_core::{
    AdapterFeature, AdapterId, AdapterSession, Capability, CapabilityRegistry, InvokeError,
    Resolution,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Owns the adapter sessions of one fabric and invokes capabilities by name.
pub struct CapabilityInvoker {
    registry: Arc<CapabilityRegistry>,
    sessions: RwLock<BTreeMap<AdapterId, Arc<AdapterSession>>>,
    default_timeout: Duration,
}

impl CapabilityInvoker {
    pub fn new(registry: Arc<CapabilityRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            sessions: RwLock::new(BTreeMap::new()),
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn add_session(&self, session: Arc<AdapterSession>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            return Err(FabricError::DuplicateAdapter(session.id().to_string()));
        }
        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    pub async fn remove_session(&self, adapter_id: &str) -> Option<Arc<AdapterSession>> {
        self.sessions.write().await.remove(adapter_id)
    }

    pub async fn session(&self, adapter_id: &str) -> Option<Arc<AdapterSession>> {
        self.sessions.read().await.get(adapter_id).cloned()
    }

    pub async fn sessions(&self) -> Vec<Arc<AdapterSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Resolve `name` to exactly one capability.
    pub async fn resolve(&self, name: &str) -> Result<Capability> {
        match self.registry.resolve(name).await {
            Resolution::Found(capability) => Ok(capability),
            Resolution::Ambiguous(candidates) => Err(FabricError::Ambiguous {
                name: name.to_string(),
                candidates,
            }),
            Resolution::NotFound => Err(FabricError::NotFound(name.to_string())),
        }
    }

    /// Invoke `name` through the adapter that published it.
    pub async fn invoke(&self, name: &str, payload: Value, timeout: Duration) -> Result<Value> {
        let capability = self.resolve(name).await?;
        let session = self
            .session(&capability.origin_adapter_id)
            .await
            .ok_or_else(|| FabricError::UnknownAdapter(capability.origin_adapter_id.clone()))?;

        if !session.supports(AdapterFeature::Invoke) {
            return Err(FabricError::UnsupportedFeature {
                adapter: session.id().to_string(),
                feature: AdapterFeature::Invoke,
            });
        }

        debug!("Routing {} to adapter {}", capability.qualified_name, session.id());
        match session.invoke(&capability, payload, timeout).await {
            Ok(output) => Ok(output),
            Err(InvokeError::Timeout(after)) => Err(FabricError::Timeout(after)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Runs router and mesh tasks by invoking the task's capability locally.
pub struct CapabilityExecutor {
    invoker: Arc<CapabilityInvoker>,
}

impl CapabilityExecutor {
    pub fn new(invoker: Arc<CapabilityInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl TaskExecutor for CapabilityExecutor {
    async fn execute(&self, task: &Task) -> std::result::Result<Value, ExecutionError> {
        let default = self.invoker.default_timeout();
        let timeout = task
            .remaining(Utc::now())
            .map(|left| left.min(default))
            .unwrap_or(default);

        match self
            .invoker
            .invoke(&task.capability_required, task.payload.clone(), timeout)
            .await
        {
            Ok(output) => Ok(output),
            Err(FabricError::Timeout(after)) => Err(ExecutionError::Timeout(after)),
            Err(FabricError::Invoke(e)) => Err(e.into()),
            Err(
                e @ (FabricError::NotFound(_)
                | FabricError::Ambiguous { .. }
                | FabricError::UnsupportedFeature { .. }),
            ) => Err(ExecutionError::Rejected(e.to_string())),
            Err(e) => Err(ExecutionError::Failed(e.to_string())),
        }
    }
}
