//! Capability adapters.
//!
//! An adapter wraps exactly one external transport session (an in-process
//! handler table, a remote capability server, a peer) behind the uniform
//! [`CapabilityAdapter`] contract. Adapters declare the features they support
//! when they are constructed; callers check [`AdapterFeature`]s instead of
//! probing at runtime.

pub mod local;
pub mod session;

#[cfg(feature = "http")]
pub mod http;

use crate::capability::Capability;
use crate::types::{AdapterId, ConnectError, InvokeError};
use agent_fabric_config::AdapterConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

pub use local::LocalAdapter;
pub use session::AdapterSession;

#[cfg(feature = "http")]
pub use http::HttpAdapter;

/// Optional behaviour an adapter may support.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AdapterFeature {
    /// Capabilities can be invoked
    Invoke,
    /// Capabilities can be re-discovered after connect
    Discovery,
    /// In-flight invocations can be cancelled downstream
    Cancellation,
}

/// Set of features an adapter declares at construction.
pub type FeatureSet = BTreeSet<AdapterFeature>;

/// Identifies one in-flight invocation for best-effort cancellation.
pub type InvocationId = String;

/// Uniform contract over one external communication mechanism.
#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    /// Unique adapter id.
    fn id(&self) -> &str;

    /// Namespace used to qualify this adapter's capabilities.
    fn namespace(&self) -> &str;

    /// Features this adapter supports.
    fn features(&self) -> FeatureSet;

    /// Establish the transport session.
    async fn connect(&self, config: &AdapterConfig) -> Result<(), ConnectError>;

    /// Current capabilities. Idempotent; callers treat it as a refresh.
    async fn discover_capabilities(&self) -> Result<Vec<Capability>, ConnectError>;

    /// Invoke a capability. Implementations should honor `timeout`;
    /// [`AdapterSession`] enforces it regardless.
    async fn invoke(
        &self,
        capability: &Capability,
        invocation_id: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, InvokeError>;

    /// Best-effort downstream cancellation of an abandoned invocation.
    async fn cancel(&self, _invocation_id: &str) {}

    /// Tear down the transport session.
    async fn disconnect(&self);

    /// Whether the transport session is currently established.
    fn is_connected(&self) -> bool;

    fn supports(&self, feature: AdapterFeature) -> bool {
        self.features().contains(&feature)
    }
}

/// Static description of an adapter, used in listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterInfo {
    pub id: AdapterId,
    pub namespace: String,
    pub features: FeatureSet,
    pub connected: bool,
}

impl AdapterInfo {
    pub fn of(adapter: &dyn CapabilityAdapter) -> Self {
        Self {
            id: adapter.id().to_string(),
            namespace: adapter.namespace().to_string(),
            features: adapter.features(),
            connected: adapter.is_connected(),
        }
    }
}
