//! Capability layer of the agent coordination fabric.
//!
//! This crate holds the two bottom layers of the fabric and the pieces
//! every coordination pattern shares:
//!
//! - **Adapters**: one external transport each, behind [`CapabilityAdapter`]
//! - **Registry**: namespacing, deduplication and name resolution
//! - **Liveness**: node records, heartbeats and the health state machine
//!
//! # Usage
//!
//! ```ignore
//! use agent_fabric_core::{AdapterSession, CapabilityRegistry, LocalAdapter};
//!
//! let registry = Arc::new(CapabilityRegistry::new());
//! let adapter = LocalAdapter::new("local", "tools")
//!     .with_handler("echo", |payload| async move { Ok(payload) });
//! let session = AdapterSession::new(Arc::new(adapter), config, registry.clone());
//! session.connect().await?;
//!
//! let capability = registry.resolve("echo").await.found().unwrap();
//! let output = session.invoke(&capability, payload, timeout).await?;
//! ```

pub mod adapter;
pub mod backoff;
pub mod capability;
pub mod node;
pub mod registry;
pub mod types;

pub use adapter::session::SessionError;
pub use adapter::{
    AdapterFeature, AdapterInfo, AdapterSession, CapabilityAdapter, FeatureSet, InvocationId,
    LocalAdapter,
};
#[cfg(feature = "http")]
pub use adapter::HttpAdapter;
pub use backoff::Backoff;
pub use capability::{qualify, split_qualified, Capability};
pub use node::{
    HealthPolicy, HealthStatus, HealthTracker, HealthTransition, Heartbeat, LivenessProbe, Node,
};
pub use registry::{
    CapabilityFilter, CapabilityRegistry, RegistrationSummary, RegistryError, Resolution,
};
pub use types::{
    generate_node_id, AdapterId, ConnectError, InvokeError, NodeId, ProposalId, TaskId,
    NAMESPACE_SEPARATOR,
};
