//! Peer-to-peer transport used by the mesh coordinator.

use crate::task::{ExecutionError, Task, TaskExecutor};
use agent_fabric_core::{Heartbeat, Node, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// What a node says about itself in response to discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerAnnouncement {
    pub node_id: NodeId,
    pub capabilities: BTreeSet<String>,
    pub address: Option<String>,
}

impl PeerAnnouncement {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            capabilities: BTreeSet::new(),
            address: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn to_node(&self) -> Node {
        let mut node = Node::new(self.node_id.clone()).with_capabilities(self.capabilities.clone());
        node.address = self.address.clone();
        node
    }
}

/// How a mesh node reaches its peers.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Broadcast a discovery request and collect announcements from every
    /// peer that answered. The sender is never included.
    async fn broadcast_discovery(&self, from: &PeerAnnouncement) -> Vec<PeerAnnouncement>;

    /// Liveness probe for one peer.
    async fn ping(&self, peer: &str) -> anyhow::Result<Heartbeat>;

    /// Execute `task` on `peer` and return its output.
    async fn dispatch(
        &self,
        peer: &str,
        task: &Task,
        timeout: Duration,
    ) -> Result<Value, ExecutionError>;
}

/// The serving side of a mesh node.
#[async_trait]
pub trait PeerService: Send + Sync {
    fn announce(&self) -> PeerAnnouncement;

    fn heartbeat(&self) -> Heartbeat;

    async fn run(&self, task: &Task) -> Result<Value, ExecutionError>;
}

/// A peer that executes tasks in-process.
pub struct LocalPeer {
    announcement: PeerAnnouncement,
    executor: Arc<dyn TaskExecutor>,
    active: AtomicUsize,
}

impl LocalPeer {
    pub fn new<I, S>(
        node_id: impl Into<NodeId>,
        capabilities: I,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            announcement: PeerAnnouncement::new(node_id).with_capabilities(capabilities),
            executor,
            active: AtomicUsize::new(0),
        }
    }

    pub fn load(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerService for LocalPeer {
    fn announce(&self) -> PeerAnnouncement {
        self.announcement.clone()
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat::new(self.announcement.node_id.clone(), self.load())
    }

    async fn run(&self, task: &Task) -> Result<Value, ExecutionError> {
        if !self.announcement.capabilities.contains(&task.capability_required) {
            return Err(ExecutionError::Rejected(format!(
                "{} does not provide {}",
                self.announcement.node_id, task.capability_required
            )));
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);
        self.executor.execute(task).await
    }
}

/// In-process mesh hub connecting every joined peer.
///
/// Peers can be partitioned to simulate an unreachable node: they stay
/// joined but stop answering discovery, pings and dispatches.
#[derive(Default)]
pub struct InMemoryMesh {
    services: RwLock<BTreeMap<NodeId, Arc<dyn PeerService>>>,
    partitioned: RwLock<BTreeSet<NodeId>>,
}

impl InMemoryMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn join(&self, service: Arc<dyn PeerService>) {
        let node_id = service.announce().node_id;
        debug!("Peer {} joined the in-memory mesh", node_id);
        self.services.write().await.insert(node_id, service);
    }

    pub async fn leave(&self, node_id: &str) {
        self.services.write().await.remove(node_id);
        self.partitioned.write().await.remove(node_id);
    }

    pub async fn partition(&self, node_id: &str) {
        self.partitioned.write().await.insert(node_id.to_string());
    }

    pub async fn heal(&self, node_id: &str) {
        self.partitioned.write().await.remove(node_id);
    }

    async fn reachable(&self, node_id: &str) -> Option<Arc<dyn PeerService>> {
        if self.partitioned.read().await.contains(node_id) {
            return None;
        }
        self.services.read().await.get(node_id).cloned()
    }
}

#[async_trait]
impl MeshTransport for InMemoryMesh {
    async fn broadcast_discovery(&self, from: &PeerAnnouncement) -> Vec<PeerAnnouncement> {
        let partitioned = self.partitioned.read().await;
        if partitioned.contains(&from.node_id) {
            return Vec::new();
        }
        self.services
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != from.node_id && !partitioned.contains(*id))
            .map(|(_, service)| service.announce())
            .collect()
    }

    async fn ping(&self, peer: &str) -> anyhow::Result<Heartbeat> {
        match self.reachable(peer).await {
            Some(service) => Ok(service.heartbeat()),
            None => anyhow::bail!("peer {} is unreachable", peer),
        }
    }

    async fn dispatch(
        &self,
        peer: &str,
        task: &Task,
        timeout: Duration,
    ) -> Result<Value, ExecutionError> {
        let service = self
            .reachable(peer)
            .await
            .ok_or_else(|| ExecutionError::Failed(format!("peer {} is unreachable", peer)))?;

        tokio::time::timeout(timeout, service.run(task))
            .await
            .unwrap_or(Err(ExecutionError::Timeout(timeout)))
    }
}
