//! Decentralized mesh coordinator.
//!
//! Each mesh node keeps its own peer table, fed by periodic discovery
//! broadcasts and heartbeats, and dispatches tasks from its own queue
//! directly to capable peers. There is no central scheduler: whichever
//! node a task is submitted to owns it until it finishes. When a peer stops
//! answering heartbeats, the tasks this node sent it are pulled back into
//! the local queue and dispatched again.

pub mod transport;

pub use transport::{InMemoryMesh, LocalPeer, MeshTransport, PeerAnnouncement, PeerService};

use crate::MIN_INTERVAL;
use crate::task::{ExecutionError, Task, TaskError, TaskQueue, TaskStatus};
use agent_fabric_config::{DistributionStrategy, MeshConfig};
use agent_fabric_core::{
    HealthPolicy, HealthTracker, HealthTransition, Heartbeat, Node, NodeId, TaskId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("Task {task_id} is already {status:?}")]
    AlreadyTerminal { task_id: TaskId, status: TaskStatus },

    #[error("Timed out after {timeout:?} waiting for task {task_id}")]
    WaitTimeout { task_id: TaskId, timeout: Duration },

    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),

    #[error(transparent)]
    Task(#[from] TaskError),
}

pub type Result<T> = std::result::Result<T, MeshError>;

/// Runtime settings for a mesh node.
#[derive(Debug, Clone)]
pub struct MeshSettings {
    pub discovery_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_connections: usize,
    pub strategy: DistributionStrategy,
    pub max_retries: u32,
    pub dispatch_timeout: Duration,
    pub health: HealthPolicy,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self::from(&MeshConfig::default())
    }
}

impl From<&MeshConfig> for MeshSettings {
    fn from(config: &MeshConfig) -> Self {
        Self {
            discovery_interval: Duration::from_millis(config.discovery_interval_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            max_connections: config.max_connections,
            strategy: config.strategy,
            max_retries: config.max_retries,
            dispatch_timeout: Duration::from_millis(config.dispatch_timeout_ms),
            health: HealthPolicy::from(config),
        }
    }
}

struct Peer {
    node: Node,
    health: HealthTracker,
    reported_load: usize,
    /// Tasks this node currently has out on the peer
    dispatched: usize,
}

impl Peer {
    fn load(&self) -> usize {
        self.reported_load.max(self.dispatched)
    }
}

/// Snapshot of one entry in the peer table.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub node: Node,
    pub load: usize,
    pub dispatched: usize,
}

struct Dispatch {
    peer: NodeId,
    attempt: u32,
    handle: AbortHandle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub discovered: Vec<NodeId>,
    pub refreshed: Vec<NodeId>,
    /// Peers turned away because the table was full
    pub refused: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub became_suspect: Vec<NodeId>,
    pub became_dead: Vec<NodeId>,
    pub recovered: Vec<NodeId>,
    pub requeued: Vec<TaskId>,
    pub evicted: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub dispatched: Vec<(TaskId, NodeId)>,
    pub expired: Vec<TaskId>,
    pub pending: usize,
}

/// One node's view of the mesh.
pub struct MeshCoordinator {
    node_id: NodeId,
    settings: MeshSettings,
    transport: Arc<dyn MeshTransport>,
    peers: RwLock<BTreeMap<NodeId, Peer>>,
    tasks: Mutex<HashMap<TaskId, Task>>,
    inflight: Mutex<HashMap<TaskId, Dispatch>>,
    queue: Mutex<TaskQueue>,
    cursor: AtomicUsize,
    changed: Notify,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshCoordinator {
    pub fn new(
        node_id: impl Into<NodeId>,
        settings: MeshSettings,
        transport: Arc<dyn MeshTransport>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            node_id: node_id.into(),
            settings,
            transport,
            peers: RwLock::new(BTreeMap::new()),
            tasks: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            queue: Mutex::new(TaskQueue::new()),
            cursor: AtomicUsize::new(0),
            changed: Notify::new(),
            shutdown,
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn settings(&self) -> &MeshSettings {
        &self.settings
    }

    /// Broadcast a discovery request and merge the answers into the peer table.
    pub async fn discover(&self) -> DiscoveryReport {
        let me = PeerAnnouncement::new(self.node_id.clone());
        let answers = self.transport.broadcast_discovery(&me).await;
        let now = Utc::now();

        let mut report = DiscoveryReport::default();
        let mut peers = self.peers.write().await;
        for answer in answers {
            if answer.node_id == self.node_id {
                continue;
            }

            if let Some(peer) = peers.get_mut(&answer.node_id) {
                peer.node.known_capabilities = answer.capabilities;
                peer.node.address = answer.address;
                if peer.health.record_success(now) == HealthTransition::Recovered {
                    info!("Peer {} rediscovered", answer.node_id);
                }
                peer.node.health = peer.health.status();
                peer.node.last_seen = peer.health.last_seen();
                report.refreshed.push(answer.node_id);
                continue;
            }

            if peers.len() >= self.settings.max_connections {
                debug!(
                    "Peer table full ({}), refusing {}",
                    self.settings.max_connections, answer.node_id
                );
                report.refused.push(answer.node_id);
                continue;
            }

            info!(
                "Discovered peer {} with capabilities {:?}",
                answer.node_id, answer.capabilities
            );
            report.discovered.push(answer.node_id.clone());
            peers.insert(
                answer.node_id.clone(),
                Peer {
                    node: answer.to_node(),
                    health: HealthTracker::new(self.settings.health),
                    reported_load: 0,
                    dispatched: 0,
                },
            );
        }
        drop(peers);

        if !report.discovered.is_empty() {
            self.changed.notify_waiters();
        }
        report
    }

    /// Ping every known peer once and apply the results.
    pub async fn heartbeat_round(&self) -> HeartbeatReport {
        let targets: Vec<NodeId> = self.peers.read().await.keys().cloned().collect();
        let timeout = self.settings.heartbeat_interval;

        let results = futures::future::join_all(targets.iter().map(|peer| async move {
            let outcome = time::timeout(timeout, self.transport.ping(peer))
                .await
                .map_err(|_| anyhow::anyhow!("heartbeat timed out after {:?}", timeout))
                .and_then(|r| r);
            (peer.clone(), outcome)
        }))
        .await;

        let mut report = HeartbeatReport::default();
        {
            let mut peers = self.peers.write().await;
            for (node_id, outcome) in results {
                let Some(peer) = peers.get_mut(&node_id) else {
                    continue;
                };
                let transition = match outcome {
                    Ok(heartbeat) => {
                        peer.reported_load = heartbeat.load;
                        peer.health.record_success(heartbeat.timestamp)
                    }
                    Err(e) => {
                        debug!("Missed heartbeat from {}: {}", node_id, e);
                        peer.health.record_miss()
                    }
                };
                peer.node.health = peer.health.status();
                peer.node.last_seen = peer.health.last_seen();

                match transition {
                    HealthTransition::BecameSuspect => {
                        warn!("Peer {} is suspect", node_id);
                        report.became_suspect.push(node_id);
                    }
                    HealthTransition::BecameDead => {
                        warn!("Peer {} is dead", node_id);
                        report.became_dead.push(node_id);
                    }
                    HealthTransition::Recovered => {
                        info!("Peer {} recovered", node_id);
                        report.recovered.push(node_id);
                    }
                    HealthTransition::Unchanged => {}
                }
            }
        }

        for node_id in &report.became_dead {
            report.requeued.extend(self.reclaim_from(node_id).await);
        }
        report.evicted = self.evict_dead().await;

        if !report.became_dead.is_empty() || !report.recovered.is_empty() {
            self.changed.notify_waiters();
        }
        report
    }

    /// Apply a heartbeat a peer pushed to us.
    pub async fn record_heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        let mut peers = self.peers.write().await;
        let peer = peers
            .get_mut(&heartbeat.node_id)
            .ok_or_else(|| MeshError::UnknownPeer(heartbeat.node_id.clone()))?;
        peer.reported_load = heartbeat.load;
        peer.health.record_success(heartbeat.timestamp);
        peer.node.health = peer.health.status();
        peer.node.last_seen = peer.health.last_seen();
        drop(peers);

        self.changed.notify_waiters();
        Ok(())
    }

    async fn evict_dead(&self) -> Vec<NodeId> {
        let now = Utc::now();
        let mut peers = self.peers.write().await;
        let evicted: Vec<NodeId> = peers
            .iter()
            .filter(|(_, peer)| peer.health.should_evict(now))
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in &evicted {
            peers.remove(node_id);
            info!("Evicted dead peer {}", node_id);
        }
        evicted
    }

    /// Pull back every task this node dispatched to `peer`.
    async fn reclaim_from(&self, peer: &str) -> Vec<TaskId> {
        let mut tasks = self.tasks.lock().await;
        let mut inflight = self.inflight.lock().await;
        let mut queue = self.queue.lock().await;

        let owned: Vec<TaskId> = inflight
            .iter()
            .filter(|(_, dispatch)| dispatch.peer == peer)
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in &owned {
            if let Some(dispatch) = inflight.remove(task_id) {
                dispatch.handle.abort();
            }
            if let Some(task) = tasks.get_mut(task_id) {
                task.clear_assignment();
                task.last_error = Some(format!("peer {} died", peer));
                self.requeue_or_expire(task, &mut queue);
            }
        }

        if let Some(entry) = self.peers.write().await.get_mut(peer) {
            entry.dispatched = entry.dispatched.saturating_sub(owned.len());
        }
        if !owned.is_empty() {
            info!("Requeued {} task(s) from dead peer {}", owned.len(), peer);
        }
        owned
    }

    pub async fn submit(
        &self,
        capability: impl Into<String>,
        payload: Value,
        priority: u8,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<TaskId> {
        let mut task = Task::new(capability, payload).with_priority(priority)?;
        task.deadline = deadline;
        self.submit_task(task).await
    }

    pub async fn submit_task(&self, mut task: Task) -> Result<TaskId> {
        if task.priority > crate::task::MAX_PRIORITY {
            return Err(TaskError::InvalidPriority(task.priority).into());
        }

        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.task_id) {
            return Err(MeshError::DuplicateTask(task.task_id));
        }

        task.clear_assignment();
        task.set_status(TaskStatus::Pending);
        let task_id = task.task_id.clone();
        self.queue.lock().await.push(&task);
        tasks.insert(task_id.clone(), task);
        drop(tasks);

        debug!("Queued mesh task {}", task_id);
        self.changed.notify_waiters();
        Ok(task_id)
    }

    pub async fn poll(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))
    }

    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| MeshError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(MeshError::AlreadyTerminal {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }

        if let Some(dispatch) = self.inflight.lock().await.remove(task_id) {
            dispatch.handle.abort();
            if let Some(peer) = self.peers.write().await.get_mut(&dispatch.peer) {
                peer.dispatched = peer.dispatched.saturating_sub(1);
            }
        }

        task.clear_assignment();
        task.last_error = Some("cancelled".to_string());
        task.set_status(TaskStatus::Cancelled);
        let snapshot = task.clone();
        drop(tasks);

        self.changed.notify_waiters();
        Ok(snapshot)
    }

    /// Dispatch everything in the local queue that has a live capable peer.
    pub async fn pump(self: &Arc<Self>) -> PumpReport {
        let now = Utc::now();
        let mut report = PumpReport::default();

        let mut tasks = self.tasks.lock().await;
        let mut inflight = self.inflight.lock().await;
        let mut queue = self.queue.lock().await;
        let mut peers = self.peers.write().await;

        let mut deferred = Vec::new();
        while let Some(task_id) = queue.pop() {
            let Some(task) = tasks.get_mut(&task_id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            if task.is_past_deadline(now) {
                if task.last_error.is_none() {
                    task.last_error = Some("deadline passed with no capable peer".to_string());
                }
                task.set_status(TaskStatus::Expired);
                report.expired.push(task_id);
                continue;
            }

            let Some(peer_id) = self.choose_peer(&peers, &task.capability_required) else {
                deferred.push(task_id);
                continue;
            };

            if let Err(e) = task.assign(&peer_id) {
                error!("Refusing double assignment: {}", e);
                deferred.push(task_id);
                continue;
            }
            if let Some(peer) = peers.get_mut(&peer_id) {
                peer.dispatched += 1;
            }

            let attempt = task.attempt_count;
            let timeout = task
                .remaining(now)
                .map(|left| left.min(self.settings.dispatch_timeout))
                .unwrap_or(self.settings.dispatch_timeout);
            debug!(
                "Dispatching task {} to peer {} (attempt {})",
                task_id, peer_id, attempt
            );

            let mesh = Arc::clone(self);
            let snapshot = task.clone();
            let target = peer_id.clone();
            let handle = tokio::spawn(async move {
                mesh.run_dispatch(target, snapshot, attempt, timeout).await;
            });

            report.dispatched.push((task_id.clone(), peer_id.clone()));
            inflight.insert(
                task_id,
                Dispatch {
                    peer: peer_id,
                    attempt,
                    handle: handle.abort_handle(),
                },
            );
        }

        report.pending = deferred.len();
        for task_id in deferred {
            if let Some(task) = tasks.get(&task_id) {
                queue.push(task);
            }
        }
        drop(peers);
        drop(queue);
        drop(inflight);
        drop(tasks);

        if !report.dispatched.is_empty() || !report.expired.is_empty() {
            self.changed.notify_waiters();
        }
        report
    }

    fn choose_peer(&self, peers: &BTreeMap<NodeId, Peer>, capability: &str) -> Option<NodeId> {
        let capable: Vec<(&NodeId, &Peer)> = peers
            .iter()
            .filter(|(_, peer)| {
                peer.health.status().is_eligible() && peer.node.has_capability(capability)
            })
            .collect();
        if capable.is_empty() {
            return None;
        }

        match self.settings.strategy {
            DistributionStrategy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::SeqCst) % capable.len();
                Some(capable[index].0.clone())
            }
            DistributionStrategy::LeastLoaded => capable
                .iter()
                .min_by_key(|(id, peer)| (peer.load(), (*id).clone()))
                .map(|(id, _)| (*id).clone()),
        }
    }

    async fn run_dispatch(
        self: Arc<Self>,
        peer: NodeId,
        task: Task,
        attempt: u32,
        timeout: Duration,
    ) {
        {
            let mut tasks = self.tasks.lock().await;
            match tasks.get_mut(&task.task_id) {
                Some(current)
                    if current.status == TaskStatus::Assigned
                        && current.attempt_count == attempt =>
                {
                    current.set_status(TaskStatus::Running);
                }
                _ => return,
            }
        }

        let result = time::timeout(timeout, self.transport.dispatch(&peer, &task, timeout))
            .await
            .unwrap_or(Err(ExecutionError::Timeout(timeout)));

        self.complete(&task.task_id, &peer, attempt, result).await;
    }

    async fn complete(
        &self,
        task_id: &str,
        peer: &str,
        attempt: u32,
        result: std::result::Result<Value, ExecutionError>,
    ) {
        let mut tasks = self.tasks.lock().await;
        let mut inflight = self.inflight.lock().await;
        match inflight.get(task_id) {
            Some(dispatch) if dispatch.peer == peer && dispatch.attempt == attempt => {
                inflight.remove(task_id);
            }
            _ => {
                debug!("Ignoring stale result for task {} from {}", task_id, peer);
                return;
            }
        }
        let mut queue = self.queue.lock().await;

        if let Some(entry) = self.peers.write().await.get_mut(peer) {
            entry.dispatched = entry.dispatched.saturating_sub(1);
        }

        let Some(task) = tasks.get_mut(task_id) else {
            return;
        };
        task.clear_assignment();

        match result {
            Ok(output) => {
                task.output = Some(output);
                task.set_status(TaskStatus::Succeeded);
                info!("Mesh task {} completed on {}", task_id, peer);
            }
            Err(err) if !err.is_retryable() => {
                task.last_error = Some(err.to_string());
                task.set_status(TaskStatus::Failed);
                warn!("Mesh task {} rejected by {}: {}", task_id, peer, err);
            }
            Err(err) => {
                warn!(
                    "Mesh task {} attempt {} failed on {}: {}",
                    task_id, attempt, peer, err
                );
                task.last_error = Some(err.to_string());
                self.requeue_or_expire(task, &mut queue);
            }
        }

        drop(queue);
        drop(inflight);
        drop(tasks);
        self.changed.notify_waiters();
    }

    fn requeue_or_expire(&self, task: &mut Task, queue: &mut TaskQueue) {
        if task.attempt_count > self.settings.max_retries {
            task.set_status(TaskStatus::Expired);
            warn!(
                "Mesh task {} expired after {} attempt(s)",
                task.task_id, task.attempt_count
            );
        } else if task.is_past_deadline(Utc::now()) {
            task.set_status(TaskStatus::Expired);
        } else {
            task.set_status(TaskStatus::Pending);
            queue.push(task);
        }
    }

    /// Submit a task and drive it to a terminal status.
    pub async fn execute(
        self: &Arc<Self>,
        capability: impl Into<String>,
        payload: Value,
        priority: u8,
        timeout: Duration,
    ) -> Result<Task> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        let task_id = self
            .submit(capability, payload, priority, Some(deadline))
            .await?;
        self.drive(&task_id, timeout).await
    }

    /// Pump the queue until `task_id` is terminal or `timeout` passes.
    pub async fn drive(self: &Arc<Self>, task_id: &str, timeout: Duration) -> Result<Task> {
        let give_up = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let task = self.poll(task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if task.status == TaskStatus::Pending {
                self.pump().await;
            }

            // wake periodically so tasks waiting on discovery get another pump
            let wake = (Instant::now() + self.settings.heartbeat_interval).min(give_up);
            let _ = time::timeout_at(wake, notified).await;
            if Instant::now() >= give_up {
                let task = self.poll(task_id).await?;
                if task.status.is_terminal() {
                    return Ok(task);
                }
                return Err(MeshError::WaitTimeout {
                    task_id: task_id.to_string(),
                    timeout,
                });
            }
        }
    }

    /// Wait for a task to finish without pumping.
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Result<Task> {
        let give_up = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let task = self.poll(task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if time::timeout_at(give_up, notified).await.is_err() {
                return Err(MeshError::WaitTimeout {
                    task_id: task_id.to_string(),
                    timeout,
                });
            }
        }
    }

    /// Wait until nothing is out on a peer.
    pub async fn settle(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inflight.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub async fn peers(&self) -> Vec<PeerStatus> {
        self.peers
            .read()
            .await
            .values()
            .map(|peer| PeerStatus {
                node: peer.node.clone(),
                load: peer.load(),
                dispatched: peer.dispatched,
            })
            .collect()
    }

    /// Capability names offered by live peers.
    pub async fn capabilities(&self) -> BTreeSet<String> {
        self.peers
            .read()
            .await
            .values()
            .filter(|peer| peer.health.status().is_eligible())
            .flat_map(|peer| peer.node.known_capabilities.iter().cloned())
            .collect()
    }

    /// Drop terminal tasks last updated before `older_than` ago.
    pub async fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, task| !(task.status.is_terminal() && task.updated_at < cutoff));
        let pruned = before - tasks.len();
        if pruned > 0 {
            debug!("Pruned {} finished mesh task(s)", pruned);
        }
        pruned
    }

    /// Spawn the discovery, heartbeat and dispatch loops.
    pub async fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            return;
        }
        self.shutdown.send_replace(false);
        info!(
            "Starting mesh node {} (discovery every {:?}, heartbeat every {:?})",
            self.node_id, self.settings.discovery_interval, self.settings.heartbeat_interval
        );

        let mesh = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        loops.push(tokio::spawn(async move {
            let mut interval = time::interval(mesh.settings.discovery_interval.max(MIN_INTERVAL));
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        mesh.discover().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        let mesh = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        loops.push(tokio::spawn(async move {
            let mut interval = time::interval(mesh.settings.heartbeat_interval.max(MIN_INTERVAL));
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        mesh.heartbeat_round().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        let mesh = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        loops.push(tokio::spawn(async move {
            let mut interval = time::interval(mesh.settings.heartbeat_interval.max(MIN_INTERVAL));
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = mesh.changed.notified() => {}
                    _ = shutdown.changed() => break,
                }
                mesh.pump().await;
            }
        }));
    }

    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Mesh loop panicked: {}", e);
                }
            }
        }
        info!("Mesh node {} stopped", self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{executor_fn, TaskExecutor};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn settings(strategy: DistributionStrategy) -> MeshSettings {
        MeshSettings {
            discovery_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(20),
            max_connections: 8,
            strategy,
            max_retries: 2,
            dispatch_timeout: Duration::from_secs(5),
            health: HealthPolicy {
                suspect_after: 1,
                dead_after: 3,
                dead_timeout: Duration::from_secs(60),
            },
        }
    }

    fn echo() -> Arc<dyn TaskExecutor> {
        Arc::new(executor_fn(|task: Task| async move { Ok(task.payload) }))
    }

    async fn mesh_with(peers: Vec<(&str, &str, Arc<dyn TaskExecutor>)>) -> Arc<InMemoryMesh> {
        let mesh = InMemoryMesh::new();
        for (id, capability, executor) in peers {
            mesh.join(Arc::new(LocalPeer::new(id, [capability], executor)))
                .await;
        }
        mesh
    }

    #[tokio::test]
    async fn discovery_respects_connection_cap() {
        let hub = mesh_with(vec![
            ("a", "x", echo()),
            ("b", "x", echo()),
            ("c", "x", echo()),
        ])
        .await;
        let mut config = settings(DistributionStrategy::RoundRobin);
        config.max_connections = 2;
        let node = MeshCoordinator::new("self", config, hub);

        let report = node.discover().await;
        assert_eq!(report.discovered, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(report.refused, vec!["c".to_string()]);

        let again = node.discover().await;
        assert_eq!(again.refreshed.len(), 2);
        assert_eq!(node.peers().await.len(), 2);
    }

    #[tokio::test]
    async fn round_robin_cycles_capable_peers() {
        let hub = mesh_with(vec![
            ("a", "x", echo()),
            ("b", "x", echo()),
            ("c", "y", echo()),
        ])
        .await;
        let node = MeshCoordinator::new("self", settings(DistributionStrategy::RoundRobin), hub);
        node.discover().await;

        let mut targets = Vec::new();
        for _ in 0..4 {
            node.submit("x", Value::Null, 5, None).await.unwrap();
            let report = node.pump().await;
            targets.push(report.dispatched[0].1.clone());
        }
        node.settle().await;
        assert_eq!(targets, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn least_loaded_uses_reported_load() {
        let hub = mesh_with(vec![("a", "x", echo()), ("b", "x", echo())]).await;
        let node = MeshCoordinator::new("self", settings(DistributionStrategy::LeastLoaded), hub);
        node.discover().await;

        node.record_heartbeat(Heartbeat::new("a", 7)).await.unwrap();
        node.record_heartbeat(Heartbeat::new("b", 2)).await.unwrap();

        node.submit("x", Value::Null, 5, None).await.unwrap();
        let report = node.pump().await;
        assert_eq!(report.dispatched[0].1, "b");
        node.settle().await;

        assert!(matches!(
            node.record_heartbeat(Heartbeat::new("ghost", 0)).await,
            Err(MeshError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn prune_finished_keeps_live_tasks() {
        let hub = mesh_with(vec![("a", "x", echo())]).await;
        let node = MeshCoordinator::new("self", settings(DistributionStrategy::RoundRobin), hub);
        node.discover().await;

        let done = node
            .execute("x", json!("done"), 5, Duration::from_secs(2))
            .await
            .unwrap();
        let waiting = node.submit("missing", Value::Null, 5, None).await.unwrap();

        assert_eq!(node.prune_finished(Duration::from_secs(3600)).await, 0);
        assert_eq!(node.prune_finished(Duration::ZERO).await, 1);
        assert!(matches!(
            node.poll(&done.task_id).await,
            Err(MeshError::TaskNotFound(_))
        ));
        assert_eq!(node.poll(&waiting).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn execute_returns_peer_output() {
        let hub = mesh_with(vec![("a", "x", echo())]).await;
        let node = MeshCoordinator::new("self", settings(DistributionStrategy::RoundRobin), hub);
        node.discover().await;

        let task = node
            .execute("x", json!({"q": 1}), 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.output, Some(json!({"q": 1})));
    }

    #[tokio::test]
    async fn dead_peer_tasks_are_requeued_locally() {
        let stuck: Arc<dyn TaskExecutor> = Arc::new(executor_fn(|_task: Task| async {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }));
        let hub = mesh_with(vec![("a", "x", stuck)]).await;
        let node = MeshCoordinator::new(
            "self",
            settings(DistributionStrategy::RoundRobin),
            hub.clone(),
        );
        node.discover().await;

        let id = node.submit("x", Value::Null, 5, None).await.unwrap();
        assert_eq!(node.pump().await.dispatched.len(), 1);

        hub.partition("a").await;
        assert_eq!(node.heartbeat_round().await.became_suspect, vec!["a".to_string()]);
        node.heartbeat_round().await;
        let third = node.heartbeat_round().await;
        assert_eq!(third.became_dead, vec!["a".to_string()]);
        assert_eq!(third.requeued, vec![id.clone()]);

        let task = node.poll(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_node, None);

        // a second peer shows up and picks the task up
        hub.join(Arc::new(LocalPeer::new("b", ["x"], echo()))).await;
        node.discover().await;
        let report = node.pump().await;
        assert_eq!(report.dispatched, vec![(id.clone(), "b".to_string())]);
        let done = node.wait_for(&id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.attempt_count, 2);
    }

    #[tokio::test]
    async fn dead_peers_are_evicted() {
        let hub = mesh_with(vec![("a", "x", echo())]).await;
        let mut config = settings(DistributionStrategy::RoundRobin);
        config.health.dead_after = 1;
        config.health.dead_timeout = Duration::ZERO;
        let node = MeshCoordinator::new("self", config, hub.clone());
        node.discover().await;

        hub.partition("a").await;
        let report = node.heartbeat_round().await;
        assert_eq!(report.became_dead, vec!["a".to_string()]);
        assert_eq!(report.evicted, vec!["a".to_string()]);
        assert!(node.peers().await.is_empty());
    }

    #[tokio::test]
    async fn failing_peer_exhausts_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let failing: Arc<dyn TaskExecutor> = Arc::new(executor_fn(move |_task: Task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ExecutionError::Failed("nope".to_string()))
            }
        }));
        let hub = mesh_with(vec![("a", "x", failing)]).await;
        let node = MeshCoordinator::new("self", settings(DistributionStrategy::RoundRobin), hub);
        node.discover().await;

        let task = node
            .execute("x", Value::Null, 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Expired);
        assert_eq!(task.attempt_count, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn background_loops_discover_and_dispatch() {
        let hub = mesh_with(vec![("a", "x", echo())]).await;
        let node = MeshCoordinator::new("self", settings(DistributionStrategy::RoundRobin), hub);
        node.start().await;

        let id = node.submit("x", json!("hi"), 5, None).await.unwrap();
        let task = node.wait_for(&id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(task.output, Some(json!("hi")));
        assert!(node.capabilities().await.contains("x"));

        node.stop().await;
    }
}
