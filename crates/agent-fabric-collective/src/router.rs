//! Centralized task router.
//!
//! Tasks wait in a priority queue ordered by `(priority desc, created_at asc)`.
//! Every tick drains the queue and hands each task to the least-loaded
//! eligible worker advertising the required capability. Workers that just
//! failed a task are sorted after every other eligible worker for one tick.
//!
//! Each worker record has its own lock, and load checks and slot reservations
//! take only that lock. A tick drains the queue under the queue lock alone and
//! holds the task table for one assignment at a time.
//!
//! Lock order: task table, in-flight table, queue, worker map, worker record.

use crate::MIN_INTERVAL;
use crate::task::{ExecutionError, Task, TaskError, TaskExecutor, TaskQueue, TaskStatus};
use agent_fabric_config::{LivenessConfig, RouterConfig};
use agent_fabric_core::{
    HealthPolicy, HealthStatus, HealthTracker, HealthTransition, Heartbeat, LivenessProbe, NodeId,
    TaskId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// Errors returned by the router's task and worker APIs.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("Worker {0} is already registered")]
    DuplicateWorker(NodeId),

    #[error("Worker not found: {0}")]
    WorkerNotFound(NodeId),

    #[error("Task {task_id} is already {status:?}")]
    AlreadyTerminal { task_id: TaskId, status: TaskStatus },

    #[error("Timed out after {timeout:?} waiting for task {task_id}")]
    WaitTimeout { task_id: TaskId, timeout: Duration },

    #[error(transparent)]
    Task(#[from] TaskError),
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// Runtime settings for the router.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub tick_interval: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub default_capacity: usize,
    /// Upper bound on a single execution attempt
    pub task_timeout: Duration,
    pub probe_interval: Duration,
    pub health: HealthPolicy,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::new(&RouterConfig::default(), &LivenessConfig::default())
    }
}

impl RouterSettings {
    pub fn new(router: &RouterConfig, liveness: &LivenessConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(router.tick_interval_ms),
            max_retries: router.max_retries,
            default_capacity: router.default_capacity.max(1),
            task_timeout: Duration::from_millis(router.task_timeout_ms),
            probe_interval: Duration::from_millis(liveness.probe_interval_ms),
            health: HealthPolicy::from(liveness),
        }
    }
}

impl From<&RouterConfig> for RouterSettings {
    fn from(config: &RouterConfig) -> Self {
        Self::new(config, &LivenessConfig::default())
    }
}

/// Description of a worker to register.
pub struct WorkerSpec {
    node_id: NodeId,
    capabilities: BTreeSet<String>,
    capacity: Option<usize>,
    executor: Arc<dyn TaskExecutor>,
    probe: Option<Arc<dyn LivenessProbe>>,
}

impl WorkerSpec {
    pub fn new(node_id: impl Into<NodeId>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            node_id: node_id.into(),
            capabilities: BTreeSet::new(),
            capacity: None,
            executor,
            probe: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

struct WorkerRecord {
    active: usize,
    health: HealthTracker,
    /// Sorted last while the router tick is at or below this value
    deprioritized_until: u64,
    reported_load: usize,
    completed: u64,
    failed: u64,
}

struct WorkerSlot {
    node_id: NodeId,
    capabilities: BTreeSet<String>,
    capacity: usize,
    executor: Arc<dyn TaskExecutor>,
    probe: Option<Arc<dyn LivenessProbe>>,
    record: Mutex<WorkerRecord>,
}

impl WorkerSlot {
    /// Give back a slot reserved by `pick_worker`.
    async fn release(&self) {
        let mut record = self.record.lock().await;
        record.active = record.active.saturating_sub(1);
    }
}

/// Snapshot of a registered worker.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerStatus {
    pub node_id: NodeId,
    pub capabilities: BTreeSet<String>,
    pub capacity: usize,
    pub active: usize,
    pub health: HealthStatus,
    pub last_seen: DateTime<Utc>,
    pub completed: u64,
    pub failed: u64,
}

struct Inflight {
    node_id: NodeId,
    attempt: u32,
    handle: AbortHandle,
}

/// Outcome of one scheduling tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub assigned: Vec<(TaskId, NodeId)>,
    pub expired: Vec<TaskId>,
    /// Tasks still waiting for an eligible worker
    pub pending: usize,
}

/// Outcome of one liveness probe round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub probed: usize,
    pub became_suspect: Vec<NodeId>,
    pub became_dead: Vec<NodeId>,
    pub recovered: Vec<NodeId>,
    pub evicted: Vec<NodeId>,
}

/// Centralized load-balanced dispatcher.
pub struct TaskRouter {
    settings: RouterSettings,
    tasks: Mutex<HashMap<TaskId, Task>>,
    inflight: Mutex<HashMap<TaskId, Inflight>>,
    queue: Mutex<TaskQueue>,
    workers: RwLock<BTreeMap<NodeId, Arc<WorkerSlot>>>,
    tick_count: AtomicU64,
    cursor: AtomicUsize,
    changed: Notify,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRouter {
    pub fn new(settings: RouterSettings) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            tasks: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            queue: Mutex::new(TaskQueue::new()),
            workers: RwLock::new(BTreeMap::new()),
            tick_count: AtomicU64::new(0),
            cursor: AtomicUsize::new(0),
            changed: Notify::new(),
            shutdown,
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub async fn register_worker(&self, spec: WorkerSpec) -> Result<()> {
        let mut workers = self.workers.write().await;
        if workers.contains_key(&spec.node_id) {
            return Err(RouterError::DuplicateWorker(spec.node_id));
        }

        info!(
            "Registering worker {} with capabilities {:?}",
            spec.node_id, spec.capabilities
        );
        let slot = WorkerSlot {
            node_id: spec.node_id.clone(),
            capabilities: spec.capabilities,
            capacity: spec.capacity.unwrap_or(self.settings.default_capacity),
            executor: spec.executor,
            probe: spec.probe,
            record: Mutex::new(WorkerRecord {
                active: 0,
                health: HealthTracker::new(self.settings.health),
                deprioritized_until: 0,
                reported_load: 0,
                completed: 0,
                failed: 0,
            }),
        };
        workers.insert(spec.node_id, Arc::new(slot));
        drop(workers);

        self.changed.notify_waiters();
        Ok(())
    }

    /// Remove a worker. Tasks it was executing go back to the queue.
    pub async fn deregister_worker(&self, node_id: &str) -> Result<Vec<TaskId>> {
        let mut tasks = self.tasks.lock().await;
        let mut inflight = self.inflight.lock().await;
        let mut queue = self.queue.lock().await;
        let mut workers = self.workers.write().await;

        if workers.remove(node_id).is_none() {
            return Err(RouterError::WorkerNotFound(node_id.to_string()));
        }
        drop(workers);

        let requeued = self.reclaim(
            node_id,
            &mut tasks,
            &mut inflight,
            &mut queue,
            "worker deregistered",
        );
        info!(
            "Deregistered worker {} ({} task(s) reclaimed)",
            node_id,
            requeued.len()
        );
        drop(queue);
        drop(inflight);
        drop(tasks);

        self.changed.notify_waiters();
        Ok(requeued)
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

    /// Enqueue a prepared task. Its status and assignment are reset.
    pub async fn submit_task(&self, mut task: Task) -> Result<TaskId> {
        if task.priority > crate::task::MAX_PRIORITY {
            return Err(TaskError::InvalidPriority(task.priority).into());
        }

        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.task_id) {
            return Err(RouterError::DuplicateTask(task.task_id));
        }

        task.clear_assignment();
        task.set_status(TaskStatus::Pending);
        let task_id = task.task_id.clone();
        debug!(
            "Submitted task {} for {} (priority {})",
            task_id, task.capability_required, task.priority
        );
        self.queue.lock().await.push(&task);
        tasks.insert(task_id.clone(), task);
        drop(tasks);

        self.changed.notify_waiters();
        Ok(task_id)
    }

    pub async fn poll(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| RouterError::TaskNotFound(task_id.to_string()))
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.lock().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Cancel a task, aborting its running attempt if there is one.
    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| RouterError::TaskNotFound(task_id.to_string()))?;

        if task.status.is_terminal() {
            return Err(RouterError::AlreadyTerminal {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }

        let mut inflight = self.inflight.lock().await;
        if let Some(running) = inflight.remove(task_id) {
            running.handle.abort();
            let workers = self.workers.read().await;
            if let Some(slot) = workers.get(&running.node_id) {
                let mut record = slot.record.lock().await;
                record.active = record.active.saturating_sub(1);
            }
        }
        drop(inflight);

        task.clear_assignment();
        task.last_error = Some("cancelled".to_string());
        task.set_status(TaskStatus::Cancelled);
        let snapshot = task.clone();
        drop(tasks);

        info!("Cancelled task {}", task_id);
        self.changed.notify_waiters();
        Ok(snapshot)
    }

    /// Run one scheduling pass over the queue.
    ///
    /// Only the candidate worker records are locked while a worker is chosen;
    /// the task and in-flight tables are held just long enough to commit one
    /// assignment.
    pub async fn tick(self: &Arc<Self>) -> TickReport {
        let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let mut report = TickReport::default();

        let batch: Vec<TaskId> = {
            let mut queue = self.queue.lock().await;
            std::iter::from_fn(|| queue.pop()).collect()
        };
        let workers: Vec<Arc<WorkerSlot>> = self.workers.read().await.values().cloned().collect();

        let mut deferred = Vec::new();
        for task_id in batch {
            let capability = {
                let mut tasks = self.tasks.lock().await;
                let Some(task) = tasks.get_mut(&task_id) else {
                    continue;
                };
                if task.status != TaskStatus::Pending {
                    continue;
                }
                if task.is_past_deadline(now) {
                    if task.last_error.is_none() {
                        task.last_error =
                            Some("deadline passed with no eligible worker".to_string());
                    }
                    task.set_status(TaskStatus::Expired);
                    warn!("Task {} expired before assignment", task.task_id);
                    report.expired.push(task.task_id.clone());
                    continue;
                }
                task.capability_required.clone()
            };

            let Some(slot) = self.pick_worker(&workers, &capability, tick).await else {
                deferred.push(task_id);
                continue;
            };

            let mut tasks = self.tasks.lock().await;
            let mut inflight = self.inflight.lock().await;
            let task = match tasks.get_mut(&task_id) {
                Some(task) if task.status == TaskStatus::Pending => task,
                _ => {
                    // cancelled while the worker was being chosen
                    slot.release().await;
                    continue;
                }
            };
            if !self.workers.read().await.contains_key(&slot.node_id) {
                slot.release().await;
                deferred.push(task_id);
                continue;
            }
            if let Err(e) = task.assign(&slot.node_id) {
                error!("Refusing double assignment: {}", e);
                slot.release().await;
                deferred.push(task_id);
                continue;
            }

            let attempt = task.attempt_count;
            let timeout = task
                .remaining(now)
                .map(|left| left.min(self.settings.task_timeout))
                .unwrap_or(self.settings.task_timeout);
            debug!(
                "Assigned task {} to {} (attempt {})",
                task.task_id, slot.node_id, attempt
            );

            let router = Arc::clone(self);
            let snapshot = task.clone();
            let node_id = slot.node_id.clone();
            let handle = tokio::spawn(async move {
                router.run_attempt(slot, snapshot, attempt, timeout).await;
            });

            report
                .assigned
                .push((task.task_id.clone(), node_id.clone()));
            inflight.insert(
                task_id,
                Inflight {
                    node_id,
                    attempt,
                    handle: handle.abort_handle(),
                },
            );
        }

        report.pending = deferred.len();
        if !deferred.is_empty() {
            let tasks = self.tasks.lock().await;
            let mut queue = self.queue.lock().await;
            for task_id in deferred {
                match tasks.get(&task_id) {
                    Some(task) if task.status == TaskStatus::Pending => queue.push(task),
                    _ => {}
                }
            }
        }

        if !report.expired.is_empty() || !report.assigned.is_empty() {
            self.changed.notify_waiters();
        }
        report
    }

    /// Choose a worker and reserve one of its slots.
    async fn pick_worker(
        &self,
        workers: &[Arc<WorkerSlot>],
        capability: &str,
        tick: u64,
    ) -> Option<Arc<WorkerSlot>> {
        let mut candidates = Vec::new();
        for slot in workers {
            if !slot.capabilities.contains(capability) {
                continue;
            }
            let record = slot.record.lock().await;
            if !record.health.status().is_eligible() || record.active >= slot.capacity {
                continue;
            }
            let deprioritized = record.deprioritized_until >= tick;
            let load = record.active.max(record.reported_load);
            candidates.push((deprioritized, load, slot));
        }

        let best = candidates
            .iter()
            .map(|(deprioritized, load, _)| (*deprioritized, *load))
            .min()?;
        let ties: Vec<&Arc<WorkerSlot>> = candidates
            .iter()
            .filter(|(deprioritized, load, _)| (*deprioritized, *load) == best)
            .map(|(_, _, slot)| *slot)
            .collect();

        // another tick may have filled the favourite since it was inspected
        let start = self.cursor.fetch_add(1, Ordering::SeqCst);
        for offset in 0..ties.len() {
            let slot = ties[(start + offset) % ties.len()];
            let mut record = slot.record.lock().await;
            if record.health.status().is_eligible() && record.active < slot.capacity {
                record.active += 1;
                return Some(Arc::clone(slot));
            }
        }
        None
    }

    async fn run_attempt(
        self: Arc<Self>,
        slot: Arc<WorkerSlot>,
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

        let result = match time::timeout(timeout, slot.executor.execute(&task)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout(timeout)),
        };

        self.complete(&task.task_id, &slot.node_id, attempt, result)
            .await;
    }

    async fn complete(
        &self,
        task_id: &str,
        node_id: &str,
        attempt: u32,
        result: std::result::Result<Value, ExecutionError>,
    ) {
        let mut tasks = self.tasks.lock().await;
        let mut inflight = self.inflight.lock().await;

        match inflight.get(task_id) {
            Some(running) if running.node_id == node_id && running.attempt == attempt => {
                inflight.remove(task_id);
            }
            _ => {
                debug!("Ignoring stale result for task {} from {}", task_id, node_id);
                return;
            }
        }

        let mut queue = self.queue.lock().await;
        let workers = self.workers.read().await;
        if let Some(slot) = workers.get(node_id) {
            let mut record = slot.record.lock().await;
            record.active = record.active.saturating_sub(1);
            if result.is_ok() {
                record.completed += 1;
            } else {
                record.failed += 1;
                record.deprioritized_until = self.tick_count.load(Ordering::SeqCst) + 1;
            }
        }
        drop(workers);

        let Some(task) = tasks.get_mut(task_id) else {
            return;
        };
        task.clear_assignment();

        match result {
            Ok(output) => {
                task.output = Some(output);
                task.set_status(TaskStatus::Succeeded);
                info!(
                    "Task {} succeeded on {} after {} attempt(s)",
                    task_id, node_id, task.attempt_count
                );
            }
            Err(err) if !err.is_retryable() => {
                task.last_error = Some(err.to_string());
                task.set_status(TaskStatus::Failed);
                warn!("Task {} rejected by {}: {}", task_id, node_id, err);
            }
            Err(err) => {
                warn!(
                    "Task {} attempt {} failed on {}: {}",
                    task_id, attempt, node_id, err
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

    /// Put a task back in the queue unless its retry budget or deadline is spent.
    fn requeue_or_expire(&self, task: &mut Task, queue: &mut TaskQueue) {
        if task.attempt_count > self.settings.max_retries {
            task.set_status(TaskStatus::Expired);
            warn!(
                "Task {} expired after {} attempt(s)",
                task.task_id, task.attempt_count
            );
        } else if task.is_past_deadline(Utc::now()) {
            task.set_status(TaskStatus::Expired);
            warn!("Task {} expired at its deadline", task.task_id);
        } else {
            task.set_status(TaskStatus::Pending);
            queue.push(task);
        }
    }

    /// Take back every task running on `node_id`.
    fn reclaim(
        &self,
        node_id: &str,
        tasks: &mut HashMap<TaskId, Task>,
        inflight: &mut HashMap<TaskId, Inflight>,
        queue: &mut TaskQueue,
        reason: &str,
    ) -> Vec<TaskId> {
        let owned: Vec<TaskId> = inflight
            .iter()
            .filter(|(_, running)| running.node_id == node_id)
            .map(|(task_id, _)| task_id.clone())
            .collect();

        for task_id in &owned {
            if let Some(running) = inflight.remove(task_id) {
                running.handle.abort();
            }
            if let Some(task) = tasks.get_mut(task_id) {
                task.clear_assignment();
                task.last_error = Some(format!("{}: {}", reason, node_id));
                self.requeue_or_expire(task, queue);
            }
        }
        owned
    }

    async fn handle_worker_death(&self, node_id: &str) -> Vec<TaskId> {
        let mut tasks = self.tasks.lock().await;
        let mut inflight = self.inflight.lock().await;
        let mut queue = self.queue.lock().await;

        let reclaimed = self.reclaim(node_id, &mut tasks, &mut inflight, &mut queue, "worker died");
        if !reclaimed.is_empty() {
            let workers = self.workers.read().await;
            if let Some(slot) = workers.get(node_id) {
                let mut record = slot.record.lock().await;
                record.active = record.active.saturating_sub(reclaimed.len());
            }
            warn!(
                "Worker {} is dead, reclaimed {} task(s)",
                node_id,
                reclaimed.len()
            );
        }
        reclaimed
    }

    /// Feed a heartbeat pushed by a worker into its health tracker.
    pub async fn record_heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        let workers = self.workers.read().await;
        let slot = workers
            .get(&heartbeat.node_id)
            .ok_or_else(|| RouterError::WorkerNotFound(heartbeat.node_id.clone()))?;

        let mut record = slot.record.lock().await;
        record.reported_load = heartbeat.load;
        if record.health.record_success(heartbeat.timestamp) == HealthTransition::Recovered {
            info!("Worker {} recovered", heartbeat.node_id);
        }
        drop(record);
        drop(workers);

        self.changed.notify_waiters();
        Ok(())
    }

    /// Record a missed heartbeat for a worker, as when a push deadline passes.
    pub async fn record_miss(&self, node_id: &str) -> Result<HealthStatus> {
        let transition = {
            let workers = self.workers.read().await;
            let slot = workers
                .get(node_id)
                .ok_or_else(|| RouterError::WorkerNotFound(node_id.to_string()))?;
            let mut record = slot.record.lock().await;
            (record.health.record_miss(), record.health.status())
        };

        if transition.0 == HealthTransition::BecameDead {
            self.handle_worker_death(node_id).await;
        }
        Ok(transition.1)
    }

    /// Ping every worker that exposes a probe and update health.
    pub async fn probe_workers(&self) -> ProbeReport {
        let slots: Vec<Arc<WorkerSlot>> = self
            .workers
            .read()
            .await
            .values()
            .filter(|slot| slot.probe.is_some())
            .cloned()
            .collect();

        let timeout = self.settings.probe_interval;
        let results = futures::future::join_all(slots.iter().map(|slot| async move {
            let outcome = match &slot.probe {
                Some(probe) => time::timeout(timeout, probe.ping())
                    .await
                    .map_err(|_| anyhow::anyhow!("probe timed out after {:?}", timeout))
                    .and_then(|r| r),
                None => Err(anyhow::anyhow!("no probe")),
            };
            (Arc::clone(slot), outcome)
        }))
        .await;

        let mut report = ProbeReport {
            probed: slots.len(),
            ..ProbeReport::default()
        };

        for (slot, outcome) in results {
            let mut record = slot.record.lock().await;
            let transition = match outcome {
                Ok(heartbeat) => {
                    record.reported_load = heartbeat.load;
                    record.health.record_success(heartbeat.timestamp)
                }
                Err(e) => {
                    debug!("Probe of {} failed: {}", slot.node_id, e);
                    record.health.record_miss()
                }
            };
            drop(record);

            match transition {
                HealthTransition::BecameSuspect => {
                    warn!("Worker {} is suspect", slot.node_id);
                    report.became_suspect.push(slot.node_id.clone());
                }
                HealthTransition::BecameDead => report.became_dead.push(slot.node_id.clone()),
                HealthTransition::Recovered => {
                    info!("Worker {} recovered", slot.node_id);
                    report.recovered.push(slot.node_id.clone());
                }
                HealthTransition::Unchanged => {}
            }
        }

        for node_id in &report.became_dead {
            self.handle_worker_death(node_id).await;
        }

        report.evicted = self.evict_dead().await;
        if !report.became_dead.is_empty() || !report.recovered.is_empty() {
            self.changed.notify_waiters();
        }
        report
    }

    /// Remove workers that have been dead for longer than the dead timeout.
    pub async fn evict_dead(&self) -> Vec<NodeId> {
        let now = Utc::now();
        let mut expired = Vec::new();
        for slot in self.workers.read().await.values() {
            if slot.record.lock().await.health.should_evict(now) {
                expired.push(slot.node_id.clone());
            }
        }

        for node_id in &expired {
            if self.deregister_worker(node_id).await.is_ok() {
                info!("Evicted dead worker {}", node_id);
            }
        }
        expired
    }

    pub async fn workers(&self) -> Vec<WorkerStatus> {
        let mut statuses = Vec::new();
        for slot in self.workers.read().await.values() {
            let record = slot.record.lock().await;
            statuses.push(WorkerStatus {
                node_id: slot.node_id.clone(),
                capabilities: slot.capabilities.clone(),
                capacity: slot.capacity,
                active: record.active,
                health: record.health.status(),
                last_seen: record.health.last_seen(),
                completed: record.completed,
                failed: record.failed,
            });
        }
        statuses
    }

    /// Wait until no execution attempt is in flight.
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

    /// Wait for a task to reach a terminal status.
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Result<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let task = self.poll(task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                return Err(RouterError::WaitTimeout {
                    task_id: task_id.to_string(),
                    timeout,
                });
            }
        }
    }

    /// Drop terminal tasks last updated before `older_than` ago.
    pub async fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, task| !(task.status.is_terminal() && task.updated_at < cutoff));
        before - tasks.len()
    }

    /// Spawn the scheduling and probing loops.
    pub async fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            return;
        }
        self.shutdown.send_replace(false);

        info!(
            "Starting task router (tick every {:?}, probe every {:?})",
            self.settings.tick_interval, self.settings.probe_interval
        );

        let router = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        loops.push(tokio::spawn(async move {
            let mut interval = time::interval(router.settings.tick_interval.max(MIN_INTERVAL));
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        router.tick().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Router scheduling loop stopped");
        }));

        let router = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        loops.push(tokio::spawn(async move {
            let mut interval = time::interval(router.settings.probe_interval.max(MIN_INTERVAL));
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        router.probe_workers().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Router probe loop stopped");
        }));
    }

    /// Stop the background loops. Running attempts finish on their own.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Router loop panicked: {}", e);
                }
            }
        }
        info!("Task router stopped");
    }
}
