//! Tasks and the executors that run them.

use agent_fabric_core::{InvokeError, NodeId, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::time::Duration;

/// Highest task priority.
pub const MAX_PRIORITY: u8 = 10;

/// Priority given to tasks that do not specify one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker
    Pending,
    /// Handed to a worker, not yet started
    Assigned,
    /// Executing on its assigned worker
    Running,
    /// Completed with output
    Succeeded,
    /// Rejected by the worker as unrunnable; never retried
    Failed,
    /// Retries or deadline exhausted
    Expired,
    /// Cancelled by the submitter
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Expired | TaskStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

/// Errors raised by task bookkeeping.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task {task_id} is already assigned to {node}")]
    AlreadyAssigned { task_id: TaskId, node: NodeId },

    #[error("Priority {0} is outside 0..={MAX_PRIORITY}")]
    InvalidPriority(u8),
}

/// A unit of work requiring one capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    pub capability_required: String,
    pub payload: Value,
    /// 0 (lowest) to 10 (highest)
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub assigned_node: Option<NodeId>,
    /// Number of times the task has been handed to a worker
    pub attempt_count: u32,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(capability_required: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            capability_required: capability_required.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            created_at: now,
            deadline: None,
            assigned_node: None,
            attempt_count: 0,
            status: TaskStatus::Pending,
            output: None,
            last_error: None,
            updated_at: now,
        }
    }

    /// Use an id minted elsewhere, e.g. carried by a translated event.
    pub fn with_id(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Result<Self, TaskError> {
        if priority > MAX_PRIORITY {
            return Err(TaskError::InvalidPriority(priority));
        }
        self.priority = priority;
        Ok(self)
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_deadline_in(self, timeout: Duration) -> Self {
        let deadline = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        self.with_deadline(deadline)
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| now >= d).unwrap_or(false)
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.deadline
            .map(|d| (d - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Hand the task to `node`. Fails if another node still holds it.
    pub fn assign(&mut self, node: &str) -> Result<(), TaskError> {
        if let Some(current) = &self.assigned_node {
            return Err(TaskError::AlreadyAssigned {
                task_id: self.task_id.clone(),
                node: current.clone(),
            });
        }
        self.assigned_node = Some(node.to_string());
        self.attempt_count += 1;
        self.set_status(TaskStatus::Assigned);
        Ok(())
    }

    pub fn clear_assignment(&mut self) {
        self.assigned_node = None;
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: u8,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending tasks ordered by `(priority desc, created_at asc)`, then insertion order.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueueEntry>,
    seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: &Task) {
        self.seq += 1;
        self.heap.push(QueueEntry {
            priority: task.priority,
            created_at: task.created_at,
            seq: self.seq,
            task_id: task.task_id.clone(),
        });
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        self.heap.pop().map(|entry| entry.task_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Why an execution attempt did not produce output.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// Transient failure; the task may be retried
    #[error("Execution failed: {0}")]
    Failed(String),

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    /// The task cannot succeed anywhere (bad payload, unknown capability)
    #[error("Task rejected: {0}")]
    Rejected(String),
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::Rejected(_))
    }
}

impl From<InvokeError> for ExecutionError {
    fn from(err: InvokeError) -> Self {
        match err {
            InvokeError::InvalidPayload(_) | InvokeError::CapabilityNotFound(_) => {
                ExecutionError::Rejected(err.to_string())
            }
            InvokeError::Timeout(after) => ExecutionError::Timeout(after),
            InvokeError::Unreachable(_) | InvokeError::RemoteError(_) => {
                ExecutionError::Failed(err.to_string())
            }
        }
    }
}

/// Something that can run a task to completion.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<Value, ExecutionError>;
}

/// [`TaskExecutor`] backed by an async closure.
pub struct FnExecutor<F> {
    f: F,
}

/// Wrap an async closure as a [`TaskExecutor`].
pub fn executor_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send,
{
    FnExecutor { f }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send,
{
    async fn execute(&self, task: &Task) -> Result<Value, ExecutionError> {
        (self.f)(task.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn task_ids_are_unique() {
        let ids: HashSet<_> = (0..1000)
            .map(|_| Task::new("search", Value::Null).task_id)
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn priority_is_bounded() {
        assert!(Task::new("x", Value::Null).with_priority(10).is_ok());
        assert_eq!(
            Task::new("x", Value::Null).with_priority(11).unwrap_err(),
            TaskError::InvalidPriority(11)
        );
    }

    #[test]
    fn single_assignment() {
        let mut task = Task::new("search", json!({}));
        task.assign("w1").unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.attempt_count, 1);

        let err = task.assign("w2").unwrap_err();
        assert!(matches!(err, TaskError::AlreadyAssigned { .. }));
        assert_eq!(task.assigned_node.as_deref(), Some("w1"));

        task.clear_assignment();
        task.assign("w2").unwrap();
        assert_eq!(task.assigned_node.as_deref(), Some("w2"));
        assert_eq!(task.attempt_count, 2);
    }

    #[test]
    fn deadline_checks() {
        let task =
            Task::new("x", Value::Null).with_deadline(Utc::now() - chrono::Duration::seconds(1));
        assert!(task.is_past_deadline(Utc::now()));
        assert_eq!(task.remaining(Utc::now()), Some(Duration::ZERO));

        let open = Task::new("x", Value::Null);
        assert!(!open.is_past_deadline(Utc::now()));
        assert_eq!(open.remaining(Utc::now()), None);
    }

    #[test]
    fn queue_orders_by_priority_then_age() {
        let base = Utc::now();
        let mut old_low = Task::new("x", Value::Null).with_priority(1).unwrap();
        let mut old_high = Task::new("x", Value::Null).with_priority(8).unwrap();
        let mut new_high = Task::new("x", Value::Null).with_priority(8).unwrap();
        let mut tied = Task::new("x", Value::Null).with_priority(8).unwrap();
        old_low.created_at = base;
        old_high.created_at = base;
        new_high.created_at = base + chrono::Duration::seconds(1);
        tied.created_at = base + chrono::Duration::seconds(1);

        let mut queue = TaskQueue::new();
        queue.push(&old_low);
        queue.push(&new_high);
        queue.push(&tied);
        queue.push(&old_high);

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.pop(), Some(old_high.task_id));
        assert_eq!(queue.pop(), Some(new_high.task_id));
        assert_eq!(queue.pop(), Some(tied.task_id));
        assert_eq!(queue.pop(), Some(old_low.task_id));
        assert!(queue.is_empty());
    }

    #[test]
    fn invoke_errors_map_to_execution_errors() {
        assert!(!ExecutionError::from(InvokeError::InvalidPayload("x".into())).is_retryable());
        assert!(ExecutionError::from(InvokeError::Unreachable("x".into())).is_retryable());
        assert_eq!(
            ExecutionError::from(InvokeError::Timeout(Duration::from_secs(2))),
            ExecutionError::Timeout(Duration::from_secs(2))
        );
    }

    #[tokio::test]
    async fn closure_executor() {
        let executor = executor_fn(|task: Task| async move { Ok(json!(task.capability_required)) });
        let out = executor.execute(&Task::new("search", Value::Null)).await.unwrap();
        assert_eq!(out, json!("search"));
    }
}
