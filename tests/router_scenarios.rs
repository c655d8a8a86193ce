use agent_fabric::agent_fabric_collective::{
    executor_fn, ExecutionError, RouterSettings, Task, TaskExecutor, TaskRouter, TaskStatus,
    WorkerSpec,
};
use agent_fabric::agent_fabric_core::HealthPolicy;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn settings(max_retries: u32) -> RouterSettings {
    RouterSettings {
        tick_interval: Duration::from_millis(5),
        max_retries,
        default_capacity: 2,
        task_timeout: Duration::from_secs(2),
        probe_interval: Duration::from_secs(60),
        health: HealthPolicy {
            suspect_after: 1,
            dead_after: 3,
            dead_timeout: Duration::from_secs(60),
        },
    }
}

fn failing(calls: Arc<AtomicU32>) -> Arc<dyn TaskExecutor> {
    Arc::new(executor_fn(move |_task: Task| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ExecutionError::Failed("worker crashed".to_string()))
        }
    }))
}

async fn wait_until_requeued(router: &TaskRouter, task_id: &str, calls: &AtomicU32, expected: u32) {
    for _ in 0..400 {
        let status = router.poll(task_id).await.unwrap().status;
        if calls.load(Ordering::SeqCst) == expected && status == TaskStatus::Pending {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {} was not requeued after {} failure(s)", task_id, expected);
}

#[tokio::test]
async fn failover_after_two_failures() {
    let router = TaskRouter::new(settings(3));
    let calls = Arc::new(AtomicU32::new(0));
    let gate = Arc::new(tokio::sync::Notify::new());
    let held = gate.clone();
    let summarize: Arc<dyn TaskExecutor> = Arc::new(executor_fn(move |task: Task| {
        let held = held.clone();
        async move {
            if task.capability_required == "tools:hold" {
                held.notified().await;
                return Ok(Value::Null);
            }
            Ok(json!({"summary": task.payload}))
        }
    }));
    router
        .register_worker(
            WorkerSpec::new("worker-1", failing(calls.clone()))
                .with_capabilities(["tools:summarize"]),
        )
        .await
        .unwrap();
    router
        .register_worker(
            WorkerSpec::new("worker-2", summarize)
                .with_capabilities(["tools:summarize", "tools:hold"])
                .with_capacity(1),
        )
        .await
        .unwrap();

    // worker-2 is busy with a long task while worker-1 fails twice
    let hold_id = router.submit("tools:hold", Value::Null, 9, None).await.unwrap();
    let task_id = router
        .submit("tools:summarize", json!({"doc": "a"}), 5, None)
        .await
        .unwrap();

    let report = router.tick().await;
    assert!(report
        .assigned
        .contains(&(hold_id.clone(), "worker-2".to_string())));
    assert!(report
        .assigned
        .contains(&(task_id.clone(), "worker-1".to_string())));
    wait_until_requeued(&router, &task_id, &calls, 1).await;

    let report = router.tick().await;
    assert_eq!(report.assigned, vec![(task_id.clone(), "worker-1".to_string())]);
    wait_until_requeued(&router, &task_id, &calls, 2).await;

    gate.notify_one();
    let hold = router
        .wait_for(&hold_id, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(hold.status, TaskStatus::Succeeded);

    let report = router.tick().await;
    assert_eq!(report.assigned, vec![(task_id.clone(), "worker-2".to_string())]);
    router.settle().await;

    let task = router.poll(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempt_count, 3);
    assert_eq!(task.output, Some(json!({"summary": {"doc": "a"}})));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn always_failing_worker_expires_after_bounded_attempts() {
    let router = TaskRouter::new(settings(2));
    let calls = Arc::new(AtomicU32::new(0));
    router
        .register_worker(
            WorkerSpec::new("flaky", failing(calls.clone())).with_capabilities(["x"]),
        )
        .await
        .unwrap();
    router.start().await;

    let task_id = router.submit("x", Value::Null, 5, None).await.unwrap();
    let task = router
        .wait_for(&task_id, Duration::from_secs(5))
        .await
        .unwrap();
    router.stop().await;

    assert_eq!(task.status, TaskStatus::Expired);
    assert_eq!(task.attempt_count, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(task.last_error.unwrap().contains("worker crashed"));
}

/// Records which worker runs which task, and how many run at once.
struct Recorder {
    running: Mutex<HashSet<String>>,
    runs: Mutex<HashMap<String, u32>>,
    concurrent: Mutex<HashMap<String, usize>>,
    peak: Mutex<HashMap<String, usize>>,
    overlaps: AtomicUsize,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(HashSet::new()),
            runs: Mutex::new(HashMap::new()),
            concurrent: Mutex::new(HashMap::new()),
            peak: Mutex::new(HashMap::new()),
            overlaps: AtomicUsize::new(0),
        })
    }

    fn begin(&self, worker: &str, task_id: &str) {
        if !self.running.lock().unwrap().insert(task_id.to_string()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        *self.runs.lock().unwrap().entry(task_id.to_string()).or_default() += 1;

        let mut concurrent = self.concurrent.lock().unwrap();
        let now = concurrent.entry(worker.to_string()).or_default();
        *now += 1;
        let mut peak = self.peak.lock().unwrap();
        let max = peak.entry(worker.to_string()).or_default();
        *max = (*max).max(*now);
    }

    fn end(&self, worker: &str, task_id: &str) {
        self.running.lock().unwrap().remove(task_id);
        if let Some(now) = self.concurrent.lock().unwrap().get_mut(worker) {
            *now -= 1;
        }
    }
}

fn recording(worker: &'static str, recorder: Arc<Recorder>) -> Arc<dyn TaskExecutor> {
    Arc::new(executor_fn(move |task: Task| {
        let recorder = recorder.clone();
        async move {
            recorder.begin(worker, &task.task_id);
            tokio::time::sleep(Duration::from_millis(3)).await;
            recorder.end(worker, &task.task_id);
            Ok(json!(worker))
        }
    }))
}

#[tokio::test]
async fn every_task_has_a_single_assignment_under_load() {
    let router = TaskRouter::new(settings(3));
    let recorder = Recorder::new();
    for worker in ["w1", "w2", "w3"] {
        router
            .register_worker(
                WorkerSpec::new(worker, recording(worker, recorder.clone()))
                    .with_capabilities(["work"])
                    .with_capacity(2),
            )
            .await
            .unwrap();
    }
    router.start().await;

    let mut ids = Vec::new();
    for i in 0..60u8 {
        ids.push(router.submit("work", json!(i), i % 11, None).await.unwrap());
    }

    for id in &ids {
        let task = router.wait_for(id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempt_count, 1);
        assert!(task.assigned_node.is_none());
    }
    router.stop().await;

    assert_eq!(recorder.overlaps.load(Ordering::SeqCst), 0);
    assert!(recorder.runs.lock().unwrap().values().all(|runs| *runs == 1));
    for (worker, peak) in recorder.peak.lock().unwrap().iter() {
        assert!(*peak <= 2, "{} ran {} tasks at once", worker, peak);
    }

    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
}

#[tokio::test]
async fn higher_priority_runs_first_on_a_single_slot() {
    let router = TaskRouter::new(settings(0));
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let executor: Arc<dyn TaskExecutor> = Arc::new(executor_fn(move |task: Task| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(task.payload.clone());
            Ok(Value::Null)
        }
    }));
    router
        .register_worker(
            WorkerSpec::new("solo", executor)
                .with_capabilities(["x"])
                .with_capacity(1),
        )
        .await
        .unwrap();

    router.submit("x", json!("low"), 1, None).await.unwrap();
    router.submit("x", json!("high"), 9, None).await.unwrap();
    router.submit("x", json!("mid"), 5, None).await.unwrap();

    for _ in 0..3 {
        router.tick().await;
        router.settle().await;
    }
    assert_eq!(
        *order.lock().unwrap(),
        vec![json!("high"), json!("mid"), json!("low")]
    );
}
