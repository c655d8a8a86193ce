//! Coordination patterns of the agent fabric.
//!
//! Three ways for nodes to get work done together, all built on the
//! capability and liveness layer in `agent-fabric-core`:
//!
//! - **Task routing**: a central router queues tasks by priority and hands
//!   them to the least-loaded capable worker, retrying on failure
//! - **Mesh execution**: every node discovers its peers and dispatches its
//!   own queue directly, so there is no central scheduler to lose
//! - **Consensus**: proposals are voted on under a majority,
//!   Byzantine-tolerant or leader-elected quorum rule
//!
//! # Usage
//!
//! ```ignore
//! use agent_fabric_collective::{executor_fn, RouterSettings, TaskRouter, WorkerSpec};
//!
//! let router = TaskRouter::new(RouterSettings::default());
//! router
//!     .register_worker(
//!         WorkerSpec::new(
//!             "worker-1",
//!             Arc::new(executor_fn(|task| async move { Ok(task.payload) })),
//!         )
//!         .with_capabilities(["tools:echo"]),
//!     )
//!     .await?;
//! router.start().await;
//!
//! let task_id = router.submit("tools:echo", payload, 5, None).await?;
//! let task = router.wait_for(&task_id, timeout).await?;
//! ```

pub mod consensus;
pub mod mesh;
pub mod router;
pub mod task;

pub use consensus::{
    voter_fn, ConsensusEngine, ConsensusError, ConsensusSettings, ElectionReport, Outcome,
    OutcomeReport, Proposal, Role, Tally, Vote, VoteDecision, Voter,
};
pub use mesh::{
    InMemoryMesh, LocalPeer, MeshCoordinator, MeshError, MeshSettings, MeshTransport,
    PeerAnnouncement, PeerService, PeerStatus,
};
pub use router::{RouterError, RouterSettings, TaskRouter, WorkerSpec, WorkerStatus};
pub use task::{
    executor_fn, ExecutionError, Task, TaskError, TaskExecutor, TaskQueue, TaskStatus,
    DEFAULT_PRIORITY, MAX_PRIORITY,
};

/// Floor for background loop periods; `tokio::time::interval` panics on zero.
pub(crate) const MIN_INTERVAL: std::time::Duration = std::time::Duration::from_millis(1);
