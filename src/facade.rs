//! The fabric facade: one handle over adapters, registry and the three
//! coordination patterns.
//!
//! A [`Fabric`] is built explicitly from a [`FabricConfig`] and shared by
//! `Arc`. Nothing runs until [`Fabric::start`] is called; [`Fabric::stop`]
//! shuts every background loop down and disconnects the adapters.

use crate::bridge::{CoordinationEvent, CoordinationPattern, ProtocolBridge};
use crate::error::{FabricError, Result};
use crate::invoker::{CapabilityExecutor, CapabilityInvoker};
use crate::selector::{ModeSelector, SelectionContext, StaticSelector};
use agent_fabric_collective::{
    ConsensusEngine, ConsensusError, ConsensusSettings, LocalPeer, MeshCoordinator, MeshError,
    MeshSettings, MeshTransport, Outcome, OutcomeReport, RouterError, RouterSettings, Task,
    TaskRouter, TaskStatus, Voter, WorkerSpec,
};
use agent_fabric_config::{
    AdapterConfig, AdapterKind, ConfigError, ConsensusAlgorithm, FabricConfig,
};
use agent_fabric_core::{
    generate_node_id, AdapterFeature, AdapterInfo, AdapterSession, Capability, CapabilityAdapter,
    CapabilityRegistry, NodeId, ProposalId, RegistrationSummary, Resolution, TaskId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What a coordination request ended with.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinationOutcome {
    /// A router or mesh task reached a terminal status.
    Task {
        pattern: CoordinationPattern,
        task: Task,
    },
    /// A proposal was decided.
    Decision { report: OutcomeReport },
}

impl CoordinationOutcome {
    pub fn pattern(&self) -> CoordinationPattern {
        match self {
            CoordinationOutcome::Task { pattern, .. } => *pattern,
            CoordinationOutcome::Decision { .. } => CoordinationPattern::Consensus,
        }
    }

    /// Whether the task succeeded or the proposal was accepted.
    pub fn is_success(&self) -> bool {
        match self {
            CoordinationOutcome::Task { task, .. } => task.status == TaskStatus::Succeeded,
            CoordinationOutcome::Decision { report } => {
                report.outcome == Outcome::Accepted
            }
        }
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            CoordinationOutcome::Task { task, .. } => task.output.as_ref(),
            CoordinationOutcome::Decision { .. } => None,
        }
    }
}

/// Adapters that connected and those that did not during [`Fabric::start`].
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StartReport {
    pub connected: Vec<AdapterRegistration>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AdapterRegistration {
    pub adapter_id: String,
    pub summary: RegistrationSummary,
}

/// Builder for [`Fabric`].
pub struct FabricBuilder {
    config: FabricConfig,
    adapters: Vec<(Arc<dyn CapabilityAdapter>, Option<AdapterConfig>)>,
    mesh_transport: Option<Arc<dyn MeshTransport>>,
    bridge: Option<ProtocolBridge>,
    selector: Option<Box<dyn ModeSelector>>,
}

impl FabricBuilder {
    pub fn new(config: FabricConfig) -> Self {
        Self {
            config,
            adapters: Vec::new(),
            mesh_transport: None,
            bridge: None,
            selector: None,
        }
    }

    /// Attach an adapter. Its settings come from the `[[adapters]]` entry
    /// with the same id, or defaults when there is none.
    pub fn with_adapter(mut self, adapter: Arc<dyn CapabilityAdapter>) -> Self {
        self.adapters.push((adapter, None));
        self
    }

    pub fn with_adapter_config(
        mut self,
        adapter: Arc<dyn CapabilityAdapter>,
        config: AdapterConfig,
    ) -> Self {
        self.adapters.push((adapter, Some(config)));
        self
    }

    /// Enable the mesh pattern over `transport`.
    pub fn with_mesh_transport(mut self, transport: Arc<dyn MeshTransport>) -> Self {
        self.mesh_transport = Some(transport);
        self
    }

    /// Replace the default bridge.
    pub fn with_bridge(mut self, bridge: ProtocolBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_selector(mut self, selector: impl ModeSelector + 'static) -> Self {
        self.selector = Some(Box::new(selector));
        self
    }

    pub async fn build(self) -> Result<Arc<Fabric>> {
        self.config.validate()?;
        let config = self.config;

        let node_id = config
            .fabric
            .node_id
            .clone()
            .unwrap_or_else(generate_node_id);
        let registry = Arc::new(CapabilityRegistry::new());
        let invoker = Arc::new(CapabilityInvoker::new(
            registry.clone(),
            config.fabric.invoke_timeout(),
        ));

        let mut attached = Vec::new();
        for (adapter, adapter_config) in self.adapters {
            let adapter_config = adapter_config
                .or_else(|| config.adapters.iter().find(|a| a.id == adapter.id()).cloned())
                .unwrap_or_else(|| {
                    AdapterConfig::local(adapter.id()).with_namespace(adapter.namespace())
                });
            attached.push(adapter_config.id.clone());
            let session = AdapterSession::new(adapter, adapter_config, registry.clone());
            invoker.add_session(Arc::new(session)).await?;
        }

        for adapter_config in &config.adapters {
            if attached.contains(&adapter_config.id) {
                continue;
            }
            let adapter = adapter_from_config(adapter_config)?;
            let session = AdapterSession::new(adapter, adapter_config.clone(), registry.clone());
            invoker.add_session(Arc::new(session)).await?;
        }

        let router = TaskRouter::new(RouterSettings::new(&config.router, &config.liveness));
        let mesh = self.mesh_transport.map(|transport| {
            MeshCoordinator::new(node_id.clone(), MeshSettings::from(&config.mesh), transport)
        });
        let consensus =
            ConsensusEngine::new(node_id.clone(), ConsensusSettings::from(&config.consensus));

        info!(
            "Fabric {} built with {} adapter(s){}",
            node_id,
            invoker.sessions().await.len(),
            if mesh.is_some() { " and mesh" } else { "" }
        );

        Ok(Arc::new(Fabric {
            node_id,
            config,
            registry,
            invoker,
            router,
            mesh,
            consensus,
            bridge: self
                .bridge
                .unwrap_or_else(ProtocolBridge::with_default_translations),
            selector: self
                .selector
                .unwrap_or_else(|| Box::new(StaticSelector::native())),
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }))
    }
}

fn adapter_from_config(config: &AdapterConfig) -> Result<Arc<dyn CapabilityAdapter>> {
    match config.kind {
        #[cfg(feature = "http")]
        AdapterKind::Http => {
            let adapter = agent_fabric_core::HttpAdapter::from_config(config)
                .map_err(|e| invalid_adapter(config, e.to_string()))?;
            Ok(Arc::new(adapter))
        }
        #[cfg(not(feature = "http"))]
        AdapterKind::Http => Err(invalid_adapter(
            config,
            "built without the `http` feature".to_string(),
        )),
        AdapterKind::Local => Err(invalid_adapter(
            config,
            "local adapters must be attached with FabricBuilder::with_adapter".to_string(),
        )),
    }
}

fn invalid_adapter(config: &AdapterConfig, reason: String) -> FabricError {
    FabricError::Config(ConfigError::Invalid {
        field: format!("adapters.{}", config.id),
        reason,
    })
}

/// Single entry point to the fabric.
pub struct Fabric {
    node_id: NodeId,
    config: FabricConfig,
    registry: Arc<CapabilityRegistry>,
    invoker: Arc<CapabilityInvoker>,
    router: Arc<TaskRouter>,
    mesh: Option<Arc<MeshCoordinator>>,
    consensus: Arc<ConsensusEngine>,
    bridge: ProtocolBridge,
    selector: Box<dyn ModeSelector>,
    running: AtomicBool,
    lifecycle: Mutex<()>,
}

impl Fabric {
    pub fn builder(config: FabricConfig) -> FabricBuilder {
        FabricBuilder::new(config)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<TaskRouter> {
        &self.router
    }

    pub fn mesh(&self) -> Option<&Arc<MeshCoordinator>> {
        self.mesh.as_ref()
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    pub fn bridge(&self) -> &ProtocolBridge {
        &self.bridge
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connect every adapter and start the background loops.
    ///
    /// Adapters that cannot be reached are reported, not fatal; their
    /// sessions reconnect on the next invocation.
    pub async fn start(self: &Arc<Self>) -> StartReport {
        let _guard = self.lifecycle.lock().await;
        let mut report = StartReport::default();
        if self.running.load(Ordering::SeqCst) {
            return report;
        }

        for session in self.invoker.sessions().await {
            match session.connect().await {
                Ok(summary) => report.connected.push(AdapterRegistration {
                    adapter_id: session.id().to_string(),
                    summary,
                }),
                Err(e) => {
                    error!("Adapter {} failed to connect: {}", session.id(), e);
                    report.failed.push((session.id().to_string(), e.to_string()));
                }
            }
        }

        self.router.start().await;
        if let Some(mesh) = &self.mesh {
            mesh.start().await;
        }
        self.consensus.start().await;

        self.running.store(true, Ordering::SeqCst);
        info!(
            "Fabric {} started ({} adapter(s) connected, {} failed)",
            self.node_id,
            report.connected.len(),
            report.failed.len()
        );
        report
    }

    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.router.stop().await;
        if let Some(mesh) = &self.mesh {
            mesh.stop().await;
        }
        self.consensus.stop().await;
        for session in self.invoker.sessions().await {
            session.disconnect().await;
        }
        info!("Fabric {} stopped", self.node_id);
    }

    /// Attach an adapter after the fabric was built. It is connected right
    /// away when the fabric is running.
    pub async fn add_adapter(
        &self,
        adapter: Arc<dyn CapabilityAdapter>,
        config: AdapterConfig,
    ) -> Result<Option<RegistrationSummary>> {
        let session = Arc::new(AdapterSession::new(adapter, config, self.registry.clone()));
        self.invoker.add_session(session.clone()).await?;
        if self.is_running() {
            return Ok(Some(session.connect().await?));
        }
        Ok(None)
    }

    pub async fn remove_adapter(&self, adapter_id: &str) -> Result<()> {
        let session = self
            .invoker
            .remove_session(adapter_id)
            .await
            .ok_or_else(|| FabricError::UnknownAdapter(adapter_id.to_string()))?;
        session.disconnect().await;
        Ok(())
    }

    pub async fn adapters(&self) -> Vec<AdapterInfo> {
        self.invoker
            .sessions()
            .await
            .iter()
            .map(|session| AdapterInfo::of(session.adapter().as_ref()))
            .collect()
    }

    /// Re-discover capabilities on every adapter that supports discovery.
    pub async fn refresh(&self) -> Result<Vec<AdapterRegistration>> {
        let mut entries = Vec::new();
        for session in self.invoker.sessions().await {
            if !session.supports(AdapterFeature::Discovery) {
                debug!("Adapter {} does not support rediscovery", session.id());
                continue;
            }
            entries.push(AdapterRegistration {
                adapter_id: session.id().to_string(),
                summary: session.refresh().await?,
            });
        }
        Ok(entries)
    }

    /// Every capability currently published, ordered by qualified name.
    pub async fn discover(&self) -> Vec<Capability> {
        self.registry.list(None).await
    }

    pub async fn invoke(&self, name: &str, payload: Value) -> Result<Value> {
        self.invoker
            .invoke(name, payload, self.config.fabric.invoke_timeout())
            .await
    }

    /// Invoke with an explicit deadline. On expiry the adapter call is
    /// abandoned and a cancel is sent downstream if the adapter supports it.
    pub async fn invoke_with_deadline(
        &self,
        name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.invoker.invoke(name, payload, timeout).await
    }

    /// Register a router worker that runs tasks through this fabric's
    /// adapters. It advertises the capabilities published right now.
    pub async fn register_local_worker(&self, capacity: Option<usize>) -> Result<NodeId> {
        let capabilities = self.published_names().await;
        let mut spec = WorkerSpec::new(
            self.node_id.clone(),
            Arc::new(CapabilityExecutor::new(self.invoker.clone())),
        )
        .with_capabilities(capabilities);
        if let Some(capacity) = capacity {
            spec = spec.with_capacity(capacity);
        }
        self.router.register_worker(spec).await?;
        Ok(self.node_id.clone())
    }

    pub async fn register_worker(&self, spec: WorkerSpec) -> Result<()> {
        Ok(self.router.register_worker(spec).await?)
    }

    /// A mesh peer serving this fabric's adapters, for joining a transport.
    pub async fn local_peer(&self) -> Arc<LocalPeer> {
        Arc::new(LocalPeer::new(
            self.node_id.clone(),
            self.published_names().await,
            Arc::new(CapabilityExecutor::new(self.invoker.clone())),
        ))
    }

    async fn published_names(&self) -> Vec<String> {
        self.registry
            .list(None)
            .await
            .into_iter()
            .map(|capability| capability.qualified_name)
            .collect()
    }

    pub async fn add_voter(&self, node_id: impl Into<NodeId>, voter: Arc<dyn Voter>) -> Result<()> {
        Ok(self.consensus.add_voter(node_id, voter).await?)
    }

    /// Capability name to use for a task. Names the registry does not know
    /// are passed through, since workers and peers may advertise
    /// capabilities no local adapter publishes.
    async fn task_capability(&self, name: &str) -> Result<String> {
        match self.registry.resolve(name).await {
            Resolution::Found(capability) => Ok(capability.qualified_name),
            Resolution::Ambiguous(candidates) => Err(FabricError::Ambiguous {
                name: name.to_string(),
                candidates,
            }),
            Resolution::NotFound => Ok(name.to_string()),
        }
    }

    /// Queue a task with the router.
    pub async fn submit(
        &self,
        capability: &str,
        payload: Value,
        priority: u8,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<TaskId> {
        let capability = self.task_capability(capability).await?;
        Ok(self
            .router
            .submit(capability, payload, priority, deadline)
            .await?)
    }

    /// Look a task up in the router, then in the mesh.
    pub async fn poll(&self, task_id: &str) -> Result<Task> {
        match (self.router.poll(task_id).await, &self.mesh) {
            (Err(RouterError::TaskNotFound(_)), Some(mesh)) => Ok(mesh.poll(task_id).await?),
            (result, _) => Ok(result?),
        }
    }

    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        match (self.router.cancel(task_id).await, &self.mesh) {
            (Err(RouterError::TaskNotFound(_)), Some(mesh)) => Ok(mesh.cancel(task_id).await?),
            (result, _) => Ok(result?),
        }
    }

    /// Drop terminal router and mesh tasks last updated before `older_than` ago.
    pub async fn prune_finished(&self, older_than: Duration) -> usize {
        let mut pruned = self.router.prune_finished(older_than).await;
        if let Some(mesh) = &self.mesh {
            pruned += mesh.prune_finished(older_than).await;
        }
        pruned
    }

    pub async fn propose(
        self: &Arc<Self>,
        content: Value,
        algorithm: Option<ConsensusAlgorithm>,
        min_nodes: Option<usize>,
    ) -> Result<ProposalId> {
        Ok(self.consensus.propose(content, algorithm, min_nodes).await?)
    }

    pub async fn await_outcome(
        &self,
        proposal_id: &str,
        timeout: Duration,
    ) -> Result<OutcomeReport> {
        match self.consensus.await_outcome(proposal_id, timeout).await {
            Ok(report) => Ok(report),
            Err(ConsensusError::Timeout { timeout, .. }) => {
                Err(FabricError::Timeout(timeout))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run `event` through `pattern`, translating it first when it was
    /// written for a different pattern. Tasks wait up to the configured
    /// invoke timeout; proposals up to twice the round timeout.
    pub async fn coordinate(
        self: &Arc<Self>,
        event: CoordinationEvent,
        pattern: CoordinationPattern,
    ) -> Result<CoordinationOutcome> {
        let timeout = match pattern {
            CoordinationPattern::Consensus => self.consensus.settings().round_timeout * 2,
            _ => self.config.fabric.invoke_timeout(),
        };
        self.coordinate_with_deadline(event, pattern, timeout).await
    }

    /// [`coordinate`](Self::coordinate) with an explicit wait. On expiry
    /// the request is cancelled in the background and the caller gets
    /// [`FabricError::Timeout`].
    pub async fn coordinate_with_deadline(
        self: &Arc<Self>,
        event: CoordinationEvent,
        pattern: CoordinationPattern,
        timeout: Duration,
    ) -> Result<CoordinationOutcome> {
        let source = event.pattern();
        let event = if source == pattern {
            event
        } else {
            self.bridge.translate(event, source, pattern)?.event
        };

        match event {
            CoordinationEvent::TaskAssignment {
                capability,
                payload,
                priority,
                deadline,
            } => {
                self.run_routed(&capability, payload, priority, deadline, timeout)
                    .await
            }
            CoordinationEvent::BroadcastTask {
                capability,
                payload,
                priority,
                deadline,
            } => {
                self.run_meshed(&capability, payload, priority, deadline, timeout)
                    .await
            }
            CoordinationEvent::Proposal {
                content,
                algorithm,
                min_nodes,
            } => {
                let proposal_id = self.consensus.propose(content, algorithm, min_nodes).await?;
                let report = self.await_outcome(&proposal_id, timeout).await?;
                Ok(CoordinationOutcome::Decision { report })
            }
        }
    }

    /// Let the configured [`ModeSelector`] pick the pattern.
    pub async fn coordinate_adaptive(
        self: &Arc<Self>,
        event: CoordinationEvent,
    ) -> Result<CoordinationOutcome> {
        let context = self.selection_context(&event).await;
        let pattern = self.selector.select(&event, &context);
        debug!(
            "Selected {} for a {} event ({:?})",
            pattern,
            event.pattern(),
            context
        );
        self.coordinate(event, pattern).await
    }

    /// Facts about the local node a selector can base its choice on.
    pub async fn selection_context(&self, event: &CoordinationEvent) -> SelectionContext {
        let capability = match event {
            CoordinationEvent::TaskAssignment { capability, .. }
            | CoordinationEvent::BroadcastTask { capability, .. } => {
                self.task_capability(capability).await.ok()
            }
            CoordinationEvent::Proposal { .. } => None,
        };

        let mut context = SelectionContext {
            live_voters: self
                .consensus
                .voters()
                .await
                .iter()
                .filter(|(_, health)| health.is_eligible())
                .count(),
            ..SelectionContext::default()
        };

        if let Some(capability) = capability {
            context.capable_workers = self
                .router
                .workers()
                .await
                .iter()
                .filter(|w| w.health.is_eligible() && w.capabilities.contains(&capability))
                .count();
            if let Some(mesh) = &self.mesh {
                context.capable_peers = mesh
                    .peers()
                    .await
                    .iter()
                    .filter(|p| p.node.health.is_eligible() && p.node.has_capability(&capability))
                    .count();
            }
        }
        context
    }

    async fn run_routed(
        self: &Arc<Self>,
        capability: &str,
        payload: Value,
        priority: u8,
        deadline: Option<DateTime<Utc>>,
        timeout: Duration,
    ) -> Result<CoordinationOutcome> {
        if !self.is_running() {
            warn!("Routing a task while the fabric is stopped; it will wait for start()");
        }
        let task_id = self.submit(capability, payload, priority, deadline).await?;
        match self.router.wait_for(&task_id, timeout).await {
            Ok(task) => Ok(CoordinationOutcome::Task {
                pattern: CoordinationPattern::Router,
                task,
            }),
            Err(RouterError::WaitTimeout { .. }) => {
                let router = self.router.clone();
                tokio::spawn(async move {
                    if let Err(e) = router.cancel(&task_id).await {
                        debug!("Cancel of abandoned task {} skipped: {}", task_id, e);
                    }
                });
                Err(FabricError::Timeout(timeout))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_meshed(
        self: &Arc<Self>,
        capability: &str,
        payload: Value,
        priority: u8,
        deadline: Option<DateTime<Utc>>,
        timeout: Duration,
    ) -> Result<CoordinationOutcome> {
        let mesh = self
            .mesh
            .clone()
            .ok_or(FabricError::PatternUnavailable(CoordinationPattern::Mesh))?;
        let capability = self.task_capability(capability).await?;

        if !mesh.capabilities().await.contains(&capability) {
            // no known peer offers it yet; look around before queueing
            mesh.discover().await;
        }

        let task_id = mesh.submit(capability, payload, priority, deadline).await?;
        match mesh.drive(&task_id, timeout).await {
            Ok(task) => Ok(CoordinationOutcome::Task {
                pattern: CoordinationPattern::Mesh,
                task,
            }),
            Err(MeshError::WaitTimeout { .. }) => {
                tokio::spawn(async move {
                    if let Err(e) = mesh.cancel(&task_id).await {
                        debug!("Cancel of abandoned task {} skipped: {}", task_id, e);
                    }
                });
                Err(FabricError::Timeout(timeout))
            }
            Err(e) => Err(e.into()),
        }
    }
}
