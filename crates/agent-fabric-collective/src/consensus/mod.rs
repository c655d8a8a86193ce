//! Multi-round agreement between nodes.
//!
//! A proposal opens a round over the voters that are alive when it is
//! created. Votes are solicited concurrently and tallied as they arrive,
//! so a round closes as soon as its outcome is certain. A round that is
//! still undecided when its timeout fires is rejected.
//!
//! Three quorum rules are supported:
//! - simple majority: accept votes `> n / 2`
//! - Byzantine tolerant: `f = (n - 1) / 3`, accept votes `>= n - f`
//!   (`2f + 1` when `n = 3f + 1`),
//!   rejected outright when `n < min_nodes`
//! - leader election: only the elected leader may propose; followers
//!   redirect callers to it

pub mod election;
pub mod proposal;

pub use election::{ElectionState, LeaderHeartbeat, Role, VoteRequest, VoteResponse};
pub use proposal::{
    required_accepts, Outcome, OutcomeReport, Proposal, Tally, Vote, VoteDecision,
};

use agent_fabric_config::{ConsensusAlgorithm, ConsensusConfig};
use agent_fabric_core::{HealthStatus, NodeId, ProposalId};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Proposal not found: {0}")]
    ProposalNotFound(ProposalId),

    #[error("Proposal {proposal_id} is already {outcome:?}")]
    ProposalClosed {
        proposal_id: ProposalId,
        outcome: Outcome,
    },

    #[error("Node {0} is not a voter")]
    UnknownVoter(NodeId),

    #[error("Voter {0} is already registered")]
    DuplicateVoter(NodeId),

    #[error("Not the leader; proposals go to {leader}")]
    Redirect { leader: NodeId },

    #[error("No leader has been elected")]
    NoLeader,

    #[error("Timed out after {timeout:?} waiting for proposal {proposal_id}")]
    Timeout {
        proposal_id: ProposalId,
        timeout: Duration,
    },
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

/// A node that can be asked for votes.
#[async_trait]
pub trait Voter: Send + Sync {
    async fn vote(&self, proposal: &Proposal) -> anyhow::Result<Vote>;

    /// Answer a leader-election vote request. Nodes that do not take part
    /// in elections refuse.
    async fn request_vote(&self, request: &VoteRequest) -> anyhow::Result<VoteResponse> {
        Ok(VoteResponse::refused(request.term))
    }

    async fn leader_heartbeat(&self, _heartbeat: &LeaderHeartbeat) -> anyhow::Result<()> {
        Ok(())
    }
}

/// [`Voter`] backed by an async closure.
pub struct FnVoter<F> {
    f: F,
}

pub fn voter_fn<F, Fut>(f: F) -> FnVoter<F>
where
    F: Fn(Proposal) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vote>> + Send,
{
    FnVoter { f }
}

#[async_trait]
impl<F, Fut> Voter for FnVoter<F>
where
    F: Fn(Proposal) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vote>> + Send,
{
    async fn vote(&self, proposal: &Proposal) -> anyhow::Result<Vote> {
        (self.f)(proposal.clone()).await
    }
}

/// Runtime settings for the consensus engine.
#[derive(Debug, Clone)]
pub struct ConsensusSettings {
    pub algorithm: ConsensusAlgorithm,
    pub min_nodes: usize,
    pub round_timeout: Duration,
    pub election_timeout: Duration,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self::from(&ConsensusConfig::default())
    }
}

impl From<&ConsensusConfig> for ConsensusSettings {
    fn from(config: &ConsensusConfig) -> Self {
        Self {
            algorithm: config.algorithm,
            min_nodes: config.min_nodes,
            round_timeout: Duration::from_millis(config.round_timeout_ms),
            election_timeout: Duration::from_millis(config.election_timeout_ms),
        }
    }
}

struct VoterEntry {
    voter: Arc<dyn Voter>,
    health: HealthStatus,
}

struct ProposalSlot {
    state: Mutex<Proposal>,
    outcome: watch::Sender<Outcome>,
}

impl ProposalSlot {
    fn publish(&self, outcome: Outcome) {
        if outcome.is_decided() {
            self.outcome.send_replace(outcome);
        }
    }
}

/// Result of one election attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElectionReport {
    pub term: u64,
    pub won: bool,
    pub votes: usize,
    pub cluster_size: usize,
}

/// Drives proposals and elections for one node.
pub struct ConsensusEngine {
    node_id: NodeId,
    settings: ConsensusSettings,
    voters: RwLock<BTreeMap<NodeId, VoterEntry>>,
    proposals: RwLock<HashMap<ProposalId, Arc<ProposalSlot>>>,
    election: Mutex<ElectionState>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsensusEngine {
    pub fn new(node_id: impl Into<NodeId>, settings: ConsensusSettings) -> Arc<Self> {
        let node_id = node_id.into();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            election: Mutex::new(ElectionState::new(
                node_id.clone(),
                settings.election_timeout,
            )),
            node_id,
            settings,
            voters: RwLock::new(BTreeMap::new()),
            proposals: RwLock::new(HashMap::new()),
            shutdown,
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn settings(&self) -> &ConsensusSettings {
        &self.settings
    }

    pub async fn add_voter(&self, node_id: impl Into<NodeId>, voter: Arc<dyn Voter>) -> Result<()> {
        let node_id = node_id.into();
        let mut voters = self.voters.write().await;
        if voters.contains_key(&node_id) {
            return Err(ConsensusError::DuplicateVoter(node_id));
        }
        debug!("Added voter {}", node_id);
        voters.insert(
            node_id,
            VoterEntry {
                voter,
                health: HealthStatus::Healthy,
            },
        );
        Ok(())
    }

    pub async fn remove_voter(&self, node_id: &str) -> Result<()> {
        self.voters
            .write()
            .await
            .remove(node_id)
            .map(|_| ())
            .ok_or_else(|| ConsensusError::UnknownVoter(node_id.to_string()))
    }

    /// Update a voter's health. A dead voter is left out of new rounds and
    /// stops counting as outstanding in open ones.
    pub async fn mark_node(&self, node_id: &str, health: HealthStatus) -> Result<()> {
        {
            let mut voters = self.voters.write().await;
            let entry = voters
                .get_mut(node_id)
                .ok_or_else(|| ConsensusError::UnknownVoter(node_id.to_string()))?;
            entry.health = health;
        }

        if health == HealthStatus::Dead {
            let slots: Vec<Arc<ProposalSlot>> =
                self.proposals.read().await.values().cloned().collect();
            for slot in slots {
                let mut proposal = slot.state.lock().await;
                if proposal.is_open() {
                    proposal.mark_silent(node_id);
                    let outcome = proposal.evaluate();
                    drop(proposal);
                    slot.publish(outcome);
                }
            }
        }
        Ok(())
    }

    pub async fn voters(&self) -> Vec<(NodeId, HealthStatus)> {
        self.voters
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.health))
            .collect()
    }

    /// Open a round. Returns immediately with the proposal id.
    pub async fn propose(
        self: &Arc<Self>,
        content: Value,
        algorithm: Option<ConsensusAlgorithm>,
        min_nodes: Option<usize>,
    ) -> Result<ProposalId> {
        let algorithm = algorithm.unwrap_or(self.settings.algorithm);
        let min_nodes = min_nodes.unwrap_or(self.settings.min_nodes);

        let round = if algorithm == ConsensusAlgorithm::LeaderElection {
            let election = self.election.lock().await;
            if !election.is_leader() {
                return Err(match election.leader() {
                    Some(leader) => ConsensusError::Redirect {
                        leader: leader.clone(),
                    },
                    None => ConsensusError::NoLeader,
                });
            }
            election.term()
        } else {
            1
        };

        let (mut electorate, solicit): (BTreeSet<NodeId>, Vec<(NodeId, Arc<dyn Voter>)>) = {
            let voters = self.voters.read().await;
            let live: Vec<(NodeId, Arc<dyn Voter>)> = voters
                .iter()
                .filter(|(_, entry)| entry.health.is_eligible())
                .map(|(id, entry)| (id.clone(), Arc::clone(&entry.voter)))
                .collect();
            (live.iter().map(|(id, _)| id.clone()).collect(), live)
        };

        // the leader's own acceptance is implied by its proposing
        let leader_round = algorithm == ConsensusAlgorithm::LeaderElection;
        if leader_round {
            electorate.insert(self.node_id.clone());
        }

        let mut proposal = Proposal::new(content, self.node_id.clone(), algorithm, electorate)
            .with_round(round)
            .with_min_nodes(min_nodes);
        if leader_round {
            proposal.record(&self.node_id, Vote::accept().with_rationale("proposer"));
        }
        let outcome = proposal.evaluate();
        let proposal_id = proposal.proposal_id.clone();
        let snapshot = proposal.clone();

        let (outcome_tx, _) = watch::channel(outcome);
        let slot = Arc::new(ProposalSlot {
            state: Mutex::new(proposal),
            outcome: outcome_tx,
        });
        self.proposals
            .write()
            .await
            .insert(proposal_id.clone(), Arc::clone(&slot));

        info!(
            "Proposal {} opened ({:?}, {} voter(s))",
            proposal_id,
            algorithm,
            snapshot.electorate.len()
        );

        if outcome.is_decided() {
            warn!(
                "Proposal {} decided on open: {:?}",
                proposal_id, snapshot.reason
            );
            return Ok(proposal_id);
        }

        let solicit: Vec<(NodeId, Arc<dyn Voter>)> = solicit
            .into_iter()
            .filter(|(id, _)| *id != self.node_id || !leader_round)
            .collect();
        let timeout = self.settings.round_timeout;
        tokio::spawn(run_round(slot, snapshot, solicit, timeout));

        Ok(proposal_id)
    }

    /// Wait for a proposal to be decided.
    pub async fn await_outcome(
        &self,
        proposal_id: &str,
        timeout: Duration,
    ) -> Result<OutcomeReport> {
        let slot = self.slot(proposal_id).await?;
        let mut outcome = slot.outcome.subscribe();

        let decided = matches!(
            time::timeout(timeout, outcome.wait_for(|o| o.is_decided())).await,
            Ok(Ok(_))
        );
        if !decided {
            return Err(ConsensusError::Timeout {
                proposal_id: proposal_id.to_string(),
                timeout,
            });
        }
        let report = slot.state.lock().await.report();
        Ok(report)
    }

    pub async fn propose_and_wait(
        self: &Arc<Self>,
        content: Value,
        algorithm: Option<ConsensusAlgorithm>,
        min_nodes: Option<usize>,
    ) -> Result<OutcomeReport> {
        let proposal_id = self.propose(content, algorithm, min_nodes).await?;
        // the round closes itself at round_timeout; the margin covers scheduling
        self.await_outcome(&proposal_id, self.settings.round_timeout * 2)
            .await
    }

    /// Record a vote pushed by a node outside of solicitation.
    pub async fn record_vote(
        &self,
        proposal_id: &str,
        node_id: &str,
        vote: Vote,
    ) -> Result<Outcome> {
        let slot = self.slot(proposal_id).await?;
        let mut proposal = slot.state.lock().await;
        if !proposal.is_open() {
            return Err(ConsensusError::ProposalClosed {
                proposal_id: proposal_id.to_string(),
                outcome: proposal.outcome,
            });
        }
        if !proposal.record(node_id, vote) {
            return Err(ConsensusError::UnknownVoter(node_id.to_string()));
        }
        let outcome = proposal.evaluate();
        drop(proposal);
        slot.publish(outcome);
        Ok(outcome)
    }

    pub async fn proposal(&self, proposal_id: &str) -> Result<Proposal> {
        let slot = self.slot(proposal_id).await?;
        let proposal = slot.state.lock().await.clone();
        Ok(proposal)
    }

    async fn slot(&self, proposal_id: &str) -> Result<Arc<ProposalSlot>> {
        self.proposals
            .read()
            .await
            .get(proposal_id)
            .cloned()
            .ok_or_else(|| ConsensusError::ProposalNotFound(proposal_id.to_string()))
    }

    /// Drop decided proposals. Returns how many were removed.
    pub async fn prune_decided(&self) -> usize {
        let mut proposals = self.proposals.write().await;
        let mut decided = Vec::new();
        for (id, slot) in proposals.iter() {
            if !slot.state.lock().await.is_open() {
                decided.push(id.clone());
            }
        }
        for id in &decided {
            proposals.remove(id);
        }
        decided.len()
    }

    pub async fn leader(&self) -> Option<NodeId> {
        self.election.lock().await.leader().cloned()
    }

    pub async fn term(&self) -> u64 {
        self.election.lock().await.term()
    }

    pub async fn role(&self) -> Role {
        self.election.lock().await.role()
    }

    pub async fn handle_vote_request(&self, request: &VoteRequest) -> VoteResponse {
        let response = self.election.lock().await.handle_vote_request(request);
        debug!(
            "Vote request from {} for term {}: granted={}",
            request.candidate_id, request.term, response.granted
        );
        response
    }

    pub async fn handle_leader_heartbeat(&self, heartbeat: &LeaderHeartbeat) -> bool {
        let mut election = self.election.lock().await;
        let previous = election.leader().cloned();
        let accepted = election.handle_heartbeat(heartbeat);
        if accepted && previous.as_ref() != Some(&heartbeat.leader_id) {
            info!(
                "Node {} follows leader {} (term {})",
                self.node_id, heartbeat.leader_id, heartbeat.term
            );
        }
        accepted
    }

    /// Run an election now, regardless of the timer.
    pub async fn start_election(&self) -> ElectionReport {
        let request = self.election.lock().await.become_candidate();
        let term = request.term;

        let peers: Vec<(NodeId, Arc<dyn Voter>)> = self
            .voters
            .read()
            .await
            .iter()
            .filter(|(id, entry)| **id != self.node_id && entry.health.is_eligible())
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.voter)))
            .collect();
        let cluster_size = peers.len() + 1;
        let majority = cluster_size / 2 + 1;
        info!(
            "Node {} starting election for term {} ({} node cluster)",
            self.node_id, term, cluster_size
        );

        let timeout = self.settings.election_timeout;
        let mut pending: FuturesUnordered<_> = peers
            .iter()
            .map(|(id, voter)| {
                let request = request.clone();
                async move {
                    let response = time::timeout(timeout, voter.request_vote(&request)).await;
                    (id.clone(), response)
                }
            })
            .collect();

        let mut votes = 1;
        let mut highest_term = term;
        while let Some((id, response)) = pending.next().await {
            match response {
                Ok(Ok(response)) => {
                    highest_term = highest_term.max(response.term);
                    if response.granted && response.term == term {
                        votes += 1;
                    }
                }
                Ok(Err(e)) => debug!("Vote request to {} failed: {}", id, e),
                Err(_) => debug!("Vote request to {} timed out", id),
            }
            if votes >= majority || highest_term > term {
                break;
            }
        }
        drop(pending);

        let won = {
            let mut election = self.election.lock().await;
            if election.observe_term(highest_term) {
                false
            } else {
                votes >= majority && election.become_leader(term)
            }
        };

        if won {
            info!("Node {} elected leader for term {}", self.node_id, term);
            self.broadcast_heartbeat().await;
        } else {
            debug!(
                "Node {} lost election for term {} ({}/{} votes)",
                self.node_id, term, votes, cluster_size
            );
        }

        ElectionReport {
            term,
            won,
            votes,
            cluster_size,
        }
    }

    /// Advance the election timer: leaders send heartbeats, followers whose
    /// timeout has passed start an election.
    pub async fn tick_election(&self) -> Option<ElectionReport> {
        let due = {
            let election = self.election.lock().await;
            if election.is_leader() {
                None
            } else {
                Some(election.election_due(Instant::now()))
            }
        };

        match due {
            None => {
                self.broadcast_heartbeat().await;
                None
            }
            Some(true) => Some(self.start_election().await),
            Some(false) => None,
        }
    }

    async fn broadcast_heartbeat(&self) {
        let Some(heartbeat) = self.election.lock().await.heartbeat() else {
            return;
        };
        let peers: Vec<(NodeId, Arc<dyn Voter>)> = self
            .voters
            .read()
            .await
            .iter()
            .filter(|(id, entry)| **id != self.node_id && entry.health.is_eligible())
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.voter)))
            .collect();

        let timeout = self.settings.election_timeout;
        let sends = peers.iter().map(|(id, voter)| {
            let heartbeat = &heartbeat;
            async move {
                match time::timeout(timeout, voter.leader_heartbeat(heartbeat)).await {
                    Ok(Err(e)) => debug!("Leader heartbeat to {} failed: {}", id, e),
                    Err(_) => debug!("Leader heartbeat to {} timed out", id),
                    Ok(Ok(())) => {}
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    /// Spawn the election timer when leader election is the configured algorithm.
    pub async fn start(self: &Arc<Self>) {
        if self.settings.algorithm != ConsensusAlgorithm::LeaderElection {
            return;
        }
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            return;
        }
        self.shutdown.send_replace(false);

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = (self.settings.election_timeout / 3).max(crate::MIN_INTERVAL);
        info!(
            "Starting election timer for {} (tick every {:?})",
            self.node_id, period
        );
        loops.push(tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        engine.tick_election().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Consensus loop panicked: {}", e);
                }
            }
        }
    }
}

/// Solicit every voter concurrently and tally as answers arrive.
async fn run_round(
    slot: Arc<ProposalSlot>,
    snapshot: Proposal,
    voters: Vec<(NodeId, Arc<dyn Voter>)>,
    timeout: Duration,
) {
    let proposal_id = snapshot.proposal_id.clone();
    let snapshot = &snapshot;
    let mut pending: FuturesUnordered<_> = voters
        .iter()
        .map(|(id, voter)| async move { (id.clone(), voter.vote(snapshot).await) })
        .collect();

    let deadline = Instant::now() + timeout;
    loop {
        let next = match time::timeout_at(deadline, pending.next()).await {
            Ok(Some(next)) => next,
            Ok(None) => break,
            Err(_) => break,
        };

        let mut proposal = slot.state.lock().await;
        match next {
            (id, Ok(vote)) => {
                debug!("Proposal {}: {} voted {:?}", proposal_id, id, vote.decision);
                proposal.record(&id, vote);
            }
            (id, Err(e)) => {
                warn!("Proposal {}: {} failed to vote: {}", proposal_id, id, e);
                proposal.mark_silent(&id);
            }
        }
        let outcome = proposal.evaluate();
        drop(proposal);

        if outcome.is_decided() {
            slot.publish(outcome);
            info!("Proposal {} {:?}", proposal_id, outcome);
            return;
        }
    }
    drop(pending);

    // pushed votes may still decide the round until its deadline
    time::sleep_until(deadline).await;
    let outcome = slot.state.lock().await.expire();
    slot.publish(outcome);
    info!("Proposal {} {:?}", proposal_id, outcome);
}
