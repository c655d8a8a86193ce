//! Proposals, votes and quorum arithmetic.

use agent_fabric_config::ConsensusAlgorithm;
use agent_fabric_core::{NodeId, ProposalId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Decision on a vote.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Accept,
    Reject,
    Abstain,
}

/// A vote cast by one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vote {
    pub decision: VoteDecision,
    /// Optional rationale for the vote
    pub rationale: Option<String>,
    pub voted_at: DateTime<Utc>,
}

impl Vote {
    pub fn new(decision: VoteDecision) -> Self {
        Self {
            decision,
            rationale: None,
            voted_at: Utc::now(),
        }
    }

    pub fn accept() -> Self {
        Self::new(VoteDecision::Accept)
    }

    pub fn reject() -> Self {
        Self::new(VoteDecision::Reject)
    }

    pub fn abstain() -> Self {
        Self::new(VoteDecision::Abstain)
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

/// Outcome of a proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Accepted,
    Rejected,
}

impl Outcome {
    pub fn is_decided(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

/// Accept votes needed out of an electorate of `n`.
pub fn required_accepts(algorithm: ConsensusAlgorithm, n: usize) -> usize {
    match algorithm {
        ConsensusAlgorithm::SimpleMajority | ConsensusAlgorithm::LeaderElection => n / 2 + 1,
        ConsensusAlgorithm::Byzantine => {
            // n - f, which is 2f + 1 when n = 3f + 1
            let f = n.saturating_sub(1) / 3;
            (n - f).max(1)
        }
    }
}

/// Current vote counts for a proposal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tally {
    pub accepts: usize,
    pub rejects: usize,
    pub abstains: usize,
    /// Electorate members that may still vote
    pub outstanding: usize,
    pub electorate: usize,
    pub required: usize,
}

/// A question put to the electorate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: ProposalId,
    pub content: Value,
    pub proposer_node_id: NodeId,
    pub algorithm: ConsensusAlgorithm,
    /// Leader term for leader-election rounds, otherwise 1
    pub round: u64,
    /// Nodes entitled to vote, fixed when the round opens
    pub electorate: BTreeSet<NodeId>,
    pub min_nodes: usize,
    pub votes: BTreeMap<NodeId, Vote>,
    /// Electorate members that failed to answer and will not be asked again
    pub silent: BTreeSet<NodeId>,
    pub outcome: Outcome,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl Proposal {
    pub fn new(
        content: Value,
        proposer_node_id: impl Into<NodeId>,
        algorithm: ConsensusAlgorithm,
        electorate: BTreeSet<NodeId>,
    ) -> Self {
        Self {
            proposal_id: uuid::Uuid::new_v4().to_string(),
            content,
            proposer_node_id: proposer_node_id.into(),
            algorithm,
            round: 1,
            electorate,
            min_nodes: 0,
            votes: BTreeMap::new(),
            silent: BTreeSet::new(),
            outcome: Outcome::Pending,
            reason: None,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    pub fn with_round(mut self, round: u64) -> Self {
        self.round = round;
        self
    }

    pub fn with_min_nodes(mut self, min_nodes: usize) -> Self {
        self.min_nodes = min_nodes;
        self
    }

    pub fn is_open(&self) -> bool {
        self.outcome == Outcome::Pending
    }

    pub fn tally(&self) -> Tally {
        let mut tally = Tally {
            electorate: self.electorate.len(),
            required: required_accepts(self.algorithm, self.electorate.len()),
            ..Tally::default()
        };
        for vote in self.votes.values() {
            match vote.decision {
                VoteDecision::Accept => tally.accepts += 1,
                VoteDecision::Reject => tally.rejects += 1,
                VoteDecision::Abstain => tally.abstains += 1,
            }
        }
        tally.outstanding = self
            .electorate
            .iter()
            .filter(|node| !self.votes.contains_key(*node) && !self.silent.contains(*node))
            .count();
        tally
    }

    /// Record a vote. A later vote from the same node replaces the earlier one.
    ///
    /// Returns `false` when the proposal is already decided or the node is
    /// not part of the electorate.
    pub fn record(&mut self, node_id: &str, vote: Vote) -> bool {
        if !self.is_open() || !self.electorate.contains(node_id) {
            return false;
        }
        self.silent.remove(node_id);
        self.votes.insert(node_id.to_string(), vote);
        true
    }

    /// Note that a node will not answer this round.
    pub fn mark_silent(&mut self, node_id: &str) {
        if self.is_open() && self.electorate.contains(node_id) && !self.votes.contains_key(node_id)
        {
            self.silent.insert(node_id.to_string());
        }
    }

    /// Apply the quorum rule. Decides the proposal as soon as the outcome
    /// is certain either way.
    pub fn evaluate(&mut self) -> Outcome {
        if !self.is_open() {
            return self.outcome;
        }

        let n = self.electorate.len();
        if self.algorithm == ConsensusAlgorithm::Byzantine && n < self.min_nodes {
            self.decide(
                Outcome::Rejected,
                format!(
                    "insufficient quorum: {} node(s), byzantine rounds need at least {}",
                    n, self.min_nodes
                ),
            );
            return self.outcome;
        }

        let tally = self.tally();
        if tally.accepts >= tally.required {
            self.decide(
                Outcome::Accepted,
                format!("{} of {} accepted", tally.accepts, tally.electorate),
            );
        } else if tally.accepts + tally.outstanding < tally.required {
            self.decide(
                Outcome::Rejected,
                format!(
                    "acceptance impossible: {} accept(s), {} outstanding, {} required",
                    tally.accepts, tally.outstanding, tally.required
                ),
            );
        }
        self.outcome
    }

    /// Close the round without quorum.
    pub fn expire(&mut self) -> Outcome {
        if self.evaluate() == Outcome::Pending {
            let tally = self.tally();
            self.decide(
                Outcome::Rejected,
                format!(
                    "round timed out: {} accept(s) of {} required",
                    tally.accepts, tally.required
                ),
            );
        }
        self.outcome
    }

    fn decide(&mut self, outcome: Outcome, reason: String) {
        self.outcome = outcome;
        self.reason = Some(reason);
        self.decided_at = Some(Utc::now());
    }

    pub fn report(&self) -> OutcomeReport {
        OutcomeReport {
            proposal_id: self.proposal_id.clone(),
            outcome: self.outcome,
            algorithm: self.algorithm,
            round: self.round,
            tally: self.tally(),
            reason: self.reason.clone(),
            decided_at: self.decided_at,
        }
    }
}

/// Summary handed back to callers waiting on a proposal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeReport {
    pub proposal_id: ProposalId,
    pub outcome: Outcome,
    pub algorithm: ConsensusAlgorithm,
    pub round: u64,
    pub tally: Tally,
    pub reason: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}
