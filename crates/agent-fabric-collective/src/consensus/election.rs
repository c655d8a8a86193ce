//! Raft-style leader election state.
//!
//! Only the state machine lives here; soliciting votes and sending
//! heartbeats is done by the engine.

use agent_fabric_core::NodeId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Request for a vote in an election for `term`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

impl VoteResponse {
    pub fn refused(term: u64) -> Self {
        Self {
            term,
            granted: false,
        }
    }
}

/// Periodic assertion of leadership for `term`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderHeartbeat {
    pub term: u64,
    pub leader_id: NodeId,
}

/// Election bookkeeping for one node.
#[derive(Debug, Clone)]
pub struct ElectionState {
    node_id: NodeId,
    base_timeout: Duration,
    term: u64,
    role: Role,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    deadline: Instant,
}

impl ElectionState {
    pub fn new(node_id: impl Into<NodeId>, base_timeout: Duration) -> Self {
        let mut state = Self {
            node_id: node_id.into(),
            base_timeout,
            term: 0,
            role: Role::Follower,
            voted_for: None,
            leader: None,
            deadline: Instant::now(),
        };
        state.reset_deadline();
        state
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Pick a fresh timeout in `[base, 2 * base)`.
    pub fn reset_deadline(&mut self) {
        let base = self.base_timeout.as_millis().max(1) as u64;
        let jittered = rand::thread_rng().gen_range(base..base * 2);
        self.deadline = Instant::now() + Duration::from_millis(jittered);
    }

    pub fn election_due(&self, now: Instant) -> bool {
        self.role != Role::Leader && now >= self.deadline
    }

    /// Move to a newer term as a follower.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term > self.term {
            self.term = term;
            self.role = Role::Follower;
            self.voted_for = None;
            self.leader = None;
            true
        } else {
            false
        }
    }

    /// Start a new term as candidate, voting for ourselves.
    pub fn become_candidate(&mut self) -> VoteRequest {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.node_id.clone());
        self.leader = None;
        self.reset_deadline();
        VoteRequest {
            term: self.term,
            candidate_id: self.node_id.clone(),
        }
    }

    /// Win the election for `term` if we are still its candidate.
    pub fn become_leader(&mut self, term: u64) -> bool {
        if self.role == Role::Candidate && self.term == term {
            self.role = Role::Leader;
            self.leader = Some(self.node_id.clone());
            true
        } else {
            false
        }
    }

    pub fn handle_vote_request(&mut self, request: &VoteRequest) -> VoteResponse {
        if request.term < self.term {
            return VoteResponse::refused(self.term);
        }
        self.observe_term(request.term);

        let granted = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == request.candidate_id,
        };
        if granted {
            self.voted_for = Some(request.candidate_id.clone());
            self.reset_deadline();
        }
        VoteResponse {
            term: self.term,
            granted,
        }
    }

    /// Accept a leader heartbeat unless it is from a stale term.
    pub fn handle_heartbeat(&mut self, heartbeat: &LeaderHeartbeat) -> bool {
        if heartbeat.term < self.term {
            return false;
        }
        self.observe_term(heartbeat.term);
        if heartbeat.leader_id != self.node_id {
            self.role = Role::Follower;
        }
        self.leader = Some(heartbeat.leader_id.clone());
        self.reset_deadline();
        true
    }

    pub fn heartbeat(&self) -> Option<LeaderHeartbeat> {
        self.is_leader().then(|| LeaderHeartbeat {
            term: self.term,
            leader_id: self.node_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: &str) -> ElectionState {
        ElectionState::new(id, Duration::from_millis(100))
    }

    #[test]
    fn one_vote_per_term() {
        let mut follower = state("f");
        let first = follower.handle_vote_request(&VoteRequest {
            term: 1,
            candidate_id: "a".into(),
        });
        assert!(first.granted);

        let second = follower.handle_vote_request(&VoteRequest {
            term: 1,
            candidate_id: "b".into(),
        });
        assert!(!second.granted);

        // a newer term resets the vote
        let third = follower.handle_vote_request(&VoteRequest {
            term: 2,
            candidate_id: "b".into(),
        });
        assert!(third.granted);
        assert_eq!(follower.term(), 2);
    }

    #[test]
    fn stale_requests_are_refused() {
        let mut node = state("n");
        node.observe_term(5);
        let response = node.handle_vote_request(&VoteRequest {
            term: 3,
            candidate_id: "old".into(),
        });
        assert_eq!(response, VoteResponse::refused(5));
    }

    #[test]
    fn candidate_becomes_leader_for_its_term_only() {
        let mut node = state("c");
        let request = node.become_candidate();
        assert_eq!(request.term, 1);
        assert_eq!(node.role(), Role::Candidate);

        assert!(!node.become_leader(0));
        assert!(node.become_leader(1));
        assert!(node.is_leader());
        assert_eq!(node.leader().map(String::as_str), Some("c"));
        assert_eq!(node.heartbeat().unwrap().term, 1);
    }

    #[test]
    fn newer_leader_demotes() {
        let mut node = state("c");
        node.become_candidate();
        node.become_leader(1);

        assert!(!node.handle_heartbeat(&LeaderHeartbeat {
            term: 0,
            leader_id: "x".into(),
        }));
        assert!(node.is_leader());

        assert!(node.handle_heartbeat(&LeaderHeartbeat {
            term: 2,
            leader_id: "x".into(),
        }));
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.leader().map(String::as_str), Some("x"));
    }

    #[test]
    fn timeouts_are_randomized_within_bounds() {
        let mut node = state("n");
        for _ in 0..50 {
            let before = Instant::now();
            node.reset_deadline();
            let wait = node.deadline() - before;
            assert!(wait >= Duration::from_millis(100));
            assert!(wait < Duration::from_millis(200) + Duration::from_millis(5));
        }
        assert!(!node.election_due(Instant::now()));
    }
}
