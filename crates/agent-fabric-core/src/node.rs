//! Node records and the liveness state machine.
//!
//! Nodes move `healthy → suspect → dead` as consecutive probes are missed
//! and return to `healthy` on the next successful probe. A node that stays
//! dead for longer than the dead timeout is evicted by its owner.

use crate::types::NodeId;
use agent_fabric_config::{LivenessConfig, MeshConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Health of a node as observed by liveness probes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Suspect,
    Dead,
}

impl HealthStatus {
    /// Whether new work or vote solicitation may target this node.
    pub fn is_eligible(&self) -> bool {
        !matches!(self, HealthStatus::Dead)
    }
}

/// Response from a node's liveness endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub node_id: NodeId,
    /// Number of tasks the node is currently executing
    pub load: usize,
    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    pub fn new(node_id: impl Into<NodeId>, load: usize) -> Self {
        Self {
            node_id: node_id.into(),
            load,
            timestamp: Utc::now(),
        }
    }
}

/// The heartbeat acceptor every node exposes.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn ping(&self) -> anyhow::Result<Heartbeat>;
}

/// A participant in the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    /// Names of the capabilities the node advertises
    pub known_capabilities: BTreeSet<String>,
    pub address: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub health: HealthStatus,
}

impl Node {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            known_capabilities: BTreeSet::new(),
            address: None,
            last_seen: Utc::now(),
            health: HealthStatus::Healthy,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.known_capabilities.contains(name)
    }
}

/// Thresholds for the health state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub suspect_after: u32,
    pub dead_after: u32,
    pub dead_timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&LivenessConfig::default())
    }
}

impl From<&LivenessConfig> for HealthPolicy {
    fn from(config: &LivenessConfig) -> Self {
        Self {
            suspect_after: config.suspect_after.max(1),
            dead_after: config.dead_after.max(1),
            dead_timeout: Duration::from_millis(config.dead_timeout_ms),
        }
    }
}

impl From<&MeshConfig> for HealthPolicy {
    fn from(config: &MeshConfig) -> Self {
        Self {
            suspect_after: 1,
            dead_after: config.missed_heartbeats.max(1),
            dead_timeout: Duration::from_millis(config.dead_timeout_ms),
        }
    }
}

/// Health transition produced by a probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    Recovered,
    BecameSuspect,
    BecameDead,
}

/// Per-node miss counter driving [`HealthStatus`] transitions.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    policy: HealthPolicy,
    status: HealthStatus,
    missed: u32,
    last_seen: DateTime<Utc>,
    dead_since: Option<DateTime<Utc>>,
}

impl HealthTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            status: HealthStatus::Healthy,
            missed: 0,
            last_seen: Utc::now(),
            dead_since: None,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Record a successful probe or heartbeat.
    pub fn record_success(&mut self, at: DateTime<Utc>) -> HealthTransition {
        let was = self.status;
        self.missed = 0;
        self.status = HealthStatus::Healthy;
        self.dead_since = None;
        if at > self.last_seen {
            self.last_seen = at;
        }

        if was == HealthStatus::Healthy {
            HealthTransition::Unchanged
        } else {
            HealthTransition::Recovered
        }
    }

    /// Record a missed probe.
    pub fn record_miss(&mut self) -> HealthTransition {
        if self.status == HealthStatus::Dead {
            return HealthTransition::Unchanged;
        }

        self.missed = self.missed.saturating_add(1);

        if self.missed >= self.policy.dead_after {
            self.status = HealthStatus::Dead;
            self.dead_since = Some(Utc::now());
            HealthTransition::BecameDead
        } else if self.missed >= self.policy.suspect_after && self.status == HealthStatus::Healthy
        {
            self.status = HealthStatus::Suspect;
            HealthTransition::BecameSuspect
        } else {
            HealthTransition::Unchanged
        }
    }

    /// Force the node dead, e.g. on an explicit leave.
    pub fn mark_dead(&mut self) -> HealthTransition {
        if self.status == HealthStatus::Dead {
            return HealthTransition::Unchanged;
        }
        self.status = HealthStatus::Dead;
        self.dead_since = Some(Utc::now());
        HealthTransition::BecameDead
    }

    /// Whether a dead node has exceeded the dead timeout.
    pub fn should_evict(&self, now: DateTime<Utc>) -> bool {
        match self.dead_since {
            Some(since) => (now - since)
                .to_std()
                .map(|elapsed| elapsed >= self.policy.dead_timeout)
                .unwrap_or(false),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(suspect_after: u32, dead_after: u32) -> HealthPolicy {
        HealthPolicy {
            suspect_after,
            dead_after,
            dead_timeout: Duration::ZERO,
        }
    }

    #[test]
    fn misses_walk_through_states() {
        let mut tracker = HealthTracker::new(policy(1, 3));
        assert_eq!(tracker.record_miss(), HealthTransition::BecameSuspect);
        assert_eq!(tracker.status(), HealthStatus::Suspect);
        assert_eq!(tracker.record_miss(), HealthTransition::Unchanged);
        assert_eq!(tracker.record_miss(), HealthTransition::BecameDead);
        assert_eq!(tracker.status(), HealthStatus::Dead);
        assert_eq!(tracker.record_miss(), HealthTransition::Unchanged);
    }

    #[test]
    fn success_recovers() {
        let mut tracker = HealthTracker::new(policy(1, 2));
        tracker.record_miss();
        assert_eq!(tracker.record_success(Utc::now()), HealthTransition::Recovered);
        assert_eq!(tracker.status(), HealthStatus::Healthy);
        assert_eq!(tracker.missed(), 0);
    }

    #[test]
    fn eviction_after_dead_timeout() {
        let mut tracker = HealthTracker::new(policy(1, 1));
        assert!(!tracker.should_evict(Utc::now()));
        tracker.record_miss();
        assert!(tracker.should_evict(Utc::now()));
    }

    #[test]
    fn dead_nodes_are_ineligible() {
        assert!(HealthStatus::Healthy.is_eligible());
        assert!(HealthStatus::Suspect.is_eligible());
        assert!(!HealthStatus::Dead.is_eligible());
    }

    #[test]
    fn mesh_policy_uses_missed_heartbeats() {
        let config = MeshConfig {
            missed_heartbeats: 4,
            ..MeshConfig::default()
        };
        let policy = HealthPolicy::from(&config);
        assert_eq!(policy.dead_after, 4);
    }
}
