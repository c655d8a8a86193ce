//! Protocol bridge between coordination patterns.
//!
//! Each pattern has its own event vocabulary: the router takes task
//! assignments, the mesh takes broadcast tasks and consensus takes
//! proposals. The bridge rewrites an event from one vocabulary into
//! another. Every directed pair must be registered explicitly; a pair with
//! no translator is refused rather than passed through.

use agent_fabric_collective::DEFAULT_PRIORITY;
use agent_fabric_config::ConsensusAlgorithm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The three coordination patterns the fabric offers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationPattern {
    /// Centralized task routing
    Router,
    /// Peer-to-peer mesh execution
    Mesh,
    /// Voting on a proposal
    Consensus,
}

impl CoordinationPattern {
    pub const ALL: [CoordinationPattern; 3] = [
        CoordinationPattern::Router,
        CoordinationPattern::Mesh,
        CoordinationPattern::Consensus,
    ];
}

impl fmt::Display for CoordinationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinationPattern::Router => "router",
            CoordinationPattern::Mesh => "mesh",
            CoordinationPattern::Consensus => "consensus",
        };
        f.write_str(name)
    }
}

/// A request expressed in one pattern's vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    /// Hand one task to a worker through the router queue.
    TaskAssignment {
        capability: String,
        payload: Value,
        priority: u8,
        deadline: Option<DateTime<Utc>>,
    },
    /// Offer one task to whichever mesh peer can run it.
    BroadcastTask {
        capability: String,
        payload: Value,
        priority: u8,
        deadline: Option<DateTime<Utc>>,
    },
    /// Put content to a vote.
    Proposal {
        content: Value,
        algorithm: Option<ConsensusAlgorithm>,
        min_nodes: Option<usize>,
    },
}

impl CoordinationEvent {
    pub fn task_assignment(capability: impl Into<String>, payload: Value) -> Self {
        CoordinationEvent::TaskAssignment {
            capability: capability.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            deadline: None,
        }
    }

    pub fn broadcast_task(capability: impl Into<String>, payload: Value) -> Self {
        CoordinationEvent::BroadcastTask {
            capability: capability.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            deadline: None,
        }
    }

    pub fn proposal(content: Value) -> Self {
        CoordinationEvent::Proposal {
            content,
            algorithm: None,
            min_nodes: None,
        }
    }

    /// The pattern whose vocabulary this event belongs to.
    pub fn pattern(&self) -> CoordinationPattern {
        match self {
            CoordinationEvent::TaskAssignment { .. } => CoordinationPattern::Router,
            CoordinationEvent::BroadcastTask { .. } => CoordinationPattern::Mesh,
            CoordinationEvent::Proposal { .. } => CoordinationPattern::Consensus,
        }
    }
}

/// Outcome of a successful translation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranslatedEvent {
    pub from: CoordinationPattern,
    pub to: CoordinationPattern,
    pub event: CoordinationEvent,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TranslationError {
    #[error("No translation registered from {from} to {to}")]
    UnsupportedTranslation {
        from: CoordinationPattern,
        to: CoordinationPattern,
    },

    #[error("Event belongs to {actual}, not {expected}")]
    PatternMismatch {
        expected: CoordinationPattern,
        actual: CoordinationPattern,
    },

    #[error("Cannot translate event: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, TranslationError>;

/// Rewrites an event of the source pattern into the target pattern.
pub type Translator = Arc<dyn Fn(CoordinationEvent) -> Result<CoordinationEvent> + Send + Sync>;

/// Task fields carried inside a proposal's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskDescriptor {
    capability: String,
    #[serde(default)]
    payload: Value,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default)]
    deadline: Option<DateTime<Utc>>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl TaskDescriptor {
    fn from_event(event: CoordinationEvent) -> Result<Self> {
        match event {
            CoordinationEvent::TaskAssignment {
                capability,
                payload,
                priority,
                deadline,
            }
            | CoordinationEvent::BroadcastTask {
                capability,
                payload,
                priority,
                deadline,
            } => Ok(Self {
                capability,
                payload,
                priority,
                deadline,
            }),
            CoordinationEvent::Proposal { content, .. } => serde_json::from_value(content)
                .map_err(|e| {
                    TranslationError::Malformed(format!("proposal content is not a task: {}", e))
                }),
        }
    }

    fn into_assignment(self) -> CoordinationEvent {
        CoordinationEvent::TaskAssignment {
            capability: self.capability,
            payload: self.payload,
            priority: self.priority,
            deadline: self.deadline,
        }
    }

    fn into_broadcast(self) -> CoordinationEvent {
        CoordinationEvent::BroadcastTask {
            capability: self.capability,
            payload: self.payload,
            priority: self.priority,
            deadline: self.deadline,
        }
    }

    fn into_proposal(self) -> Result<CoordinationEvent> {
        let content = serde_json::to_value(&self)
            .map_err(|e| TranslationError::Malformed(e.to_string()))?;
        Ok(CoordinationEvent::proposal(content))
    }
}

/// Registration table of directed translations.
#[derive(Default)]
pub struct ProtocolBridge {
    translations: HashMap<(CoordinationPattern, CoordinationPattern), Translator>,
}

impl ProtocolBridge {
    /// A bridge with no translations; every cross-pattern request fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// A bridge translating in both directions between every pair of patterns.
    pub fn with_default_translations() -> Self {
        use CoordinationPattern::{Consensus, Mesh, Router};

        let mut bridge = Self::new();
        bridge.register(Router, Mesh, |event| {
            Ok(TaskDescriptor::from_event(event)?.into_broadcast())
        });
        bridge.register(Mesh, Router, |event| {
            Ok(TaskDescriptor::from_event(event)?.into_assignment())
        });
        bridge.register(Router, Consensus, |event| {
            TaskDescriptor::from_event(event)?.into_proposal()
        });
        bridge.register(Mesh, Consensus, |event| {
            TaskDescriptor::from_event(event)?.into_proposal()
        });
        bridge.register(Consensus, Router, |event| {
            Ok(TaskDescriptor::from_event(event)?.into_assignment())
        });
        bridge.register(Consensus, Mesh, |event| {
            Ok(TaskDescriptor::from_event(event)?.into_broadcast())
        });
        bridge
    }

    /// Declare how to translate `from` events into `to` events. Replaces an
    /// earlier registration for the same pair.
    pub fn register<F>(&mut self, from: CoordinationPattern, to: CoordinationPattern, translator: F)
    where
        F: Fn(CoordinationEvent) -> Result<CoordinationEvent> + Send + Sync + 'static,
    {
        self.translations.insert((from, to), Arc::new(translator));
    }

    pub fn unregister(&mut self, from: CoordinationPattern, to: CoordinationPattern) -> bool {
        self.translations.remove(&(from, to)).is_some()
    }

    pub fn supports(&self, from: CoordinationPattern, to: CoordinationPattern) -> bool {
        from == to || self.translations.contains_key(&(from, to))
    }

    /// Registered pairs, sorted.
    pub fn pairs(&self) -> Vec<(CoordinationPattern, CoordinationPattern)> {
        let mut pairs: Vec<_> = self.translations.keys().copied().collect();
        pairs.sort();
        pairs
    }

    /// Translate `event` from `from` into `to`.
    ///
    /// An event already in `to`'s vocabulary passes through unchanged.
    pub fn translate(
        &self,
        event: CoordinationEvent,
        from: CoordinationPattern,
        to: CoordinationPattern,
    ) -> Result<TranslatedEvent> {
        let actual = event.pattern();
        if actual != from {
            return Err(TranslationError::PatternMismatch {
                expected: from,
                actual,
            });
        }

        if from == to {
            return Ok(TranslatedEvent { from, to, event });
        }

        let translator = self
            .translations
            .get(&(from, to))
            .ok_or(TranslationError::UnsupportedTranslation { from, to })?;
        let translated = translator(event)?;

        if translated.pattern() != to {
            return Err(TranslationError::Malformed(format!(
                "translator for {} -> {} produced a {} event",
                from,
                to,
                translated.pattern()
            )));
        }

        debug!("Translated {} event into {}", from, to);
        Ok(TranslatedEvent {
            from,
            to,
            event: translated,
        })
    }
}
