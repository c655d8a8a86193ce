//! Choosing a coordination pattern for `coordinate_adaptive`.

use crate::bridge::{CoordinationEvent, CoordinationPattern};
use serde::{Deserialize, Serialize};

/// What the fabric knows when it asks a selector for a pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionContext {
    /// Router workers able to run the event's capability
    pub capable_workers: usize,
    /// Live mesh peers advertising the event's capability
    pub capable_peers: usize,
    /// Voters eligible for a new round
    pub live_voters: usize,
}

/// Policy hook deciding which pattern handles an event.
pub trait ModeSelector: Send + Sync {
    fn select(&self, event: &CoordinationEvent, context: &SelectionContext) -> CoordinationPattern;
}

impl<F> ModeSelector for F
where
    F: Fn(&CoordinationEvent, &SelectionContext) -> CoordinationPattern + Send + Sync,
{
    fn select(&self, event: &CoordinationEvent, context: &SelectionContext) -> CoordinationPattern {
        self(event, context)
    }
}

/// Selector with no heuristics: a fixed pattern, or the event's own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticSelector {
    pattern: Option<CoordinationPattern>,
}

impl StaticSelector {
    /// Always pick `pattern`.
    pub fn fixed(pattern: CoordinationPattern) -> Self {
        Self {
            pattern: Some(pattern),
        }
    }

    /// Keep every event in the pattern it was written for.
    pub fn native() -> Self {
        Self::default()
    }
}

impl ModeSelector for StaticSelector {
    fn select(
        &self,
        event: &CoordinationEvent,
        _context: &SelectionContext,
    ) -> CoordinationPattern {
        self.pattern.unwrap_or_else(|| event.pattern())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn native_keeps_the_event_pattern() {
        let selector = StaticSelector::native();
        let event = CoordinationEvent::broadcast_task("t:x", json!(1));
        assert_eq!(
            selector.select(&event, &SelectionContext::default()),
            CoordinationPattern::Mesh
        );
    }

    #[test]
    fn fixed_ignores_the_event() {
        let selector = StaticSelector::fixed(CoordinationPattern::Router);
        let event = CoordinationEvent::proposal(json!(1));
        assert_eq!(
            selector.select(&event, &SelectionContext::default()),
            CoordinationPattern::Router
        );
    }

    #[test]
    fn closures_can_select() {
        let prefer_mesh = |event: &CoordinationEvent, context: &SelectionContext| {
            if context.capable_peers > 0 && event.pattern() != CoordinationPattern::Consensus {
                CoordinationPattern::Mesh
            } else {
                event.pattern()
            }
        };
        let context = SelectionContext {
            capable_peers: 2,
            ..SelectionContext::default()
        };
        let event = CoordinationEvent::task_assignment("t:x", json!(1));
        assert_eq!(prefer_mesh.select(&event, &context), CoordinationPattern::Mesh);
    }
}
