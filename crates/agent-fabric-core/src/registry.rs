//! Capability registry: the single source of truth for name resolution.
//!
//! Adapters publish their capability sets here; nothing else answers
//! resolution queries. A registration replaces everything the adapter
//! published before, so repeated discovery is a refresh rather than an
//! append.

use crate::capability::Capability;
use crate::types::{AdapterId, NAMESPACE_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Result of resolving a capability name.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(Capability),
    /// The short name exists in several namespaces; callers must qualify it.
    Ambiguous(Vec<String>),
    NotFound,
}

impl Resolution {
    pub fn found(self) -> Option<Capability> {
        match self {
            Resolution::Found(capability) => Some(capability),
            _ => None,
        }
    }
}

/// Errors raised by registration.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Capability {name} is already published by adapter {owner}")]
    NamespaceConflict { name: String, owner: AdapterId },

    #[error("Adapter {adapter} tried to publish {name} which names adapter {origin} as its origin")]
    ForeignCapability {
        adapter: AdapterId,
        name: String,
        origin: AdapterId,
    },

    #[error("Capability name {0} is not qualified")]
    Unqualified(String),
}

/// Counts from one registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSummary {
    pub added: usize,
    pub replaced: usize,
    pub removed: usize,
    /// Refresh cycle number for this adapter, starting at 1.
    pub cycle: u64,
}

/// Optional constraints for [`CapabilityRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct CapabilityFilter {
    pub adapter_id: Option<AdapterId>,
    pub namespace: Option<String>,
    pub name_prefix: Option<String>,
    pub metadata_key: Option<String>,
}

impl CapabilityFilter {
    pub fn adapter(adapter_id: impl Into<AdapterId>) -> Self {
        Self {
            adapter_id: Some(adapter_id.into()),
            ..Self::default()
        }
    }

    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn with_metadata_key(mut self, key: impl Into<String>) -> Self {
        self.metadata_key = Some(key.into());
        self
    }

    fn matches(&self, capability: &Capability) -> bool {
        if let Some(adapter_id) = &self.adapter_id {
            if &capability.origin_adapter_id != adapter_id {
                return false;
            }
        }
        if let Some(namespace) = &self.namespace {
            if capability.namespace() != namespace {
                return false;
            }
        }
        if let Some(prefix) = &self.name_prefix {
            if !capability.local_name().starts_with(prefix.as_str())
                && !capability.qualified_name.starts_with(prefix.as_str())
            {
                return false;
            }
        }
        if let Some(key) = &self.metadata_key {
            if !capability.metadata.contains_key(key) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    by_name: BTreeMap<String, Capability>,
    by_adapter: HashMap<AdapterId, BTreeSet<String>>,
    cycles: HashMap<AdapterId, u64>,
}

/// Deduplicating, namespacing capability registry.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    state: RwLock<RegistryState>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the capability set published by `adapter_id`.
    pub async fn register(
        &self,
        adapter_id: &str,
        capabilities: Vec<Capability>,
    ) -> Result<RegistrationSummary, RegistryError> {
        let mut incoming: BTreeMap<String, Capability> = BTreeMap::new();
        for capability in capabilities {
            if capability.origin_adapter_id != adapter_id {
                return Err(RegistryError::ForeignCapability {
                    adapter: adapter_id.to_string(),
                    name: capability.qualified_name.clone(),
                    origin: capability.origin_adapter_id.clone(),
                });
            }
            if !capability.qualified_name.contains(NAMESPACE_SEPARATOR) {
                return Err(RegistryError::Unqualified(capability.qualified_name));
            }
            incoming.insert(capability.qualified_name.clone(), capability);
        }

        let mut state = self.state.write().await;

        for name in incoming.keys() {
            if let Some(existing) = state.by_name.get(name) {
                if existing.origin_adapter_id != adapter_id {
                    return Err(RegistryError::NamespaceConflict {
                        name: name.clone(),
                        owner: existing.origin_adapter_id.clone(),
                    });
                }
            }
        }

        let previous = state.by_adapter.remove(adapter_id).unwrap_or_default();
        let mut summary = RegistrationSummary::default();

        for name in &previous {
            if !incoming.contains_key(name) {
                state.by_name.remove(name);
                summary.removed += 1;
            }
        }

        let mut names = BTreeSet::new();
        for (name, capability) in incoming {
            if previous.contains(&name) {
                summary.replaced += 1;
            } else {
                summary.added += 1;
            }
            names.insert(name.clone());
            state.by_name.insert(name, capability);
        }
        state.by_adapter.insert(adapter_id.to_string(), names);

        let cycle = state.cycles.entry(adapter_id.to_string()).or_insert(0);
        *cycle += 1;
        summary.cycle = *cycle;

        info!(
            "Registered capabilities for adapter {} (cycle {}): +{} ~{} -{}",
            adapter_id, summary.cycle, summary.added, summary.replaced, summary.removed
        );
        Ok(summary)
    }

    /// Drop everything `adapter_id` published.
    pub async fn unregister(&self, adapter_id: &str) -> usize {
        let mut state = self.state.write().await;
        let names = state.by_adapter.remove(adapter_id).unwrap_or_default();
        for name in &names {
            state.by_name.remove(name);
        }
        debug!("Unregistered {} capabilities of adapter {}", names.len(), adapter_id);
        names.len()
    }

    /// Resolve a qualified or short capability name.
    pub async fn resolve(&self, name: &str) -> Resolution {
        let state = self.state.read().await;

        if name.contains(NAMESPACE_SEPARATOR) {
            return match state.by_name.get(name) {
                Some(capability) => Resolution::Found(capability.clone()),
                None => Resolution::NotFound,
            };
        }

        let mut matches = state
            .by_name
            .values()
            .filter(|capability| capability.local_name() == name);

        match (matches.next(), matches.next()) {
            (None, _) => Resolution::NotFound,
            (Some(only), None) => Resolution::Found(only.clone()),
            (Some(first), Some(second)) => {
                let mut candidates = vec![
                    first.qualified_name.clone(),
                    second.qualified_name.clone(),
                ];
                candidates.extend(matches.map(|c| c.qualified_name.clone()));
                Resolution::Ambiguous(candidates)
            }
        }
    }

    /// List capabilities, optionally filtered, ordered by qualified name.
    pub async fn list(&self, filter: Option<&CapabilityFilter>) -> Vec<Capability> {
        let state = self.state.read().await;
        state
            .by_name
            .values()
            .filter(|capability| filter.map(|f| f.matches(capability)).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Short names that resolve unambiguously, mapped to their qualified name.
    pub async fn aliases(&self) -> BTreeMap<String, String> {
        let state = self.state.read().await;
        let mut counts: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for capability in state.by_name.values() {
            counts
                .entry(capability.local_name())
                .or_default()
                .push(capability.qualified_name.as_str());
        }
        counts
            .into_iter()
            .filter(|(_, names)| names.len() == 1)
            .map(|(local, names)| (local.to_string(), names[0].to_string()))
            .collect()
    }

    /// Adapter that published a qualified capability name.
    pub async fn owner(&self, qualified_name: &str) -> Option<AdapterId> {
        let state = self.state.read().await;
        state
            .by_name
            .get(qualified_name)
            .map(|c| c.origin_adapter_id.clone())
    }

    /// Number of refresh cycles recorded for an adapter.
    pub async fn refresh_cycles(&self, adapter_id: &str) -> u64 {
        let state = self.state.read().await;
        state.cycles.get(adapter_id).copied().unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.by_name.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
