//! Top-level error type for the fabric facade.

use crate::bridge::{CoordinationPattern, TranslationError};
use agent_fabric_collective::{ConsensusError, MeshError, RouterError};
use agent_fabric_config::ConfigError;
use agent_fabric_core::{AdapterFeature, AdapterId, InvokeError, RegistryError, SessionError};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("Capability not found: {0}")]
    NotFound(String),

    #[error("Capability name {name} is ambiguous; candidates: {candidates:?}")]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },

    #[error("Adapter {adapter} does not support {feature:?}")]
    UnsupportedFeature {
        adapter: AdapterId,
        feature: AdapterFeature,
    },

    #[error("Unknown adapter: {0}")]
    UnknownAdapter(AdapterId),

    #[error("Adapter {0} is already attached")]
    DuplicateAdapter(AdapterId),

    #[error("The {0} pattern is not available on this fabric")]
    PatternUnavailable(CoordinationPattern),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FabricError>;

impl FabricError {
    /// Whether the request may succeed if simply repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            FabricError::Timeout(_) => true,
            FabricError::Invoke(e) => e.is_transient(),
            FabricError::Session(SessionError::Connect(_)) => true,
            _ => false,
        }
    }
}
