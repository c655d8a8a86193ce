//! Identifiers and error types shared across the fabric.

use std::time::Duration;
use uuid::{NoContext, Timestamp, Uuid};

/// Unique identifier for an adapter instance.
pub type AdapterId = String;

/// Unique identifier for a node (worker, peer or voter).
pub type NodeId = String;

/// Unique identifier for a task.
pub type TaskId = String;

/// Unique identifier for a proposal.
pub type ProposalId = String;

/// Separator between namespace and local name in qualified capability names.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Generate a node id from the hostname and a time-ordered UUID.
pub fn generate_node_id() -> NodeId {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let uuid = Uuid::new_v7(Timestamp::now(NoContext));
    format!("{}-{}", hostname, uuid)
}

/// Errors raised while establishing an adapter's transport session.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Transport unreachable: {0}")]
    Unreachable(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Adapter misconfigured: {0}")]
    Misconfigured(String),

    #[error("Adapter is not connected")]
    NotConnected,

    #[error("Gave up connecting after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Errors raised by a single capability invocation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InvokeError {
    #[error("Capability endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Remote error: {0}")]
    RemoteError(String),

    #[error("Invocation timed out after {0:?}")]
    Timeout(Duration),
}

impl InvokeError {
    /// Whether a retry against the same or another endpoint may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, InvokeError::Unreachable(_) | InvokeError::Timeout(_))
    }
}
