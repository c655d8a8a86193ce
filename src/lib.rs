//! Coordination fabric for autonomous agents.
//!
//! The fabric lets many worker nodes discover each other's capabilities,
//! invoke them across heterogeneous transports and coordinate work through
//! three patterns: a central task router, a peer-to-peer mesh and a
//! consensus engine. [`Fabric`] composes all of it behind one handle.
//!
//! # Usage
//!
//! ```ignore
//! use agent_fabric::{CoordinationEvent, CoordinationPattern, Fabric, FabricConfig};
//!
//! let config = FabricConfig::load_default()?;
//! agent_fabric::telemetry::init_tracing(&config.logging)?;
//!
//! let fabric = Fabric::builder(config).with_adapter(adapter).build().await?;
//! fabric.start().await;
//!
//! let output = fabric.invoke("echo", json!({"text": "hi"})).await?;
//! let outcome = fabric
//!     .coordinate(CoordinationEvent::proposal(content), CoordinationPattern::Consensus)
//!     .await?;
//! fabric.stop().await;
//! ```

pub mod bridge;
pub mod error;
pub mod facade;
pub mod invoker;
pub mod selector;
pub mod telemetry;

pub use bridge::{
    CoordinationEvent, CoordinationPattern, ProtocolBridge, TranslatedEvent, TranslationError,
};
pub use error::{FabricError, Result};
pub use facade::{AdapterRegistration, CoordinationOutcome, Fabric, FabricBuilder, StartReport};
pub use invoker::{CapabilityExecutor, CapabilityInvoker};
pub use selector::{ModeSelector, SelectionContext, StaticSelector};

pub use agent_fabric_collective;
pub use agent_fabric_config;
pub use agent_fabric_core;

pub use agent_fabric_config::FabricConfig;
