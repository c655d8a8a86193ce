//! Lifecycle wrapper around one adapter.
//!
//! The session is where connection failures are absorbed: connects and
//! reconnects run through exponential backoff, invocations get a hard
//! timeout, and each successful refresh publishes the adapter's capability
//! set to the registry exactly once.

use super::{AdapterFeature, CapabilityAdapter};
use crate::backoff::Backoff;
use crate::capability::Capability;
use crate::registry::{CapabilityRegistry, RegistrationSummary, RegistryError};
use crate::types::{ConnectError, InvokeError};
use agent_fabric_config::AdapterConfig;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors raised while bringing a session up or refreshing it.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A connected adapter together with its config and the registry it feeds.
pub struct AdapterSession {
    adapter: Arc<dyn CapabilityAdapter>,
    config: AdapterConfig,
    registry: Arc<CapabilityRegistry>,
    connect_lock: Mutex<()>,
    refresh_lock: Mutex<()>,
}

impl AdapterSession {
    pub fn new(
        adapter: Arc<dyn CapabilityAdapter>,
        config: AdapterConfig,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        Self {
            adapter,
            config,
            registry,
            connect_lock: Mutex::new(()),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        self.adapter.id()
    }

    pub fn adapter(&self) -> &Arc<dyn CapabilityAdapter> {
        &self.adapter
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn supports(&self, feature: AdapterFeature) -> bool {
        self.adapter.supports(feature)
    }

    /// Connect (with backoff) and publish the initial capability set.
    pub async fn connect(&self) -> Result<RegistrationSummary, SessionError> {
        self.ensure_connected().await?;
        self.publish().await
    }

    /// Re-discover capabilities and replace the registry entry.
    pub async fn refresh(&self) -> Result<RegistrationSummary, SessionError> {
        self.ensure_connected().await?;
        self.publish().await
    }

    async fn publish(&self) -> Result<RegistrationSummary, SessionError> {
        let _guard = self.refresh_lock.lock().await;
        let capabilities = self.adapter.discover_capabilities().await?;
        let summary = self
            .registry
            .register(self.adapter.id(), capabilities)
            .await?;
        Ok(summary)
    }

    /// Connect if the adapter is not connected, retrying with backoff.
    pub async fn ensure_connected(&self) -> Result<(), ConnectError> {
        if self.adapter.is_connected() {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.adapter.is_connected() {
            return Ok(());
        }

        let mut backoff = Backoff::new(&self.config.reconnect);
        loop {
            let attempt = tokio::time::timeout(
                self.config.connect_timeout(),
                self.adapter.connect(&self.config),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ConnectError::Unreachable(format!(
                    "connect timed out after {:?}",
                    self.config.connect_timeout()
                )))
            });

            match attempt {
                Ok(()) => {
                    info!("Adapter {} connected", self.adapter.id());
                    return Ok(());
                }
                Err(ConnectError::Misconfigured(reason)) => {
                    return Err(ConnectError::Misconfigured(reason));
                }
                Err(err) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "Adapter {} connect failed ({}), retrying in {:?}",
                            self.adapter.id(),
                            err,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(ConnectError::RetriesExhausted {
                            attempts: backoff.attempts() + 1,
                            last_error: err.to_string(),
                        });
                    }
                },
            }
        }
    }

    /// Invoke `capability` with a hard `timeout`, reconnect included.
    ///
    /// On timeout the call is dropped and, when the adapter supports it, a
    /// cancel signal is sent downstream without waiting for it.
    pub async fn invoke(
        &self,
        capability: &Capability,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, InvokeError> {
        if !self.adapter.supports(AdapterFeature::Invoke) {
            return Err(InvokeError::RemoteError(format!(
                "adapter {} does not support invocation",
                self.adapter.id()
            )));
        }

        capability.check_input(&payload)?;

        // the deadline covers reconnecting as well as the call itself
        let deadline = tokio::time::Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, self.ensure_connected()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(InvokeError::Unreachable(e.to_string())),
            Err(_) => {
                warn!(
                    "Gave up reconnecting {} for {} after {:?}",
                    self.adapter.id(),
                    capability.qualified_name,
                    timeout
                );
                return Err(InvokeError::Timeout(timeout));
            }
        }

        let invocation_id = uuid::Uuid::new_v4().to_string();
        debug!(
            "Invoking {} via {} ({})",
            capability.qualified_name,
            self.adapter.id(),
            invocation_id
        );

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let call = self
            .adapter
            .invoke(capability, &invocation_id, payload, remaining);

        let result = tokio::time::timeout_at(deadline, call)
            .await
            .unwrap_or(Err(InvokeError::Timeout(timeout)));

        if let Err(InvokeError::Timeout(_)) = &result {
            if self.adapter.supports(AdapterFeature::Cancellation) {
                let adapter = self.adapter.clone();
                let id = invocation_id.clone();
                tokio::spawn(async move {
                    adapter.cancel(&id).await;
                });
            }
            warn!(
                "Invocation {} of {} timed out after {:?}",
                invocation_id, capability.qualified_name, timeout
            );
        }

        let output = result?;
        capability.check_output(&output)?;
        Ok(output)
    }

    /// Disconnect and withdraw the adapter's capabilities.
    pub async fn disconnect(&self) {
        self.adapter.disconnect().await;
        self.registry.unregister(self.adapter.id()).await;
        info!("Adapter {} disconnected", self.adapter.id());
    }
}
