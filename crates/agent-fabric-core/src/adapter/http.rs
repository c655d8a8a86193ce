//! Adapter for a remote capability server spoken to over HTTP.
//!
//! Endpoints:
//! - `GET  {base}/health`
//! - `GET  {base}/capabilities`
//! - `POST {base}/invoke`
//! - `POST {base}/cancel/{invocation_id}`

use super::{AdapterFeature, CapabilityAdapter, FeatureSet};
use crate::capability::Capability;
use crate::types::{AdapterId, ConnectError, InvokeError};
use agent_fabric_config::AdapterConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Capability as described by the remote server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCapability {
    pub name: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Response from `GET /capabilities`
#[derive(Debug, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    pub capabilities: Vec<RemoteCapability>,
}

/// Request body for `POST /invoke`
#[derive(Debug, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub invocation_id: String,
    pub capability: String,
    pub payload: Value,
    pub timeout_ms: u64,
}

/// Response body for `POST /invoke`
#[derive(Debug, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub output: Value,
}

/// Error body returned by the remote server on failure.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: String,
}

/// Adapter backed by a remote capability server.
pub struct HttpAdapter {
    id: AdapterId,
    namespace: String,
    base_url: RwLock<String>,
    client: Client,
    connected: AtomicBool,
}

impl HttpAdapter {
    pub fn new(
        id: impl Into<AdapterId>,
        namespace: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            base_url: RwLock::new(trim_base(base_url.into())),
            client: Client::new(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &AdapterConfig) -> Result<Self, ConnectError> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            ConnectError::Misconfigured(format!("adapter {} has no endpoint", config.id))
        })?;
        Ok(Self::new(config.id.clone(), config.namespace(), endpoint))
    }

    async fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.read().await, path)
    }

    fn to_capability(&self, remote: RemoteCapability) -> Capability {
        let mut capability = Capability::new(&self.namespace, &remote.name, self.id.clone());
        capability.input_schema = remote.input_schema;
        capability.output_schema = remote.output_schema;
        capability.metadata = remote.metadata;
        capability
    }
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

/// Map a non-success HTTP status to an invocation error.
pub fn map_status(status: StatusCode, capability: &str, detail: String) -> InvokeError {
    match status {
        StatusCode::NOT_FOUND => InvokeError::CapabilityNotFound(capability.to_string()),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            InvokeError::InvalidPayload(detail)
        }
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            InvokeError::Unreachable(format!("{}: {}", status, detail))
        }
        _ => InvokeError::RemoteError(format!("{}: {}", status, detail)),
    }
}

fn map_transport(err: reqwest::Error, timeout: Duration) -> InvokeError {
    if err.is_timeout() {
        InvokeError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() {
        InvokeError::Unreachable(err.to_string())
    } else if err.is_decode() {
        InvokeError::RemoteError(format!("malformed response: {}", err))
    } else {
        InvokeError::RemoteError(err.to_string())
    }
}

#[async_trait]
impl CapabilityAdapter for HttpAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn features(&self) -> FeatureSet {
        [
            AdapterFeature::Invoke,
            AdapterFeature::Discovery,
            AdapterFeature::Cancellation,
        ]
        .into_iter()
        .collect()
    }

    async fn connect(&self, config: &AdapterConfig) -> Result<(), ConnectError> {
        if let Some(endpoint) = &config.endpoint {
            *self.base_url.write().await = trim_base(endpoint.clone());
        }

        let response = self
            .client
            .get(self.url("/health").await)
            .timeout(config.connect_timeout())
            .send()
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        if response.status().is_success() {
            self.connected.store(true, Ordering::SeqCst);
            debug!("HTTP adapter {} connected", self.id);
            Ok(())
        } else {
            Err(ConnectError::Handshake(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    async fn discover_capabilities(&self) -> Result<Vec<Capability>, ConnectError> {
        if !self.is_connected() {
            return Err(ConnectError::NotConnected);
        }

        let response = self
            .client
            .get(self.url("/capabilities").await)
            .send()
            .await
            .map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                ConnectError::Unreachable(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(ConnectError::Handshake(format!(
                "capability listing returned {}",
                response.status()
            )));
        }

        let body: CapabilitiesResponse = response
            .json()
            .await
            .map_err(|e| ConnectError::Handshake(format!("malformed capability listing: {}", e)))?;

        Ok(body
            .capabilities
            .into_iter()
            .map(|remote| self.to_capability(remote))
            .collect())
    }

    async fn invoke(
        &self,
        capability: &Capability,
        invocation_id: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, InvokeError> {
        let request = InvokeRequest {
            invocation_id: invocation_id.to_string(),
            capability: capability.local_name().to_string(),
            payload,
            timeout_ms: timeout.as_millis() as u64,
        };

        let response = self
            .client
            .post(self.url("/invoke").await)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                map_transport(e, timeout)
            })?;

        let status = response.status();
        if status.is_success() {
            let body: InvokeResponse = response
                .json()
                .await
                .map_err(|e| map_transport(e, timeout))?;
            Ok(body.output)
        } else {
            let detail = response
                .json::<ErrorBody>()
                .await
                .map(|b| b.error)
                .unwrap_or_default();
            Err(map_status(status, &capability.qualified_name, detail))
        }
    }

    async fn cancel(&self, invocation_id: &str) {
        let url = self.url(&format!("/cancel/{}", invocation_id)).await;
        if let Err(e) = self.client.post(url).send().await {
            warn!("Cancel of {} on {} failed: {}", invocation_id, self.id, e);
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
