//! Configuration surface for the coordination fabric.
//!
//! The fabric reads its configuration once at startup and never writes it
//! back. Every section has defaults so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! [fabric]
//! node_id = "node-a"
//!
//! [[adapters]]
//! id = "search"
//! namespace = "web"
//! kind = "http"
//! endpoint = "http://127.0.0.1:7400"
//!
//! [router]
//! max_retries = 3
//!
//! [consensus]
//! algorithm = "byzantine"
//! min_nodes = 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable pointing at a configuration file.
pub const CONFIG_ENV_VAR: &str = "AGENT_FABRIC_CONFIG";

/// File name looked up in the platform configuration directory.
pub const CONFIG_FILE_NAME: &str = "fabric.toml";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level fabric configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FabricConfig {
    pub fabric: FabricSection,
    pub adapters: Vec<AdapterConfig>,
    pub router: RouterConfig,
    pub mesh: MeshConfig,
    pub consensus: ConsensusConfig,
    pub liveness: LivenessConfig,
    pub logging: LoggingConfig,
}

/// Identity of the local node and facade-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FabricSection {
    /// Local node id. Generated from the hostname when absent.
    pub node_id: Option<String>,
    /// Default timeout applied to `invoke` calls without an explicit deadline.
    pub invoke_timeout_ms: u64,
}

impl Default for FabricSection {
    fn default() -> Self {
        Self {
            node_id: None,
            invoke_timeout_ms: 30_000,
        }
    }
}

impl FabricSection {
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }
}

/// Transport kind behind an adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// In-process handlers registered by the embedding application
    #[default]
    Local,
    /// Remote capability server reached over HTTP
    Http,
}

/// Connection parameters for one capability adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    pub id: String,
    /// Namespace prefix for qualified capability names. Defaults to the id.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub kind: AdapterKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: BackoffConfig,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl AdapterConfig {
    /// Create a config for an in-process adapter.
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            namespace: None,
            kind: AdapterKind::Local,
            endpoint: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect: BackoffConfig::default(),
        }
    }

    /// Create a config for a remote HTTP adapter.
    pub fn http(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            kind: AdapterKind::Http,
            endpoint: Some(endpoint.into()),
            ..Self::local(id)
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Namespace used for qualified names.
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.id)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Exponential backoff parameters for adapter reconnects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Connection attempts before giving up. Zero disables retrying.
    pub max_attempts: u32,
    /// Fraction of each delay randomized (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

/// Centralized task router settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    pub tick_interval_ms: u64,
    pub max_retries: u32,
    /// Capacity given to workers registered without an explicit one.
    pub default_capacity: usize,
    /// Upper bound for one execution attempt.
    pub task_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 250,
            max_retries: 3,
            default_capacity: 4,
            task_timeout_ms: 60_000,
        }
    }
}

/// Distribution strategy for mesh task execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
}

/// Peer mesh settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    pub discovery_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a peer is declared dead.
    pub missed_heartbeats: u32,
    /// How long a dead peer stays in the table before eviction.
    pub dead_timeout_ms: u64,
    pub max_connections: usize,
    pub strategy: DistributionStrategy,
    pub max_retries: u32,
    pub dispatch_timeout_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            missed_heartbeats: 3,
            dead_timeout_ms: 30_000,
            max_connections: 32,
            strategy: DistributionStrategy::RoundRobin,
            max_retries: 3,
            dispatch_timeout_ms: 60_000,
        }
    }
}

/// Consensus algorithm choice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusAlgorithm {
    #[default]
    SimpleMajority,
    Byzantine,
    LeaderElection,
}

/// Consensus engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsensusConfig {
    pub algorithm: ConsensusAlgorithm,
    /// Minimum known nodes for a Byzantine round to start.
    pub min_nodes: usize,
    pub round_timeout_ms: u64,
    /// Base election timeout; actual timeouts are randomized in [base, 2*base).
    pub election_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            algorithm: ConsensusAlgorithm::SimpleMajority,
            min_nodes: 4,
            round_timeout_ms: 10_000,
            election_timeout_ms: 300,
        }
    }
}

/// Liveness probing shared by the router and the mesh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LivenessConfig {
    pub probe_interval_ms: u64,
    pub suspect_after: u32,
    pub dead_after: u32,
    pub dead_timeout_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1_000,
            suspect_after: 1,
            dead_after: 3,
            dead_timeout_ms: 30_000,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl FabricConfig {
    /// Parse configuration from a TOML string and validate it.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: FabricConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded fabric config from {}", path.display());
        Self::from_toml_str(&contents)
    }

    /// Load from `AGENT_FABRIC_CONFIG`, then the platform config directory,
    /// falling back to defaults when neither exists.
    pub fn load_default() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::load(PathBuf::from(path));
        }

        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(path);
            }
        }

        debug!("No fabric config file found, using defaults");
        Ok(Self::default())
    }

    /// Platform-specific location of `fabric.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "agent-fabric", "agent-fabric")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Reject values the fabric cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for adapter in &self.adapters {
            if adapter.id.trim().is_empty() {
                return Err(invalid("adapters.id", "must not be empty"));
            }
            if !seen.insert(adapter.namespace().to_string()) {
                return Err(invalid(
                    "adapters.namespace",
                    format!("namespace '{}' is used twice", adapter.namespace()),
                ));
            }
            if adapter.namespace().contains(':') {
                return Err(invalid("adapters.namespace", "must not contain ':'"));
            }
            if adapter.kind == AdapterKind::Http && adapter.endpoint.is_none() {
                return Err(invalid(
                    "adapters.endpoint",
                    format!("http adapter '{}' needs an endpoint", adapter.id),
                ));
            }
            if adapter.reconnect.multiplier < 1.0 {
                return Err(invalid("adapters.reconnect.multiplier", "must be >= 1.0"));
            }
            if !(0.0..=1.0).contains(&adapter.reconnect.jitter) {
                return Err(invalid("adapters.reconnect.jitter", "must be within 0.0..=1.0"));
            }
        }

        if self.fabric.invoke_timeout_ms == 0 {
            return Err(invalid("fabric.invoke_timeout_ms", "must be > 0"));
        }
        if self.router.tick_interval_ms == 0 {
            return Err(invalid("router.tick_interval_ms", "must be > 0"));
        }
        if self.router.task_timeout_ms == 0 {
            return Err(invalid("router.task_timeout_ms", "must be > 0"));
        }
        if self.router.default_capacity == 0 {
            return Err(invalid("router.default_capacity", "must be > 0"));
        }
        if self.mesh.heartbeat_interval_ms == 0 || self.mesh.discovery_interval_ms == 0 {
            return Err(invalid("mesh", "intervals must be > 0"));
        }
        if self.mesh.dispatch_timeout_ms == 0 {
            return Err(invalid("mesh.dispatch_timeout_ms", "must be > 0"));
        }
        if self.mesh.missed_heartbeats == 0 {
            return Err(invalid("mesh.missed_heartbeats", "must be > 0"));
        }
        if self.mesh.max_connections == 0 {
            return Err(invalid("mesh.max_connections", "must be > 0"));
        }
        if self.consensus.round_timeout_ms == 0 {
            return Err(invalid("consensus.round_timeout_ms", "must be > 0"));
        }
        if self.consensus.election_timeout_ms == 0 {
            return Err(invalid("consensus.election_timeout_ms", "must be > 0"));
        }
        if self.liveness.probe_interval_ms == 0 {
            return Err(invalid("liveness.probe_interval_ms", "must be > 0"));
        }
        if self.liveness.dead_after == 0 || self.liveness.suspect_after > self.liveness.dead_after
        {
            return Err(invalid(
                "liveness",
                "dead_after must be > 0 and >= suspect_after",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = FabricConfig::from_toml_str("").unwrap();
        assert_eq!(config, FabricConfig::default());
        assert_eq!(config.router.max_retries, 3);
        assert_eq!(config.consensus.algorithm, ConsensusAlgorithm::SimpleMajority);
    }

    #[test]
    fn parses_full_document() {
        let config = FabricConfig::from_toml_str(
            r#"
            [fabric]
            node_id = "node-a"
            invoke_timeout_ms = 1500

            [[adapters]]
            id = "search"
            namespace = "web"
            kind = "http"
            endpoint = "http://127.0.0.1:7400"

            [[adapters]]
            id = "math"

            [router]
            max_retries = 5
            tick_interval_ms = 50

            [mesh]
            strategy = "least_loaded"
            max_connections = 8

            [consensus]
            algorithm = "byzantine"
            min_nodes = 7

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(config.fabric.node_id.as_deref(), Some("node-a"));
        assert_eq!(config.fabric.invoke_timeout(), Duration::from_millis(1500));
        assert_eq!(config.adapters.len(), 2);
        assert_eq!(config.adapters[0].namespace(), "web");
        assert_eq!(config.adapters[1].namespace(), "math");
        assert_eq!(config.adapters[1].kind, AdapterKind::Local);
        assert_eq!(config.router.max_retries, 5);
        assert_eq!(config.mesh.strategy, DistributionStrategy::LeastLoaded);
        assert_eq!(config.consensus.algorithm, ConsensusAlgorithm::Byzantine);
        assert_eq!(config.consensus.min_nodes, 7);
        assert!(config.logging.json);
    }

    #[test]
    fn rejects_duplicate_namespaces() {
        let err = FabricConfig::from_toml_str(
            r#"
            [[adapters]]
            id = "a"
            namespace = "tools"

            [[adapters]]
            id = "b"
            namespace = "tools"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn rejects_http_adapter_without_endpoint() {
        let err = FabricConfig::from_toml_str(
            r#"
            [[adapters]]
            id = "remote"
            kind = "http"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn rejects_zero_tick_interval() {
        let err = FabricConfig::from_toml_str("[router]\ntick_interval_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("router.tick_interval_ms"));
    }

    #[test]
    fn rejects_zero_timeouts_and_probe_interval() {
        for (toml, field) in [
            ("[liveness]\nprobe_interval_ms = 0\n", "liveness.probe_interval_ms"),
            ("[router]\ntask_timeout_ms = 0\n", "router.task_timeout_ms"),
            ("[fabric]\ninvoke_timeout_ms = 0\n", "fabric.invoke_timeout_ms"),
            ("[mesh]\ndispatch_timeout_ms = 0\n", "mesh.dispatch_timeout_ms"),
        ] {
            let err = FabricConfig::from_toml_str(toml).unwrap_err();
            assert!(err.to_string().contains(field), "{}", err);
        }
    }

    #[test]
    fn load_reports_missing_file() {
        let err = FabricConfig::load("/definitely/not/here/fabric.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    #[serial]
    fn load_default_prefers_env_var() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fabric.toml");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(file, "[fabric]\nnode_id = \"from-env\"").expect("write");

        std::env::set_var(CONFIG_ENV_VAR, &path);
        let config = FabricConfig::load_default();
        std::env::remove_var(CONFIG_ENV_VAR);

        assert_eq!(config.unwrap().fabric.node_id.as_deref(), Some("from-env"));
    }
}
