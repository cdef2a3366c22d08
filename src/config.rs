//! WolfCoord Configuration
//!
//! This module provides configuration structures for the WolfCoord
//! election and service registry node.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::coordination::path;
use crate::state::{ElectionConfig, PublishPolicy, RegistryConfig};

/// Main WolfCoord configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WolfCoordConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Coordination service configuration
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Leader election configuration
    #[serde(default)]
    pub election: ElectionSection,

    /// Service registry configuration
    #[serde(default)]
    pub registry: RegistrySection,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host advertised in the service registry
    #[serde(default = "default_host")]
    pub host: String,

    /// Port advertised in the service registry
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Which coordination service sessions are opened against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process service shared by the participants of this process
    #[default]
    Embedded,
    /// External ZooKeeper ensemble
    Zookeeper,
}

/// Coordination service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Backend to connect to
    #[serde(default)]
    pub backend: BackendKind,

    /// ZooKeeper connect string (host:port[,host:port...])
    #[serde(default = "default_connect_string")]
    pub connect_string: String,

    /// ZooKeeper session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Create the election path if it does not exist
    #[serde(default = "default_true")]
    pub create_election_root: bool,
}

/// Leader election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSection {
    /// Parent of all election nodes
    #[serde(default = "default_election_path")]
    pub path: String,

    /// Election node name prefix
    #[serde(default = "default_election_prefix")]
    pub prefix: String,

    /// Minimum re-evaluation backoff in milliseconds
    #[serde(default = "default_retry_backoff_min_ms")]
    pub retry_backoff_min_ms: u64,

    /// Maximum re-evaluation backoff in milliseconds
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

/// Service registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    /// Parent of all registry nodes
    #[serde(default = "default_registry_path")]
    pub path: String,

    /// Registry node name prefix
    #[serde(default = "default_registry_prefix")]
    pub prefix: String,

    /// Which election outcome registers this node (leader, workers, all)
    #[serde(default)]
    pub publish: PublishPolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_connect_string() -> String {
    "localhost:2181".to_string()
}

fn default_session_timeout_ms() -> u64 {
    3000
}

fn default_election_path() -> String {
    "/election".to_string()
}

fn default_election_prefix() -> String {
    "c_".to_string()
}

fn default_retry_backoff_min_ms() -> u64 {
    10
}

fn default_retry_backoff_max_ms() -> u64 {
    1000
}

fn default_registry_path() -> String {
    "/service_registry".to_string()
}

fn default_registry_prefix() -> String {
    "n_".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            connect_string: default_connect_string(),
            session_timeout_ms: default_session_timeout_ms(),
            create_election_root: true,
        }
    }
}

impl Default for ElectionSection {
    fn default() -> Self {
        Self {
            path: default_election_path(),
            prefix: default_election_prefix(),
            retry_backoff_min_ms: default_retry_backoff_min_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            prefix: default_registry_prefix(),
            publish: PublishPolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfCoordConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfCoordConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfCoordConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise use defaults
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.host.is_empty() {
            return Err(crate::Error::Config("node.host cannot be empty".into()));
        }

        if self.node.port == 0 {
            return Err(crate::Error::Config("node.port cannot be 0".into()));
        }

        if self.coordination.backend == BackendKind::Zookeeper {
            if self.coordination.connect_string.trim().is_empty() {
                return Err(crate::Error::Config(
                    "coordination.connect_string cannot be empty".into(),
                ));
            }
            if self.coordination.session_timeout_ms == 0 {
                return Err(crate::Error::Config(
                    "coordination.session_timeout_ms cannot be 0".into(),
                ));
            }
        }

        for (name, value) in [
            ("election.path", &self.election.path),
            ("registry.path", &self.registry.path),
        ] {
            if value == "/" || path::validate(value).is_err() {
                return Err(crate::Error::Config(format!(
                    "{} must be an absolute, non-root path (got {:?})",
                    name, value
                )));
            }
        }

        if self.election.path == self.registry.path {
            return Err(crate::Error::Config(
                "election.path and registry.path must differ".into(),
            ));
        }

        if path::is_descendant(&self.registry.path, &self.election.path)
            || path::is_descendant(&self.election.path, &self.registry.path)
        {
            return Err(crate::Error::Config(format!(
                "election.path ({}) and registry.path ({}) cannot be nested",
                self.election.path, self.registry.path
            )));
        }

        for (name, value) in [
            ("election.prefix", &self.election.prefix),
            ("registry.prefix", &self.registry.prefix),
        ] {
            if value.is_empty() || value.contains('/') {
                return Err(crate::Error::Config(format!(
                    "{} must be a non-empty name without '/'",
                    name
                )));
            }
        }

        if self.election.retry_backoff_min_ms > self.election.retry_backoff_max_ms {
            return Err(crate::Error::Config(
                "election.retry_backoff_min_ms cannot exceed retry_backoff_max_ms".into(),
            ));
        }

        Ok(())
    }

    /// ZooKeeper session timeout
    pub fn session_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.coordination.session_timeout_ms)
    }

    /// Address published in the service registry (host:port)
    pub fn advertise_address(&self) -> String {
        format!("{}:{}", self.node.host, self.node.port)
    }

    /// Election settings for the coordinator
    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            election_path: self.election.path.clone(),
            node_prefix: self.election.prefix.clone(),
            retry_backoff_min_ms: self.election.retry_backoff_min_ms,
            retry_backoff_max_ms: self.election.retry_backoff_max_ms,
        }
    }

    /// Registry settings for the membership registry
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            registry_path: self.registry.path.clone(),
            node_prefix: self.registry.prefix.clone(),
            publish: self.registry.publish,
        }
    }
}
