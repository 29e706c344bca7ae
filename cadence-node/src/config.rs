//! Node configuration
//!
//! Loaded from a TOML file (default `<config dir>/cadence/config.toml`), then
//! overridden from the environment for anything secret or deployment specific.

use crate::error::{NodeError, NodeResult};
use cadence_consensus::peers::DEFAULT_QUEUE_DEPTH;
use cadence_consensus::AppConfig;
use cadence_registry::RegistryConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_DELEGATE_KEY: &str = "CADENCE_DELEGATE_PRIVATE_KEY";
pub const ENV_DATABASE_URL: &str = "CADENCE_DATABASE_URL";
pub const ENV_ETH_RPC_URL: &str = "CADENCE_ETH_RPC_URL";
pub const ENV_ENVIRONMENT: &str = "CADENCE_ENV";
pub const ENV_ENDPOINT: &str = "CADENCE_NODE_ENDPOINT";

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Sandbox,
    Stage,
    Prod,
}

impl Environment {
    /// Nodes may stake and register themselves on the Ethereum registry
    pub fn is_permissive(self) -> bool {
        matches!(self, Environment::Dev | Environment::Sandbox)
    }
}

impl FromStr for Environment {
    type Err = NodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "sandbox" => Ok(Environment::Sandbox),
            "stage" | "staging" => Ok(Environment::Stage),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(NodeError::Config(format!("unknown environment {other:?}"))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Environment::Dev => "dev",
            Environment::Sandbox => "sandbox",
            Environment::Stage => "stage",
            Environment::Prod => "prod",
        };
        f.write_str(name)
    }
}

/// Where registration checks read the service-provider registry from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrySource {
    #[default]
    Ethereum,
    /// In-memory registry, for local single-node networks
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// secp256k1 key of the registry delegate wallet, hex
    pub delegate_private_key: Option<SecretString>,
    /// Public URL peers and the registry know this node by
    pub endpoint: String,
    pub node_type: String,
    pub http_listen: SocketAddr,
    pub registry: RegistrySource,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            delegate_private_key: None,
            endpoint: "http://localhost:26659".to_string(),
            node_type: "validator".to_string(),
            http_listen: SocketAddr::from(([0, 0, 0, 0], 26659)),
            registry: RegistrySource::Ethereum,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL; unset keeps state in memory
    pub url: Option<SecretString>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// RPC address of the consensus engine, polled for sync status
    pub rpc_url: String,
    /// Address the ABCI server listens on for the engine's `proxy_app`
    pub abci_listen: SocketAddr,
    /// Sequence blocks locally instead of waiting for an external engine
    pub local_driver: bool,
    pub block_interval_ms: u64,
    pub catch_up_attempts: u32,
    pub catch_up_delay_secs: u64,
    /// Pause between self registration rounds that failed
    pub registration_retry_secs: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:26657".to_string(),
            abci_listen: SocketAddr::from(([127, 0, 0, 1], 26658)),
            local_driver: false,
            block_interval_ms: 1000,
            catch_up_attempts: 60,
            catch_up_delay_secs: 10,
            registration_retry_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    pub capacity: usize,
    pub peer_queue_depth: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            capacity: cadence_consensus::mempool::DEFAULT_CAPACITY,
            peer_queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Timers of the transport and the background loops
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub send_timeout_secs: u64,
    pub peer_timeout_ms: u64,
    pub peer_refresh_secs: u64,
    pub sla_monitor_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 30,
            peer_timeout_ms: 5000,
            peer_refresh_secs: 60,
            sla_monitor_secs: 300,
        }
    }
}

impl ServiceConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub environment: Environment,
    pub node: NodeSection,
    pub database: DatabaseConfig,
    pub ethereum: RegistryConfig,
    pub consensus: ConsensusConfig,
    pub mempool: MempoolConfig,
    pub app: AppConfig,
    pub services: ServiceConfig,
}

impl NodeConfig {
    /// `<config dir>/cadence/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cadence").join("config.toml"))
    }

    /// Read `path`, or the default location when `path` is `None`
    ///
    /// An explicit path must exist; a missing default file means defaults.
    /// Environment overrides are applied and the result validated.
    pub fn load(path: Option<&Path>) -> NodeResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    tracing::info!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> NodeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Overlay values from `lookup` (the process environment in production)
    pub fn apply_env<F>(&mut self, lookup: F) -> NodeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_DELEGATE_KEY) {
            self.node.delegate_private_key = Some(SecretString::new(key));
        }
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database.url = Some(SecretString::new(url));
        }
        if let Some(url) = lookup(ENV_ETH_RPC_URL) {
            self.ethereum.rpc_url = url;
        }
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.node.endpoint = endpoint;
        }
        if let Some(environment) = lookup(ENV_ENVIRONMENT) {
            self.environment = environment.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> NodeResult<()> {
        if self.node.endpoint.trim().is_empty() {
            return Err(NodeError::Config("node.endpoint must be set".to_string()));
        }
        if self
            .node
            .delegate_private_key
            .as_ref()
            .map_or(true, |key| key.expose_secret().trim().is_empty())
        {
            return Err(NodeError::Config(format!(
                "node.delegate_private_key or {ENV_DELEGATE_KEY} must be set"
            )));
        }
        if !self.consensus.local_driver && self.consensus.rpc_url.trim().is_empty() {
            return Err(NodeError::Config(
                "consensus.rpc_url is required without the local driver".to_string(),
            ));
        }
        if self.mempool.capacity == 0 {
            return Err(NodeError::Config("mempool.capacity must be positive".to_string()));
        }
        if self.node.registry == RegistrySource::Memory && !self.environment.is_permissive() {
            return Err(NodeError::Config(format!(
                "the in-memory registry is not allowed in {}",
                self.environment
            )));
        }
        if self.node.registry == RegistrySource::Ethereum {
            self.ethereum.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const KEY: &str = "5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a";

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("Sandbox".parse::<Environment>().unwrap(), Environment::Sandbox);
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("mars".parse::<Environment>().is_err());
        assert!(Environment::Dev.is_permissive());
        assert!(!Environment::Stage.is_permissive());
    }

    #[test]
    fn test_parse_file_with_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
environment = "stage"

[node]
endpoint = "https://validator-1.example"
registry = "ethereum"

[app]
rollup_interval = 12

[mempool]
capacity = 50
"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.environment, Environment::Stage);
        assert_eq!(config.node.endpoint, "https://validator-1.example");
        assert_eq!(config.app.rollup_interval, 12);
        assert_eq!(config.app.tx_ttl_blocks, AppConfig::default().tx_ttl_blocks);
        assert_eq!(config.mempool.capacity, 50);
        assert_eq!(config.services.send_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides_and_validation() {
        let mut config = NodeConfig::default();
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        config
            .apply_env(env(&[
                (ENV_DELEGATE_KEY, KEY),
                (ENV_ENVIRONMENT, "prod"),
                (ENV_DATABASE_URL, "postgres://cadence@localhost/cadence"),
            ]))
            .unwrap();
        assert_eq!(config.environment, Environment::Prod);
        assert_eq!(
            config.database.url.as_ref().unwrap().expose_secret(),
            "postgres://cadence@localhost/cadence"
        );
        config.validate().unwrap();

        config.node.registry = RegistrySource::Memory;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_environment_override() {
        let mut config = NodeConfig::default();
        assert!(config.apply_env(env(&[(ENV_ENVIRONMENT, "moon")])).is_err());
    }
}
