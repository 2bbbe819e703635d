//! Configuration Module
//!
//! YAML configuration for the catalog server and for storage nodes. Durations are
//! written in humantime form (`15s`, `1h`).

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::catalog_store::NodeAddress;

/// Shared secret used when a config file does not name one. Replace in production.
pub const DEFAULT_SIGNING_SECRET: &str = "songvault-development-secret";

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

fn load_yaml<T: serde::de::DeserializeOwned, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

fn save_yaml<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> ConfigResult<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let content = serde_yaml::to_string(value)?;
    fs::write(path, content)?;
    Ok(())
}

fn validate_listen_address(listen_address: &str) -> ConfigResult<()> {
    listen_address
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ConfigError::Invalid {
            reason: format!("listen_address {:?} is not ip:port", listen_address),
        })
}

fn require_nonzero(name: &str, value: Duration) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            reason: format!("{} must be greater than 0", name),
        });
    }
    Ok(())
}

/// Timing of the background replication loops
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Interval between node health passes
    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub health_interval: Duration,
    /// Interval between reconciliation passes
    #[serde(with = "humantime_serde", default = "default_reconcile_interval")]
    pub reconcile_interval: Duration,
    /// Bound on a single liveness or verify probe
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,
    /// Lifetime of the two tokens carried by a relay instruction
    #[serde(with = "humantime_serde", default = "default_relay_token_ttl")]
    pub relay_token_ttl: Duration,
    /// Lifetime of a verify probe token
    #[serde(with = "humantime_serde", default = "default_verify_token_ttl")]
    pub verify_token_ttl: Duration,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_relay_token_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_verify_token_ttl() -> Duration {
    Duration::from_secs(60)
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            health_interval: default_health_interval(),
            reconcile_interval: default_reconcile_interval(),
            probe_timeout: default_probe_timeout(),
            relay_token_ttl: default_relay_token_ttl(),
            verify_token_ttl: default_verify_token_ttl(),
        }
    }
}

impl ReplicationConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        require_nonzero("health_interval", self.health_interval)?;
        require_nonzero("reconcile_interval", self.reconcile_interval)?;
        require_nonzero("probe_timeout", self.probe_timeout)?;
        require_nonzero("relay_token_ttl", self.relay_token_ttl)?;
        require_nonzero("verify_token_ttl", self.verify_token_ttl)?;
        Ok(())
    }
}

/// Configuration for the catalog server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogServerConfig {
    /// Address clients connect to
    pub listen_address: String,
    /// Path to the catalog database
    pub database_path: PathBuf,
    /// Storage nodes, fixed at startup
    #[serde(default)]
    pub nodes: Vec<NodeAddress>,
    /// Secret shared with every storage node
    pub signing_secret: String,
    /// Lifetime of a user session token
    #[serde(with = "humantime_serde", default = "default_session_ttl")]
    pub session_ttl: Duration,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(3600)
}

impl Default for CatalogServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8500".to_string(),
            database_path: PathBuf::from("data/catalog.db"),
            nodes: vec![
                NodeAddress::new("127.0.0.1", 8601),
                NodeAddress::new("127.0.0.1", 8602),
            ],
            signing_secret: DEFAULT_SIGNING_SECRET.to_string(),
            session_ttl: default_session_ttl(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl CatalogServerConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        load_yaml(path)
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        save_yaml(self, path)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        validate_listen_address(&self.listen_address)?;

        if self.signing_secret.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "signing_secret must not be empty".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node) {
                return Err(ConfigError::Invalid {
                    reason: format!("node {} is listed more than once", node),
                });
            }
        }

        require_nonzero("session_ttl", self.session_ttl)?;
        self.replication.validate()
    }
}

/// Configuration for a storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodeConfig {
    /// Node identifier, reported in liveness replies
    pub node_id: Uuid,
    /// Address the node listens on
    pub listen_address: String,
    /// Root directory for blobs
    pub storage_root: PathBuf,
    /// Secret shared with the catalog server
    pub signing_secret: String,
    /// Largest blob accepted by `pst`/`bkp` (in bytes)
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: u64,
}

fn default_max_blob_size() -> u64 {
    512 * 1024 * 1024
}

impl Default for StorageNodeConfig {
    fn default() -> Self {
        Self {
            node_id: Uuid::new_v4(),
            listen_address: "127.0.0.1:8601".to_string(),
            storage_root: PathBuf::from("data/blobs"),
            signing_secret: DEFAULT_SIGNING_SECRET.to_string(),
            max_blob_size: default_max_blob_size(),
        }
    }
}

impl StorageNodeConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        load_yaml(path)
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        save_yaml(self, path)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        validate_listen_address(&self.listen_address)?;

        if self.signing_secret.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "signing_secret must not be empty".to_string(),
            });
        }

        if self.max_blob_size == 0 {
            return Err(ConfigError::Invalid {
                reason: "max_blob_size must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_catalog_config_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("catalog.yaml");

        let config = CatalogServerConfig::default();
        config.validate().unwrap();
        config.save_to_file(&path).unwrap();

        let loaded = CatalogServerConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_catalog_config_defaults_and_humantime() {
        let yaml = r#"
listen_address: "0.0.0.0:8500"
database_path: /var/lib/songvault/catalog.db
nodes:
  - "10.0.0.1:8601"
  - "10.0.0.2:8601"
signing_secret: s3cret
replication:
  health_interval: 30s
  probe_timeout: 500ms
"#;
        let config: CatalogServerConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.nodes[1], NodeAddress::new("10.0.0.2", 8601));
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
        assert_eq!(config.replication.health_interval, Duration::from_secs(30));
        assert_eq!(config.replication.reconcile_interval, Duration::from_secs(15));
        assert_eq!(config.replication.probe_timeout, Duration::from_millis(500));
        assert_eq!(config.replication.verify_token_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_catalog_config_validation() {
        let mut config = CatalogServerConfig::default();
        config.signing_secret.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = CatalogServerConfig::default();
        config.nodes.push(config.nodes[0].clone());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = CatalogServerConfig::default();
        config.replication.probe_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = CatalogServerConfig::default();
        config.listen_address = "not-an-address".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_bad_node_address_rejected() {
        let yaml = r#"
listen_address: "0.0.0.0:8500"
database_path: catalog.db
nodes: ["missing-port"]
signing_secret: s3cret
"#;
        assert!(serde_yaml::from_str::<CatalogServerConfig>(yaml).is_err());
    }

    #[test]
    fn test_storage_node_config_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("node.yaml");

        let config = StorageNodeConfig::default();
        config.validate().unwrap();
        config.save_to_file(&path).unwrap();

        let loaded = StorageNodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.node_id, config.node_id);
        assert_eq!(loaded, config);

        let mut invalid = config;
        invalid.max_blob_size = 0;
        assert!(invalid.validate().is_err());
    }
}
