//! # Node Configuration
//!
//! Purpose: Parse the config file every node process is launched with into
//! a typed tree, rejecting unknown keys so a typo surfaces as the
//! misconfiguration exit code rather than a silently-ignored setting.
//!
//! ## Design Principles
//! 1. **Deny Unknown Fields**: A renamed or mistyped option fails to load
//!    instead of being silently dropped.
//! 2. **Sensible Defaults**: Every optional field has a default matching the
//!    values called out in the design doc, so a minimal config file is a
//!    valid one.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level node configuration, matching the option tree in the design doc.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSection {
    pub id: String,
    pub data_dir: String,
    pub advertise_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    #[serde(default = "default_bind_addr")]
    pub resp_bind_addr: String,
    #[serde(default = "default_resp_port")]
    pub resp_port: u16,
    #[serde(default = "default_bind_addr")]
    pub http_bind_addr: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_gossip_port")]
    pub gossip_port: u16,
}

impl Default for NetworkSection {
    fn default() -> Self {
        NetworkSection {
            resp_bind_addr: default_bind_addr(),
            resp_port: default_resp_port(),
            http_bind_addr: default_bind_addr(),
            http_port: default_http_port(),
            gossip_port: default_gossip_port(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_resp_port() -> u16 {
    6380
}
fn default_http_port() -> u16 {
    8080
}
fn default_gossip_port() -> u16 {
    7946
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    One,
    Quorum,
    All,
}

impl Default for ConsistencyLevel {
    fn default() -> Self {
        ConsistencyLevel::One
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSection {
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default)]
    pub consistency_level: ConsistencyLevel,
}

impl Default for ClusterSection {
    fn default() -> Self {
        ClusterSection {
            seeds: Vec::new(),
            replication_factor: default_replication_factor(),
            consistency_level: ConsistencyLevel::default(),
        }
    }
}

fn default_replication_factor() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CuckooFilterSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_filter_capacity")]
    pub capacity: usize,
    #[serde(default = "default_filter_fpp")]
    pub fpp: f64,
}

impl Default for CuckooFilterSection {
    fn default() -> Self {
        CuckooFilterSection {
            enabled: false,
            capacity: default_filter_capacity(),
            fpp: default_filter_fpp(),
        }
    }
}

fn default_filter_capacity() -> usize {
    1 << 16
}
fn default_filter_fpp() -> f64 {
    0.01
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicyKind {
    SessionAware,
    Lru,
}

impl Default for EvictionPolicyKind {
    fn default() -> Self {
        EvictionPolicyKind::SessionAware
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub name: String,
    pub max_memory: u64,
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,
    #[serde(default)]
    pub eviction_policy: EvictionPolicyKind,
    #[serde(default)]
    pub cuckoo_filter: CuckooFilterSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceStrategy {
    Aof,
    Hybrid,
}

impl Default for PersistenceStrategy {
    fn default() -> Self {
        PersistenceStrategy::Aof
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPolicy {
    Always,
    EverySecond,
    Never,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::EverySecond
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistenceSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_persistence_dir")]
    pub directory: String,
    #[serde(default)]
    pub strategy: PersistenceStrategy,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_snapshot_threshold_entries")]
    pub snapshot_threshold_entries: u64,
    /// Whether replicated (non-origin) mutations are appended to the local
    /// log for audit purposes. Open question (c) in the design notes.
    #[serde(default)]
    pub persist_replicated: bool,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        PersistenceSection {
            enabled: false,
            directory: default_persistence_dir(),
            strategy: PersistenceStrategy::default(),
            sync_policy: SyncPolicy::default(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            snapshot_threshold_entries: default_snapshot_threshold_entries(),
            persist_replicated: false,
        }
    }
}

fn default_persistence_dir() -> String {
    "data".to_string()
}
fn default_snapshot_interval_secs() -> u64 {
    300
}
fn default_snapshot_threshold_entries() -> u64 {
    100_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: default_log_level(),
            format: default_log_format(),
            outputs: vec!["stdout".to_string()],
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

/// Error surfaced when a config file fails to load or parse.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl NodeConfig {
    /// Loads and parses a TOML config file from `path`.
    ///
    /// Per the CLI/process contract, a parse failure here should translate
    /// to exit code 2 (misconfiguration) at the call site.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let text = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_ref.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let text = r#"
            [node]
            id = "node-1"
            data_dir = "/var/lib/hkv"
            advertise_addr = "10.0.0.1"
        "#;
        let config: NodeConfig = toml::from_str(text).unwrap();
        assert_eq!(config.network.resp_port, 6380);
        assert_eq!(config.cluster.replication_factor, 2);
        assert_eq!(config.persistence.sync_policy, SyncPolicy::EverySecond);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn unknown_field_is_rejected() {
        let text = r#"
            [node]
            id = "node-1"
            data_dir = "/var/lib/hkv"
            advertise_addr = "10.0.0.1"
            bogus_field = true
        "#;
        assert!(toml::from_str::<NodeConfig>(text).is_err());
    }

    #[test]
    fn store_config_round_trips_cuckoo_filter() {
        let text = r#"
            [node]
            id = "node-1"
            data_dir = "/var/lib/hkv"
            advertise_addr = "10.0.0.1"

            [[cache.stores]]
            name = "default"
            max_memory = 1048576

            [cache.stores.cuckoo_filter]
            enabled = true
            capacity = 4096
            fpp = 0.02
        "#;
        let config: NodeConfig = toml::from_str(text).unwrap();
        let store = &config.cache.stores[0];
        assert_eq!(store.name, "default");
        assert!(store.cuckoo_filter.enabled);
        assert_eq!(store.cuckoo_filter.capacity, 4096);
    }
}
