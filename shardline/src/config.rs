//! Sharding coordinator configuration

use crate::error::{Result, ShardingError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main coordinator configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ShardingConfig {
    /// Connection to the local search engine
    #[serde(default)]
    pub engine: EngineConfig,

    /// Identity of this node
    #[serde(default)]
    pub node: NodeConfig,

    /// Cluster membership and leadership
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Command queue tuning
    #[serde(default)]
    pub queue: QueueConfig,

    /// Names of the backing tables
    #[serde(default)]
    pub tables: TablesConfig,

    /// Health check thresholds
    #[serde(default)]
    pub health: HealthConfig,

    /// Cleanup retention windows
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Sidecar HTTP server
    #[serde(default)]
    pub server: ServerConfig,
}

impl ShardingConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShardingError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML file, falling back to defaults if it is missing
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ShardingConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_tries == 0 {
            return Err(ShardingError::Config("queue.max_tries must be > 0".into()));
        }
        if self.queue.batch_size == 0 {
            return Err(ShardingError::Config("queue.batch_size must be > 0".into()));
        }
        if self.queue.backoff_base < 1.0 {
            return Err(ShardingError::Config(
                "queue.backoff_base must be >= 1.0".into(),
            ));
        }
        if self.cluster.tick_interval_ms == 0 {
            return Err(ShardingError::Config(
                "cluster.tick_interval_ms must be > 0".into(),
            ));
        }
        for name in [
            &self.tables.state,
            &self.tables.queue,
            &self.tables.schema,
        ] {
            crate::sql::validate_identifier(name)?;
        }
        Ok(())
    }
}

/// Search engine connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Base URL of the engine's HTTP SQL endpoint
    #[serde(default = "default_engine_url")]
    pub url: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_engine_url() -> String {
    "http://127.0.0.1:9308".to_string()
}

fn default_request_timeout() -> u64 {
    30000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: default_engine_url(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl EngineConfig {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Node identity settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Advertised "host:port" id; discovered from the engine's listen list when unset
    #[serde(default)]
    pub advertise_addr: Option<String>,
}

/// Cluster membership and leadership settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Node ids that belong to the cluster even before their first heartbeat
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Interval between coordinator ticks in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// A node whose last heartbeat is older than this is inactive
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// How long the master must look stale before another node takes over
    #[serde(default = "default_master_grace")]
    pub master_takeover_grace_ms: u64,

    /// Poll interval used while waiting for a table operation to finish
    #[serde(default = "default_wait_poll")]
    pub wait_poll_interval_ms: u64,
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_heartbeat_timeout() -> u64 {
    5000
}

fn default_master_grace() -> u64 {
    5000
}

fn default_wait_poll() -> u64 {
    500
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seed_nodes: Vec::new(),
            tick_interval_ms: default_tick_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            master_takeover_grace_ms: default_master_grace(),
            wait_poll_interval_ms: default_wait_poll(),
        }
    }
}

impl ClusterConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn master_takeover_grace(&self) -> Duration {
        Duration::from_millis(self.master_takeover_grace_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}

/// Command queue settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Attempts before an item is left permanently failed
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Maximum items fetched per node per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Base of the exponential retry backoff (seconds scale, 1.21^tries)
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,

    /// An item left in `processing` longer than this is released for retry
    #[serde(default = "default_stale_processing")]
    pub stale_processing_ms: u64,
}

fn default_max_tries() -> u32 {
    10
}

fn default_batch_size() -> usize {
    1000
}

fn default_backoff_base() -> f64 {
    1.21
}

fn default_stale_processing() -> u64 {
    10 * 60 * 1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            batch_size: default_batch_size(),
            backoff_base: default_backoff_base(),
            stale_processing_ms: default_stale_processing(),
        }
    }
}

/// Backing table names. The mixed `system.` prefixing is kept for
/// compatibility with tables created by earlier deployments.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TablesConfig {
    #[serde(default = "default_state_table")]
    pub state: String,

    #[serde(default = "default_queue_table")]
    pub queue: String,

    #[serde(default = "default_schema_table")]
    pub schema: String,
}

fn default_state_table() -> String {
    "sharding_state".to_string()
}

fn default_queue_table() -> String {
    "system.sharding_queue".to_string()
}

fn default_schema_table() -> String {
    "system.sharding_table".to_string()
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            state: default_state_table(),
            queue: default_queue_table(),
            schema: default_schema_table(),
        }
    }
}

/// Health check thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    /// A rebalance running longer than this is reported as stuck
    #[serde(default = "default_stuck_rebalance")]
    pub stuck_rebalance_secs: u64,

    /// Pending queue items above this are reported
    #[serde(default = "default_queue_depth")]
    pub queue_depth_threshold: u64,

    /// Temporary move clusters older than this are orphans
    #[serde(default = "default_orphan_cluster_age")]
    pub orphan_cluster_age_secs: u64,
}

fn default_stuck_rebalance() -> u64 {
    30 * 60
}

fn default_queue_depth() -> u64 {
    100
}

fn default_orphan_cluster_age() -> u64 {
    60 * 60
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stuck_rebalance_secs: default_stuck_rebalance(),
            queue_depth_threshold: default_queue_depth(),
            orphan_cluster_age_secs: default_orphan_cluster_age(),
        }
    }
}

/// Cleanup retention windows
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CleanupConfig {
    #[serde(default = "default_failed_group_age")]
    pub failed_group_age_secs: u64,

    #[serde(default = "default_queue_retention")]
    pub queue_retention_secs: u64,

    #[serde(default = "default_error_state_retention")]
    pub error_state_retention_secs: u64,
}

fn default_failed_group_age() -> u64 {
    24 * 60 * 60
}

fn default_queue_retention() -> u64 {
    7 * 24 * 60 * 60
}

fn default_error_state_retention() -> u64 {
    30 * 24 * 60 * 60
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            failed_group_age_secs: default_failed_group_age(),
            queue_retention_secs: default_queue_retention(),
            error_state_retention_secs: default_error_state_retention(),
        }
    }
}

/// Sidecar HTTP server settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:9380".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShardingConfig::default();
        assert_eq!(config.queue.max_tries, 10);
        assert_eq!(config.queue.batch_size, 1000);
        assert_eq!(config.tables.queue, "system.sharding_queue");
        assert_eq!(config.tables.state, "sharding_state");
        assert_eq!(config.health.stuck_rebalance_secs, 1800);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = ShardingConfig::from_toml(
            r#"
            [engine]
            url = "http://10.0.0.5:9308"

            [cluster]
            seed_nodes = ["10.0.0.5:9308", "10.0.0.6:9308"]
            heartbeat_timeout_ms = 8000
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.url, "http://10.0.0.5:9308");
        assert_eq!(config.cluster.seed_nodes.len(), 2);
        assert_eq!(config.cluster.heartbeat_timeout_ms, 8000);
        assert_eq!(config.cluster.tick_interval_ms, 1000);
        assert_eq!(config.queue.max_tries, 10);
    }

    #[test]
    fn test_rejects_zero_tries() {
        let result = ShardingConfig::from_toml("[queue]\nmax_tries = 0\n");
        assert!(matches!(result, Err(ShardingError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_table_name() {
        let result = ShardingConfig::from_toml("[tables]\nstate = \"bad name\"\n");
        assert!(result.is_err());
    }
}
