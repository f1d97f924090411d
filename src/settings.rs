use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub writer: ShardWriterConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    /// Cluster-visible address of this node, recorded as shard owner.
    #[serde(default = "default_node_address")]
    pub address: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: default_node_address(),
        }
    }
}

fn default_node_address() -> String {
    "127.0.0.1:11811".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// etcd endpoints; ignored by the memory backend.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Key namespace shared by every node of one cluster.
    #[serde(default = "default_cluster_prefix")]
    pub cluster_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoints: Vec::new(),
            cluster_prefix: default_cluster_prefix(),
        }
    }
}

fn default_cluster_prefix() -> String {
    "timeshard".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Etcd,
}

/// Tuning for a shard's background batching writer.
#[derive(Debug, Deserialize, Clone)]
pub struct ShardWriterConfig {
    /// Upper bound on job operations committed in one log append.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Below this batch size the writer lingers for `flush_interval_ms`
    /// hoping to coalesce more operations.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Bound on waiting for the writer task to exit during shutdown.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl ShardWriterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for ShardWriterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            min_batch_size: default_min_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

fn default_max_batch_size() -> usize {
    128
}

fn default_min_batch_size() -> usize {
    8
}

fn default_flush_interval_ms() -> u64 {
    10
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ManagerConfig {
    /// Bound on regenerate-and-retry rounds when a freshly minted shard id
    /// collides with an existing one.
    #[serde(default = "default_max_create_attempts")]
    pub max_create_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_create_attempts: default_max_create_attempts(),
        }
    }
}

fn default_max_create_attempts() -> u32 {
    10
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_missing_sections() {
        let cfg: AppConfig = toml::from_str("[node]\naddress = \"10.1.1.1:4000\"\n").unwrap();
        assert_eq!(cfg.node.address, "10.1.1.1:4000");
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.writer.max_batch_size, 128);
        assert_eq!(cfg.manager.max_create_attempts, 10);
    }

    #[test]
    fn etcd_backend_parses_lowercase() {
        let cfg: AppConfig = toml::from_str(
            "[store]\nbackend = \"etcd\"\nendpoints = [\"http://127.0.0.1:2379\"]\n",
        )
        .unwrap();
        assert_eq!(cfg.store.backend, StoreBackend::Etcd);
        assert_eq!(cfg.store.endpoints.len(), 1);
    }
}
