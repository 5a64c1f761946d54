//! Coordinator configuration.
//!
//! The configuration is one JSON document, read once at startup. Node
//! descriptors are immutable after load; their order is significant, the
//! i-th coordinator node fronts the i-th database server.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

/// One remote node agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorNode {
    pub url: String,
    /// Availability zone, empty when the deployment has none.
    #[serde(default)]
    pub az: String,
}

/// Polling behaviour while waiting for node sub-operations; see
/// `Cluster::wait_successful_results`. Times are in seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollConfig {
    pub delay_start: f64,
    pub delay_multiplier: f64,
    pub delay_max: f64,
    /// Total wall-clock budget of one wait.
    pub duration: f64,
    /// Consecutive unanswered polls tolerated per node.
    pub maximum_failures: u32,
    /// Timeout of one status poll.
    pub result_timeout: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            delay_start: 0.1,
            delay_multiplier: 2.0,
            delay_max: 60.0,
            duration: 86400.0,
            maximum_failures: 5,
            result_timeout: 10.0,
        }
    }
}

/// Backup manifest retention applied by the cleanup operation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Keep at most this many backups, dropping the oldest first.
    #[serde(default)]
    pub maximum_backups: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsdConfig {
    pub host: String,
    pub port: u16,
}

/// Where backup manifests and deduplicated blobs live.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local directory tree, mainly for development and tests. Manifests
    /// go under `json/`, blobs under `hexdigest/`.
    Directory { path: PathBuf },
    /// Process-local memory, lost on restart.
    Memory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum PluginConfig {
    /// Plain file tree backup; snapshots everything matching `root_globs`.
    Files { root_globs: Vec<String> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Address the HTTP API binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// URL under which the node agents can reach this coordinator; used
    /// to build status and sub-result URLs handed out to clients and
    /// nodes.
    #[serde(default = "default_coordinator_url")]
    pub coordinator_url: String,
    pub nodes: Vec<CoordinatorNode>,
    #[serde(default)]
    pub poll: PollConfig,
    /// Name of the object storage configuration, echoed to node agents in
    /// upload and download requests.
    #[serde(default = "default_storage_name")]
    pub storage_name: String,
    pub object_storage: StorageConfig,
    pub plugin: PluginConfig,
    /// Seconds a cached list response stays valid.
    #[serde(default = "default_list_ttl")]
    pub list_ttl: f64,
    /// TTL in seconds of the cluster lock taken by long operations.
    #[serde(default = "default_lock_ttl")]
    pub default_lock_ttl: u64,
    #[serde(default = "default_attempts")]
    pub backup_attempts: u32,
    #[serde(default = "default_attempts")]
    pub restore_attempts: u32,
    /// Seconds to wait between attempts after a transient failure.
    #[serde(default = "default_attempt_retry_wait")]
    pub attempt_retry_wait: f64,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub statsd: Option<StatsdConfig>,
}

fn default_bind_address() -> String {
    "127.0.0.1:5515".to_string()
}

fn default_coordinator_url() -> String {
    "http://127.0.0.1:5515".to_string()
}

fn default_storage_name() -> String {
    "default".to_string()
}

fn default_list_ttl() -> f64 {
    600.0
}

fn default_lock_ttl() -> u64 {
    600
}

fn default_attempts() -> u32 {
    5
}

fn default_attempt_retry_wait() -> f64 {
    5.0
}

impl CoordinatorConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<CoordinatorConfig, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| format_err!("unable to read {:?} - {}", path, err))?;
        let config: CoordinatorConfig = serde_json::from_str(&contents)
            .map_err(|err| format_err!("unable to parse {:?} - {}", path, err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.nodes.is_empty() {
            bail!("no nodes configured");
        }
        for node in &self.nodes {
            url::Url::parse(&node.url)
                .with_context(|| format!("invalid node url {:?}", node.url))?;
        }
        if self.default_lock_ttl < 2 {
            bail!("default_lock_ttl must be at least 2 seconds");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: CoordinatorConfig = serde_json::from_str(
            r#"{
                "nodes": [{"url": "http://10.0.0.1:5516"}, {"url": "http://10.0.0.2:5516", "az": "az-1"}],
                "object_storage": {"type": "memory"},
                "plugin": {"name": "files", "root_globs": ["**/*"]}
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].az, "");
        assert_eq!(config.nodes[1].az, "az-1");
        assert_eq!(config.storage_name, "default");
        assert_eq!(config.backup_attempts, 5);
        assert!((config.poll.delay_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_rejects_bad_node_url() {
        let config: CoordinatorConfig = serde_json::from_str(
            r#"{
                "nodes": [{"url": "not a url"}],
                "object_storage": {"type": "memory"},
                "plugin": {"name": "files", "root_globs": []}
            }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_empty_node_set() {
        let config: CoordinatorConfig = serde_json::from_str(
            r#"{
                "nodes": [],
                "object_storage": {"type": "memory"},
                "plugin": {"name": "files", "root_globs": []}
            }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
