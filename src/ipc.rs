//! Wire types shared between the coordinator and the node agents, plus the
//! JSON documents persisted in object storage.
//!
//! Node agents are external processes; everything they exchange with the
//! coordinator is declared here so the protocol is visible in one place.
//! All types are plain serde records. Unknown fields are ignored and most
//! fields carry defaults, so old coordinators tolerate newer agents.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::progress::Progress;

/// Name prefix of backup manifests in the JSON document storage.
///
/// The rest of the name is the attempt start time as UTC ISO-8601 with
/// second precision, so sorting names lexicographically sorts backups
/// chronologically.
pub const JSON_BACKUP_PREFIX: &str = "backup-";

/// Compose a backup manifest name from the attempt start time.
pub fn backup_name(start: DateTime<Utc>) -> String {
    format!(
        "{}{}",
        JSON_BACKUP_PREFIX,
        start.to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
    )
}

/// Database plugin tag carried in the backup manifest.
///
/// The full set of known plugins is declared even though not all of them
/// are implemented here, so that manifests written by other deployments
/// still parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plugin {
    Cassandra,
    Clickhouse,
    Files,
    Flink,
    M3db,
}

/// What a node agent returns when asked to start an asynchronous
/// sub-operation; the coordinator polls `status_url` to completion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpStartResult {
    pub op_id: u64,
    pub status_url: String,
}

/// Request body fields common to all node sub-operation starts.
///
/// `result_url` is filled in by the cluster client when the coordinator
/// wants the node to push non-authoritative completion hints back.
pub trait NodeRequest: Serialize + Clone + Send + Sync {
    fn set_result_url(&mut self, url: String);
}

macro_rules! impl_node_request {
    ($($t:ty),*) => {
        $(impl NodeRequest for $t {
            fn set_result_url(&mut self, url: String) {
                self.result_url = url;
            }
        })*
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotRequest {
    #[serde(default)]
    pub result_url: String,
    pub root_globs: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotUploadRequest {
    #[serde(default)]
    pub result_url: String,
    pub hashes: Vec<SnapshotHash>,
    pub storage: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotDownloadRequest {
    #[serde(default)]
    pub result_url: String,
    pub storage: String,
    pub backup_name: String,
    pub snapshot_index: usize,
    pub root_globs: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotClearRequest {
    #[serde(default)]
    pub result_url: String,
    pub root_globs: Vec<String>,
}

impl_node_request!(
    SnapshotRequest,
    SnapshotUploadRequest,
    SnapshotDownloadRequest,
    SnapshotClearRequest
);

/// Result documents served by a node's sub-operation status URL.
pub trait NodeOpResult: DeserializeOwned + Send + 'static {
    fn progress(&self) -> &Progress;
}

/// Generic node result without operation specific payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeResult {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub az: String,
    #[serde(default)]
    pub progress: Progress,
}

impl NodeOpResult for NodeResult {
    fn progress(&self) -> &Progress {
        &self.progress
    }
}

/// One file in a node snapshot.
///
/// Files large enough to be worth deduplicating carry a `hexdigest` and are
/// stored in the digest-addressed blob storage; tiny files are embedded
/// into the manifest as base64.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub relative_path: String,
    pub file_size: u64,
    pub mtime_ns: i64,
    #[serde(default)]
    pub hexdigest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_b64: Option<String>,
}

/// Digest plus size of one deduplicated blob.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotHash {
    pub hexdigest: String,
    pub size: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotState {
    #[serde(default)]
    pub root_globs: Vec<String>,
    #[serde(default)]
    pub files: Vec<SnapshotFile>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotResult {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub az: String,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub state: SnapshotState,
    #[serde(default)]
    pub hashes: Vec<SnapshotHash>,
    #[serde(default)]
    pub files: u64,
    #[serde(default)]
    pub total_size: u64,
}

impl NodeOpResult for SnapshotResult {
    fn progress(&self) -> &Progress {
        &self.progress
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotUploadResult {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub az: String,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_stored_size: u64,
}

impl NodeOpResult for SnapshotUploadResult {
    fn progress(&self) -> &Progress {
        &self.progress
    }
}

/// The cluster wide backup document persisted in JSON storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupManifest {
    pub attempt: u32,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub snapshot_results: Vec<SnapshotResult>,
    #[serde(default)]
    pub upload_results: Vec<SnapshotUploadResult>,
    pub plugin: Plugin,
    #[serde(default)]
    pub plugin_data: Value,
}

/// Pin one coordinator node to one backup snapshot during partial restore.
///
/// Either member of each pair may be used; indexes win over names.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartialRestoreRequestNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_hostname: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub storage: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RestoreRequest {
    #[serde(default)]
    pub storage: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub partial_restore_nodes: Vec<PartialRestoreRequestNode>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub storage: String,
    #[serde(default)]
    pub explicit_delete: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListSingleBackup {
    /// Backup name without the [`JSON_BACKUP_PREFIX`].
    pub name: String,
    pub start: DateTime<Utc>,
    pub plugin: Plugin,
    pub attempt: u32,
    pub nodes: usize,
    pub files: usize,
    pub total_size: u64,
    pub upload_size: u64,
    pub upload_stored_size: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListForStorage {
    pub storage_name: String,
    pub backups: Vec<ListSingleBackup>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListResponse {
    pub storages: Vec<ListForStorage>,
}
