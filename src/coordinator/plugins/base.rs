//! Generic steps shared by all plugins, plus the placement policies:
//! deduplicated upload distribution for backup and node-to-snapshot
//! assignment for restore.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error as ThisError;

use crate::config::CoordinatorNode;
use crate::coordinator::cluster::{Cluster, NodeCallResult};
use crate::coordinator::steps::{Step, StepError, StepsContext};
use crate::ipc::{
    BackupManifest, NodeResult, PartialRestoreRequestNode, Plugin, SnapshotClearRequest,
    SnapshotDownloadRequest, SnapshotHash, SnapshotRequest, SnapshotResult, SnapshotUploadRequest,
    SnapshotUploadResult, JSON_BACKUP_PREFIX,
};
use crate::storage::{HexDigestStorage, JsonStorage};

/// Ask every node for a snapshot of the files matching `root_globs` and
/// wait for all of them.
///
/// Each per-node snapshot lists relative path, size, mtime and hash of
/// every matched file; see `SnapshotFile`.
pub struct SnapshotStep {
    pub root_globs: Vec<String>,
}

#[async_trait]
impl Step for SnapshotStep {
    type Output = Vec<SnapshotResult>;

    async fn run_step(
        &self,
        cluster: &Cluster,
        _context: &StepsContext,
    ) -> Result<Vec<SnapshotResult>, StepError> {
        let req = SnapshotRequest { root_globs: self.root_globs.clone(), ..Default::default() };
        let start_results = cluster.request_from_nodes("snapshot", "SnapshotStep", &req, None).await;
        let required = start_results.len();
        Ok(cluster.wait_successful_results(&start_results, Some(required)).await?)
    }
}

/// Fetch the digests of all blobs already present in object storage.
pub struct ListHexdigestsStep {
    pub hexdigest_storage: Arc<dyn HexDigestStorage>,
}

#[async_trait]
impl Step for ListHexdigestsStep {
    type Output = HashSet<String>;

    async fn run_step(
        &self,
        _cluster: &Cluster,
        _context: &StepsContext,
    ) -> Result<HashSet<String>, StepError> {
        let hexdigests = self
            .hexdigest_storage
            .list_hexdigests()
            .await
            .map_err(|err| StepError::Failed(err.to_string()))?;
        Ok(hexdigests.into_iter().collect())
    }
}

/// Upload every blob that is not yet in object storage.
///
/// Blobs present on several nodes are uploaded by exactly one of them;
/// see [`build_node_index_datas`] for how the work is spread.
pub struct UploadBlocksStep {
    pub storage_name: String,
}

#[async_trait]
impl Step for UploadBlocksStep {
    type Output = Vec<SnapshotUploadResult>;

    async fn run_step(
        &self,
        cluster: &Cluster,
        context: &StepsContext,
    ) -> Result<Vec<SnapshotUploadResult>, StepError> {
        let hexdigests = context.get_result::<ListHexdigestsStep>()?;
        let snapshots = context.get_result::<SnapshotStep>()?;
        let node_indices: Vec<usize> = (0..cluster.nodes().len()).collect();
        let node_index_datas = build_node_index_datas(&hexdigests, &snapshots, &node_indices);

        let mut start_results: Vec<NodeCallResult> = Vec::new();
        for data in &node_index_datas {
            let req = SnapshotUploadRequest {
                hashes: data.sshashes.clone(),
                storage: self.storage_name.clone(),
                ..Default::default()
            };
            let node = &cluster.nodes()[data.node_index];
            let mut start_result = cluster
                .request_from_nodes("upload", "UploadBlocksStep", &req, Some(std::slice::from_ref(node)))
                .await;
            if start_result.len() != 1 {
                return Err(StepError::Failed("upload failed".to_string()));
            }
            start_results.append(&mut start_result);
        }
        Ok(cluster.wait_successful_results(&start_results, None).await?)
    }
}

/// Persist the cluster wide backup manifest, finishing the backup.
pub struct UploadManifestStep {
    pub json_storage: Arc<dyn JsonStorage>,
    pub plugin: Plugin,
    /// Plugin specific manifest payload pulled from an earlier step, if
    /// the plugin has one.
    pub plugin_data: Option<Box<dyn Fn(&StepsContext) -> Result<Value, StepError> + Send + Sync>>,
}

#[async_trait]
impl Step for UploadManifestStep {
    type Output = ();

    async fn run_step(&self, _cluster: &Cluster, context: &StepsContext) -> Result<(), StepError> {
        let plugin_data = match &self.plugin_data {
            Some(provider) => provider(context)?,
            None => Value::Object(Default::default()),
        };
        let manifest = BackupManifest {
            attempt: context.attempt,
            start: context.attempt_start,
            snapshot_results: context.get_result::<SnapshotStep>()?,
            upload_results: context.get_result::<UploadBlocksStep>()?,
            plugin: self.plugin,
            plugin_data,
        };
        let name = context.backup_name();
        log::debug!("storing backup manifest {}", name);
        let value = serde_json::to_value(&manifest)
            .map_err(|err| StepError::Internal(err.to_string()))?;
        self.json_storage
            .upload_json(&name, &value)
            .await
            .map_err(|err| StepError::Failed(err.to_string()))
    }
}

/// Pick the backup to restore: the requested one, or the newest stored
/// one when the request does not name any.
pub struct BackupNameStep {
    pub json_storage: Arc<dyn JsonStorage>,
    pub requested_name: String,
}

#[async_trait]
impl Step for BackupNameStep {
    type Output = String;

    async fn run_step(&self, _cluster: &Cluster, _context: &StepsContext) -> Result<String, StepError> {
        if !self.requested_name.is_empty() {
            if self.requested_name.starts_with(JSON_BACKUP_PREFIX) {
                return Ok(self.requested_name.clone());
            }
            return Ok(format!("{}{}", JSON_BACKUP_PREFIX, self.requested_name));
        }
        let mut names: Vec<String> = self
            .json_storage
            .list_jsons()
            .await
            .map_err(|err| StepError::Failed(err.to_string()))?
            .into_iter()
            .filter(|name| name.starts_with(JSON_BACKUP_PREFIX))
            .collect();
        names.sort();
        names.pop().ok_or_else(|| StepError::Failed("no backups available".to_string()))
    }
}

/// Download and decode the manifest of the chosen backup.
pub struct BackupManifestStep {
    pub json_storage: Arc<dyn JsonStorage>,
}

#[async_trait]
impl Step for BackupManifestStep {
    type Output = BackupManifest;

    async fn run_step(
        &self,
        _cluster: &Cluster,
        context: &StepsContext,
    ) -> Result<BackupManifest, StepError> {
        let backup_name = context.get_result::<BackupNameStep>()?;
        let value = self
            .json_storage
            .download_json(&backup_name)
            .await
            .map_err(|err| StepError::Failed(err.to_string()))?;
        serde_json::from_value(value)
            .map_err(|err| StepError::Failed(format!("invalid manifest {}: {}", backup_name, err)))
    }
}

/// Fan out downloads (and clears, for nodes left without data) according
/// to the restore placement, then wait for all of them.
pub struct RestoreStep {
    pub storage_name: String,
    pub partial_restore_nodes: Vec<PartialRestoreRequestNode>,
}

#[async_trait]
impl Step for RestoreStep {
    type Output = Vec<NodeResult>;

    async fn run_step(
        &self,
        cluster: &Cluster,
        context: &StepsContext,
    ) -> Result<Vec<NodeResult>, StepError> {
        let backup_name = context.get_result::<BackupNameStep>()?;
        let manifest = context.get_result::<BackupManifestStep>()?;
        let snapshot_results = &manifest.snapshot_results;
        if snapshot_results.is_empty() {
            return Err(StepError::Failed(format!(
                "backup {} contains no snapshots",
                backup_name
            )));
        }

        let node_to_backup_index = get_node_to_backup_index(
            &self.partial_restore_nodes,
            snapshot_results,
            cluster.nodes(),
        )
        .map_err(|err| StepError::Failed(err.to_string()))?;

        let mut start_results: Vec<NodeCallResult> = Vec::new();
        for (node, backup_index) in cluster.nodes().iter().zip(node_to_backup_index.iter()) {
            let target = std::slice::from_ref(node);
            let mut start_result = match backup_index {
                Some(backup_index) => {
                    let req = SnapshotDownloadRequest {
                        storage: self.storage_name.clone(),
                        backup_name: backup_name.clone(),
                        snapshot_index: *backup_index,
                        root_globs: snapshot_results[*backup_index].state.root_globs.clone(),
                        ..Default::default()
                    };
                    cluster.request_from_nodes("download", "RestoreStep", &req, Some(target)).await
                }
                // On partial restore, leave the unnamed nodes alone.
                None if !self.partial_restore_nodes.is_empty() => continue,
                None => {
                    let req = SnapshotClearRequest {
                        root_globs: snapshot_results[0].state.root_globs.clone(),
                        ..Default::default()
                    };
                    cluster.request_from_nodes("clear", "RestoreStep", &req, Some(target)).await
                }
            };
            if start_result.len() != 1 {
                return Err(StepError::Failed("restore failed to start on a node".to_string()));
            }
            start_results.append(&mut start_result);
        }
        Ok(cluster.wait_successful_results(&start_results, None).await?)
    }
}

/// Upload work assigned to one node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeIndexData {
    pub node_index: usize,
    pub sshashes: Vec<SnapshotHash>,
    pub total_size: u64,
}

impl NodeIndexData {
    fn new(node_index: usize) -> NodeIndexData {
        NodeIndexData { node_index, ..Default::default() }
    }

    fn append_sshash(&mut self, sshash: SnapshotHash) {
        self.total_size += sshash.size;
        self.sshashes.push(sshash);
    }
}

/// Decide which node uploads which blob.
///
/// Digests already in storage are skipped. The rest are handed out
/// rarest first (fewest nodes have it), largest first within the same
/// rarity, each to the least loaded node that has the blob, lowest node
/// index on ties. Nodes that end up with nothing are omitted. The whole
/// procedure is deterministic for a given input.
pub fn build_node_index_datas(
    hexdigests: &HashSet<String>,
    snapshots: &[SnapshotResult],
    node_indices: &[usize],
) -> Vec<NodeIndexData> {
    assert_eq!(snapshots.len(), node_indices.len());
    // Map each hash to the nodes that have it, preserving first-seen
    // hash order and node order so the result is stable.
    let mut order: Vec<&SnapshotHash> = Vec::new();
    let mut sshash_to_node_indexes: HashMap<&SnapshotHash, Vec<usize>> = HashMap::new();
    for (i, snapshot_result) in snapshots.iter().enumerate() {
        for snapshot_hash in &snapshot_result.hashes {
            let indexes = sshash_to_node_indexes.entry(snapshot_hash).or_insert_with(|| {
                order.push(snapshot_hash);
                Vec::new()
            });
            indexes.push(i);
        }
    }

    let mut node_index_datas: Vec<NodeIndexData> =
        node_indices.iter().map(|&node_index| NodeIndexData::new(node_index)).collect();

    let mut todo: Vec<(&SnapshotHash, &Vec<usize>)> =
        order.iter().map(|sshash| (*sshash, &sshash_to_node_indexes[sshash])).collect();
    todo.sort_by_key(|(sshash, indexes)| (indexes.len(), std::cmp::Reverse(sshash.size)));

    for (snapshot_hash, node_indexes) in todo {
        if hexdigests.contains(&snapshot_hash.hexdigest) {
            continue;
        }
        let chosen = match node_indexes.iter().map(|&i| (node_index_datas[i].total_size, i)).min() {
            Some((_, i)) => i,
            None => continue,
        };
        node_index_datas[chosen].append_sshash(snapshot_hash.clone());
    }
    node_index_datas.into_iter().filter(|data| !data.sshashes.is_empty()).collect()
}

#[derive(Debug, ThisError)]
pub enum PlacementError {
    #[error("{0} node(s) missing - unable to restore backup")]
    InsufficientNodes(usize),
    #[error("{0} az(s) missing - unable to restore backup")]
    InsufficientAZs(usize),
    #[error("AZ {node_az}, to be restored from {backup_az}, is missing {missing} nodes")]
    InsufficientNodesInAZ { node_az: String, backup_az: String, missing: usize },
    #[error("{0}")]
    NotFound(String),
}

/// Assign backup snapshot indices to coordinator nodes for restore.
///
/// An explicit partial-restore list wins; otherwise snapshots are matched
/// to nodes availability zone by availability zone, pairing zones by
/// descending population.
pub fn get_node_to_backup_index(
    partial_restore_nodes: &[PartialRestoreRequestNode],
    snapshot_results: &[SnapshotResult],
    nodes: &[CoordinatorNode],
) -> Result<Vec<Option<usize>>, PlacementError> {
    if !partial_restore_nodes.is_empty() {
        return get_node_to_backup_index_from_partial_restore_nodes(
            partial_restore_nodes,
            snapshot_results,
            nodes,
        );
    }
    let covered_nodes = snapshot_results.len();
    let configured_nodes = nodes.len();
    if configured_nodes < covered_nodes {
        return Err(PlacementError::InsufficientNodes(covered_nodes - configured_nodes));
    }

    let azs_in_backup = az_counts(snapshot_results.iter().map(|result| result.az.as_str()));
    let azs_in_nodes = az_counts(nodes.iter().map(|node| node.az.as_str()));
    if azs_in_backup.len() > azs_in_nodes.len() {
        return Err(PlacementError::InsufficientAZs(azs_in_backup.len() - azs_in_nodes.len()));
    }

    let mut node_to_backup_index: Vec<Option<usize>> = vec![None; nodes.len()];
    for ((backup_az, backup_n), (node_az, node_n)) in azs_in_backup.iter().zip(azs_in_nodes.iter()) {
        if backup_n > node_n {
            return Err(PlacementError::InsufficientNodesInAZ {
                node_az: node_az.clone(),
                backup_az: backup_az.clone(),
                missing: backup_n - node_n,
            });
        }
        for (backup_index, snapshot_result) in snapshot_results.iter().enumerate() {
            if snapshot_result.az != *backup_az {
                continue;
            }
            for (node_index, node) in nodes.iter().enumerate() {
                if node.az != *node_az || node_to_backup_index[node_index].is_some() {
                    continue;
                }
                node_to_backup_index[node_index] = Some(backup_index);
                break;
            }
        }
    }
    Ok(node_to_backup_index)
}

fn get_node_to_backup_index_from_partial_restore_nodes(
    partial_restore_nodes: &[PartialRestoreRequestNode],
    snapshot_results: &[SnapshotResult],
    nodes: &[CoordinatorNode],
) -> Result<Vec<Option<usize>>, PlacementError> {
    let mut node_to_backup_index: Vec<Option<usize>> = vec![None; nodes.len()];
    let url_to_node_index: HashMap<&str, usize> =
        nodes.iter().enumerate().map(|(i, node)| (node.url.as_str(), i)).collect();
    let hostname_to_backup_index: HashMap<&str, usize> = snapshot_results
        .iter()
        .enumerate()
        .map(|(i, result)| (result.hostname.as_str(), i))
        .collect();

    for req_node in partial_restore_nodes {
        let node_index = match req_node.node_index {
            Some(node_index) => {
                if node_index >= nodes.len() {
                    return Err(PlacementError::NotFound(format!(
                        "invalid node_index in partial restore: must be 0 <= {} < {}",
                        node_index,
                        nodes.len()
                    )));
                }
                node_index
            }
            None => {
                let node_url = req_node.node_url.as_deref().unwrap_or("");
                *url_to_node_index.get(node_url).ok_or_else(|| {
                    PlacementError::NotFound(format!(
                        "partial restore url {} not found in active configuration",
                        node_url
                    ))
                })?
            }
        };
        let backup_index = match req_node.backup_index {
            Some(backup_index) => {
                if backup_index >= snapshot_results.len() {
                    return Err(PlacementError::NotFound(format!(
                        "invalid backup_index in partial restore: must be 0 <= {} < {}",
                        backup_index,
                        snapshot_results.len()
                    )));
                }
                backup_index
            }
            None => {
                let backup_hostname = req_node.backup_hostname.as_deref().unwrap_or("");
                *hostname_to_backup_index.get(backup_hostname).ok_or_else(|| {
                    PlacementError::NotFound(format!(
                        "partial restore hostname {} not found in backup manifest",
                        backup_hostname
                    ))
                })?
            }
        };
        node_to_backup_index[node_index] = Some(backup_index);
    }
    Ok(node_to_backup_index)
}

/// Occurrence counts per availability zone, most populous first; zones
/// with equal population stay in first-seen order.
fn az_counts<'a, I: Iterator<Item = &'a str>>(azs: I) -> Vec<(String, usize)> {
    let mut order: Vec<&str> = Vec::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for az in azs {
        let count = counts.entry(az).or_insert_with(|| {
            order.push(az);
            0
        });
        *count += 1;
    }
    let mut result: Vec<(String, usize)> =
        order.into_iter().map(|az| (az.to_string(), counts[az])).collect();
    result.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
    result
}
