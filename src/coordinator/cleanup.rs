//! Backup retention: delete old backup manifests and the blobs only they
//! referenced.
//!
//! Runs under the cluster lock like any other long operation so it never
//! races a concurrent backup writing new manifests and blobs.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RetentionConfig;
use crate::coordinator::cluster::Cluster;
use crate::coordinator::plugins::OperationContext;
use crate::coordinator::steps::{boxed, DynStep, Step, StepError, StepsContext};
use crate::ipc::{BackupManifest, CleanupRequest, JSON_BACKUP_PREFIX};
use crate::storage::{HexDigestStorage, JsonStorage};

/// The cleanup pipeline.
pub fn cleanup_steps(
    context: &OperationContext,
    retention: &RetentionConfig,
    req: &CleanupRequest,
) -> Vec<Box<dyn DynStep>> {
    vec![
        boxed(ListBackupsStep { json_storage: context.json_storage.clone() }),
        boxed(ComputeKeptBackupsStep {
            retention: retention.clone(),
            explicit_delete: req.explicit_delete.clone(),
        }),
        boxed(DeleteBackupManifestsStep { json_storage: context.json_storage.clone() }),
        boxed(DeleteDanglingHexdigestsStep {
            json_storage: context.json_storage.clone(),
            hexdigest_storage: context.hexdigest_storage.clone(),
        }),
    ]
}

/// All stored backup manifest names, oldest first.
pub struct ListBackupsStep {
    pub json_storage: Arc<dyn JsonStorage>,
}

#[async_trait]
impl Step for ListBackupsStep {
    type Output = Vec<String>;

    async fn run_step(
        &self,
        _cluster: &Cluster,
        _context: &StepsContext,
    ) -> Result<Vec<String>, StepError> {
        let mut names: Vec<String> = self
            .json_storage
            .list_jsons()
            .await
            .map_err(|err| StepError::Failed(err.to_string()))?
            .into_iter()
            .filter(|name| name.starts_with(JSON_BACKUP_PREFIX))
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Decide which backups survive: drop the explicitly requested ones,
/// then cut the oldest until the retention cap holds.
pub struct ComputeKeptBackupsStep {
    pub retention: RetentionConfig,
    pub explicit_delete: Vec<String>,
}

#[async_trait]
impl Step for ComputeKeptBackupsStep {
    type Output = Vec<String>;

    async fn run_step(
        &self,
        _cluster: &Cluster,
        context: &StepsContext,
    ) -> Result<Vec<String>, StepError> {
        let explicit_delete: HashSet<String> = self
            .explicit_delete
            .iter()
            .map(|name| {
                if name.starts_with(JSON_BACKUP_PREFIX) {
                    name.clone()
                } else {
                    format!("{}{}", JSON_BACKUP_PREFIX, name)
                }
            })
            .collect();
        let mut kept: Vec<String> = context
            .get_result::<ListBackupsStep>()?
            .into_iter()
            .filter(|name| !explicit_delete.contains(name))
            .collect();
        if let Some(maximum_backups) = self.retention.maximum_backups {
            if kept.len() > maximum_backups {
                kept.drain(..kept.len() - maximum_backups);
            }
        }
        Ok(kept)
    }
}

/// Delete every listed manifest that is not kept.
pub struct DeleteBackupManifestsStep {
    pub json_storage: Arc<dyn JsonStorage>,
}

#[async_trait]
impl Step for DeleteBackupManifestsStep {
    type Output = usize;

    async fn run_step(
        &self,
        _cluster: &Cluster,
        context: &StepsContext,
    ) -> Result<usize, StepError> {
        let all = context.get_result::<ListBackupsStep>()?;
        let kept: HashSet<String> = context.get_result::<ComputeKeptBackupsStep>()?.into_iter().collect();
        let mut deleted = 0;
        for name in all {
            if kept.contains(&name) {
                continue;
            }
            log::info!("deleting backup manifest {}", name);
            self.json_storage
                .delete_json(&name)
                .await
                .map_err(|err| StepError::Failed(err.to_string()))?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

/// Delete blobs no surviving manifest references.
pub struct DeleteDanglingHexdigestsStep {
    pub json_storage: Arc<dyn JsonStorage>,
    pub hexdigest_storage: Arc<dyn HexDigestStorage>,
}

#[async_trait]
impl Step for DeleteDanglingHexdigestsStep {
    type Output = usize;

    async fn run_step(
        &self,
        _cluster: &Cluster,
        context: &StepsContext,
    ) -> Result<usize, StepError> {
        let kept = context.get_result::<ComputeKeptBackupsStep>()?;
        let mut referenced: HashSet<String> = HashSet::new();
        for name in &kept {
            let value = self
                .json_storage
                .download_json(name)
                .await
                .map_err(|err| StepError::Failed(err.to_string()))?;
            let manifest: BackupManifest = serde_json::from_value(value)
                .map_err(|err| StepError::Failed(format!("invalid manifest {}: {}", name, err)))?;
            for snapshot_result in &manifest.snapshot_results {
                for file in &snapshot_result.state.files {
                    if !file.hexdigest.is_empty() {
                        referenced.insert(file.hexdigest.clone());
                    }
                }
                for hash in &snapshot_result.hashes {
                    referenced.insert(hash.hexdigest.clone());
                }
            }
        }
        let mut deleted = 0;
        for hexdigest in self
            .hexdigest_storage
            .list_hexdigests()
            .await
            .map_err(|err| StepError::Failed(err.to_string()))?
        {
            if referenced.contains(&hexdigest) {
                continue;
            }
            log::info!("deleting dangling hexdigest {}", hexdigest);
            self.hexdigest_storage
                .delete_hexdigest(&hexdigest)
                .await
                .map_err(|err| StepError::Failed(err.to_string()))?;
            deleted += 1;
        }
        Ok(deleted)
    }
}
