//! Building the backup listing served by `GET /list`.

use anyhow::{format_err, Error};
use std::sync::Arc;

use crate::ipc::{
    BackupManifest, ListForStorage, ListResponse, ListSingleBackup, JSON_BACKUP_PREFIX,
};
use crate::storage::JsonStorage;

/// Summarize every stored backup manifest. This downloads each manifest,
/// which is why the result is cached by the coordinator.
pub async fn compute_list_response(
    storage_name: &str,
    json_storage: &Arc<dyn JsonStorage>,
) -> Result<ListResponse, Error> {
    let mut names: Vec<String> = json_storage
        .list_jsons()
        .await?
        .into_iter()
        .filter(|name| name.starts_with(JSON_BACKUP_PREFIX))
        .collect();
    names.sort();

    let mut backups = Vec::with_capacity(names.len());
    for name in names {
        let value = json_storage.download_json(&name).await?;
        let manifest: BackupManifest = serde_json::from_value(value)
            .map_err(|err| format_err!("invalid manifest {}: {}", name, err))?;
        backups.push(summarize(&name, &manifest));
    }
    Ok(ListResponse {
        storages: vec![ListForStorage { storage_name: storage_name.to_string(), backups }],
    })
}

fn summarize(name: &str, manifest: &BackupManifest) -> ListSingleBackup {
    let files = manifest
        .snapshot_results
        .iter()
        .map(|result| result.state.files.len())
        .sum();
    let total_size = manifest
        .snapshot_results
        .iter()
        .flat_map(|result| result.state.files.iter())
        .map(|file| file.file_size)
        .sum();
    ListSingleBackup {
        name: name.trim_start_matches(JSON_BACKUP_PREFIX).to_string(),
        start: manifest.start,
        plugin: manifest.plugin,
        attempt: manifest.attempt,
        nodes: manifest.snapshot_results.len(),
        files,
        total_size,
        upload_size: manifest.upload_results.iter().map(|result| result.total_size).sum(),
        upload_stored_size: manifest
            .upload_results
            .iter()
            .map(|result| result.total_stored_size)
            .sum(),
    }
}
