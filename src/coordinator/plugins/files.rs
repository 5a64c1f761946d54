//! Plain file tree plugin.
//!
//! No database coordination at all: snapshot whatever matches the
//! configured root globs on every node, deduplicate, upload, done. Also
//! the reference consumer of the generic step set.

use anyhow::Error;

use crate::coordinator::plugins::base::{
    BackupManifestStep, BackupNameStep, ListHexdigestsStep, RestoreStep, SnapshotStep,
    UploadBlocksStep, UploadManifestStep,
};
use crate::coordinator::plugins::{CoordinatorPlugin, OperationContext};
use crate::coordinator::steps::{boxed, DynStep};
use crate::ipc::{Plugin, RestoreRequest};

pub struct FilesPlugin {
    pub root_globs: Vec<String>,
}

impl CoordinatorPlugin for FilesPlugin {
    fn plugin(&self) -> Plugin {
        Plugin::Files
    }

    fn backup_steps(&self, context: &OperationContext) -> Result<Vec<Box<dyn DynStep>>, Error> {
        Ok(vec![
            boxed(SnapshotStep { root_globs: self.root_globs.clone() }),
            boxed(ListHexdigestsStep { hexdigest_storage: context.hexdigest_storage.clone() }),
            boxed(UploadBlocksStep { storage_name: context.storage_name.clone() }),
            boxed(UploadManifestStep {
                json_storage: context.json_storage.clone(),
                plugin: Plugin::Files,
                plugin_data: None,
            }),
        ])
    }

    fn restore_steps(
        &self,
        context: &OperationContext,
        req: &RestoreRequest,
    ) -> Result<Vec<Box<dyn DynStep>>, Error> {
        Ok(vec![
            boxed(BackupNameStep {
                json_storage: context.json_storage.clone(),
                requested_name: req.name.clone(),
            }),
            boxed(BackupManifestStep { json_storage: context.json_storage.clone() }),
            boxed(RestoreStep {
                storage_name: context.storage_name.clone(),
                partial_restore_nodes: req.partial_restore_nodes.clone(),
            }),
        ])
    }
}
