//! Database plugins.
//!
//! A plugin contributes the ordered step lists that make up a backup or a
//! restore; everything else (locking, polling, retries, manifest
//! persistence) is generic machinery the steps ride on. Plugins never
//! talk to the cluster or the registry directly, only through steps.

use std::sync::Arc;

use anyhow::Error;

use crate::config::PluginConfig;
use crate::coordinator::steps::DynStep;
use crate::ipc::{Plugin, RestoreRequest};
use crate::storage::{HexDigestStorage, JsonStorage};

pub mod base;
pub mod files;

/// Storage handles a plugin may wire into its steps.
#[derive(Clone)]
pub struct OperationContext {
    pub storage_name: String,
    pub json_storage: Arc<dyn JsonStorage>,
    pub hexdigest_storage: Arc<dyn HexDigestStorage>,
}

pub trait CoordinatorPlugin: Send + Sync {
    /// Tag recorded in backup manifests produced with this plugin.
    fn plugin(&self) -> Plugin;

    fn backup_steps(&self, context: &OperationContext) -> Result<Vec<Box<dyn DynStep>>, Error>;

    /// Build the restore pipeline. A plugin that cannot serve parts of
    /// the request (for instance partial restore) must refuse here, so
    /// the operation fails as unsupported instead of degrading silently.
    fn restore_steps(
        &self,
        context: &OperationContext,
        req: &RestoreRequest,
    ) -> Result<Vec<Box<dyn DynStep>>, Error>;
}

pub fn build_plugin(config: &PluginConfig) -> Arc<dyn CoordinatorPlugin> {
    match config {
        PluginConfig::Files { root_globs } => {
            Arc::new(files::FilesPlugin { root_globs: root_globs.clone() })
        }
    }
}
