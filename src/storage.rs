//! Object storage access as seen by the coordinator.
//!
//! The coordinator itself only touches two corners of object storage: the
//! JSON document namespace holding backup manifests, and the listing and
//! deletion side of the digest-addressed blob namespace. Actual blob
//! upload and download happens on the nodes, so those calls are not here.
//!
//! Two backends are provided: a local directory tree (development, tests,
//! network filesystems) and a process-local memory store (tests).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Error};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::StorageConfig;

#[async_trait]
pub trait JsonStorage: Send + Sync {
    async fn list_jsons(&self) -> Result<Vec<String>, Error>;
    async fn download_json(&self, name: &str) -> Result<Value, Error>;
    async fn upload_json(&self, name: &str, value: &Value) -> Result<(), Error>;
    async fn delete_json(&self, name: &str) -> Result<(), Error>;
}

#[async_trait]
pub trait HexDigestStorage: Send + Sync {
    async fn list_hexdigests(&self) -> Result<Vec<String>, Error>;
    async fn delete_hexdigest(&self, hexdigest: &str) -> Result<(), Error>;
}

pub fn build_storage(
    config: &StorageConfig,
) -> Result<(Arc<dyn JsonStorage>, Arc<dyn HexDigestStorage>), Error> {
    match config {
        StorageConfig::Directory { path } => {
            let storage = Arc::new(DirectoryStorage::new(path.clone()));
            Ok((storage.clone(), storage))
        }
        StorageConfig::Memory => {
            let storage = Arc::new(MemoryStorage::new());
            Ok((storage.clone(), storage))
        }
    }
}

// Storage names come straight from client requests; keep them to one path
// component.
fn check_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        bail!("invalid storage object name {:?}", name);
    }
    Ok(())
}

/// Local directory backend. JSON documents live under `json/`, blobs
/// under `hexdigest/`. Writes go through a temporary file and an atomic
/// rename, the same pattern the node agents use for downloaded files.
pub struct DirectoryStorage {
    json_dir: PathBuf,
    hexdigest_dir: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: PathBuf) -> DirectoryStorage {
        DirectoryStorage {
            json_dir: root.join("json"),
            hexdigest_dir: root.join("hexdigest"),
        }
    }

    async fn list_dir(dir: &PathBuf) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(format_err!("unable to list {:?} - {}", dir, err)),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(name) = entry.file_name().into_string() {
                if !name.ends_with(".tmp") {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn write_atomic(path: PathBuf, data: Vec<u8>) -> Result<(), Error> {
        let dir = path
            .parent()
            .ok_or_else(|| format_err!("storage path {:?} has no parent", path))?;
        tokio::fs::create_dir_all(dir).await?;
        let mut tmp_path = path.clone();
        tmp_path.set_extension("tmp");
        tokio::fs::write(&tmp_path, data).await?;
        if let Err(err) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            bail!("atomic rename failed for {:?} - {}", path, err);
        }
        Ok(())
    }
}

#[async_trait]
impl JsonStorage for DirectoryStorage {
    async fn list_jsons(&self) -> Result<Vec<String>, Error> {
        Self::list_dir(&self.json_dir).await
    }

    async fn download_json(&self, name: &str) -> Result<Value, Error> {
        check_name(name)?;
        let path = self.json_dir.join(name);
        let contents = tokio::fs::read(&path)
            .await
            .map_err(|err| format_err!("unable to read {:?} - {}", path, err))?;
        Ok(serde_json::from_slice(&contents)
            .map_err(|err| format_err!("unable to parse {:?} - {}", path, err))?)
    }

    async fn upload_json(&self, name: &str, value: &Value) -> Result<(), Error> {
        check_name(name)?;
        Self::write_atomic(self.json_dir.join(name), serde_json::to_vec(value)?).await
    }

    async fn delete_json(&self, name: &str) -> Result<(), Error> {
        check_name(name)?;
        let path = self.json_dir.join(name);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| format_err!("unable to delete {:?} - {}", path, err))
    }
}

#[async_trait]
impl HexDigestStorage for DirectoryStorage {
    async fn list_hexdigests(&self) -> Result<Vec<String>, Error> {
        Self::list_dir(&self.hexdigest_dir).await
    }

    async fn delete_hexdigest(&self, hexdigest: &str) -> Result<(), Error> {
        check_name(hexdigest)?;
        let path = self.hexdigest_dir.join(hexdigest);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| format_err!("unable to delete {:?} - {}", path, err))
    }
}

/// In-memory backend for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStorage {
    jsons: Mutex<BTreeMap<String, Value>>,
    hexdigests: Mutex<BTreeSet<String>>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    /// Seed a blob digest, standing in for an upload done by a node.
    pub fn add_hexdigest(&self, hexdigest: &str) {
        self.hexdigests.lock().unwrap().insert(hexdigest.to_string());
    }
}

#[async_trait]
impl JsonStorage for MemoryStorage {
    async fn list_jsons(&self) -> Result<Vec<String>, Error> {
        Ok(self.jsons.lock().unwrap().keys().cloned().collect())
    }

    async fn download_json(&self, name: &str) -> Result<Value, Error> {
        self.jsons
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| format_err!("no such json object {:?}", name))
    }

    async fn upload_json(&self, name: &str, value: &Value) -> Result<(), Error> {
        check_name(name)?;
        self.jsons.lock().unwrap().insert(name.to_string(), value.clone());
        Ok(())
    }

    async fn delete_json(&self, name: &str) -> Result<(), Error> {
        match self.jsons.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => bail!("no such json object {:?}", name),
        }
    }
}

#[async_trait]
impl HexDigestStorage for MemoryStorage {
    async fn list_hexdigests(&self) -> Result<Vec<String>, Error> {
        Ok(self.hexdigests.lock().unwrap().iter().cloned().collect())
    }

    async fn delete_hexdigest(&self, hexdigest: &str) -> Result<(), Error> {
        match self.hexdigests.lock().unwrap().remove(hexdigest) {
            true => Ok(()),
            false => bail!("no such hexdigest {:?}", hexdigest),
        }
    }
}
