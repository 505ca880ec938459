//! Out-of-line storage for image and diff payloads.
//!
//! Every blob is an immutable PNG file named by a random UUID and sharded
//! into sub-directories by the first two hex characters of the id:
//! `<base>/ab/ab12cd...png`.

use std::collections::HashSet;
use std::path::PathBuf;

use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServiceError;

const BLOB_EXTENSION: &str = "png";

#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl BlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServiceError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServiceError::Storage(format!(
                "Failed to create blob directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), max_size, "Blob store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub async fn store_blob(&self, data: &[u8]) -> Result<Uuid, ServiceError> {
        if data.is_empty() {
            return Err(ServiceError::Storage("Empty blob".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServiceError::BlobTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let id = Uuid::new_v4();
        let path = self.blob_path(&id);
        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard).await.map_err(|e| {
                ServiceError::Storage(format!("Failed to create shard for blob {}: {}", id, e))
            })?;
        }

        fs::write(&path, data)
            .await
            .map_err(|e| ServiceError::Storage(format!("Failed to write blob {}: {}", id, e)))?;

        debug!(id = %id, size = data.len(), "Stored blob");
        Ok(id)
    }

    pub async fn get_blob(&self, id: Uuid) -> Result<Vec<u8>, ServiceError> {
        let path = self.blob_path(&id);

        match fs::read(&path).await {
            Ok(data) => {
                debug!(id = %id, size = data.len(), "Retrieved blob");
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ServiceError::Storage(
                format!("Blob {} referenced but missing on disk", id),
            )),
            Err(e) => Err(ServiceError::Storage(format!(
                "Failed to read blob {}: {}",
                id, e
            ))),
        }
    }

    /// Remove a blob. Returns `false` if it did not exist.
    pub async fn delete_blob(&self, id: Uuid) -> Result<bool, ServiceError> {
        match fs::remove_file(self.blob_path(&id)).await {
            Ok(()) => {
                debug!(id = %id, "Deleted blob");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ServiceError::Storage(format!(
                "Failed to delete blob {}: {}",
                id, e
            ))),
        }
    }

    /// Ids of every blob on disk. Files that are not `<uuid>.png` are skipped.
    pub async fn list_blobs(&self) -> Result<HashSet<Uuid>, ServiceError> {
        let mut ids = HashSet::new();
        let mut shards = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| ServiceError::Storage(format!("Failed to list blobs: {}", e)))?;

        while let Some(shard) = shards.next_entry().await.map_err(|e| {
            ServiceError::Storage(format!("Failed to read directory entry: {}", e))
        })? {
            if !shard.path().is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(shard.path())
                .await
                .map_err(|e| ServiceError::Storage(format!("Failed to list shard: {}", e)))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                ServiceError::Storage(format!("Failed to read directory entry: {}", e))
            })? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                    continue;
                }
                if let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
                {
                    ids.insert(id);
                }
            }
        }

        Ok(ids)
    }

    // Ids are generated here, so the path can never leave the base directory.
    fn blob_path(&self, id: &Uuid) -> PathBuf {
        let name = id.simple().to_string();
        self.base_path
            .join(&name[..2])
            .join(format!("{name}.{BLOB_EXTENSION}"))
    }
}
