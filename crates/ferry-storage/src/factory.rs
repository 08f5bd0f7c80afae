#[cfg(feature = "storage-local")]
use crate::LocalStorage;
#[cfg(feature = "storage-s3")]
use crate::S3Storage;
use crate::{Storage, StorageBackend, StorageError, StorageResult};
use serde::Deserialize;
use std::sync::Arc;

/// One configured blob store: the staging area or a replication destination.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StorageTarget {
    pub backend: StorageBackend,
    /// Root directory (local backend)
    #[serde(default)]
    pub path: Option<String>,
    /// URL prefix reported for stored objects (local backend)
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl StorageTarget {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Local,
            path: Some(path.into()),
            base_url: None,
            bucket: None,
            region: None,
            endpoint: None,
        }
    }
}

/// Create a storage backend from a target description
pub async fn create_storage(target: &StorageTarget) -> StorageResult<Arc<dyn Storage>> {
    match target.backend {
        #[cfg(feature = "storage-s3")]
        StorageBackend::S3 => {
            let bucket = target
                .bucket
                .clone()
                .ok_or_else(|| StorageError::ConfigError("bucket not configured".to_string()))?;
            let region = target
                .region
                .clone()
                .or_else(|| std::env::var("AWS_REGION").ok())
                .ok_or_else(|| {
                    StorageError::ConfigError("region or AWS_REGION not configured".to_string())
                })?;

            let storage = S3Storage::new(bucket, region, target.endpoint.clone()).await?;
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-s3"))]
        StorageBackend::S3 => Err(StorageError::ConfigError(
            "S3 storage backend not available (storage-s3 feature not enabled)".to_string(),
        )),

        #[cfg(feature = "storage-local")]
        StorageBackend::Local => {
            let base_path = target
                .path
                .clone()
                .ok_or_else(|| StorageError::ConfigError("path not configured".to_string()))?;
            let base_url = target
                .base_url
                .clone()
                .unwrap_or_else(|| format!("file://{}", base_path));

            let storage = LocalStorage::new(base_path, base_url).await?;
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-local"))]
        StorageBackend::Local => Err(StorageError::ConfigError(
            "Local storage backend not available (storage-local feature not enabled)".to_string(),
        )),
    }
}
