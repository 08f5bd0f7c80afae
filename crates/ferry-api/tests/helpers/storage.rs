use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::StorageBackend;
use ferry_storage::{ByteReader, ByteStream, LocalStorage, Storage, StorageError, StorageResult};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

/// Local destination that rejects the first `failures` writes like a throttled bucket.
pub struct FlakyStorage {
    inner: LocalStorage,
    failures: AtomicU32,
}

impl FlakyStorage {
    pub async fn new(path: &Path, failures: u32) -> Self {
        Self {
            inner: LocalStorage::new(path, "file:///flaky".to_string())
                .await
                .expect("Failed to create flaky storage"),
            failures: AtomicU32::new(failures),
        }
    }

    fn should_fail(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<String> {
        if self.should_fail() {
            return Err(StorageError::UploadFailed("503 Slow Down".to_string()));
        }
        self.inner.put(key, data, content_type).await
    }

    async fn download(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.inner.download(key).await
    }

    async fn upload_stream(
        &self,
        key: &str,
        content_type: &str,
        content_length: Option<u64>,
        reader: ByteReader,
    ) -> StorageResult<String> {
        if self.should_fail() {
            return Err(StorageError::UploadFailed("503 Slow Down".to_string()));
        }
        self.inner
            .upload_stream(key, content_type, content_length, reader)
            .await
    }

    async fn download_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.download_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn content_length(&self, key: &str) -> StorageResult<u64> {
        self.inner.content_length(key).await
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }
}
