use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::RwLock;
use tracing::debug;

use crate::store::{BlobPut, BlobStore, ContainerHandle, PutResult};
use crate::{ByteStream, UploadError, UploadResult};

/// Blob stored in a [`MemoryBlobStore`]
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub data: Bytes,
    pub content_type: String,
}

#[derive(Debug, Default)]
struct Container {
    public: bool,
    blobs: BTreeMap<String, StoredBlob>,
}

/// In-process blob store, for tests and local development
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    containers: RwLock<HashMap<String, Container>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with `container` already provisioned and holding `keys` as empty blobs
    pub fn with_keys<S: AsRef<str>>(container: &str, keys: &[S]) -> Self {
        let store = Self::new();
        {
            let mut containers = store.containers.write();
            let entry = containers.entry(container.to_string()).or_default();
            for key in keys {
                entry.blobs.insert(
                    key.as_ref().to_string(),
                    StoredBlob {
                        data: Bytes::new(),
                        content_type: "application/octet-stream".to_string(),
                    },
                );
            }
        }
        store
    }

    pub fn get(&self, container: &str, key: &str) -> Option<StoredBlob> {
        self.containers.read().get(container)?.blobs.get(key).cloned()
    }

    /// Keys of a container in lexicographic order; empty when it does not exist
    pub fn keys(&self, container: &str) -> Vec<String> {
        self.containers
            .read()
            .get(container)
            .map(|c| c.blobs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_container(&self, container: &str) -> bool {
        self.containers.read().contains_key(container)
    }

    pub fn is_public(&self, container: &str) -> bool {
        self.containers.read().get(container).map_or(false, |c| c.public)
    }

    fn missing(container: &ContainerHandle) -> UploadError {
        UploadError::backend(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("container {} does not exist", container),
        ))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list_keys(
        &self,
        container: &ContainerHandle,
        prefix: Option<&str>,
    ) -> UploadResult<Vec<String>> {
        let containers = self.containers.read();
        let entry = containers.get(container.name()).ok_or_else(|| Self::missing(container))?;
        Ok(entry
            .blobs
            .keys()
            .filter(|key| prefix.map_or(true, |p| key.starts_with(p)))
            .cloned()
            .collect())
    }

    async fn put_stream(
        &self,
        container: &ContainerHandle,
        key: &str,
        put: BlobPut,
        mut stream: ByteStream,
    ) -> UploadResult<PutResult> {
        if !self.has_container(container.name()) {
            return Err(Self::missing(container));
        }

        let mut data = Vec::with_capacity(put.size_hint.unwrap_or(0) as usize);
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }

        let digest = md5::compute(&data);
        if let Some(expected) = put.content_md5 {
            if expected != digest.0 {
                return Err(UploadError::backend(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("content MD5 mismatch for {}", key),
                )));
            }
        }

        let size_bytes = data.len() as u64;
        let blob = StoredBlob {
            data: Bytes::from(data),
            content_type: put.content_type,
        };

        let mut containers = self.containers.write();
        let entry = containers.get_mut(container.name()).ok_or_else(|| Self::missing(container))?;
        entry.blobs.insert(key.to_string(), blob);
        debug!(container = %container, key, size_bytes, "Stored blob in memory");

        Ok(PutResult {
            etag: Some(format!("{:x}", digest)),
            size_bytes,
        })
    }

    async fn ensure_container(&self, name: &str) -> UploadResult<ContainerHandle> {
        self.containers.write().entry(name.to_string()).or_default();
        Ok(ContainerHandle::new(name))
    }

    async fn set_public_read_access(&self, container: &ContainerHandle) -> UploadResult<()> {
        let mut containers = self.containers.write();
        let entry = containers.get_mut(container.name()).ok_or_else(|| Self::missing(container))?;
        entry.public = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_to_stream;
    use std::io::Cursor;

    fn body(data: &[u8]) -> ByteStream {
        source_to_stream(Box::new(Cursor::new(data.to_vec())), 3)
    }

    #[tokio::test]
    async fn test_put_and_list() {
        let store = MemoryBlobStore::new();
        let container = store.ensure_container("docs").await.unwrap();

        let result = store
            .put_stream(&container, "b.txt", BlobPut::new("text/plain"), body(b"hello"))
            .await
            .unwrap();
        store
            .put_stream(&container, "a.txt", BlobPut::new("text/plain"), body(b"x"))
            .await
            .unwrap();

        assert_eq!(result.size_bytes, 5);
        assert_eq!(result.etag.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));
        assert_eq!(store.list_keys(&container, None).await.unwrap(), vec!["a.txt", "b.txt"]);
        assert_eq!(store.get("docs", "b.txt").unwrap().data, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let store = MemoryBlobStore::with_keys("docs", &["2024/a.txt", "2025/a.txt", "2024/b.txt"]);
        let container = ContainerHandle::new("docs");
        let keys = store.list_keys(&container, Some("2024/")).await.unwrap();
        assert_eq!(keys, vec!["2024/a.txt", "2024/b.txt"]);
    }

    #[tokio::test]
    async fn test_missing_container_is_an_error() {
        let store = MemoryBlobStore::new();
        let container = ContainerHandle::new("nope");
        let err = store
            .put_stream(&container, "a.txt", BlobPut::new("text/plain"), body(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Backend { .. }));
        assert!(store.list_keys(&container, None).await.is_err());
    }

    #[tokio::test]
    async fn test_md5_mismatch_is_rejected() {
        let store = MemoryBlobStore::new();
        let container = store.ensure_container("docs").await.unwrap();
        let put = BlobPut::new("text/plain").with_content_md5([0u8; 16]);
        assert!(store.put_stream(&container, "a.txt", put, body(b"abc")).await.is_err());
        assert!(store.get("docs", "a.txt").is_none());
    }

    #[test]
    fn test_public_access() {
        let store = MemoryBlobStore::new();
        tokio_test::block_on(async {
            let container = store.ensure_container("media").await.unwrap();
            assert!(!store.is_public("media"));
            store.set_public_read_access(&container).await.unwrap();
        });
        assert!(store.is_public("media"));
    }
}
