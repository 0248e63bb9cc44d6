use async_trait::async_trait;

use crate::{ByteStream, UploadResult};

/// Blob storage operations the uploader needs from a backend.
///
/// A store is a caller-owned handle: build it once, share it behind an `Arc`,
/// and pass it to every uploader that should talk to the same account.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Every key in `container` starting with `prefix` (all keys when `None`)
    async fn list_keys(
        &self,
        container: &ContainerHandle,
        prefix: Option<&str>,
    ) -> UploadResult<Vec<String>>;

    /// Store a blob from a stream, overwriting any existing blob under `key`
    async fn put_stream(
        &self,
        container: &ContainerHandle,
        key: &str,
        put: BlobPut,
        stream: ByteStream,
    ) -> UploadResult<PutResult>;

    /// Create the container if it does not exist yet
    async fn ensure_container(&self, name: &str) -> UploadResult<ContainerHandle>;

    /// Allow anonymous reads of individual blobs (not listing)
    async fn set_public_read_access(&self, container: &ContainerHandle) -> UploadResult<()>;
}

/// Reference to a provisioned container (bucket)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    name: String,
}

impl ContainerHandle {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Request metadata accompanying a put
#[derive(Debug, Clone)]
pub struct BlobPut {
    pub content_type: String,
    pub size_hint: Option<u64>,
    pub content_md5: Option<[u8; 16]>,
}

impl BlobPut {
    pub fn new<S: Into<String>>(content_type: S) -> Self {
        Self {
            content_type: content_type.into(),
            size_hint: None,
            content_md5: None,
        }
    }

    pub fn with_size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    /// MD5 the store may verify the received content against
    pub fn with_content_md5(mut self, md5: [u8; 16]) -> Self {
        self.content_md5 = Some(md5);
        self
    }
}

/// Result of a successful put operation
#[derive(Debug, Clone)]
pub struct PutResult {
    pub etag: Option<String>,
    pub size_bytes: u64,
}
