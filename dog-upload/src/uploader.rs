use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::normalizer::NORMALIZED_CONTENT_TYPE;
use crate::store::{BlobPut, BlobStore, ContainerHandle, PutResult};
use crate::{
    source_to_stream, BoxedSource, ByteStream, ImageNormalizer, ScaleBound, UploadBatch,
    UploadConfig, UploadError, UploadReceipt, UploadResult,
};

/// Lifecycle of a [`BlobUploader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Initialized,
    NamesListed,
    ConflictsResolved,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::NamesListed => "names_listed",
            Self::ConflictsResolved => "conflicts_resolved",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A put that is ready to be sent: the candidate's stream has been taken
/// (and re-encoded when normalization applies).
struct PreparedPut {
    index: usize,
    key: String,
    content_type: String,
    normalized: bool,
    put: BlobPut,
    stream: ByteStream,
}

struct FinishedPut {
    index: usize,
    key: String,
    content_type: String,
    normalized: bool,
    result: UploadResult<PutResult>,
}

/// Drives an [`UploadBatch`] into a container of a [`BlobStore`].
///
/// Construction lists the keys already in the container and renames every
/// colliding candidate, so an uploader always holds a conflict-free batch.
/// Each candidate's stream is released after its write attempt. A failed run
/// does not delete blobs written before the failure.
pub struct BlobUploader {
    store: Arc<dyn BlobStore>,
    container: ContainerHandle,
    batch: UploadBatch,
    config: UploadConfig,
    normalizer: Option<(ImageNormalizer, ScaleBound)>,
    state: UploadState,
    existing_keys: Vec<String>,
    receipts: Vec<UploadReceipt>,
}

impl BlobUploader {
    /// Create an uploader, listing existing keys and resolving conflicts against them
    #[instrument(skip_all, fields(container = %container, batch_id = %batch.id()))]
    pub async fn new(
        store: Arc<dyn BlobStore>,
        container: ContainerHandle,
        mut batch: UploadBatch,
        config: UploadConfig,
    ) -> UploadResult<Self> {
        if let Some(attempts) = config.max_name_attempts {
            batch.set_max_attempts(attempts);
        }

        let mut uploader = Self {
            store,
            container,
            batch,
            config,
            normalizer: None,
            state: UploadState::Initialized,
            existing_keys: Vec::new(),
            receipts: Vec::new(),
        };

        uploader.list_existing().await?;
        uploader.resolve_conflicts()?;
        Ok(uploader)
    }

    /// [`new`](Self::new) on a private current-thread runtime.
    ///
    /// Must not be called from within an async context.
    pub fn new_blocking(
        store: Arc<dyn BlobStore>,
        container: ContainerHandle,
        batch: UploadBatch,
        config: UploadConfig,
    ) -> UploadResult<Self> {
        blocking_runtime()?.block_on(Self::new(store, container, batch, config))
    }

    /// Provision a container for `name` and open it for anonymous reads.
    ///
    /// The store sees the slug of `name` (see [`container_slug`]). Store errors
    /// are returned unchanged.
    pub async fn ensure_container(
        store: &dyn BlobStore,
        name: &str,
    ) -> UploadResult<ContainerHandle> {
        let slug = container_slug(name)?;
        let container = store.ensure_container(&slug).await?;
        store.set_public_read_access(&container).await?;
        info!(requested = name, container = %container, "Container ready");
        Ok(container)
    }

    /// Re-encode image candidates as JPEG scaled into `bound` before upload.
    /// Candidates without image dimensions are uploaded unchanged.
    pub fn with_image_normalizer(mut self, normalizer: ImageNormalizer, bound: ScaleBound) -> Self {
        self.normalizer = Some((normalizer, bound));
        self
    }

    /// [`with_image_normalizer`](Self::with_image_normalizer) with a normalizer
    /// using the configured JPEG quality
    pub fn with_image_bound(self, bound: ScaleBound) -> Self {
        let normalizer = ImageNormalizer::new().with_quality(self.config.jpeg_quality);
        self.with_image_normalizer(normalizer, bound)
    }

    async fn list_existing(&mut self) -> UploadResult<()> {
        let prefix = self.config.key_prefix.as_deref();
        let keys = self.store.list_keys(&self.container, prefix).await?;

        self.existing_keys = keys
            .into_iter()
            .map(|key| match prefix {
                Some(prefix) if key.starts_with(prefix) => key[prefix.len()..].to_string(),
                _ => key,
            })
            .collect();
        self.state = UploadState::NamesListed;
        debug!(existing = self.existing_keys.len(), "Listed existing keys");
        Ok(())
    }

    fn resolve_conflicts(&mut self) -> UploadResult<()> {
        let renamed = self.batch.resolve_against(self.existing_keys.as_slice())?;
        self.state = UploadState::ConflictsResolved;
        info!(candidates = self.batch.len(), renamed, "Resolved save names against container");
        Ok(())
    }

    /// Upload every candidate in batch order, one at a time.
    ///
    /// Stops at the first failure with [`UploadError::UploadFailed`].
    #[instrument(skip(self), fields(batch_id = %self.batch.id(), container = %self.container))]
    pub async fn upload(&mut self) -> UploadResult<Vec<UploadReceipt>> {
        self.run_sequential(None).await
    }

    /// [`upload`](Self::upload) on a private current-thread runtime.
    ///
    /// Must not be called from within an async context.
    pub fn upload_blocking(&mut self) -> UploadResult<Vec<UploadReceipt>> {
        blocking_runtime()?.block_on(self.upload())
    }

    /// Like [`upload`](Self::upload), checking `token` before each candidate.
    /// A write already sent to the store is allowed to finish.
    #[instrument(
        skip(self, token),
        fields(batch_id = %self.batch.id(), container = %self.container)
    )]
    pub async fn upload_with_cancel(
        &mut self,
        token: &CancellationToken,
    ) -> UploadResult<Vec<UploadReceipt>> {
        self.run_sequential(Some(token)).await
    }

    /// Upload with at most `max_in_flight` writes at once (0 uses the configured
    /// default).
    ///
    /// Once a failure has been seen no further write is started; writes already
    /// running are awaited. Receipts come back in batch order and the error
    /// names the earliest failing candidate.
    #[instrument(skip(self), fields(batch_id = %self.batch.id(), container = %self.container))]
    pub async fn upload_concurrent(
        &mut self,
        max_in_flight: usize,
    ) -> UploadResult<Vec<UploadReceipt>> {
        self.begin()?;

        let limit = match max_in_flight {
            0 => self.config.max_in_flight,
            n => n,
        }
        .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        // Set by a failing task before it gives its permit back.
        let failed = Arc::new(AtomicBool::new(false));
        let mut tasks: JoinSet<FinishedPut> = JoinSet::new();
        let mut finished: Vec<FinishedPut> = Vec::with_capacity(self.batch.len());

        for index in 0..self.batch.len() {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(UploadError::backend)?;

            if failed.load(Ordering::Acquire) {
                break;
            }

            let prepared = match self.prepare(index) {
                Ok(prepared) => prepared,
                Err(e) => {
                    finished.push(FinishedPut {
                        index,
                        key: self.config.key_for(self.save_name_of(index)),
                        content_type: String::new(),
                        normalized: false,
                        result: Err(e),
                    });
                    break;
                }
            };

            let store = Arc::clone(&self.store);
            let container = self.container.clone();
            let failed = Arc::clone(&failed);
            tasks.spawn(async move {
                let _permit = permit;
                let result = store
                    .put_stream(&container, &prepared.key, prepared.put, prepared.stream)
                    .await;
                if result.is_err() {
                    failed.store(true, Ordering::Release);
                }
                FinishedPut {
                    index: prepared.index,
                    key: prepared.key,
                    content_type: prepared.content_type,
                    normalized: prepared.normalized,
                    result,
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            finished.push(settle(joined));
        }
        finished.sort_by_key(|f| f.index);

        let mut failure = None;
        for done in finished {
            match done.result {
                Ok(put) => {
                    if let Some(candidate) = self.batch.get(done.index) {
                        self.receipts.push(UploadReceipt::new(
                            candidate,
                            done.key,
                            done.content_type,
                            done.normalized,
                            put,
                        ));
                    }
                }
                Err(e) if failure.is_none() => failure = Some((done.index, e)),
                Err(e) => warn!(index = done.index, error = %e, "Additional upload failure"),
            }
        }

        match failure {
            Some((index, e)) => Err(self.fail(index, e)),
            None => {
                self.state = UploadState::Completed;
                info!(uploaded = self.receipts.len(), max_in_flight = limit, "Batch uploaded");
                Ok(self.receipts.clone())
            }
        }
    }

    async fn run_sequential(
        &mut self,
        token: Option<&CancellationToken>,
    ) -> UploadResult<Vec<UploadReceipt>> {
        self.begin()?;

        for index in 0..self.batch.len() {
            if token.map_or(false, CancellationToken::is_cancelled) {
                self.state = UploadState::Cancelled;
                let completed = self.receipts.len();
                warn!(completed, remaining = self.batch.len() - index, "Upload cancelled");
                return Err(UploadError::Cancelled { completed });
            }

            match self.put_candidate(index).await {
                Ok(receipt) => {
                    debug!(
                        index,
                        key = %receipt.key,
                        size_bytes = receipt.size_bytes,
                        "Uploaded candidate"
                    );
                    self.receipts.push(receipt);
                }
                Err(e) => return Err(self.fail(index, e)),
            }
        }

        self.state = UploadState::Completed;
        info!(uploaded = self.receipts.len(), "Batch uploaded");
        Ok(self.receipts.clone())
    }

    async fn put_candidate(&mut self, index: usize) -> UploadResult<UploadReceipt> {
        let prepared = self.prepare(index)?;
        let put = self
            .store
            .put_stream(&self.container, &prepared.key, prepared.put, prepared.stream)
            .await?;

        let candidate = self
            .batch
            .get(index)
            .ok_or_else(|| UploadError::invalid(format!("no candidate at index {}", index)))?;
        Ok(UploadReceipt::new(
            candidate,
            prepared.key,
            prepared.content_type,
            prepared.normalized,
            put,
        ))
    }

    fn prepare(&mut self, index: usize) -> UploadResult<PreparedPut> {
        let candidate = self
            .batch
            .get_mut(index)
            .ok_or_else(|| UploadError::invalid(format!("no candidate at index {}", index)))?;
        let mut source = candidate.take_stream().ok_or_else(|| {
            UploadError::invalid(format!("{} stream was already released", candidate.save_name()))
        })?;

        let key = self.config.key_for(candidate.save_name());
        let (source, content_type, normalized): (BoxedSource, String, bool) =
            match (&self.normalizer, candidate.image()) {
                (Some((normalizer, bound)), Some(_)) => {
                    let scaled = normalizer.scale(&mut *source, *bound)?;
                    (Box::new(scaled), NORMALIZED_CONTENT_TYPE.to_string(), true)
                }
                _ => (source, candidate.content_type().to_string(), false),
            };

        let mut put = BlobPut::new(content_type.clone());
        if !normalized {
            put = put.with_size_hint(candidate.size_bytes());
            if let Some(md5) = candidate.cached_md5() {
                put = put.with_content_md5(md5);
            }
        }

        Ok(PreparedPut {
            index,
            key,
            content_type,
            normalized,
            put,
            stream: source_to_stream(source, self.config.read_chunk_size),
        })
    }

    fn begin(&mut self) -> UploadResult<()> {
        if self.state != UploadState::ConflictsResolved {
            return Err(UploadError::InvalidState {
                expected: UploadState::ConflictsResolved.as_str(),
                actual: self.state.as_str(),
            });
        }
        self.state = UploadState::Uploading;
        Ok(())
    }

    fn fail(&mut self, index: usize, source: UploadError) -> UploadError {
        self.state = UploadState::Failed;
        let save_name = self.save_name_of(index).to_string();
        error!(index, save_name = %save_name, error = %source, "Upload failed");
        UploadError::upload_failed(index, save_name, source)
    }

    fn save_name_of(&self, index: usize) -> &str {
        self.batch.get(index).map_or("", |c| c.save_name())
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn container(&self) -> &ContainerHandle {
        &self.container
    }

    pub fn batch(&self) -> &UploadBatch {
        &self.batch
    }

    /// Keys found in the container at construction, without the key prefix
    pub fn existing_keys(&self) -> &[String] {
        &self.existing_keys
    }

    /// Receipts of the blobs written so far, in batch order
    pub fn receipts(&self) -> &[UploadReceipt] {
        &self.receipts
    }

    pub fn into_batch(self) -> UploadBatch {
        self.batch
    }
}

static SLUG_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("slug pattern is a valid regex"));

/// Canonical container name: lower-case, every run of characters outside
/// `[a-z0-9]` collapsed to `-`, no leading or trailing `-`.
pub fn container_slug(name: &str) -> UploadResult<String> {
    let lowered = name.to_lowercase();
    let slug = SLUG_SEPARATORS.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        return Err(UploadError::invalid(format!(
            "{:?} does not yield a container name",
            name
        )));
    }
    Ok(slug.to_string())
}

fn blocking_runtime() -> UploadResult<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
}

fn settle(joined: Result<FinishedPut, JoinError>) -> FinishedPut {
    match joined {
        Ok(done) => done,
        // Tasks are never aborted, so a join error is always a panic in the store.
        Err(e) => std::panic::resume_unwind(e.into_panic()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBlobStore, RawFile, UploadCandidate};
    use tracing_test::traced_test;

    fn batch_of(names: &[&str]) -> UploadBatch {
        let mut batch = UploadBatch::new();
        for name in names {
            let raw = RawFile::from_bytes(*name, "text/plain", name.as_bytes().to_vec());
            batch.insert(UploadCandidate::from_raw(raw, name.to_string()).unwrap()).unwrap();
        }
        batch
    }

    #[test]
    fn test_container_slug() {
        assert_eq!(container_slug("My Photos!").unwrap(), "my-photos");
        assert_eq!(container_slug("--Team_42 / Docs--").unwrap(), "team-42-docs");
        assert_eq!(container_slug("abc").unwrap(), "abc");
        assert!(matches!(container_slug("!!!"), Err(UploadError::InvalidInput { .. })));
        assert!(container_slug("").is_err());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(UploadState::ConflictsResolved.as_str(), "conflicts_resolved");
        assert_eq!(UploadState::Failed.to_string(), "failed");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_new_resolves_against_existing_keys() {
        let store = Arc::new(MemoryBlobStore::with_keys("docs", &["a.txt"]));
        let uploader = BlobUploader::new(
            store,
            ContainerHandle::new("docs"),
            batch_of(&["a.txt", "b.txt"]),
            UploadConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(uploader.state(), UploadState::ConflictsResolved);
        assert_eq!(uploader.existing_keys(), ["a.txt".to_string()]);
        assert_eq!(uploader.batch().save_names(), vec!["a (1).txt", "b.txt"]);
        assert!(logs_contain("Resolved save names against container"));
    }

    #[tokio::test]
    async fn test_batch_attempt_ceiling_survives_default_config() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::with_keys("docs", &["a.txt"]));
        let container = ContainerHandle::new("docs");

        let batch = batch_of(&["a.txt"]).with_max_attempts(3);
        let uploader =
            BlobUploader::new(store.clone(), container.clone(), batch, UploadConfig::default())
                .await
                .unwrap();
        assert_eq!(uploader.batch().max_attempts(), 3);

        let batch = batch_of(&["a.txt"]).with_max_attempts(3);
        let config = UploadConfig::default().with_max_name_attempts(7);
        let uploader = BlobUploader::new(store, container, batch, config).await.unwrap();
        assert_eq!(uploader.batch().max_attempts(), 7);
    }

    #[tokio::test]
    async fn test_upload_twice_is_invalid_state() {
        let store = Arc::new(MemoryBlobStore::new());
        let container = BlobUploader::ensure_container(&*store, "docs").await.unwrap();
        let batch = batch_of(&["a.txt"]);
        let mut uploader = BlobUploader::new(store, container, batch, UploadConfig::default())
            .await
            .unwrap();

        uploader.upload().await.unwrap();
        assert_eq!(uploader.state(), UploadState::Completed);

        let err = uploader.upload().await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::InvalidState { expected: "conflicts_resolved", actual: "completed" }
        ));
    }
}
