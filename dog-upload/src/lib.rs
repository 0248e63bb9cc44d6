//! # dog-upload: staging and uploading batches of files to blob storage
//!
//! `dog-upload` takes the files of a request, gives each one a save name that is
//! unique within the batch and within the target container, and streams them
//! into any [`BlobStore`] (S3-compatible storage, in-memory, custom backends).
//!
//! ## Key Features
//!
//! - **Collision-free names**: `photo.jpg`, `photo (1).jpg`, `photo (2).jpg`, with pluggable
//!   resolvers
//! - **Pre-flight against the store**: names already in the container are never overwritten
//! - **Lazy digests**: MD5 and SHA-1 computed once per file, on demand
//! - **Image normalization**: optional re-encoding to bounded JPEG before upload
//! - **Storage agnostic**: the store is a caller-owned `Arc<dyn BlobStore>`
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_upload::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! let store = Arc::new(MemoryBlobStore::new());
//! let container = BlobUploader::ensure_container(&*store, "Team Docs").await?;
//!
//! let inputs = vec![
//!     RawFile::from_bytes("notes.txt", "text/plain", b"first".to_vec()),
//!     RawFile::from_bytes("notes.txt", "text/plain", b"second".to_vec()),
//! ];
//! let batch =
//!     UploadBatch::bulk_build(inputs, same_name, UploadCandidate::from_raw).into_result()?;
//!
//! let mut uploader =
//!     BlobUploader::new(store.clone(), container, batch, UploadConfig::default()).await?;
//! let receipts = uploader.upload().await?;
//!
//! assert_eq!(receipts[1].save_name, "notes (1).txt");
//! assert_eq!(store.keys("team-docs"), vec!["notes (1).txt", "notes.txt"]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   UploadBatch   │  ← Candidates + unique save names
//! ├─────────────────┤
//! │   BlobUploader  │  ← Pre-flight, ordered upload, receipts
//! ├─────────────────┤
//! │   BlobStore     │  ← Storage primitives
//! └─────────────────┘
//! ```

mod batch;
mod candidate;
mod config;
mod error;
mod memory_store;
pub mod normalizer;
mod receipt;
pub mod resolver;
mod s3_store;
pub mod store;
mod types;
mod uploader;
pub mod validation;

// Re-export main types for clean API
pub use batch::{same_name, BulkBuild, RejectedInput, UploadBatch, DEFAULT_MAX_NAME_ATTEMPTS};
pub use candidate::{DigestAlgorithm, RawFile, RawUpload, UploadCandidate};
pub use config::{UploadConfig, ENV_PREFIX};
pub use error::{UploadError, UploadResult};
pub use memory_store::{MemoryBlobStore, StoredBlob};
pub use normalizer::{scaled_dimensions, ImageDimensions, ImageNormalizer, ScaleBound, Sizeable};
pub use receipt::UploadReceipt;
pub use resolver::{NameResolver, WindowsStyleResolver};
pub use s3_store::{S3BlobStore, S3Config};
pub use store::{BlobPut, BlobStore, ContainerHandle, PutResult};
pub use types::{source_to_stream, BatchId, BoxedSource, ByteStream, SourceStream};
pub use uploader::{container_slug, BlobUploader, UploadState};
pub use validation::{FileSize, FileTypes};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        same_name, BlobStore, BlobUploader, ContainerHandle, MemoryBlobStore, RawFile, RawUpload,
        UploadBatch, UploadCandidate, UploadConfig, UploadError, UploadReceipt, UploadResult,
    };
}
