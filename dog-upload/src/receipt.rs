use serde::{Deserialize, Serialize};

use crate::store::PutResult;
use crate::UploadCandidate;

/// Receipt returned for each candidate that reached the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// Full object key (prefix plus save name)
    pub key: String,
    pub save_name: String,
    pub original_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub etag: Option<String>,
    /// True when the content was re-encoded by the image normalizer
    pub normalized: bool,
    pub uploaded_at: i64,
}

impl UploadReceipt {
    pub(crate) fn new(
        candidate: &UploadCandidate,
        key: String,
        content_type: String,
        normalized: bool,
        put: PutResult,
    ) -> Self {
        Self {
            key,
            save_name: candidate.save_name().to_string(),
            original_name: candidate.original_name().to_string(),
            content_type,
            size_bytes: put.size_bytes,
            etag: put.etag,
            normalized,
            uploaded_at: chrono::Utc::now().timestamp(),
        }
    }
}
