use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod s3;

#[cfg(test)]
pub(crate) mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned {status} for {path}: {body}")]
    UnexpectedStatus {
        status: u16,
        path: String,
        body: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed store response: {0}")]
    MalformedResponse(String),
    #[error("multipart upload {upload_id} is missing part numbers {missing:?}")]
    IncompleteUpload {
        upload_id: String,
        missing: Vec<i32>,
    },
}

/// One part of a multipart upload. The body is an owned copy; dispatching a
/// part transfers ownership of its bytes to the store call.
#[derive(Debug, Clone)]
pub struct UploadPart {
    pub upload_id: String,
    pub storage_path: String,
    /// 1-based, monotonically assigned by the uploader.
    pub part_number: i32,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub recording_url: String,
}

/// Object-store contract the recording pipelines upload through.
///
/// Implementations must honour S3 multipart semantics: every part except the
/// last is at least 5 MiB, ETags are opaque, and completion requires the part
/// list sorted by part number.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Opens a multipart upload session and returns its upload id.
    async fn create_multipart(&self, storage_path: &str) -> Result<String, StoreError>;

    async fn upload_part(&self, part: UploadPart) -> Result<CompletedPart, StoreError>;

    /// Commits the upload. `parts` must be the full gap-free set, sorted by
    /// part number.
    async fn complete_multipart(
        &self,
        upload_id: &str,
        storage_path: &str,
        parts: &[CompletedPart],
    ) -> Result<CompletedUpload, StoreError>;

    /// Single-shot upload of a local file.
    async fn put_object(&self, storage_path: &str, local_file: &Path) -> Result<(), StoreError>;

    /// Single-shot download to a local file.
    async fn get_object(&self, storage_path: &str, download_path: &Path)
        -> Result<(), StoreError>;
}
