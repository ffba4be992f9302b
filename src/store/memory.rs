//! In-memory object store used by the test suites.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::store::{CompletedPart, CompletedUpload, ObjectStore, StoreError, UploadPart};

#[derive(Default)]
pub struct MemoryStore {
    next_upload: AtomicU32,
    pub state: Mutex<MemoryState>,
    /// Part numbers whose upload should fail every attempt.
    pub failing_parts: Vec<i32>,
    /// Part numbers whose upload is held back briefly, to exercise
    /// out-of-order completion.
    pub delayed_parts: Vec<i32>,
}

#[derive(Default)]
pub struct MemoryState {
    /// upload id -> (storage path, parts by number)
    pub uploads: HashMap<String, (String, HashMap<i32, Bytes>)>,
    /// storage path -> completed part order
    pub completed: HashMap<String, Vec<CompletedPart>>,
    /// storage path -> single-shot object bodies
    pub objects: HashMap<String, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(parts: Vec<i32>) -> Self {
        Self {
            failing_parts: parts,
            ..Self::default()
        }
    }

    pub fn delayed(parts: Vec<i32>) -> Self {
        Self {
            delayed_parts: parts,
            ..Self::default()
        }
    }

    /// Reassembled object body for `storage_path`, in part-number order.
    pub fn object_bytes(&self, storage_path: &str) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let completed = match state.completed.get(storage_path) {
            Some(parts) => parts,
            None => return Vec::new(),
        };
        let parts = state
            .uploads
            .values()
            .find(|(path, _)| path == storage_path)
            .map(|(_, parts)| parts);

        let mut body = Vec::new();
        if let Some(parts) = parts {
            for part in completed {
                if let Some(bytes) = parts.get(&part.part_number) {
                    body.extend_from_slice(bytes);
                }
            }
        }
        body
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create_multipart(&self, storage_path: &str) -> Result<String, StoreError> {
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.state
            .lock()
            .unwrap()
            .uploads
            .insert(id.clone(), (storage_path.to_string(), HashMap::new()));
        Ok(id)
    }

    async fn upload_part(&self, part: UploadPart) -> Result<CompletedPart, StoreError> {
        if self.delayed_parts.contains(&part.part_number) {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        if self.failing_parts.contains(&part.part_number) {
            return Err(StoreError::UnexpectedStatus {
                status: 500,
                path: part.storage_path,
                body: "injected failure".to_string(),
            });
        }

        let mut state = self.state.lock().unwrap();
        let (_, parts) = state
            .uploads
            .get_mut(&part.upload_id)
            .ok_or_else(|| StoreError::MalformedResponse("unknown upload id".to_string()))?;
        parts.insert(part.part_number, part.body);

        Ok(CompletedPart {
            part_number: part.part_number,
            etag: format!("\"etag-{}\"", part.part_number),
        })
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        storage_path: &str,
        parts: &[CompletedPart],
    ) -> Result<CompletedUpload, StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.uploads.contains_key(upload_id) {
            return Err(StoreError::MalformedResponse(
                "unknown upload id".to_string(),
            ));
        }
        state
            .completed
            .insert(storage_path.to_string(), parts.to_vec());

        Ok(CompletedUpload {
            recording_url: format!("https://bucket.example.com/{storage_path}"),
        })
    }

    async fn put_object(&self, storage_path: &str, local_file: &Path) -> Result<(), StoreError> {
        let body = tokio::fs::read(local_file).await?;
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(storage_path.to_string(), Bytes::from(body));
        Ok(())
    }

    async fn get_object(
        &self,
        storage_path: &str,
        download_path: &Path,
    ) -> Result<(), StoreError> {
        let body = self
            .state
            .lock()
            .unwrap()
            .objects
            .get(storage_path)
            .cloned()
            .ok_or_else(|| StoreError::UnexpectedStatus {
                status: 404,
                path: storage_path.to_string(),
                body: String::new(),
            })?;
        tokio::fs::write(download_path, &body).await?;
        Ok(())
    }
}
