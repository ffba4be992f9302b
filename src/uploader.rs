use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;

use crate::config::MAX_PART_BYTES;
use crate::store::{CompletedPart, CompletedUpload, ObjectStore, StoreError, UploadPart};

/// Drains the capture encoder's stdout into a multipart upload. Parts are at
/// most `MAX_PART_BYTES`, numbered from 1 in the order the byte stream
/// crosses part boundaries; that order is the only source of part ordering.
pub struct MultipartUploader {
    upload_id: String,
    storage_path: String,
    store: Arc<dyn ObjectStore>,
    completed: Mutex<Vec<CompletedPart>>,
    dispatched: AtomicU32,
}

impl MultipartUploader {
    /// Opens the multipart session for `recording_<pipeline_id>.mp4`.
    pub async fn new(
        store: Arc<dyn ObjectStore>,
        pipeline_id: &str,
    ) -> Result<Self, StoreError> {
        let storage_path = format!("recording_{pipeline_id}.mp4");
        let upload_id = store.create_multipart(&storage_path).await?;

        log::info!("multipart upload {upload_id} opened for {storage_path}");

        Ok(Self {
            upload_id,
            storage_path,
            store,
            completed: Mutex::new(Vec::new()),
            dispatched: AtomicU32::new(0),
        })
    }

    /// Reads the encoder stream until EOF, dispatching each full part
    /// concurrently, then waits for every in-flight part. The reader reaches
    /// EOF once the encoder exits, so shutdown is bounded by the encoder's
    /// own stop grace.
    pub async fn run<R>(self: Arc<Self>, mut reader: R) -> Result<(), StoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut uploads = JoinSet::new();
        let mut buffer = vec![0u8; MAX_PART_BYTES];
        let mut filled = 0usize;
        let mut part_number: i32 = 1;
        let mut read_error = None;

        loop {
            let n = match reader.read(&mut buffer[filled..]).await {
                Ok(n) => n,
                Err(err) => {
                    // In-flight parts still drain below; the gap check in
                    // `complete` decides whether the object survives.
                    read_error = Some(err);
                    0
                }
            };
            filled += n;
            let eof = n == 0;

            if filled >= MAX_PART_BYTES || (eof && filled > 0) {
                // Owned copy: the read buffer is reused for the next part.
                let body = Bytes::copy_from_slice(&buffer[..filled]);
                log::info!(
                    "dispatching part {part_number} ({filled} bytes) of {}",
                    self.storage_path
                );

                self.dispatched.fetch_add(1, Ordering::SeqCst);
                let uploader = Arc::clone(&self);
                uploads.spawn(async move { uploader.upload_part(part_number, body).await });

                part_number += 1;
                filled = 0;
            }

            if eof {
                log::info!("encoder stream for {} reached EOF", self.storage_path);
                break;
            }
        }

        while uploads.join_next().await.is_some() {}

        match read_error {
            Some(err) => Err(StoreError::Io(err)),
            None => Ok(()),
        }
    }

    async fn upload_part(&self, part_number: i32, body: Bytes) {
        let part = UploadPart {
            upload_id: self.upload_id.clone(),
            storage_path: self.storage_path.clone(),
            part_number,
            body,
        };

        match self.store.upload_part(part).await {
            Ok(completed) => {
                log::info!(
                    "part {part_number} of {} uploaded, etag {}",
                    self.storage_path,
                    completed.etag
                );
                self.completed.lock().unwrap().push(completed);
            }
            Err(err) => {
                log::error!(
                    "part {part_number} of {} failed: {err}",
                    self.storage_path
                );
            }
        }
    }

    /// Commits the upload. Must run after `run` has returned (the pipeline's
    /// stop awaits the drain task first). Fails loudly when any dispatched
    /// part is missing rather than committing a truncated object.
    pub async fn complete(&self) -> Result<CompletedUpload, StoreError> {
        let mut parts = self.completed.lock().unwrap().clone();
        parts.sort_by_key(|part| part.part_number);

        let dispatched = self.dispatched.load(Ordering::SeqCst) as i32;
        if parts.len() as i32 != dispatched {
            let missing = (1..=dispatched)
                .filter(|n| !parts.iter().any(|p| p.part_number == *n))
                .collect();
            return Err(StoreError::IncompleteUpload {
                upload_id: self.upload_id.clone(),
                missing,
            });
        }

        log::info!(
            "completing multipart upload {} with {} parts",
            self.upload_id,
            parts.len()
        );

        self.store
            .complete_multipart(&self.upload_id, &self.storage_path, &parts)
            .await
    }
}

#[cfg(test)]
#[path = "uploader_test.rs"]
mod uploader_test;
