use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CHUNK_UPLOAD_DEADLINE;
use crate::executor::{ExecutorHandle, Job};
use crate::media::watcher::ChunkInfo;
use crate::store::ObjectStore;

/// Bridges discovered segments to the worker pool: every `ChunkInfo` becomes
/// an upload job with a 20 s deadline, stored under
/// `<recorderId>/<chunkName>`.
pub struct Chunker {
    store: Arc<dyn ObjectStore>,
    cancel: CancellationToken,
}

impl Chunker {
    pub fn new(store: Arc<dyn ObjectStore>, cancel: CancellationToken) -> Self {
        Self { store, cancel }
    }

    /// Consumes the watcher channel until it closes, enqueueing one job per
    /// chunk. The executor handle is dropped when the channel drains, so the
    /// pool's queue can close afterwards.
    pub fn attach(
        self,
        mut chunks: mpsc::Receiver<ChunkInfo>,
        executor: ExecutorHandle,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                log::info!("received new chunk {}", chunk.chunk_name);
                executor.enqueue(self.upload_job(chunk));
            }
            log::info!("chunk channel closed, chunker exiting");
        })
    }

    fn upload_job(&self, chunk: ChunkInfo) -> Job {
        let storage_path = format!("{}/{}", chunk.recorder_id, chunk.chunk_name);
        let store = Arc::clone(&self.store);
        let chunk_path = chunk.chunk_path.clone();
        let job_id = storage_path.clone();

        let success_id = job_id.clone();
        let error_id = job_id.clone();

        Job {
            id: job_id,
            cancel: self.cancel.child_token(),
            run: Box::new(move || {
                let store = Arc::clone(&store);
                let storage_path = storage_path.clone();
                let chunk_path = chunk_path.clone();
                Box::pin(async move {
                    tokio::time::timeout(
                        CHUNK_UPLOAD_DEADLINE,
                        store.put_object(&storage_path, &chunk_path),
                    )
                    .await
                    .map_err(|_| anyhow::anyhow!("chunk upload timed out"))??;
                    Ok(())
                })
            }),
            on_success: Box::new(move || {
                log::info!("chunk {success_id} uploaded");
            }),
            on_error: Box::new(move |err| {
                log::warn!("chunk {error_id} upload failed: {err:#}");
            }),
        }
    }
}
