use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default polling interval; segments are written monotonically so this only
/// bounds discovery latency, not correctness.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(12);

/// A segment discovered in the recording directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub recorder_id: String,
    pub chunk_name: String,
    pub chunk_path: PathBuf,
    pub chunk_size: u64,
}

#[derive(Debug, Clone)]
pub struct SegmentWatcherOptions {
    pub recorder_id: String,
    pub directory: PathBuf,
    pub poll_interval: Duration,
}

/// Polls the segment directory for `chunk_00000.mp4, chunk_00001.mp4, ...`
/// and emits them strictly in index order. Indexes are dense, so each round
/// stops at the first missing one; a segment still being written shows up on
/// a later round with its final size.
pub struct SegmentWatcher {
    opts: SegmentWatcherOptions,
    cancel: CancellationToken,
}

impl SegmentWatcher {
    pub fn new(opts: SegmentWatcherOptions, cancel: CancellationToken) -> Self {
        Self { opts, cancel }
    }

    /// Spawns the polling loop. The returned channel closes when the watcher
    /// observes cancellation.
    pub fn start(self) -> mpsc::Receiver<ChunkInfo> {
        let (tx, rx) = mpsc::channel(20);

        tokio::spawn(async move {
            let mut next_index: u32 = 0;
            let mut tick = tokio::time::interval(self.opts.poll_interval);
            // First tick fires immediately; skip it so the encoder has a
            // full interval to produce the first segment.
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        log::info!(
                            "segment watcher for {} cancelled after {} chunks",
                            self.opts.recorder_id, next_index
                        );
                        return;
                    }
                    _ = tick.tick() => {
                        if !self.grab_chunks(&tx, &mut next_index).await {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }

    /// Emits every ready chunk from `next_index` onward. Returns false when
    /// the receiver is gone and the watcher should exit.
    async fn grab_chunks(&self, tx: &mpsc::Sender<ChunkInfo>, next_index: &mut u32) -> bool {
        loop {
            let chunk_name = chunk_file_name(*next_index);
            let chunk_path = self.opts.directory.join(&chunk_name);

            let size = match tokio::fs::metadata(&chunk_path).await {
                Ok(metadata) => metadata.len(),
                Err(_) => return true,
            };

            // Just-created, still-empty file: pick it up next round.
            if size == 0 {
                return true;
            }

            log::info!("chunk found: {}", chunk_path.display());

            let chunk = ChunkInfo {
                recorder_id: self.opts.recorder_id.clone(),
                chunk_name,
                chunk_path,
                chunk_size: size,
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                sent = tx.send(chunk) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }

            *next_index += 1;
        }
    }
}

fn chunk_file_name(index: u32) -> String {
    format!("chunk_{index:05}.mp4")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watcher(dir: &std::path::Path, poll_ms: u64) -> (SegmentWatcher, CancellationToken) {
        let cancel = CancellationToken::new();
        let watcher = SegmentWatcher::new(
            SegmentWatcherOptions {
                recorder_id: "pipeline_1".to_string(),
                directory: dir.to_path_buf(),
                poll_interval: Duration::from_millis(poll_ms),
            },
            cancel.clone(),
        );
        (watcher, cancel)
    }

    #[test]
    fn chunk_names_are_zero_padded() {
        assert_eq!(chunk_file_name(0), "chunk_00000.mp4");
        assert_eq!(chunk_file_name(42), "chunk_00042.mp4");
        assert_eq!(chunk_file_name(99999), "chunk_99999.mp4");
    }

    #[tokio::test]
    async fn emits_chunks_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chunk_00000.mp4"), b"segment zero").unwrap();
        std::fs::write(dir.path().join("chunk_00001.mp4"), b"segment one").unwrap();

        let (watcher, cancel) = watcher(dir.path(), 10);
        let mut rx = watcher.start();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();

        assert_eq!(first.chunk_name, "chunk_00000.mp4");
        assert_eq!(first.chunk_size, 12);
        assert_eq!(second.chunk_name, "chunk_00001.mp4");
        assert_eq!(second.recorder_id, "pipeline_1");

        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stops_at_the_first_missing_index() {
        let dir = tempfile::tempdir().unwrap();
        // Index 1 is missing; 2 exists but must not be emitted yet.
        std::fs::write(dir.path().join("chunk_00000.mp4"), b"zero").unwrap();
        std::fs::write(dir.path().join("chunk_00002.mp4"), b"two").unwrap();

        let (watcher, cancel) = watcher(dir.path(), 10);
        let mut rx = watcher.start();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.chunk_name, "chunk_00000.mp4");

        // Nothing else until the gap closes.
        let no_more =
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(no_more.is_err());

        std::fs::write(dir.path().join("chunk_00001.mp4"), b"one").unwrap();

        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(second.chunk_name, "chunk_00001.mp4");
        assert_eq!(third.chunk_name, "chunk_00002.mp4");

        cancel.cancel();
    }

    #[tokio::test]
    async fn skips_empty_files_until_written() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chunk_00000.mp4"), b"").unwrap();

        let (watcher, cancel) = watcher(dir.path(), 10);
        let mut rx = watcher.start();

        let nothing = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(nothing.is_err());

        std::fs::write(dir.path().join("chunk_00000.mp4"), b"now written").unwrap();

        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.chunk_name, "chunk_00000.mp4");
        assert!(chunk.chunk_size > 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn channel_closes_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, cancel) = watcher(dir.path(), 10);
        let mut rx = watcher.start();

        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }
}
