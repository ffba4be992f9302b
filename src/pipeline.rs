use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chunker::Chunker;
use crate::config::{AppConfig, BROWSER_SETTLE};
use crate::executor::{WorkerExecutor, WorkerExecutorOptions};
use crate::media::display::{Display, DisplayOptions};
use crate::media::livestream::{Livestream, LivestreamOptions};
use crate::media::recorder::{Recorder, RecorderMode, RecorderOptions};
use crate::media::watcher::{SegmentWatcher, SegmentWatcherOptions, DEFAULT_POLL_INTERVAL};
use crate::media::MediaError;
use crate::store::{CompletedUpload, ObjectStore, StoreError};
use crate::uploader::MultipartUploader;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("display startup failed: {0}")]
    Display(#[source] MediaError),
    #[error("recorder startup failed: {0}")]
    Recorder(#[source] MediaError),
    #[error("livestream startup failed: {0}")]
    Livestream(#[source] MediaError),
    #[error("uploader startup failed: {0}")]
    Uploader(#[from] StoreError),
    #[error("pipeline cancelled during startup")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub record_url: String,
    pub stream_url: Option<String>,
    /// Segment duration; `Some` selects segmented mode.
    pub chunking: Option<Duration>,
}

#[derive(Default)]
struct PipelineState {
    display: Option<Display>,
    recorder: Option<Recorder>,
    livestream: Option<Livestream>,
    uploader: Option<Arc<MultipartUploader>>,
    drain: Option<JoinHandle<Result<(), StoreError>>>,
    executor: Option<WorkerExecutor>,
    forwarder: Option<JoinHandle<()>>,
    stopped: bool,
}

/// One recording: the display group, the capture encoder, its upload path
/// and the optional live stream, all under a single cancellable scope.
/// `stop` is the sole destructor path.
pub struct Pipeline {
    pub id: String,
    opts: PipelineOptions,
    cancel: CancellationToken,
    /// Parent scope; the chunk-upload pool lives under this rather than the
    /// pipeline token so a stop can still flush queued work on the server's
    /// schedule.
    server_cancel: CancellationToken,
    state: tokio::sync::Mutex<PipelineState>,
}

/// Disambiguates pipelines created within the same millisecond. The id names
/// the null sink and the storage path, so it must never collide.
static PIPELINE_SEQ: AtomicU64 = AtomicU64::new(0);

impl Pipeline {
    pub fn new(server_cancel: &CancellationToken, opts: PipelineOptions) -> Self {
        let id = format!(
            "pipeline_{}_{}",
            Utc::now().timestamp_millis(),
            PIPELINE_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        Self {
            id,
            opts,
            cancel: server_cancel.child_token(),
            server_cancel: server_cancel.clone(),
            state: tokio::sync::Mutex::new(PipelineState::default()),
        }
    }

    /// Brings the pipeline up: display group, encoder plus its upload path,
    /// then the optional live stream. Any failure tears down everything
    /// acquired so far before returning.
    pub async fn start(
        &self,
        store: Arc<dyn ObjectStore>,
        config: &AppConfig,
    ) -> Result<(), PipelineError> {
        let result = self.start_inner(store, config).await;

        if let Err(err) = &result {
            log::error!("pipeline {} start failed: {err}", self.id);
            if let Err(stop_err) = self.stop().await {
                log::error!("rollback of pipeline {} failed: {stop_err:#}", self.id);
            }
        }

        result
    }

    async fn start_inner(
        &self,
        store: Arc<dyn ObjectStore>,
        config: &AppConfig,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;

        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Display group: framebuffer, audio sink, browser, in that order.
        let mut display = Display::new(DisplayOptions {
            id: self.id.clone(),
            width: config.display.width,
            height: config.display.height,
            depth: config.display.depth,
        });
        display
            .launch(&self.opts.record_url)
            .await
            .map_err(PipelineError::Display)?;

        let display_id = display.display_id().to_string();
        let monitor_id = display.pulse_monitor_id();
        let (width, height) = (display.width(), display.height());
        state.display = Some(display);

        // Let the page render before capture starts.
        tokio::select! {
            _ = tokio::time::sleep(BROWSER_SETTLE) => {}
            _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
        }

        let mode = match self.opts.chunking {
            Some(duration) => RecorderMode::Segmented {
                segment_secs: duration.as_secs().max(1),
                directory: config.pipeline_dir(&self.id),
            },
            None => RecorderMode::Streaming,
        };
        let segmented = matches!(mode, RecorderMode::Segmented { .. });

        let mut recorder = Recorder::new(RecorderOptions {
            id: self.id.clone(),
            display_id: display_id.clone(),
            monitor_id: monitor_id.clone(),
            width,
            height,
            mode,
            show_encoder_logs: false,
        });
        recorder
            .start(self.cancel.clone())
            .await
            .map_err(PipelineError::Recorder)?;

        if segmented {
            let directory = recorder
                .segment_directory()
                .map(|dir| dir.to_path_buf())
                .unwrap_or_else(|| config.pipeline_dir(&self.id));

            let watcher = SegmentWatcher::new(
                SegmentWatcherOptions {
                    recorder_id: self.id.clone(),
                    directory,
                    poll_interval: DEFAULT_POLL_INTERVAL,
                },
                self.cancel.clone(),
            );
            let chunks = watcher.start();

            let executor = WorkerExecutor::new(
                self.server_cancel.child_token(),
                WorkerExecutorOptions::default(),
            );
            let chunker = Chunker::new(Arc::clone(&store), self.cancel.clone());
            state.forwarder = Some(chunker.attach(chunks, executor.handle()));
            state.executor = Some(executor);
        } else {
            let reader = recorder.take_reader().ok_or_else(|| {
                PipelineError::Recorder(MediaError::Io(std::io::Error::other(
                    "encoder reader unavailable",
                )))
            })?;

            let uploader = Arc::new(MultipartUploader::new(Arc::clone(&store), &self.id).await?);
            state.drain = Some(tokio::spawn(Arc::clone(&uploader).run(reader)));
            state.uploader = Some(uploader);
        }

        state.recorder = Some(recorder);

        if let Some(stream_url) = &self.opts.stream_url {
            let mut livestream = Livestream::new(LivestreamOptions {
                id: self.id.clone(),
                stream_url: stream_url.clone(),
                display_id,
                monitor_id,
                width,
                height,
                show_encoder_logs: false,
            });
            livestream
                .start(self.cancel.clone())
                .await
                .map_err(PipelineError::Livestream)?;
            state.livestream = Some(livestream);
        }

        log::info!("pipeline {} started", self.id);
        Ok(())
    }

    /// Cancels the scope and releases every child in reverse order, then
    /// flushes the upload path. Idempotent: a second call after the first
    /// returns is a no-op.
    pub async fn stop(&self) -> anyhow::Result<Option<CompletedUpload>> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Ok(None);
        }
        state.stopped = true;

        log::info!("stopping pipeline {}", self.id);
        self.cancel.cancel();

        if let Some(mut display) = state.display.take() {
            display.close().await;
        }

        if let Some(mut livestream) = state.livestream.take() {
            if let Err(err) = livestream.wait_for_exit().await {
                log::warn!("livestream for {} exited abnormally: {err}", self.id);
            }
        }

        // The encoder's exit status is observed before stop returns.
        if let Some(mut recorder) = state.recorder.take() {
            if let Err(err) = recorder.wait_for_exit().await {
                log::warn!("encoder for {} exited abnormally: {err}", self.id);
            }
        }

        if let Some(drain) = state.drain.take() {
            match drain.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log::warn!("uploader drain for {} failed: {err}", self.id),
                Err(err) => log::warn!("uploader drain task for {} panicked: {err}", self.id),
            }
        }

        let mut completed = None;
        if let Some(uploader) = state.uploader.take() {
            completed = Some(uploader.complete().await?);
        }

        if let Some(forwarder) = state.forwarder.take() {
            let _ = forwarder.await;
        }
        if let Some(mut executor) = state.executor.take() {
            executor.stop();
            executor.wait().await;
        }

        log::info!("pipeline {} stopped", self.id);
        Ok(completed)
    }
}
