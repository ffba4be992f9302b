use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::ENCODER_STOP_GRACE;
use crate::media::{is_clean_exit, shutdown_child, MediaError};

/// Where the capture encoder writes.
#[derive(Debug, Clone)]
pub enum RecorderMode {
    /// Fragmented MP4 on the encoder's stdout pipe.
    Streaming,
    /// Self-contained MP4 segments in a per-pipeline directory.
    Segmented {
        segment_secs: u64,
        directory: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct RecorderOptions {
    pub id: String,
    pub display_id: String,
    pub monitor_id: String,
    pub width: u32,
    pub height: u32,
    pub mode: RecorderMode,
    /// Forward ffmpeg's stderr into the service log.
    pub show_encoder_logs: bool,
}

/// The capture encoder: one ffmpeg child grabbing the virtual display and the
/// pipeline's monitor source. Registers itself on the cancellation token; on
/// cancel it interrupts the child, waits out the grace period, then kills.
pub struct Recorder {
    opts: RecorderOptions,
    stdout: Option<BufReader<ChildStdout>>,
    done: Option<oneshot::Receiver<std::io::Result<std::process::ExitStatus>>>,
    started: bool,
}

impl Recorder {
    pub fn new(opts: RecorderOptions) -> Self {
        Self {
            opts,
            stdout: None,
            done: None,
            started: false,
        }
    }

    pub fn segment_directory(&self) -> Option<&Path> {
        match &self.opts.mode {
            RecorderMode::Segmented { directory, .. } => Some(directory),
            RecorderMode::Streaming => None,
        }
    }

    pub async fn start(&mut self, cancel: CancellationToken) -> Result<(), MediaError> {
        if self.started {
            return Err(MediaError::AlreadyRunning("recorder"));
        }

        let streaming = matches!(self.opts.mode, RecorderMode::Streaming);
        let args = match &self.opts.mode {
            RecorderMode::Streaming => streaming_args(
                &self.opts.display_id,
                &self.opts.monitor_id,
                self.opts.width,
                self.opts.height,
            ),
            RecorderMode::Segmented {
                segment_secs,
                directory,
            } => {
                tokio::fs::create_dir_all(directory).await?;
                segmented_args(
                    &self.opts.display_id,
                    &self.opts.monitor_id,
                    self.opts.width,
                    self.opts.height,
                    *segment_secs,
                    directory,
                )
            }
        };

        log::info!("starting capture encoder for {}", self.opts.id);

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(if streaming {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(if self.opts.show_encoder_logs {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .spawn()
            .map_err(|source| MediaError::Spawn {
                binary: "ffmpeg",
                source,
            })?;

        if streaming {
            let stdout = child.stdout.take().ok_or_else(|| {
                MediaError::Io(std::io::Error::other("encoder stdout pipe missing"))
            })?;
            self.stdout = Some(BufReader::new(stdout));
        }

        if let Some(stderr) = child.stderr.take() {
            let id = self.opts.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("ffmpeg[{id}]: {line}");
                }
            });
        }

        // Single owner of the child: waits for a natural exit or for the
        // pipeline cancel, then reports the status exactly once.
        let (done_tx, done_rx) = oneshot::channel();
        let id = self.opts.id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    log::info!("cancel observed, stopping encoder for {id}");
                    shutdown_child("encoder", &mut child, Signal::SIGINT, ENCODER_STOP_GRACE).await
                }
            };
            let _ = done_tx.send(status);
        });

        self.done = Some(done_rx);
        self.started = true;

        log::info!("capture encoder started for {}", self.opts.id);
        Ok(())
    }

    /// Buffered reader over the encoder's stdout. Single-reader by
    /// construction; available once, streaming mode only.
    pub fn take_reader(&mut self) -> Option<BufReader<ChildStdout>> {
        self.stdout.take()
    }

    /// Waits for the encoder to exit and classifies the status. Must be
    /// observed before the pipeline's stop returns.
    pub async fn wait_for_exit(&mut self) -> Result<(), MediaError> {
        let Some(done) = self.done.take() else {
            return Ok(());
        };

        match done.await {
            Ok(Ok(status)) if is_clean_exit(&status) => {
                log::info!("encoder for {} stopped with {status}", self.opts.id);
                Ok(())
            }
            Ok(Ok(status)) => Err(MediaError::EncoderExit(status.code().unwrap_or(-1))),
            Ok(Err(err)) => Err(MediaError::Io(err)),
            // Supervisor dropped without reporting; nothing left to wait on.
            Err(_) => Ok(()),
        }
    }
}

fn capture_input_args(display_id: &str, monitor_id: &str, width: u32, height: u32) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-loglevel".to_string(),
        "info".to_string(),
        "-thread_queue_size".to_string(),
        "512".to_string(),
        "-video_size".to_string(),
        format!("{width}x{height}"),
        "-f".to_string(),
        "x11grab".to_string(),
        "-i".to_string(),
        display_id.to_string(),
        "-f".to_string(),
        "pulse".to_string(),
        "-i".to_string(),
        monitor_id.to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "ultrafast".to_string(),
        "-crf".to_string(),
        "23".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "128k".to_string(),
        "-async".to_string(),
        "1".to_string(),
    ]
}

fn streaming_args(display_id: &str, monitor_id: &str, width: u32, height: u32) -> Vec<String> {
    let mut args = capture_input_args(display_id, monitor_id, width, height);
    args.extend(
        [
            "-f",
            "mp4",
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof",
            "-bufsize",
            "2M",
            "-flush_packets",
            "1",
            "-y",
            "pipe:1",
        ]
        .map(String::from),
    );
    args
}

fn segmented_args(
    display_id: &str,
    monitor_id: &str,
    width: u32,
    height: u32,
    segment_secs: u64,
    directory: &Path,
) -> Vec<String> {
    let mut args = capture_input_args(display_id, monitor_id, width, height);
    args.extend([
        "-f".to_string(),
        "segment".to_string(),
        "-segment_time".to_string(),
        segment_secs.to_string(),
        "-segment_format".to_string(),
        "mp4".to_string(),
        "-reset_timestamps".to_string(),
        "1".to_string(),
        "-segment_list".to_string(),
        directory.join("out.list").to_string_lossy().to_string(),
        "-y".to_string(),
        directory.join("chunk_%05d.mp4").to_string_lossy().to_string(),
    ]);
    args
}
