use std::process::Stdio;

use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::ENCODER_STOP_GRACE;
use crate::media::{is_clean_exit, shutdown_child, MediaError};

#[derive(Debug, Clone)]
pub struct LivestreamOptions {
    pub id: String,
    pub stream_url: String,
    pub display_id: String,
    pub monitor_id: String,
    pub width: u32,
    pub height: u32,
    pub show_encoder_logs: bool,
}

/// RTMP push encoder. Shares the pipeline's display and monitor source with
/// the recorder; stop semantics match it (interrupt, grace, kill).
pub struct Livestream {
    opts: LivestreamOptions,
    done: Option<oneshot::Receiver<std::io::Result<std::process::ExitStatus>>>,
    started: bool,
}

impl Livestream {
    pub fn new(opts: LivestreamOptions) -> Self {
        Self {
            opts,
            done: None,
            started: false,
        }
    }

    pub async fn start(&mut self, cancel: CancellationToken) -> Result<(), MediaError> {
        if self.started {
            return Err(MediaError::AlreadyRunning("livestream"));
        }

        log::info!(
            "starting live stream for {} to {}",
            self.opts.id,
            self.opts.stream_url
        );

        let mut child = Command::new("ffmpeg")
            .args(stream_args(
                &self.opts.display_id,
                &self.opts.monitor_id,
                self.opts.width,
                self.opts.height,
                &self.opts.stream_url,
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
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

        if let Some(stderr) = child.stderr.take() {
            let id = self.opts.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("ffmpeg-live[{id}]: {line}");
                }
            });
        }

        let (done_tx, done_rx) = oneshot::channel();
        let id = self.opts.id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    log::info!("cancel observed, stopping live stream for {id}");
                    shutdown_child("livestream", &mut child, Signal::SIGINT, ENCODER_STOP_GRACE)
                        .await
                }
            };
            let _ = done_tx.send(status);
        });

        self.done = Some(done_rx);
        self.started = true;

        log::info!("live stream started for {}", self.opts.id);
        Ok(())
    }

    pub async fn wait_for_exit(&mut self) -> Result<(), MediaError> {
        let Some(done) = self.done.take() else {
            return Ok(());
        };

        match done.await {
            Ok(Ok(status)) if is_clean_exit(&status) => {
                log::info!("live stream for {} stopped with {status}", self.opts.id);
                Ok(())
            }
            Ok(Ok(status)) => Err(MediaError::EncoderExit(status.code().unwrap_or(-1))),
            Ok(Err(err)) => Err(MediaError::Io(err)),
            Err(_) => Ok(()),
        }
    }
}

fn stream_args(
    display_id: &str,
    monitor_id: &str,
    width: u32,
    height: u32,
    stream_url: &str,
) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-loglevel".to_string(),
        "info".to_string(),
        "-f".to_string(),
        "x11grab".to_string(),
        "-video_size".to_string(),
        format!("{width}x{height}"),
        "-i".to_string(),
        display_id.to_string(),
        "-f".to_string(),
        "pulse".to_string(),
        "-i".to_string(),
        monitor_id.to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryslow".to_string(),
        "-maxrate".to_string(),
        "4500k".to_string(),
        "-bufsize".to_string(),
        "9000k".to_string(),
        "-g".to_string(),
        "60".to_string(),
        "-keyint_min".to_string(),
        "60".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "160k".to_string(),
        "-ar".to_string(),
        "44100".to_string(),
        "-flvflags".to_string(),
        "no_duration_filesize".to_string(),
        "-fflags".to_string(),
        "nobuffer".to_string(),
        "-f".to_string(),
        "flv".to_string(),
        "-rtmp_live".to_string(),
        "live".to_string(),
        "-rtmp_buffer".to_string(),
        "3000".to_string(),
        stream_url.to_string(),
    ]
}
