use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::Child;

pub mod display;
pub mod livestream;
pub mod recorder;
pub mod watcher;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: &'static str,
        source: std::io::Error,
    },
    #[error("audio sink setup failed: {0}")]
    AudioSink(String),
    #[error("encoder exited with status {0}")]
    EncoderExit(i32),
    #[error("{0} already running")]
    AlreadyRunning(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Delivers `signal` to a running child. Best effort; a child that already
/// exited has no pid and is skipped.
pub(crate) fn send_signal(child: &Child, signal: Signal) {
    if let Some(pid) = child.id() {
        let _ = signal::kill(Pid::from_raw(pid as i32), signal);
    }
}

/// Signal, wait up to `grace`, then kill. Never blocks past the grace period
/// plus the (immediate) post-kill reap.
pub(crate) async fn shutdown_child(
    name: &str,
    child: &mut Child,
    signal: Signal,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    send_signal(child, signal);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            log::warn!("{name} did not stop within {grace:?}, killing it");
            child.start_kill()?;
            child.wait().await
        }
    }
}

/// Exit codes left by our own shutdown signal count as clean: a signal
/// termination carries no code, and ffmpeg reports 255 on SIGINT.
pub(crate) fn is_clean_exit(status: &ExitStatus) -> bool {
    match status.code() {
        None => true,
        Some(0) | Some(255) => true,
        Some(_) => false,
    }
}
