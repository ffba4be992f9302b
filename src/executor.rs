use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Backoff doubling stops here.
const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// One unit of retryable work. `run` is re-invoked on every attempt;
/// exactly one of `on_success` / `on_error` fires, once.
pub struct Job {
    pub id: String,
    pub cancel: CancellationToken,
    pub run: Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>,
    pub on_success: Box<dyn FnOnce() + Send>,
    pub on_error: Box<dyn FnOnce(anyhow::Error) + Send>,
}

#[derive(Debug, Clone)]
pub struct WorkerExecutorOptions {
    pub max_retries: u32,
    pub worker_count: usize,
    pub retry_backoff: Duration,
}

impl Default for WorkerExecutorOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            worker_count: 5,
            retry_backoff: Duration::from_secs(10),
        }
    }
}

/// Fixed-size worker pool draining an unbounded job queue with retry and
/// exponential backoff. Dropping the sender side (`stop`) lets workers finish
/// the queued jobs and exit; cancelling the token fails queued jobs instead.
pub struct WorkerExecutor {
    cancel: CancellationToken,
    jobs: Option<mpsc::UnboundedSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerExecutor {
    pub fn new(cancel: CancellationToken, opts: WorkerExecutorOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..opts.worker_count)
            .map(|_| {
                let cancel = cancel.clone();
                let rx = Arc::clone(&rx);
                let opts = opts.clone();
                tokio::spawn(async move { run_worker(cancel, rx, opts).await })
            })
            .collect();

        Self {
            cancel,
            jobs: Some(tx),
            workers,
        }
    }

    /// Adds a job to the queue. A job enqueued after `stop` fails immediately.
    pub fn enqueue(&self, job: Job) {
        match &self.jobs {
            Some(tx) => {
                if let Err(send_err) = tx.send(job) {
                    let job = send_err.0;
                    (job.on_error)(anyhow::anyhow!("executor queue closed"));
                }
            }
            None => (job.on_error)(anyhow::anyhow!("executor stopped")),
        }
    }

    /// Closes the queue. Workers drain what is already queued and exit.
    pub fn stop(&mut self) {
        self.jobs.take();
    }

    /// Returns once every worker has exited. This is the flush point the
    /// pipeline uses during shutdown.
    pub async fn wait(&mut self) {
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }

    /// Cheap handle for producers that outlive the borrow on the executor.
    /// Every handle must be dropped before the queue is considered closed,
    /// so `wait` only returns once producers are done.
    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            jobs: self.jobs.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ExecutorHandle {
    jobs: Option<mpsc::UnboundedSender<Job>>,
}

impl ExecutorHandle {
    pub fn enqueue(&self, job: Job) {
        match &self.jobs {
            Some(tx) => {
                if let Err(send_err) = tx.send(job) {
                    let job = send_err.0;
                    (job.on_error)(anyhow::anyhow!("executor queue closed"));
                }
            }
            None => (job.on_error)(anyhow::anyhow!("executor stopped")),
        }
    }
}

async fn run_worker(
    cancel: CancellationToken,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    opts: WorkerExecutorOptions,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                // Cancellation must win over a ready queue: queued jobs are
                // failed, never executed.
                biased;
                _ = cancel.cancelled() => {
                    fail_queued(&mut rx);
                    return;
                }
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => return,
                },
            }
        };

        // The token can trip between poll rounds; a job dequeued after that
        // point is failed as well.
        if cancel.is_cancelled() {
            (job.on_error)(anyhow::anyhow!("executor cancelled"));
            fail_queued(&mut *rx.lock().await);
            return;
        }

        process_job(job, &cancel, &opts).await;
    }
}

/// Fails everything still queued so callers hear about it.
fn fail_queued(rx: &mut mpsc::UnboundedReceiver<Job>) {
    while let Ok(job) = rx.try_recv() {
        (job.on_error)(anyhow::anyhow!("executor cancelled"));
    }
}

async fn process_job(job: Job, cancel: &CancellationToken, opts: &WorkerExecutorOptions) {
    let Job {
        id,
        cancel: job_cancel,
        run,
        on_success,
        on_error,
    } = job;

    if job_cancel.is_cancelled() {
        on_error(anyhow::anyhow!("job {id} cancelled before first attempt"));
        return;
    }

    let mut backoff = opts.retry_backoff;

    for attempt in 0..=opts.max_retries {
        match run().await {
            Ok(()) => {
                log::info!("job {id} completed on attempt {}", attempt + 1);
                on_success();
                return;
            }
            Err(err) => {
                if attempt == opts.max_retries {
                    log::warn!("job {id} failed after {} attempts: {err:#}", attempt + 1);
                    on_error(err);
                    return;
                }
                log::warn!("job {id} attempt {} failed: {err:#}, retrying in {backoff:?}", attempt + 1);

                if !backoff.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {
                            backoff = (backoff * 2).min(BACKOFF_CAP);
                        }
                        _ = job_cancel.cancelled() => {
                            on_error(anyhow::anyhow!("job {id} cancelled"));
                            return;
                        }
                        _ = cancel.cancelled() => {
                            on_error(anyhow::anyhow!("executor cancelled"));
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "executor_test.rs"]
mod executor_test;
