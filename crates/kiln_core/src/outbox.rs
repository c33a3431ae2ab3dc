//! Background task queue for fire-and-forget persistence.
//!
//! Jobs run one at a time on a single worker, in submission order. A failed
//! job is retried with exponential backoff and then logged; it never fails
//! the caller that submitted it. Jobs must be idempotent, since a retry may
//! repeat work that partially succeeded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::CoreResult;

/// A unit of background work.
#[async_trait]
pub trait BackgroundJob: Send + Sync {
    /// Identity of the write this job performs, used in logs.
    fn key(&self) -> String;

    async fn run(&self) -> CoreResult<()>;
}

/// Exponential backoff with a cap.
#[derive(Debug, Clone)]
struct ExponentialBackoff {
    current: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max,
        }
    }

    fn current(&self) -> Duration {
        self.current
    }

    fn next(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }
}

/// Retry policy for background jobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Counters describing what the worker has done.
#[derive(Debug, Default)]
pub struct QueueStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    retries: AtomicUsize,
}

impl QueueStats {
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Jobs that exhausted their attempts.
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::SeqCst)
    }
}

enum Command {
    Job(Box<dyn BackgroundJob>),
    Flush(oneshot::Sender<()>),
    Stop,
}

/// Single-worker queue of background jobs.
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<QueueStats>,
}

impl TaskQueue {
    /// Start a queue with the default retry policy. Requires a Tokio runtime.
    pub fn start() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(QueueStats::default());
        let worker = tokio::spawn(Self::work(rx, policy, stats.clone()));

        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            stats,
        }
    }

    /// Queue a job. Returns `false` if the queue has been shut down.
    pub fn submit(&self, job: impl BackgroundJob + 'static) -> bool {
        let key = job.key();
        match self.tx.send(Command::Job(Box::new(job))) {
            Ok(()) => {
                debug!("Queued background job {}", key);
                true
            }
            Err(_) => {
                error!("Background queue is stopped; dropping job {}", key);
                false
            }
        }
    }

    /// Wait until every job submitted before this call has finished.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Finish outstanding jobs and stop the worker.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Stop);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Background worker ended abnormally: {}", e);
            }
        }
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    async fn work(
        mut rx: mpsc::UnboundedReceiver<Command>,
        policy: RetryPolicy,
        stats: Arc<QueueStats>,
    ) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Job(job) => Self::run_with_retry(job.as_ref(), policy, &stats).await,
                Command::Flush(done) => {
                    let _ = done.send(());
                }
                Command::Stop => break,
            }
        }
        debug!("Background worker stopped");
    }

    async fn run_with_retry(job: &dyn BackgroundJob, policy: RetryPolicy, stats: &QueueStats) {
        let key = job.key();
        let mut backoff = ExponentialBackoff::new(policy.initial_backoff, policy.max_backoff);
        let attempts = policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            match job.run().await {
                Ok(()) => {
                    stats.completed.fetch_add(1, Ordering::SeqCst);
                    debug!("Background job {} done (attempt {})", key, attempt);
                    return;
                }
                Err(e) if attempt < attempts => {
                    stats.retries.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        "Background job {} failed (attempt {}/{}): {}",
                        key, attempt, attempts, e
                    );
                    tokio::time::sleep(backoff.current()).await;
                    backoff.next();
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::SeqCst);
                    error!("Background job {} gave up after {} attempts: {}", key, attempts, e);
                }
            }
        }
    }
}
