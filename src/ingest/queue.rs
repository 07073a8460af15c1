//! Bounded job queue drained by a fixed pool of workers.
//!
//! Admission never blocks: [`JobQueue::enqueue`] fails straight away when
//! the buffer is full and [`JobQueue::enqueue_with_retry`] retries at a
//! fixed interval for a bounded window. Each job runs in its own task so a
//! panic becomes an error result instead of killing the worker, and each
//! gets a child of the queue's shutdown token so stopping the pool reaches
//! every suspension point inside the job.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::retry::RetryPolicy;
use crate::domain::JobSource;

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;
pub type JobResult = Result<(), JobError>;

type WorkFn = Box<dyn FnOnce(CancellationToken) -> JobFuture + Send + 'static>;
type FinishFn = Box<dyn FnOnce(&JobResult) + Send + 'static>;

/// Why a job did not complete successfully
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0:#}")]
    Failed(anyhow::Error),

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error("Job timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Job cancelled")]
    Cancelled,

    /// Still buffered when the pool shut down
    #[error("Job never started: queue shut down")]
    NotStarted,
}

impl JobError {
    fn status_label(&self) -> &'static str {
        match self {
            Self::Failed(_) => "error",
            Self::Panicked(_) => "panic",
            Self::TimedOut(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::NotStarted => "not_started",
        }
    }
}

/// Ephemeral unit of work tied to one filename
pub struct Job {
    pub id: String,
    pub source: JobSource,
    work: WorkFn,
    on_finish: Option<FinishFn>,
}

impl Job {
    /// Create a job from an async work function.
    ///
    /// The function receives a token that fires on queue shutdown or
    /// when the job exceeds its timeout.
    pub fn new<F, Fut>(id: impl Into<String>, source: JobSource, work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            source,
            work: Box::new(move |token| Box::pin(work(token))),
            on_finish: None,
        }
    }

    /// Callback invoked exactly once with the job's result
    pub fn on_finish(mut self, callback: impl FnOnce(&JobResult) + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(callback));
        self
    }

    fn finish(on_finish: Option<FinishFn>, id: &str, result: &JobResult) {
        if let Some(callback) = on_finish {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                error!(job = %id, "completion callback panicked");
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Rejected admission; the job is handed back to the caller
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("Queue is full")]
    Full(Job),

    #[error("Queue is shut down")]
    Closed(Job),
}

impl EnqueueError {
    pub fn into_job(self) -> Job {
        match self {
            Self::Full(job) | Self::Closed(job) => job,
        }
    }
}

/// Result of [`JobQueue::enqueue_with_retry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub accepted: bool,
    /// The buffer stayed full for the whole window
    pub dropped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub length: usize,
    pub capacity: usize,
    pub worker_count: usize,
    pub processed: u64,
    pub failed: u64,
}

/// What happened during [`JobQueue::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Every worker exited within the timeout
    pub drained: bool,
    /// Buffered jobs that were never started
    pub abandoned: usize,
}

/// Bounded buffer plus worker pool
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

struct Inner {
    capacity: usize,
    job_timeout: Duration,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Job>>,
    shutdown: CancellationToken,
    started: AtomicBool,
    stopping: AtomicBool,
    live_workers: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Create a queue holding at most `capacity` pending jobs.
    ///
    /// Jobs may be enqueued before [`start`](Self::start); they wait in
    /// the buffer until workers exist.
    pub fn new(capacity: usize, job_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                capacity,
                job_timeout,
                tx: Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                live_workers: AtomicUsize::new(0),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Launch `worker_count` workers. Calling it twice is a no-op.
    pub fn start(&self, worker_count: usize) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("job queue already started");
            return;
        }

        let worker_count = worker_count.max(1);
        let mut workers = lock(&self.inner.workers);
        for worker_id in 0..worker_count {
            self.inner.live_workers.fetch_add(1, Ordering::SeqCst);
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                inner.worker_loop(worker_id).await;
                inner.live_workers.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        info!(
            workers = worker_count,
            capacity = self.inner.capacity,
            timeout_secs = self.inner.job_timeout.as_secs(),
            "job queue started"
        );
    }

    /// Non-blocking admission that hands the job back on failure
    pub fn try_enqueue(&self, job: Job) -> Result<(), EnqueueError> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(EnqueueError::Closed(job));
        }
        let tx = lock(&self.inner.tx);
        let Some(tx) = tx.as_ref() else {
            return Err(EnqueueError::Closed(job));
        };
        tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(job) => EnqueueError::Full(job),
            TrySendError::Closed(job) => EnqueueError::Closed(job),
        })
    }

    /// Place a job in the buffer; `false` when full or shut down
    pub fn enqueue(&self, job: Job) -> bool {
        match self.try_enqueue(job) {
            Ok(()) => true,
            Err(e) => {
                let job = e.into_job();
                debug!(job = %job.id, "enqueue rejected");
                false
            }
        }
    }

    /// Retry admission every `interval` until `window` elapses.
    ///
    /// `dropped` is set only when the buffer stayed full for the whole
    /// window; a queue that shuts down meanwhile reports neither.
    pub async fn enqueue_with_retry(
        &self,
        job: Job,
        window: Duration,
        interval: Duration,
    ) -> EnqueueOutcome {
        let policy = RetryPolicy::fixed(u32::MAX, interval);
        let deadline = Instant::now() + window;
        let mut job = job;
        let mut attempt = 1;

        loop {
            match self.try_enqueue(job) {
                Ok(()) => {
                    return EnqueueOutcome {
                        accepted: true,
                        dropped: false,
                    }
                }
                Err(EnqueueError::Closed(_)) => {
                    return EnqueueOutcome {
                        accepted: false,
                        dropped: false,
                    }
                }
                Err(EnqueueError::Full(rejected)) => job = rejected,
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    job = %job.id,
                    job_source = %job.source,
                    window_ms = window.as_millis() as u64,
                    attempts = attempt,
                    "queue full, dropping job"
                );
                return EnqueueOutcome {
                    accepted: false,
                    dropped: true,
                };
            }

            let delay = policy.delay_for_attempt(attempt).min(deadline - now);
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    return EnqueueOutcome { accepted: false, dropped: false };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    pub fn stats(&self) -> QueueStats {
        let length = lock(&self.inner.tx)
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0);
        QueueStats {
            length,
            capacity: self.inner.capacity,
            worker_count: self.inner.live_workers.load(Ordering::SeqCst),
            processed: self.inner.processed.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
        }
    }

    /// False before start, once shutdown begins, or with no live workers
    pub fn healthy(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
            && !self.inner.stopping.load(Ordering::SeqCst)
            && self.inner.live_workers.load(Ordering::SeqCst) > 0
    }

    /// Token that fires when the queue begins shutting down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Stop accepting jobs, signal cancellation, and wait up to `timeout`
    /// for running jobs. Stragglers keep running detached.
    pub async fn stop(&self, timeout: Duration) -> StopReport {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return StopReport {
                drained: true,
                abandoned: 0,
            };
        }
        info!(timeout_secs = timeout.as_secs(), "stopping job queue");

        lock(&self.inner.tx).take();
        self.inner.shutdown.cancel();

        let handles = std::mem::take(&mut *lock(&self.inner.workers));
        let drained = tokio::time::timeout(timeout, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!("job queue stop timed out with jobs still running");
        }

        let mut abandoned = 0;
        if let Ok(mut rx) = self.inner.rx.try_lock() {
            while let Ok(job) = rx.try_recv() {
                abandoned += 1;
                let Job { id, on_finish, .. } = job;
                Job::finish(on_finish, &id, &Err(JobError::NotStarted));
            }
        }
        if abandoned > 0 {
            warn!(abandoned, "buffered jobs abandoned at shutdown");
        }

        StopReport { drained, abandoned }
    }
}

impl Inner {
    async fn worker_loop(&self, worker_id: usize) {
        debug!(worker = worker_id, "worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                job = async { self.rx.lock().await.recv().await } => job,
            };
            let Some(job) = next else { break };
            self.run_job(job, worker_id).await;
        }
        debug!(worker = worker_id, "worker exiting");
    }

    async fn run_job(&self, job: Job, worker_id: usize) {
        let Job {
            id,
            source,
            work,
            on_finish,
        } = job;
        let started = Instant::now();
        let token = self.shutdown.child_token();

        let mut handle = tokio::spawn({
            let token = token.clone();
            async move { work(token).await }
        });

        let result = match tokio::time::timeout(self.job_timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(JobError::Failed(e)),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(JobError::Panicked(panic_message(join_err.into_panic())))
            }
            Ok(Err(_)) => Err(JobError::Cancelled),
            Err(_) => {
                token.cancel();
                handle.abort();
                Err(JobError::TimedOut(self.job_timeout))
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::SeqCst);
                info!(job = %id, job_source = %source, worker = worker_id, duration_ms, status = "ok", "job finished");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                warn!(
                    job = %id,
                    job_source = %source,
                    worker = worker_id,
                    duration_ms,
                    status = e.status_label(),
                    error = %e,
                    "job finished"
                );
            }
        }

        Job::finish(on_finish, &id, &result);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
