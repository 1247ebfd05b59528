//! Bounded cooperative worker pool
//!
//! All subscriber dispatch loops submit through one pool, so the pool's
//! capacity is the framework-wide cap on concurrent handler invocation.
//!
//! The pool keeps `count` resident workers warm and grows with ephemeral
//! workers up to `capacity`; an ephemeral worker that stays idle past the
//! configured expiry releases itself. Workers share a single job channel
//! behind a mutex: exactly one worker waits on the channel at a time, the
//! rest are either running jobs or queued on the mutex.
//!
//! Job failures are reported through an optional per-job result sink and
//! never poison the pool. A separate stop-error path exists for failures
//! the pool owner must react to by shutting the service down.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerPoolConfig;
use crate::context::RequestContext;
use crate::error::{Error, Result};

/// Boxed future returned by a job
pub type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A unit of work: runs to completion with the context it was submitted under
pub type Job = Box<dyn FnOnce(RequestContext) -> JobFuture + Send>;

/// Optional channel a job's outcome is forwarded to
pub type ResultSink = mpsc::UnboundedSender<Result<()>>;

/// Callback invoked when a fatal error is escalated through the pool
pub type StopErrorHandler = Arc<dyn Fn(Error) + Send + Sync>;

struct QueuedJob {
    ctx: RequestContext,
    job: Job,
    sink: Option<ResultSink>,
}

/// Bounded pool of reusable workers
pub struct WorkerPool {
    jobs_tx: mpsc::Sender<QueuedJob>,
    jobs_rx: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    capacity: usize,
    expiry: Duration,
    workers: Arc<AtomicUsize>,
    busy: Arc<AtomicUsize>,
    on_stop: StopErrorHandler,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Create a pool and spawn its resident workers.
    ///
    /// `on_stop` is the single stop-error callback: it fires once per
    /// [`WorkerPool::stop_error`] call and is expected to trigger service
    /// shutdown.
    pub fn new(config: &WorkerPoolConfig, on_stop: StopErrorHandler) -> Arc<Self> {
        let capacity = config.effective_capacity();
        let count = config.count.clamp(1, capacity);

        let (jobs_tx, jobs_rx) = mpsc::channel(1);

        let pool = Arc::new(Self {
            jobs_tx,
            jobs_rx: Arc::new(Mutex::new(jobs_rx)),
            capacity,
            expiry: config.expiry(),
            workers: Arc::new(AtomicUsize::new(0)),
            busy: Arc::new(AtomicUsize::new(0)),
            on_stop,
            shutdown: CancellationToken::new(),
        });

        for _ in 0..count {
            pool.workers.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(Self::resident_worker(pool.clone()));
        }

        tracing::debug!(capacity, count, "worker pool started");
        pool
    }

    /// Maximum number of concurrently running jobs.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of jobs currently executing.
    pub fn active_jobs(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Submit a job, blocking cooperatively while the pool is saturated.
    ///
    /// Cancellation of `ctx` aborts the submission; the pool being shut down
    /// rejects it. A submitted job always runs to completion and its outcome
    /// goes to `sink` when one is provided.
    pub async fn submit(
        &self,
        ctx: &RequestContext,
        job: Job,
        sink: Option<ResultSink>,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::PoolBusy("worker pool is shut down".to_string()));
        }

        self.scale_up();

        let queued = QueuedJob {
            ctx: ctx.clone(),
            job,
            sink,
        };

        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(Error::Cancelled),
            sent = self.jobs_tx.send(queued) => {
                sent.map_err(|_| Error::PoolBusy("worker pool is shut down".to_string()))
            }
        }
    }

    /// Escalate a fatal error to the pool owner.
    ///
    /// Used by subscribers when job submission or subscription recreation
    /// fails; the installed callback is expected to stop the service.
    pub fn stop_error(&self, err: Error) {
        tracing::error!(error = %err, "fatal error escalated through worker pool");
        (self.on_stop)(err);
    }

    /// Shut the pool down: no further submissions are accepted and idle
    /// workers exit. Jobs already running complete on their own contexts.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Spawn an ephemeral worker when every current worker is busy and the
    /// capacity allows one more. The count check and the increment race with
    /// concurrent submitters, so overshoot is corrected by decrementing.
    fn scale_up(&self) {
        let workers = self.workers.load(Ordering::SeqCst);
        if self.busy.load(Ordering::SeqCst) < workers || workers >= self.capacity {
            return;
        }
        if self.workers.fetch_add(1, Ordering::SeqCst) >= self.capacity {
            self.workers.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let rx = self.jobs_rx.clone();
        let busy = self.busy.clone();
        let workers = self.workers.clone();
        let shutdown = self.shutdown.clone();
        let expiry = self.expiry;
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    received = tokio::time::timeout(expiry, async {
                        rx.lock().await.recv().await
                    }) => received.unwrap_or(None),
                };
                match received {
                    Some(queued) => Self::run_job(&busy, queued).await,
                    None => break,
                }
            }
            workers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn resident_worker(pool: Arc<Self>) {
        loop {
            let received = tokio::select! {
                _ = pool.shutdown.cancelled() => None,
                received = async { pool.jobs_rx.lock().await.recv().await } => received,
            };
            match received {
                Some(queued) => Self::run_job(&pool.busy, queued).await,
                None => break,
            }
        }
        pool.workers.fetch_sub(1, Ordering::SeqCst);
    }

    async fn run_job(busy: &AtomicUsize, queued: QueuedJob) {
        busy.fetch_add(1, Ordering::SeqCst);
        let outcome = (queued.job)(queued.ctx).await;
        if let Err(err) = &outcome {
            tracing::warn!(error = %err, "job finished with error");
        }
        if let Some(sink) = queued.sink {
            let _ = sink.send(outcome);
        }
        busy.fetch_sub(1, Ordering::SeqCst);
    }
}
