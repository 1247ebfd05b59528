//! Named subscriber with a pool-bounded dispatch loop
//!
//! A subscriber owns one driver subscription and, when handlers are
//! registered, a background dispatch loop that pulls deliveries and submits
//! processing jobs to the shared worker pool. Handlers of one delivery run
//! sequentially; deliveries run concurrently up to the pool's capacity.
//!
//! A subscriber with no handlers is a pull-only endpoint: callers drive
//! [`Subscriber::receive`] themselves and no loop is spawned.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::driver::{self, Delivery, Subscription};
use crate::claims::{AuthenticationClaims, METADATA_LANGUAGE, METADATA_SKIP_TENANCY};
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::observability;
use crate::workers::WorkerPool;

/// Shutdown budget applied to subscriber teardown
const STOP_BUDGET: Duration = Duration::from_secs(1);

/// Observable subscriber lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriberState {
    /// Blocked on the driver waiting for a delivery
    Waiting = 0,
    /// At least one delivery is being processed
    Processing = 1,
    /// The last receive failed with a non-cancellation error
    InError = 2,
}

impl SubscriberState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Processing,
            2 => Self::InError,
            _ => Self::Waiting,
        }
    }
}

/// Atomic counters describing a subscriber's throughput
#[derive(Debug, Default)]
pub struct SubscriberMetrics {
    active_messages: AtomicI64,
    last_activity_unix_nanos: AtomicI64,
    total_processing_time_nanos: AtomicU64,
    message_count: AtomicU64,
    error_count: AtomicU64,
}

impl SubscriberMetrics {
    /// Deliveries currently being processed.
    pub fn active_messages(&self) -> i64 {
        self.active_messages.load(Ordering::SeqCst)
    }

    /// Unix timestamp (nanoseconds) of the last receive or completion.
    pub fn last_activity_unix_nanos(&self) -> i64 {
        self.last_activity_unix_nanos.load(Ordering::SeqCst)
    }

    /// Deliveries fully processed (acked or nacked).
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    /// Receive and processing failures observed.
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Idle iff waiting on the driver with nothing in flight.
    pub fn is_idle(&self, state: SubscriberState) -> bool {
        state == SubscriberState::Waiting && self.active_messages() <= 0
    }

    /// Time since last activity when idle; zero otherwise.
    pub fn idle_time(&self, state: SubscriberState) -> Duration {
        if !self.is_idle(state) {
            return Duration::ZERO;
        }
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let idle = now.saturating_sub(self.last_activity_unix_nanos());
        Duration::from_nanos(idle.max(0) as u64)
    }

    /// Mean processing time per delivery; zero before the first one.
    pub fn avg_processing_time(&self) -> Duration {
        let count = self.message_count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_processing_time_nanos.load(Ordering::SeqCst) / count)
    }

    fn record_activity(&self) {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        self.last_activity_unix_nanos.store(now, Ordering::SeqCst);
    }

    fn record_receive(&self) {
        self.active_messages.fetch_add(1, Ordering::SeqCst);
        self.record_activity();
    }

    fn record_receive_error(&self) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
        self.record_activity();
    }

    fn record_completion(&self, elapsed: Duration, errored: bool) {
        self.total_processing_time_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::SeqCst);
        self.message_count.fetch_add(1, Ordering::SeqCst);
        self.active_messages.fetch_sub(1, Ordering::SeqCst);
        if errored {
            self.error_count.fetch_add(1, Ordering::SeqCst);
        }
        self.record_activity();
    }

    fn record_dispatch_failure(&self) {
        self.active_messages.fetch_sub(1, Ordering::SeqCst);
        self.error_count.fetch_add(1, Ordering::SeqCst);
        self.record_activity();
    }
}

/// Message handler invoked by the dispatch loop
#[async_trait]
pub trait SubscribeWorker: Send + Sync {
    /// Process one delivery. The context carries the claims, language and
    /// tenancy flags reconstructed from the message metadata.
    async fn handle(
        &self,
        ctx: &RequestContext,
        metadata: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<()>;
}

type HandlerFuture = std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct FnWorker<F> {
    f: F,
}

#[async_trait]
impl<F> SubscribeWorker for FnWorker<F>
where
    F: Fn(RequestContext, HashMap<String, String>, Vec<u8>) -> HandlerFuture + Send + Sync,
{
    async fn handle(
        &self,
        ctx: &RequestContext,
        metadata: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<()> {
        (self.f)(ctx.clone(), metadata.clone(), body.to_vec()).await
    }
}

/// Wrap an async closure as a [`SubscribeWorker`].
pub fn worker_fn<F, Fut>(f: F) -> Arc<dyn SubscribeWorker>
where
    F: Fn(RequestContext, HashMap<String, String>, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnWorker {
        f: move |ctx, metadata, body| Box::pin(f(ctx, metadata, body)) as HandlerFuture,
    })
}

/// Lazily-initialized receiver bound to one destination DSN
pub struct Subscriber {
    reference: String,
    url: String,
    handlers: Vec<Arc<dyn SubscribeWorker>>,
    subscription: RwLock<Option<Box<dyn Subscription>>>,
    initiated: AtomicBool,
    state: AtomicU8,
    metrics: Arc<SubscriberMetrics>,
    pool: Arc<WorkerPool>,
    // Serializes init and recreate against stop so a fresh handle is never
    // opened mid-teardown
    stop_lock: Mutex<()>,
    loop_token: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    pub(crate) fn new(
        reference: impl Into<String>,
        url: impl Into<String>,
        handlers: Vec<Arc<dyn SubscribeWorker>>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            reference: reference.into(),
            url: url.into(),
            handlers,
            subscription: RwLock::new(None),
            initiated: AtomicBool::new(false),
            state: AtomicU8::new(SubscriberState::Waiting as u8),
            metrics: Arc::new(SubscriberMetrics::default()),
            pool,
            stop_lock: Mutex::new(()),
            loop_token: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    /// Name the subscriber is registered under.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Source DSN.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the subscriber has been initialized.
    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Throughput counters.
    pub fn metrics(&self) -> &Arc<SubscriberMetrics> {
        &self.metrics
    }

    /// Open the driver handle and, when handlers are registered, start the
    /// dispatch loop. `http(s)` DSNs are pull-mode and open nothing here.
    /// Idempotent.
    pub async fn init(self: &Arc<Self>, ctx: &RequestContext) -> Result<()> {
        if self.initiated.load(Ordering::SeqCst) {
            return Ok(());
        }

        let _guard = self.stop_lock.lock().await;
        if self.initiated.load(Ordering::SeqCst) {
            return Ok(());
        }

        if !driver::is_pull_mode(&self.url) {
            let subscription = driver::open_subscription(&self.url).await?;
            *self.subscription.write().await = Some(subscription);

            if !self.handlers.is_empty() {
                let subscriber = self.clone();
                let loop_ctx = ctx.clone();
                let handle = tokio::spawn(async move {
                    subscriber.dispatch_loop(loop_ctx).await;
                });
                *self.loop_handle.lock().await = Some(handle);
            }
        }

        self.state
            .store(SubscriberState::Waiting as u8, Ordering::SeqCst);
        self.initiated.store(true, Ordering::SeqCst);
        tracing::debug!(reference = %self.reference, url = %self.url, "subscriber initialized");
        Ok(())
    }

    /// Block until the driver yields one delivery.
    ///
    /// Cancellation of `ctx` is returned unchanged; any other driver error
    /// marks the subscriber in-error and is returned for the caller (or the
    /// dispatch loop) to recover from.
    pub async fn receive(&self, ctx: &RequestContext) -> Result<Delivery> {
        let guard = self.subscription.read().await;
        let subscription = guard.as_deref().ok_or(Error::NotInitialized("subscriber"))?;

        self.state
            .store(SubscriberState::Waiting as u8, Ordering::SeqCst);
        self.metrics.record_activity();

        match subscription.receive(ctx).await {
            Ok(delivery) => {
                self.state
                    .store(SubscriberState::Processing as u8, Ordering::SeqCst);
                self.metrics.record_receive();
                Ok(delivery)
            }
            Err(err) if err.is_cancellation() => Err(err),
            Err(err) => {
                self.state
                    .store(SubscriberState::InError as u8, Ordering::SeqCst);
                self.metrics.record_receive_error();
                Err(err)
            }
        }
    }

    /// Tear the subscriber down: the dispatch loop exits and the driver
    /// handle (if any) is shut within a 1-second budget on its own timer.
    /// Safe to call repeatedly.
    pub async fn stop(&self, _ctx: &RequestContext) -> Result<()> {
        self.initiated.store(false, Ordering::SeqCst);
        self.loop_token.cancel();

        let teardown = async {
            let _guard = self.stop_lock.lock().await;
            match self.subscription.write().await.take() {
                Some(subscription) => subscription.shutdown().await,
                None => Ok(()),
            }
        };

        match tokio::time::timeout(STOP_BUDGET, teardown).await {
            Ok(result) => result,
            Err(_) => Err(Error::Driver(format!(
                "subscriber {} shutdown timed out",
                self.reference
            ))),
        }
    }

    /// Close and reopen the driver handle in place after a receive failure.
    async fn recreate(&self) -> Result<()> {
        let _guard = self.stop_lock.lock().await;

        if let Some(old) = self.subscription.write().await.take() {
            if let Err(err) = old.shutdown().await {
                tracing::debug!(reference = %self.reference, error = %err,
                    "ignoring shutdown error while recreating subscription");
            }
        }

        let fresh = driver::open_subscription(&self.url).await?;
        *self.subscription.write().await = Some(fresh);
        tracing::info!(reference = %self.reference, "subscription recreated");
        Ok(())
    }

    async fn dispatch_loop(self: Arc<Self>, outer: RequestContext) {
        loop {
            let received = tokio::select! {
                _ = outer.cancellation().cancelled() => {
                    let _ = self.stop(&outer).await;
                    return;
                }
                _ = self.loop_token.cancelled() => return,
                received = self.receive(&outer) => received,
            };

            match received {
                // The outer select re-checks cancellation on the next turn
                Err(err) if err.is_cancellation() => continue,
                Err(err) => {
                    tracing::warn!(reference = %self.reference, error = %err,
                        "receive failed, recreating subscription");
                    if let Err(recreate_err) = self.recreate().await {
                        self.pool.stop_error(Error::Fatal(format!(
                            "subscriber {} could not recreate its subscription: {recreate_err}",
                            self.reference
                        )));
                        let _ = self.stop(&outer).await;
                        return;
                    }
                }
                Ok(delivery) => {
                    let acker = delivery.acker();
                    let subscriber = self.clone();
                    let job = Box::new(move |job_ctx: RequestContext| {
                        Box::pin(async move {
                            subscriber.process_delivery(job_ctx, delivery).await
                        }) as crate::workers::JobFuture
                    });

                    if let Err(submit_err) = self.pool.submit(&outer, job, None).await {
                        if let Some(acker) = acker {
                            acker.nack().await;
                        }
                        self.metrics.record_dispatch_failure();
                        tracing::error!(reference = %self.reference, error = %submit_err,
                            "failed to submit processing job");
                        self.pool.stop_error(Error::Fatal(format!(
                            "subscriber {} could not submit a processing job: {submit_err}",
                            self.reference
                        )));
                        let _ = self.stop(&outer).await;
                        return;
                    }
                }
            }
        }
    }

    /// Run every handler against one delivery and settle it.
    async fn process_delivery(&self, job_ctx: RequestContext, delivery: Delivery) -> Result<()> {
        let started = Instant::now();

        let mut ctx = RequestContext::with_cancellation(job_ctx.cancellation().child_token());
        if delivery
            .metadata
            .get(METADATA_SKIP_TENANCY)
            .map(String::as_str)
            == Some("true")
        {
            ctx = ctx.with_skip_tenancy(true);
        }
        if let Some(claims) = AuthenticationClaims::from_metadata(&delivery.metadata) {
            ctx = ctx.with_claims(claims);
        }
        if let Some(languages) = delivery
            .metadata
            .get(METADATA_LANGUAGE)
            .filter(|l| !l.is_empty())
        {
            ctx = ctx.with_languages(
                languages
                    .split(',')
                    .map(|l| l.trim().to_string())
                    .collect(),
            );
        }

        let span = tracing::info_span!("queue.process", reference = %self.reference);
        tracing_opentelemetry::OpenTelemetrySpanExt::set_parent(
            &span,
            observability::extract_trace_context(&delivery.metadata),
        );

        let outcome = async {
            for handler in &self.handlers {
                handler
                    .handle(&ctx, &delivery.metadata, &delivery.body)
                    .await?;
            }
            Ok(())
        }
        .instrument(span)
        .await;

        match &outcome {
            Ok(()) => delivery.ack().await,
            Err(err) => {
                tracing::warn!(reference = %self.reference, error = %err,
                    "handler failed, nacking delivery");
                delivery.nack().await;
            }
        }

        self.state
            .store(SubscriberState::Waiting as u8, Ordering::SeqCst);
        self.metrics.record_completion(started.elapsed(), outcome.is_err());
        outcome
    }
}
