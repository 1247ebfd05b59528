//! Named publisher over one broker destination

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use super::driver::{self, QueueMessage, Topic};
use crate::claims::{METADATA_LANGUAGE, METADATA_SKIP_TENANCY};
use crate::codec::Encode;
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::observability;

/// Shutdown budget applied to publisher teardown, independent of the
/// caller's context
const STOP_BUDGET: Duration = Duration::from_secs(30);

/// Lazily-initialized sender bound to one destination DSN
pub struct Publisher {
    reference: String,
    url: String,
    topic: RwLock<Option<Box<dyn Topic>>>,
    initiated: AtomicBool,
    init_lock: Mutex<()>,
}

impl Publisher {
    pub(crate) fn new(reference: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            url: url.into(),
            topic: RwLock::new(None),
            initiated: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        }
    }

    /// Name the publisher is registered under.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Destination DSN.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether a driver handle is currently open.
    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Open the driver handle. Idempotent; concurrent callers open at most
    /// one handle.
    pub async fn init(&self, _ctx: &RequestContext) -> Result<()> {
        if self.initiated.load(Ordering::SeqCst) {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.initiated.load(Ordering::SeqCst) {
            return Ok(());
        }

        let topic = driver::open_topic(&self.url).await?;
        *self.topic.write().await = Some(topic);
        self.initiated.store(true, Ordering::SeqCst);

        tracing::debug!(reference = %self.reference, url = %self.url, "publisher initialized");
        Ok(())
    }

    /// Send one payload.
    ///
    /// The outgoing metadata envelope is assembled in a fixed order: trace
    /// context first, then caller-supplied header maps in the order given,
    /// then the claims projection, language preference, and tenancy-bypass
    /// flag from `ctx`. Later writes win, so callers supplying headers are
    /// trusted not to smuggle reserved keys.
    pub async fn publish<P: Encode + ?Sized>(
        &self,
        ctx: &RequestContext,
        payload: &P,
        extra_headers: &[HashMap<String, String>],
    ) -> Result<()> {
        self.init(ctx).await?;

        let mut metadata = HashMap::new();
        observability::inject_trace_context(&mut metadata);

        for headers in extra_headers {
            for (key, value) in headers {
                metadata.insert(key.clone(), value.clone());
            }
        }

        if let Some(claims) = ctx.claims() {
            metadata.extend(claims.as_metadata());
        }
        if !ctx.languages().is_empty() {
            metadata.insert(METADATA_LANGUAGE.to_string(), ctx.languages().join(","));
        }
        if ctx.skip_tenancy() {
            metadata.insert(METADATA_SKIP_TENANCY.to_string(), "true".to_string());
        }

        let body = payload.encode()?;

        let guard = self.topic.read().await;
        let topic = guard.as_deref().ok_or(Error::NotInitialized("publisher"))?;
        topic.send(QueueMessage { body, metadata }).await
    }

    /// Tear the handle down.
    ///
    /// Bounded by a 30-second budget on its own timer, so an already-done
    /// caller context cannot leave the handle dangling. `mem://` handles are
    /// dropped without a driver shutdown: the in-memory subject is shared by
    /// URL across the process and shutting it down would poison co-tenant
    /// users. A driver reporting the topic already shut down counts as
    /// success.
    pub async fn stop(&self, _ctx: &RequestContext) -> Result<()> {
        self.initiated.store(false, Ordering::SeqCst);

        let handle = self.topic.write().await.take();
        let Some(topic) = handle else {
            return Ok(());
        };

        if self.url.starts_with("mem://") {
            return Ok(());
        }

        match tokio::time::timeout(STOP_BUDGET, topic.shutdown()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Error::Driver(msg))) if msg.contains("topic has been shutdown") => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Driver(format!(
                "publisher {} shutdown timed out",
                self.reference
            ))),
        }
    }
}
