//! Named pub/sub over pluggable broker drivers
//!
//! The [`QueueManager`] is the registry: publishers and subscribers are added
//! under human-chosen references, initialized lazily or in one batch, and
//! addressed by reference from application code. All subscriber dispatch runs
//! through the manager's shared [`WorkerPool`](crate::workers::WorkerPool).

pub mod driver;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
mod publisher;
mod subscriber;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::codec::Encode;
use crate::config::QueueConfig;
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::workers::WorkerPool;

pub use driver::{Acknowledger, Delivery, QueueMessage, Subscription, Topic};
pub use publisher::Publisher;
pub use subscriber::{
    worker_fn, SubscribeWorker, Subscriber, SubscriberMetrics, SubscriberState,
};

/// Registry of named publishers and subscribers
pub struct QueueManager {
    publishers: DashMap<String, Arc<Publisher>>,
    subscribers: DashMap<String, Arc<Subscriber>>,
    initialized: Mutex<bool>,
    pool: Arc<WorkerPool>,
}

impl QueueManager {
    /// Create a manager dispatching through `pool`.
    ///
    /// The pool outlives individual endpoints but is shut down with the
    /// manager in [`QueueManager::close`].
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            publishers: DashMap::new(),
            subscribers: DashMap::new(),
            initialized: Mutex::new(false),
            pool,
        }
    }

    /// The pool all subscriber dispatch runs through.
    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    fn validate(reference: &str, url: &str) -> Result<()> {
        if reference.trim().is_empty() {
            return Err(Error::Validation("reference is required".to_string()));
        }
        driver::parse_dsn(url)?;
        Ok(())
    }

    /// Register a publisher under `reference`.
    ///
    /// Idempotent: a reference that already exists is left untouched. When
    /// the manager has already been initialized the new publisher is
    /// initialized eagerly; otherwise it waits for [`QueueManager::init`].
    pub async fn add_publisher(
        &self,
        ctx: &RequestContext,
        reference: &str,
        url: &str,
    ) -> Result<()> {
        Self::validate(reference, url)?;

        if self.publishers.contains_key(reference) {
            return Ok(());
        }
        let publisher = Arc::new(Publisher::new(reference, url));
        self.publishers
            .entry(reference.to_string())
            .or_insert_with(|| publisher.clone());

        if *self.initialized.lock().await {
            publisher.init(ctx).await?;
        }
        Ok(())
    }

    /// Register a subscriber under `reference`.
    ///
    /// A subscriber registered with no handlers is pull-only. The same
    /// idempotence and eager-vs-deferred init policy as
    /// [`QueueManager::add_publisher`] applies.
    pub async fn add_subscriber(
        &self,
        ctx: &RequestContext,
        reference: &str,
        url: &str,
        handlers: Vec<Arc<dyn SubscribeWorker>>,
    ) -> Result<()> {
        Self::validate(reference, url)?;

        if self.subscribers.contains_key(reference) {
            return Ok(());
        }
        let subscriber = Arc::new(Subscriber::new(
            reference,
            url,
            handlers,
            self.pool.clone(),
        ));
        self.subscribers
            .entry(reference.to_string())
            .or_insert_with(|| subscriber.clone());

        if *self.initialized.lock().await {
            subscriber.init(ctx).await?;
        }
        Ok(())
    }

    /// Register the endpoints declared in the loaded configuration.
    ///
    /// Config-declared subscribers carry no handlers and are therefore
    /// pull-only; subscribers that need handlers are registered
    /// programmatically via [`QueueManager::add_subscriber`]. The usual
    /// validation, dedupe and eager-vs-deferred init policy applies.
    pub async fn register_from_config(
        &self,
        ctx: &RequestContext,
        config: &QueueConfig,
    ) -> Result<()> {
        for endpoint in &config.publishers {
            self.add_publisher(ctx, &endpoint.reference, &endpoint.url)
                .await?;
        }
        for endpoint in &config.subscribers {
            self.add_subscriber(ctx, &endpoint.reference, &endpoint.url, Vec::new())
                .await?;
        }
        Ok(())
    }

    /// Stop and remove a publisher. The entry is removed even when the stop
    /// fails; the stop error is returned.
    pub async fn discard_publisher(&self, ctx: &RequestContext, reference: &str) -> Result<()> {
        let Some((_, publisher)) = self.publishers.remove(reference) else {
            return Err(Error::publisher_not_found(reference));
        };
        publisher.stop(ctx).await
    }

    /// Stop and remove a subscriber. The entry is removed even when the stop
    /// fails; the stop error is returned.
    pub async fn discard_subscriber(&self, ctx: &RequestContext, reference: &str) -> Result<()> {
        let Some((_, subscriber)) = self.subscribers.remove(reference) else {
            return Err(Error::subscriber_not_found(reference));
        };
        subscriber.stop(ctx).await
    }

    /// Look up a registered publisher.
    pub fn publisher(&self, reference: &str) -> Option<Arc<Publisher>> {
        self.publishers.get(reference).map(|p| p.clone())
    }

    /// Look up a registered subscriber.
    pub fn subscriber(&self, reference: &str) -> Option<Arc<Subscriber>> {
        self.subscribers.get(reference).map(|s| s.clone())
    }

    /// Publish `payload` through the publisher registered under `reference`.
    pub async fn publish<P: Encode + ?Sized>(
        &self,
        ctx: &RequestContext,
        reference: &str,
        payload: &P,
        extra_headers: &[HashMap<String, String>],
    ) -> Result<()> {
        let publisher = self
            .publisher(reference)
            .ok_or_else(|| Error::publisher_not_found(reference))?;
        publisher.publish(ctx, payload, extra_headers).await
    }

    /// Initialize every registered endpoint, publishers first.
    ///
    /// Errors are collected; the first one is returned wrapped in an
    /// aggregate message. The initialized flag is only set on full success,
    /// so a failed batch can be retried.
    pub async fn init(&self, ctx: &RequestContext) -> Result<()> {
        let mut initialized = self.initialized.lock().await;

        let mut failures = 0usize;
        let mut first_error: Option<Error> = None;

        for entry in self.publishers.iter() {
            if let Err(err) = entry.value().init(ctx).await {
                tracing::error!(reference = %entry.key(), error = %err,
                    "publisher initialization failed");
                failures += 1;
                first_error.get_or_insert(err);
            }
        }
        for entry in self.subscribers.iter() {
            if let Err(err) = entry.value().init(ctx).await {
                tracing::error!(reference = %entry.key(), error = %err,
                    "subscriber initialization failed");
                failures += 1;
                first_error.get_or_insert(err);
            }
        }

        if let Some(err) = first_error {
            return Err(Error::Other(format!(
                "queue initialization failed for {failures} endpoint(s): {err}"
            )));
        }

        *initialized = true;
        Ok(())
    }

    /// Stop every endpoint, clear the registries, and shut the pool down.
    ///
    /// Teardown continues past individual failures; the first error seen is
    /// returned.
    pub async fn close(&self, ctx: &RequestContext) -> Result<()> {
        let mut first_error: Option<Error> = None;

        for entry in self.publishers.iter() {
            if let Err(err) = entry.value().stop(ctx).await {
                tracing::warn!(reference = %entry.key(), error = %err, "publisher stop failed");
                first_error.get_or_insert(err);
            }
        }
        for entry in self.subscribers.iter() {
            if let Err(err) = entry.value().stop(ctx).await {
                tracing::warn!(reference = %entry.key(), error = %err, "subscriber stop failed");
                first_error.get_or_insert(err);
            }
        }

        self.publishers.clear();
        self.subscribers.clear();
        *self.initialized.lock().await = false;
        self.pool.shutdown();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerPoolConfig;

    fn manager() -> QueueManager {
        let pool = WorkerPool::new(
            &WorkerPoolConfig {
                cpu_factor: 1,
                capacity: 4,
                count: 1,
                expiry_secs: 1,
            },
            Arc::new(|_| {}),
        );
        QueueManager::new(pool)
    }

    #[tokio::test]
    async fn test_add_publisher_rejects_blank_reference() {
        let manager = manager();
        let ctx = RequestContext::new();
        let err = manager
            .add_publisher(&ctx, "   ", "mem://topic")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Validation error: reference is required");
    }

    #[tokio::test]
    async fn test_add_publisher_rejects_invalid_dsn() {
        let manager = manager();
        let ctx = RequestContext::new();
        let err = manager
            .add_publisher(&ctx, "p", "not a url")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_add_publisher_is_idempotent() {
        let manager = manager();
        let ctx = RequestContext::new();
        manager
            .add_publisher(&ctx, "p", "mem://manager-idem")
            .await
            .unwrap();
        manager
            .add_publisher(&ctx, "p", "mem://manager-idem")
            .await
            .unwrap();
        assert_eq!(manager.publishers.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_reference_fails() {
        let manager = manager();
        let ctx = RequestContext::new();
        let err = manager
            .publish(&ctx, "random", "payload", &[])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "publisher random not found");
    }

    #[tokio::test]
    async fn test_discard_unknown_subscriber_fails() {
        let manager = manager();
        let ctx = RequestContext::new();
        let err = manager.discard_subscriber(&ctx, "ghost").await.unwrap_err();
        assert_eq!(err.to_string(), "subscriber ghost not found");
    }

    #[tokio::test]
    async fn test_eager_init_after_manager_init() {
        let manager = manager();
        let ctx = RequestContext::new();
        manager.init(&ctx).await.unwrap();

        manager
            .add_publisher(&ctx, "late", "mem://manager-eager")
            .await
            .unwrap();
        assert!(manager.publisher("late").unwrap().is_initiated());
    }

    #[tokio::test]
    async fn test_register_from_config() {
        use crate::config::QueueEndpointConfig;

        let manager = manager();
        let ctx = RequestContext::new();

        let config = QueueConfig {
            publishers: vec![QueueEndpointConfig {
                reference: "events".to_string(),
                url: "mem://manager-from-config".to_string(),
            }],
            subscribers: vec![QueueEndpointConfig {
                reference: "events-pull".to_string(),
                url: "mem://manager-from-config".to_string(),
            }],
        };

        manager.register_from_config(&ctx, &config).await.unwrap();
        assert!(manager.publisher("events").is_some());
        assert!(manager.subscriber("events-pull").is_some());

        // Config registration goes through the same validation path
        let bad = QueueConfig {
            publishers: vec![QueueEndpointConfig {
                reference: "  ".to_string(),
                url: "mem://manager-from-config".to_string(),
            }],
            subscribers: Vec::new(),
        };
        assert!(matches!(
            manager.register_from_config(&ctx, &bad).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_close_clears_registries() {
        let manager = manager();
        let ctx = RequestContext::new();
        manager
            .add_publisher(&ctx, "p", "mem://manager-close")
            .await
            .unwrap();
        manager
            .add_subscriber(&ctx, "s", "mem://manager-close", Vec::new())
            .await
            .unwrap();
        manager.init(&ctx).await.unwrap();

        manager.close(&ctx).await.unwrap();
        assert!(manager.publisher("p").is_none());
        assert!(manager.subscriber("s").is_none());
        assert!(!*manager.initialized.lock().await);
    }
}
