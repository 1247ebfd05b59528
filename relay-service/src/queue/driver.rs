//! Broker driver abstractions
//!
//! A driver exposes two handles: a topic that accepts outbound messages and
//! a subscription that yields inbound deliveries. Endpoints are addressed by
//! DSN; the scheme selects the driver:
//!
//! - `mem://`: the process-shared in-memory driver (tests, co-tenant use)
//! - `nats://`: core NATS (requires the `nats` feature)
//! - `http://` / `https://`: pull-mode targets; no handle is ever opened

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::context::RequestContext;
use crate::error::{Error, Result};

/// Outbound message: opaque body plus a flat metadata envelope
#[derive(Debug, Clone, Default)]
pub struct QueueMessage {
    /// Serialized payload
    pub body: Vec<u8>,
    /// Case-sensitive string metadata (claims projection, trace baggage,
    /// language, caller-supplied headers)
    pub metadata: HashMap<String, String>,
}

/// Acknowledgement backend for one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirm the delivery was processed.
    async fn ack(&self);
    /// Reject the delivery; redelivery is the broker's decision.
    async fn nack(&self);
}

/// Inbound message handed to the dispatch path
pub struct Delivery {
    /// Message payload
    pub body: Vec<u8>,
    /// Metadata envelope as received
    pub metadata: HashMap<String, String>,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("body", &self.body)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Delivery {
    /// Wrap a received message with its acknowledgement backend.
    pub fn new(
        body: Vec<u8>,
        metadata: HashMap<String, String>,
        acker: Option<Arc<dyn Acknowledger>>,
    ) -> Self {
        Self {
            body,
            metadata,
            acker,
        }
    }

    /// Confirm the delivery.
    pub async fn ack(&self) {
        if let Some(acker) = &self.acker {
            acker.ack().await;
        }
    }

    /// Reject the delivery.
    pub async fn nack(&self) {
        if let Some(acker) = &self.acker {
            acker.nack().await;
        }
    }

    /// Detached handle to the acknowledgement backend, for callers that must
    /// nack after the delivery value itself has been moved elsewhere.
    pub(crate) fn acker(&self) -> Option<Arc<dyn Acknowledger>> {
        self.acker.clone()
    }
}

/// Sender half of a broker destination
#[async_trait]
pub trait Topic: Send + Sync {
    /// Send one message; returns once the broker has accepted it.
    async fn send(&self, message: QueueMessage) -> Result<()>;

    /// Tear the handle down.
    async fn shutdown(&self) -> Result<()>;
}

/// Receiver half of a broker destination
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Block until a message arrives, the driver fails, or `ctx` is
    /// cancelled (in which case the cancellation error is returned
    /// unchanged).
    async fn receive(&self, ctx: &RequestContext) -> Result<Delivery>;

    /// Tear the handle down.
    async fn shutdown(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Topic")
    }
}

/// Whether a DSN denotes a pull-mode endpoint that never opens a handle.
pub(crate) fn is_pull_mode(url: &str) -> bool {
    url.starts_with("http")
}

/// Open a topic handle for `url`.
pub(crate) async fn open_topic(url: &str) -> Result<Box<dyn Topic>> {
    let parsed = parse_dsn(url)?;
    match parsed.scheme() {
        "mem" => Ok(Box::new(super::memory::open_topic(url))),
        #[cfg(feature = "nats")]
        "nats" => Ok(Box::new(super::nats::open_topic(&parsed).await?)),
        scheme => Err(unsupported_scheme(scheme)),
    }
}

/// Open a subscription handle for `url`.
pub(crate) async fn open_subscription(url: &str) -> Result<Box<dyn Subscription>> {
    let parsed = parse_dsn(url)?;
    match parsed.scheme() {
        "mem" => Ok(Box::new(super::memory::open_subscription(url))),
        #[cfg(feature = "nats")]
        "nats" => Ok(Box::new(super::nats::open_subscription(&parsed).await?)),
        scheme => Err(unsupported_scheme(scheme)),
    }
}

/// Validate a DSN at registration time.
pub(crate) fn parse_dsn(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| Error::Validation(format!("invalid queue url {url}: {e}")))
}

fn unsupported_scheme(scheme: &str) -> Error {
    Error::Validation(format!("unsupported queue url scheme: {scheme}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dsn_rejects_garbage() {
        let err = parse_dsn("not a url").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_pull_mode_detection() {
        assert!(is_pull_mode("http://queue.internal/pull"));
        assert!(is_pull_mode("https://queue.internal/pull"));
        assert!(!is_pull_mode("mem://topicA"));
        assert!(!is_pull_mode("nats://localhost:4222/events"));
    }

    #[tokio::test]
    async fn test_unknown_scheme_fails_validation() {
        let err = open_topic("ftp://example.com/q").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
