//! Core NATS driver
//!
//! DSNs take the form `nats://host:port/subject`. Metadata travels as NATS
//! headers. At this quality of service the broker does not track
//! acknowledgements, so ack/nack are recorded as no-ops; redelivery
//! semantics require a streaming tier on top.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use url::Url;

use super::driver::{Delivery, QueueMessage, Subscription, Topic};
use crate::context::RequestContext;
use crate::error::{Error, Result};

/// Split a `nats://host:port/subject` DSN into server address and subject.
fn split_dsn(url: &Url) -> Result<(String, String)> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Validation(format!("nats url {url} is missing a host")))?;
    let port = url.port().unwrap_or(4222);

    let subject = url.path().trim_start_matches('/');
    if subject.is_empty() {
        return Err(Error::Validation(format!(
            "nats url {url} is missing a subject path"
        )));
    }

    Ok((format!("nats://{host}:{port}"), subject.to_string()))
}

async fn connect(url: &Url) -> Result<(async_nats::Client, String)> {
    let (server, subject) = split_dsn(url)?;
    let client = async_nats::connect(&server)
        .await
        .map_err(|e| Error::Driver(format!("failed to connect to NATS at {server}: {e}")))?;
    Ok((client, subject))
}

fn headers_from_metadata(metadata: &HashMap<String, String>) -> async_nats::HeaderMap {
    let mut headers = async_nats::HeaderMap::new();
    for (key, value) in metadata {
        if let (Ok(name), Ok(val)) = (
            async_nats::HeaderName::from_str(key),
            async_nats::HeaderValue::from_str(value),
        ) {
            headers.insert(name, val);
        }
    }
    headers
}

fn metadata_from_headers(headers: Option<&async_nats::HeaderMap>) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            if let Some(value) = values.first() {
                metadata.insert(name.to_string(), value.to_string());
            }
        }
    }
    metadata
}

pub(crate) struct NatsTopic {
    client: async_nats::Client,
    subject: String,
}

pub(crate) async fn open_topic(url: &Url) -> Result<NatsTopic> {
    let (client, subject) = connect(url).await?;
    Ok(NatsTopic { client, subject })
}

#[async_trait]
impl Topic for NatsTopic {
    async fn send(&self, message: QueueMessage) -> Result<()> {
        self.client
            .publish_with_headers(
                self.subject.clone(),
                headers_from_metadata(&message.metadata),
                message.body.into(),
            )
            .await
            .map_err(|e| Error::Driver(format!("failed to publish to {}: {e}", self.subject)))?;

        // publish buffers; flushing is what makes "accepted" true
        self.client
            .flush()
            .await
            .map_err(|e| Error::Driver(format!("failed to flush {}: {e}", self.subject)))
    }

    async fn shutdown(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| Error::Driver(format!("failed to flush {}: {e}", self.subject)))
    }
}

pub(crate) struct NatsSubscription {
    subscriber: Mutex<async_nats::Subscriber>,
}

pub(crate) async fn open_subscription(url: &Url) -> Result<NatsSubscription> {
    let (client, subject) = connect(url).await?;
    let subscriber = client
        .subscribe(subject.clone())
        .await
        .map_err(|e| Error::Driver(format!("failed to subscribe to {subject}: {e}")))?;
    Ok(NatsSubscription {
        subscriber: Mutex::new(subscriber),
    })
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn receive(&self, ctx: &RequestContext) -> Result<Delivery> {
        let mut subscriber = self.subscriber.lock().await;
        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(Error::Cancelled),
            received = subscriber.next() => match received {
                Some(message) => Ok(Delivery::new(
                    message.payload.to_vec(),
                    metadata_from_headers(message.headers.as_ref()),
                    None,
                )),
                None => Err(Error::Driver("subscription has been shutdown".to_string())),
            },
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.subscriber
            .lock()
            .await
            .unsubscribe()
            .await
            .map_err(|e| Error::Driver(format!("failed to unsubscribe: {e}")))
    }
}
