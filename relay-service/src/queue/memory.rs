//! Process-shared in-memory driver
//!
//! Subjects are shared by URL across the whole process: two endpoints opened
//! against `mem://topicA` talk to the same subject, which is what co-tenant
//! components (and tests) rely on. Because the subject is shared, shutting a
//! topic down poisons every other in-process user of the URL; publishers
//! therefore drop their `mem://` handles without calling shutdown.
//!
//! The driver doubles as the spy broker for tests: per-subject counters and
//! the last message sent are observable through [`subject_stats`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::{mpsc, Mutex};

use super::driver::{Acknowledger, Delivery, QueueMessage, Subscription, Topic};
use crate::context::RequestContext;
use crate::error::{Error, Result};

/// Error message produced by sends on a shut-down subject.
///
/// Publishers treat stop-time errors carrying this text as success.
pub(crate) const TOPIC_SHUTDOWN_MSG: &str = "topic has been shutdown";

static REGISTRY: Lazy<DashMap<String, Arc<MemSubject>>> = Lazy::new(DashMap::new);

struct MemSubject {
    senders: StdMutex<Vec<mpsc::UnboundedSender<QueueMessage>>>,
    shutdown: AtomicBool,
    sent: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    last_message: StdMutex<Option<QueueMessage>>,
}

impl MemSubject {
    fn new() -> Self {
        Self {
            senders: StdMutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
            last_message: StdMutex::new(None),
        }
    }
}

fn subject(url: &str) -> Arc<MemSubject> {
    REGISTRY
        .entry(url.to_string())
        .or_insert_with(|| Arc::new(MemSubject::new()))
        .clone()
}

/// Point-in-time counters for one subject
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectStats {
    /// Messages accepted by the subject
    pub sent: u64,
    /// Deliveries acknowledged
    pub acked: u64,
    /// Deliveries rejected
    pub nacked: u64,
}

/// Observe a subject's counters; `None` when the URL was never opened.
pub fn subject_stats(url: &str) -> Option<SubjectStats> {
    REGISTRY.get(url).map(|s| SubjectStats {
        sent: s.sent.load(Ordering::SeqCst),
        acked: s.acked.load(Ordering::SeqCst),
        nacked: s.nacked.load(Ordering::SeqCst),
    })
}

/// The last message a subject accepted; `None` before the first send.
pub fn last_message(url: &str) -> Option<QueueMessage> {
    REGISTRY
        .get(url)
        .and_then(|s| s.last_message.lock().expect("subject lock").clone())
}

pub(crate) struct MemTopic {
    subject: Arc<MemSubject>,
}

pub(crate) fn open_topic(url: &str) -> MemTopic {
    MemTopic {
        subject: subject(url),
    }
}

#[async_trait]
impl Topic for MemTopic {
    async fn send(&self, message: QueueMessage) -> Result<()> {
        if self.subject.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Driver(TOPIC_SHUTDOWN_MSG.to_string()));
        }

        self.subject.sent.fetch_add(1, Ordering::SeqCst);
        *self.subject.last_message.lock().expect("subject lock") = Some(message.clone());

        // Fan out to every live subscription, pruning closed ones
        let mut senders = self.subject.senders.lock().expect("subject lock");
        senders.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.subject.shutdown.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemAcker {
    subject: Arc<MemSubject>,
}

#[async_trait]
impl Acknowledger for MemAcker {
    async fn ack(&self) {
        self.subject.acked.fetch_add(1, Ordering::SeqCst);
    }

    async fn nack(&self) {
        // Counted, not redelivered; redelivery is the production broker's
        // contract
        self.subject.nacked.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct MemSubscription {
    subject: Arc<MemSubject>,
    rx: Mutex<mpsc::UnboundedReceiver<QueueMessage>>,
}

pub(crate) fn open_subscription(url: &str) -> MemSubscription {
    let subject = self::subject(url);
    let (tx, rx) = mpsc::unbounded_channel();
    subject.senders.lock().expect("subject lock").push(tx);
    MemSubscription {
        subject,
        rx: Mutex::new(rx),
    }
}

#[async_trait]
impl Subscription for MemSubscription {
    async fn receive(&self, ctx: &RequestContext) -> Result<Delivery> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(Error::Cancelled),
            received = rx.recv() => match received {
                Some(message) => Ok(Delivery::new(
                    message.body,
                    message.metadata,
                    Some(Arc::new(MemAcker {
                        subject: self.subject.clone(),
                    })),
                )),
                None => Err(Error::Driver("subscription has been shutdown".to_string())),
            },
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.rx.lock().await.close();
        Ok(())
    }
}
