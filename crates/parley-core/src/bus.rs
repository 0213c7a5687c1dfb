//! Message bus abstraction.
//!
//! The bus connects ingest pipelines, fan-out relays and the external
//! notification and upload subsystems. Delivery is assumed to be
//! at-least-once: a subscriber may see the same payload more than once.

use crate::message::Topic;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default per-topic buffer capacity.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Bus errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus cannot be reached.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// The subscriber fell behind and skipped payloads.
    #[error("Subscriber lagged, {0} payloads skipped")]
    Lagged(u64),

    /// The subscription ended and must be re-established.
    #[error("Subscription to {0} lost")]
    SubscriptionLost(Topic),
}

/// A publish/subscribe transport.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload to a topic.
    async fn publish(&self, topic: Topic, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to a topic.
    async fn subscribe(&self, topic: Topic) -> Result<Box<dyn Subscription>, BusError>;
}

/// A live subscription to one topic.
#[async_trait]
pub trait Subscription: Send {
    /// Receive the next payload.
    async fn recv(&mut self) -> Result<Bytes, BusError>;
}

/// Retry policy for (re-)establishing subscriptions.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for the delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Subscribe to `topic`, retrying with exponential backoff.
///
/// Returns `None` once `shutdown` is cancelled.
pub async fn subscribe_with_backoff(
    bus: &dyn Bus,
    topic: Topic,
    backoff: Backoff,
    shutdown: &CancellationToken,
) -> Option<Box<dyn Subscription>> {
    let mut delay = backoff.initial;
    loop {
        let attempt = tokio::select! {
            _ = shutdown.cancelled() => return None,
            r = bus.subscribe(topic) => r,
        };

        match attempt {
            Ok(subscription) => {
                debug!(topic = %topic, "Subscribed");
                return Some(subscription);
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, retry_in = ?delay, "Subscribe failed");
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = backoff.next(delay);
            }
        }
    }
}

/// In-process bus backed by one broadcast channel per topic.
///
/// Every subscriber of a topic sees every payload, which matches a
/// deployment with one consumer per topic and process.
pub struct MemoryBus {
    topics: DashMap<Topic, broadcast::Sender<Bytes>>,
    capacity: usize,
    available: AtomicBool,
}

impl MemoryBus {
    /// Create a bus with the default topic capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a bus with a specific per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            available: AtomicBool::new(true),
        }
    }

    fn sender(&self, topic: Topic) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscribers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics
            .get(&topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Mark the bus reachable or unreachable.
    ///
    /// While unavailable, publishing and subscribing fail.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Tear down a topic, ending every current subscription to it.
    pub fn close_topic(&self, topic: Topic) {
        if self.topics.remove(&topic).is_some() {
            debug!(topic = %topic, "Closed topic");
        }
    }

    fn check_available(&self) -> Result<(), BusError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable("memory bus marked unavailable".into()))
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: Topic, payload: Bytes) -> Result<(), BusError> {
        self.check_available()?;
        match self.sender(topic).send(payload) {
            Ok(count) => trace!(topic = %topic, subscribers = count, "Published"),
            Err(_) => debug!(topic = %topic, "Published with no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<Box<dyn Subscription>, BusError> {
        self.check_available()?;
        Ok(Box::new(MemorySubscription {
            topic,
            receiver: self.sender(topic).subscribe(),
        }))
    }
}

struct MemorySubscription {
    topic: Topic,
    receiver: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Result<Bytes, BusError> {
        match self.receiver.recv().await {
            Ok(payload) => Ok(payload),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(BusError::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => {
                Err(BusError::SubscriptionLost(self.topic))
            }
        }
    }
}
