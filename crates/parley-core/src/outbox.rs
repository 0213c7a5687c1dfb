//! Envelopes that were persisted but could not be published.
//!
//! A message is published if and only if it was persisted, so an envelope
//! whose publish failed after the save stays here until a publish succeeds.
//! Two paths drain it: the republisher worker of the hub, and a client
//! resubmitting the same message id, which publishes the parked envelope
//! instead of saving the message a second time.
//!
//! Entries are removed only after a successful publish. Both paths may
//! publish the same envelope; the bus is at-least-once anyway.

use crate::message::Topic;
use bytes::Bytes;
use dashmap::DashMap;
use parley_protocol::{MessageId, UserId};
use tokio::time::Instant;
use tracing::debug;

/// One envelope awaiting publication.
#[derive(Debug, Clone)]
pub struct ParkedEnvelope {
    /// The submitter, the only user allowed to resubmit it.
    pub sender_id: UserId,
    /// Topic the envelope belongs on.
    pub topic: Topic,
    /// Encoded envelope.
    pub payload: Bytes,
    /// When the first publish failed.
    pub since: Instant,
}

/// Table of unpublished envelopes keyed by message id.
#[derive(Debug, Default)]
pub struct Outbox {
    parked: DashMap<MessageId, ParkedEnvelope>,
}

impl Outbox {
    /// An empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep an envelope until it is published.
    pub fn park(
        &self,
        message_id: impl Into<MessageId>,
        sender_id: impl Into<UserId>,
        topic: Topic,
        payload: Bytes,
    ) {
        let message_id = message_id.into();
        debug!(message_id = %message_id, topic = %topic, "Parking unpublished envelope");
        self.parked
            .entry(message_id)
            .or_insert_with(|| ParkedEnvelope {
                sender_id: sender_id.into(),
                topic,
                payload,
                since: Instant::now(),
            });
    }

    /// The envelope parked for `message_id`, if `sender_id` submitted it.
    #[must_use]
    pub fn parked_for(&self, message_id: &str, sender_id: &str) -> Option<ParkedEnvelope> {
        self.parked
            .get(message_id)
            .filter(|entry| entry.sender_id == sender_id)
            .map(|entry| entry.value().clone())
    }

    /// Forget an envelope once it is on the bus.
    pub fn published(&self, message_id: &str) -> bool {
        self.parked.remove(message_id).is_some()
    }

    /// Every parked envelope, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(MessageId, ParkedEnvelope)> {
        let mut entries: Vec<_> = self
            .parked
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(_, parked)| parked.since);
        entries
    }

    /// Number of envelopes still waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parked.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }
}
