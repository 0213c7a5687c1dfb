//! Fan-out relays.
//!
//! One relay runs per message topic. It consumes envelopes in arrival order,
//! resolves the receivers through the membership collaborator (after an
//! admin check for channels) and gives every receiver exactly one outcome:
//! a frame written to its local connection, or a ready message published on
//! the notification topic.

use crate::bus::{subscribe_with_backoff, BusError};
use crate::hub::Hub;
use crate::message::{Envelope, ReadyMessage, Topic};
use crate::metrics;
use crate::services::CollaboratorError;
use parley_protocol::{codec, Destination, Frame, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Which message topic a relay consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    /// Chat room envelopes.
    Room,
    /// Broadcast channel envelopes.
    Channel,
}

impl RelayKind {
    /// The topic consumed by this kind of relay.
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            RelayKind::Room => Topic::RoomMessages,
            RelayKind::Channel => Topic::ChannelMessages,
        }
    }
}

/// Reasons an envelope is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The sender is not an admin of the channel.
    #[error("{sender_id} is not an admin of channel {channel_id}")]
    Authorization {
        /// Channel the envelope was addressed to.
        channel_id: String,
        /// Claimed sender.
        sender_id: UserId,
    },

    /// The admin check or membership lookup failed.
    #[error("Receiver resolution failed: {0}")]
    Resolution(#[from] CollaboratorError),

    /// The envelope's destination does not belong on this topic.
    #[error("Envelope for {destination} arrived on {topic}")]
    Misrouted {
        /// Destination named by the message.
        destination: Destination,
        /// Topic it arrived on.
        topic: Topic,
    },
}

impl RelayError {
    fn reason(&self) -> &'static str {
        match self {
            RelayError::Authorization { .. } => "unauthorized",
            RelayError::Resolution(_) => "resolution",
            RelayError::Misrouted { .. } => "misrouted",
        }
    }
}

/// Outcome of fanning out one envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Receivers written to directly.
    pub local: usize,
    /// Receivers handed to the notification topic.
    pub notified: usize,
    /// Receivers whose notification publish failed.
    pub failed: usize,
}

/// A per-topic relay.
pub struct FanoutRelay {
    hub: Arc<Hub>,
    kind: RelayKind,
}

impl FanoutRelay {
    /// Create a relay for `kind` on `hub`.
    #[must_use]
    pub fn new(hub: Arc<Hub>, kind: RelayKind) -> Self {
        Self { hub, kind }
    }

    /// The relay kind.
    #[must_use]
    pub fn kind(&self) -> RelayKind {
        self.kind
    }

    /// Consume the relay's topic until `shutdown` is cancelled.
    ///
    /// A lost subscription is re-established with backoff.
    pub async fn run(self, shutdown: CancellationToken) {
        let topic = self.kind.topic();
        info!(topic = %topic, "Relay starting");

        while let Some(mut subscription) =
            subscribe_with_backoff(self.hub.bus(), topic, self.hub.settings().resubscribe, &shutdown)
                .await
        {
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(topic = %topic, "Relay stopped");
                        return;
                    }
                    r = subscription.recv() => r,
                };
                match next {
                    Ok(payload) => {
                        self.handle_payload(&payload).await;
                    }
                    Err(BusError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "Relay lagged, envelopes skipped");
                        metrics::record_error("bus_lagged");
                    }
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Relay subscription lost");
                        metrics::record_error("subscription_lost");
                        break;
                    }
                }
            }
        }
        info!(topic = %topic, "Relay stopped");
    }

    /// Decode and process one bus payload.
    ///
    /// Returns `None` if the payload was skipped or the envelope dropped.
    pub async fn handle_payload(&self, payload: &[u8]) -> Option<DeliveryReport> {
        let envelope: Envelope = match codec::decode_json(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %self.kind.topic(), error = %e, "Skipping undecodable envelope");
                metrics::record_dropped("invalid");
                return None;
            }
        };

        let message_id = envelope.message.message_id.clone();
        match self.process(envelope).await {
            Ok(report) => Some(report),
            Err(e @ RelayError::Resolution(_)) => {
                error!(message_id = %message_id, error = %e, "Dropping envelope");
                metrics::record_dropped(e.reason());
                None
            }
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Dropping envelope");
                metrics::record_dropped(e.reason());
                None
            }
        }
    }

    /// Resolve the receivers of an envelope and deliver to each of them.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope is dropped: the channel sender is not
    /// an admin, a collaborator call failed, or the destination does not
    /// match the relay's topic.
    pub async fn process(&self, mut envelope: Envelope) -> Result<DeliveryReport, RelayError> {
        let topic = self.kind.topic();
        let destination = envelope.message.destination.clone();
        if Topic::for_destination(&destination) != topic {
            return Err(RelayError::Misrouted { destination, topic });
        }

        if let Destination::Channel(channel_id) = &destination {
            let sender_id = &envelope.message.sender_id;
            let is_admin = self
                .hub
                .admins()
                .is_admin(channel_id, sender_id, &envelope.credentials)
                .await?;
            if !is_admin {
                return Err(RelayError::Authorization {
                    channel_id: channel_id.clone(),
                    sender_id: sender_id.clone(),
                });
            }
        }

        let members = self
            .hub
            .membership()
            .members(destination.id(), &envelope.credentials)
            .await?;
        envelope.receivers = dedup(members);

        let mut report = DeliveryReport::default();
        for receiver in &envelope.receivers {
            self.deliver(&envelope, receiver, &mut report).await;
        }

        debug!(
            message_id = %envelope.message.message_id,
            destination = %destination,
            local = report.local,
            notified = report.notified,
            failed = report.failed,
            "Envelope delivered"
        );
        Ok(report)
    }

    async fn deliver(&self, envelope: &Envelope, receiver: &str, report: &mut DeliveryReport) {
        let registry = self.hub.registry();

        let online_elsewhere = match registry.lookup(receiver) {
            Some(handle) => match handle.send(Frame::message(envelope.message.clone())) {
                Ok(()) => {
                    trace!(user = %receiver, connection = %handle.connection_id(), "Delivered locally");
                    metrics::record_delivery("local");
                    report.local += 1;
                    return;
                }
                Err(e) => {
                    warn!(
                        user = %receiver,
                        connection = %handle.connection_id(),
                        error = %e,
                        "Local write failed, closing connection"
                    );
                    metrics::record_error("local_write");
                    handle.close();
                    if registry.unregister_connection(receiver, handle.connection_id()) {
                        if let Err(e) = self
                            .hub
                            .presence()
                            .set_offline(receiver, handle.connection_id().as_str())
                            .await
                        {
                            warn!(user = %receiver, error = %e, "Failed to clear presence");
                        }
                    }
                    false
                }
            },
            None => self.hub.presence().is_online(receiver).await.unwrap_or_else(|e| {
                debug!(user = %receiver, error = %e, "Presence hint unavailable");
                false
            }),
        };

        self.notify(envelope, receiver, online_elsewhere, report)
            .await;
    }

    async fn notify(
        &self,
        envelope: &Envelope,
        receiver: &str,
        online_elsewhere: bool,
        report: &mut DeliveryReport,
    ) {
        let ready = ReadyMessage {
            message: envelope.message.clone(),
            receiver_id: receiver.to_string(),
            credentials: envelope.credentials.clone(),
            online_elsewhere,
        };

        let published = match codec::encode_json(&ready) {
            Ok(payload) => self
                .hub
                .bus()
                .publish(Topic::Notification, payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match published {
            Ok(()) => {
                trace!(user = %receiver, online_elsewhere, "Handed to notification relay");
                metrics::record_delivery("notification");
                report.notified += 1;
            }
            Err(e) => {
                error!(
                    user = %receiver,
                    message_id = %envelope.message.message_id,
                    error = %e,
                    "Notification publish failed"
                );
                metrics::record_error("notification_publish");
                report.failed += 1;
            }
        }
    }
}

fn dedup(members: Vec<UserId>) -> Vec<UserId> {
    let mut seen = HashSet::with_capacity(members.len());
    members
        .into_iter()
        .filter(|m| seen.insert(m.clone()))
        .collect()
}
