//! Shared state of one delivery process and the workers running on it.
//!
//! The hub owns the connection registry, the media reconciler and the
//! outbox of unpublished envelopes. It holds the external collaborators and
//! starts the background workers explicitly: one fan-out relay per message
//! topic, the attachment listener, the republisher and the sweeper.

use crate::bus::{subscribe_with_backoff, Backoff, Bus, BusError};
use crate::fanout::{FanoutRelay, RelayKind};
use crate::message::{PendingAttachment, Topic};
use crate::metrics;
use crate::outbox::Outbox;
use crate::presence::PresenceStore;
use crate::reconcile::{DeliverOutcome, MediaReconciler};
use crate::registry::ConnectionRegistry;
use crate::services::{AdminService, Authenticator, MembershipService, MessageStore};
use parley_protocol::codec;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables of a hub.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Identifier of this process in the presence store.
    pub node_id: String,
    /// Frames queued per connection before writes count as failed.
    pub outbound_queue: usize,
    /// Largest frame accepted from a client.
    pub max_frame_size: usize,
    /// Time a new connection has to send its `connect` frame.
    pub handshake_timeout: Duration,
    /// Heartbeat interval advertised to clients.
    pub heartbeat_interval: Duration,
    /// Bound on the wait for declared media parts.
    pub reconcile_timeout: Duration,
    /// Age after which unclaimed attachment events are dropped.
    pub stale_attachment_age: Duration,
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
    /// Idle time after which a presence record counts as abandoned.
    pub presence_ttl: Duration,
    /// How often parked envelopes are offered to the bus again.
    pub republish_interval: Duration,
    /// Longest accepted message body, in bytes.
    pub max_body_len: usize,
    /// Most media parts a message may declare.
    pub max_media_parts: u32,
    /// Publish attempts before a submission fails with a publish error.
    pub publish_attempts: u32,
    /// Retry policy for bus subscriptions.
    pub resubscribe: Backoff,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", uuid::Uuid::new_v4().simple()),
            outbound_queue: 256,
            max_frame_size: 64 * 1024,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(30),
            stale_attachment_age: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            presence_ttl: Duration::from_secs(90),
            republish_interval: Duration::from_secs(5),
            max_body_len: 4096,
            max_media_parts: 10,
            publish_attempts: 3,
            resubscribe: Backoff::default(),
        }
    }
}

/// External collaborators of the delivery core.
#[derive(Clone)]
pub struct Collaborators {
    /// Identity provider.
    pub authenticator: Arc<dyn Authenticator>,
    /// Message persistence.
    pub store: Arc<dyn MessageStore>,
    /// Room and channel membership.
    pub membership: Arc<dyn MembershipService>,
    /// Channel admin checks.
    pub admins: Arc<dyn AdminService>,
    /// Shared presence key space.
    pub presence: Arc<dyn PresenceStore>,
    /// Message bus.
    pub bus: Arc<dyn Bus>,
}

/// The per-process hub.
pub struct Hub {
    registry: ConnectionRegistry,
    reconciler: MediaReconciler,
    outbox: Outbox,
    collaborators: Collaborators,
    settings: HubSettings,
}

impl Hub {
    /// Create a hub.
    #[must_use]
    pub fn new(collaborators: Collaborators, settings: HubSettings) -> Self {
        info!(node = %settings.node_id, "Creating hub");
        Self {
            registry: ConnectionRegistry::new(),
            reconciler: MediaReconciler::new(),
            outbox: Outbox::new(),
            collaborators,
            settings,
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// The media reconciler.
    #[must_use]
    pub fn reconciler(&self) -> &MediaReconciler {
        &self.reconciler
    }

    /// Envelopes persisted but not yet published.
    #[must_use]
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// The hub settings.
    #[must_use]
    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// The message bus.
    #[must_use]
    pub fn bus(&self) -> &dyn Bus {
        self.collaborators.bus.as_ref()
    }

    /// The presence store.
    #[must_use]
    pub fn presence(&self) -> &dyn PresenceStore {
        self.collaborators.presence.as_ref()
    }

    /// The message store.
    #[must_use]
    pub fn store(&self) -> &dyn MessageStore {
        self.collaborators.store.as_ref()
    }

    /// The membership collaborator.
    #[must_use]
    pub fn membership(&self) -> &dyn MembershipService {
        self.collaborators.membership.as_ref()
    }

    /// The admin-check collaborator.
    #[must_use]
    pub fn admins(&self) -> &dyn AdminService {
        self.collaborators.admins.as_ref()
    }

    /// The identity provider.
    #[must_use]
    pub fn authenticator(&self) -> &dyn Authenticator {
        self.collaborators.authenticator.as_ref()
    }

    /// Start the background workers.
    ///
    /// Every worker stops when `shutdown` is cancelled; await the returned
    /// set to drain them.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: &CancellationToken) -> JoinSet<()> {
        let mut workers = JoinSet::new();

        for kind in [RelayKind::Room, RelayKind::Channel] {
            let relay = FanoutRelay::new(self.clone(), kind);
            workers.spawn(relay.run(shutdown.clone()));
        }
        workers.spawn(self.clone().run_attachment_listener(shutdown.clone()));
        workers.spawn(self.clone().run_republisher(shutdown.clone()));
        workers.spawn(self.clone().run_sweeper(shutdown.clone()));

        info!(node = %self.settings.node_id, "Workers started");
        workers
    }

    /// Feed one `attachment-ready` payload into the reconciler.
    pub fn handle_attachment_payload(&self, payload: &[u8]) -> Option<DeliverOutcome> {
        let event: PendingAttachment = match codec::decode_json(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Undecodable attachment event");
                metrics::record_attachment_event("invalid");
                return None;
            }
        };

        let outcome = self.reconciler.deliver(&event.message_id, &event.file_id);
        metrics::record_attachment_event(match outcome {
            DeliverOutcome::Buffered => "buffered",
            DeliverOutcome::Progress { .. } => "progress",
            DeliverOutcome::Completed => "completed",
            DeliverOutcome::Duplicate => "duplicate",
        });
        debug!(
            message_id = %event.message_id,
            file_id = %event.file_id,
            outcome = ?outcome,
            "Attachment event"
        );
        Some(outcome)
    }

    async fn run_attachment_listener(self: Arc<Self>, shutdown: CancellationToken) {
        let topic = Topic::AttachmentReady;

        while let Some(mut subscription) =
            subscribe_with_backoff(self.bus(), topic, self.settings.resubscribe, &shutdown).await
        {
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    r = subscription.recv() => r,
                };
                match next {
                    Ok(payload) => {
                        self.handle_attachment_payload(&payload);
                    }
                    Err(BusError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "Attachment listener lagged");
                        metrics::record_error("bus_lagged");
                    }
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Attachment subscription lost");
                        metrics::record_error("subscription_lost");
                        break;
                    }
                }
            }
        }
        debug!("Attachment listener stopped");
    }

    /// Offer every parked envelope to the bus once, oldest first.
    ///
    /// Stops at the first failure, since the bus is most likely still down.
    /// Returns how many envelopes went out.
    pub async fn republish_parked(&self) -> usize {
        let mut published = 0;
        for (message_id, parked) in self.outbox.snapshot() {
            if let Err(e) = self.bus().publish(parked.topic, parked.payload).await {
                debug!(message_id = %message_id, error = %e, "Bus still unavailable");
                break;
            }
            if self.outbox.published(&message_id) {
                info!(message_id = %message_id, topic = %parked.topic, "Published parked envelope");
                metrics::record_republished("worker");
                published += 1;
            }
        }
        metrics::record_parked(self.outbox.len());
        published
    }

    /// One sweeper pass.
    ///
    /// Drops attachment events nobody claimed, refreshes the presence
    /// records of local connections and removes records no process has
    /// refreshed within the presence TTL, such as those left behind by a
    /// crashed process.
    pub async fn sweep(&self) {
        let pruned = self.reconciler.prune_stale(self.settings.stale_attachment_age);
        if pruned > 0 {
            info!(pruned, "Dropped unclaimed attachment events");
        }

        for user_id in self.registry.users() {
            if let Err(e) = self.presence().touch(&user_id).await {
                debug!(user = %user_id, error = %e, "Presence refresh failed");
            }
        }
        match self.presence().prune_stale(self.settings.presence_ttl).await {
            Ok(gone) if !gone.is_empty() => {
                info!(count = gone.len(), "Removed abandoned presence records");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Presence sweep failed"),
        }
    }

    async fn run_republisher(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.republish_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.outbox.is_empty() {
                        self.republish_parked().await;
                    }
                }
            }
        }
        if !self.outbox.is_empty() {
            warn!(parked = self.outbox.len(), "Stopping with unpublished envelopes");
        }
        debug!("Republisher stopped");
    }

    async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }
        debug!("Sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::presence::MemoryPresence;
    use crate::registry::ConnectionHandle;
    use crate::services::{MemoryStore, StaticAuthenticator, StaticDirectory};
    use bytes::Bytes;
    use parley_transport::ConnectionId;

    fn hub(bus: Arc<MemoryBus>, settings: HubSettings) -> Arc<Hub> {
        hub_with_presence(bus, Arc::new(MemoryPresence::new()), settings)
    }

    fn hub_with_presence(
        bus: Arc<MemoryBus>,
        presence: Arc<MemoryPresence>,
        settings: HubSettings,
    ) -> Arc<Hub> {
        let directory = Arc::new(StaticDirectory::new());
        Arc::new(Hub::new(
            Collaborators {
                authenticator: Arc::new(StaticAuthenticator::new()),
                store: Arc::new(MemoryStore::new()),
                membership: directory.clone(),
                admins: directory,
                presence,
                bus,
            },
            settings,
        ))
    }

    async fn wait_for_subscriber(bus: &MemoryBus, topic: Topic) {
        while bus.subscriber_count(topic) == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_handle_attachment_payload() {
        let hub = hub(Arc::new(MemoryBus::new()), HubSettings::default());

        let payload = codec::encode_json(&PendingAttachment::new("m1", "f1")).unwrap();
        assert_eq!(
            hub.handle_attachment_payload(&payload),
            Some(DeliverOutcome::Buffered)
        );
        assert_eq!(hub.handle_attachment_payload(b"{oops"), None);
        assert_eq!(hub.reconciler().buffered_count(), 1);
    }

    #[tokio::test]
    async fn test_workers_consume_attachments_and_stop() {
        let bus = Arc::new(MemoryBus::new());
        let hub = hub(bus.clone(), HubSettings::default());
        let shutdown = CancellationToken::new();
        let mut workers = hub.spawn_workers(&shutdown);

        wait_for_subscriber(&bus, Topic::AttachmentReady).await;
        let payload = codec::encode_json(&PendingAttachment::new("m1", "f1")).unwrap();
        bus.publish(Topic::AttachmentReady, payload).await.unwrap();

        let parts = hub
            .reconciler()
            .await_attachments("m1", 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(parts[0].file_id, "f1");

        shutdown.cancel();
        while let Some(result) = workers.join_next().await {
            result.unwrap();
        }
    }

    #[tokio::test]
    async fn test_listener_resubscribes_after_loss() {
        let bus = Arc::new(MemoryBus::new());
        let settings = HubSettings {
            resubscribe: Backoff {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
            },
            ..HubSettings::default()
        };
        let hub = hub(bus.clone(), settings);
        let shutdown = CancellationToken::new();
        let _workers = hub.spawn_workers(&shutdown);

        wait_for_subscriber(&bus, Topic::AttachmentReady).await;
        bus.close_topic(Topic::AttachmentReady);
        wait_for_subscriber(&bus, Topic::AttachmentReady).await;

        let payload = codec::encode_json(&PendingAttachment::new("m2", "f9")).unwrap();
        bus.publish(Topic::AttachmentReady, payload).await.unwrap();

        let parts = hub
            .reconciler()
            .await_attachments("m2", 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(parts[0].file_id, "f9");
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_prunes_unclaimed_events() {
        let settings = HubSettings {
            stale_attachment_age: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(2),
            ..HubSettings::default()
        };
        let hub = hub(Arc::new(MemoryBus::new()), settings);
        hub.reconciler().deliver("orphan", "f1");

        let shutdown = CancellationToken::new();
        let _workers = hub.spawn_workers(&shutdown);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(hub.reconciler().is_empty());
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_republish_parked_envelopes_in_order() {
        let bus = Arc::new(MemoryBus::new());
        let hub = hub(bus.clone(), HubSettings::default());
        let mut room = bus.subscribe(Topic::RoomMessages).await.unwrap();

        hub.outbox()
            .park("m1", "alice", Topic::RoomMessages, Bytes::from_static(b"one"));
        tokio::time::advance(Duration::from_millis(5)).await;
        hub.outbox()
            .park("m2", "alice", Topic::RoomMessages, Bytes::from_static(b"two"));

        bus.set_available(false);
        assert_eq!(hub.republish_parked().await, 0);
        assert_eq!(hub.outbox().len(), 2);

        bus.set_available(true);
        assert_eq!(hub.republish_parked().await, 2);
        assert!(hub.outbox().is_empty());
        assert_eq!(room.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(room.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_republisher_drains_outbox() {
        let settings = HubSettings {
            republish_interval: Duration::from_secs(1),
            ..HubSettings::default()
        };
        let hub = hub(Arc::new(MemoryBus::new()), settings);
        hub.outbox()
            .park("m1", "alice", Topic::ChannelMessages, Bytes::from_static(b"{}"));

        let shutdown = CancellationToken::new();
        let _workers = hub.spawn_workers(&shutdown);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(hub.outbox().is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_sweep_keeps_local_presence_and_drops_abandoned() {
        let presence = Arc::new(MemoryPresence::new());
        let settings = HubSettings {
            presence_ttl: Duration::from_millis(50),
            ..HubSettings::default()
        };
        let hub = hub_with_presence(Arc::new(MemoryBus::new()), presence.clone(), settings);

        let (handle, _rx) = ConnectionHandle::channel(ConnectionId::new("c1"), "alice", 1);
        hub.registry().register(handle);
        presence.set_online("alice", "c1", "this-node").await.unwrap();
        presence.set_online("ghost", "c9", "crashed-node").await.unwrap();

        // Wall-clock timestamps, so this waits in real time
        tokio::time::sleep(Duration::from_millis(120)).await;
        hub.sweep().await;

        assert!(presence.is_online("alice").await.unwrap());
        assert!(!presence.is_online("ghost").await.unwrap());
    }
}
