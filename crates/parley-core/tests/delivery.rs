//! End-to-end delivery through the ingest pipeline, the bus and the relays,
//! driven over in-memory connections.

use parley_core::{
    serve_connection, Bus, Collaborators, Hub, HubSettings, MemoryBus, MemoryPresence,
    MemoryStore, MessageStore, PendingAttachment, PresenceStore, ReadyMessage, StaticAuthenticator,
    StaticDirectory, Subscription, Topic,
};
use parley_protocol::{codec, error_code, Attachment, Destination, Frame, Submission};
use parley_transport::memory::{pair, MemoryClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(150);

struct Harness {
    hub: Arc<Hub>,
    bus: Arc<MemoryBus>,
    store: Arc<MemoryStore>,
    directory: Arc<StaticDirectory>,
    presence: Arc<MemoryPresence>,
    shutdown: CancellationToken,
    workers: JoinSet<()>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(HubSettings::default()).await
    }

    async fn start_with(settings: HubSettings) -> Self {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new());
        let directory = Arc::new(
            StaticDirectory::new()
                .with_room("lobby", ["alice", "bob"])
                .with_room("quiet", ["alice", "carol"])
                .with_channel("news", ["alice", "bob", "sam"], ["alice"]),
        );
        let authenticator = StaticAuthenticator::new()
            .with_token("t-alice", "alice")
            .with_token("t-bob", "bob")
            .with_token("t-carol", "carol")
            .with_token("t-sam", "sam");

        let hub = Arc::new(Hub::new(
            Collaborators {
                authenticator: Arc::new(authenticator),
                store: store.clone(),
                membership: directory.clone(),
                admins: directory.clone(),
                presence: presence.clone(),
                bus: bus.clone(),
            },
            settings,
        ));

        let shutdown = CancellationToken::new();
        let workers = hub.spawn_workers(&shutdown);
        for topic in [
            Topic::RoomMessages,
            Topic::ChannelMessages,
            Topic::AttachmentReady,
        ] {
            eventually(|| bus.subscriber_count(topic) > 0).await;
        }

        Self {
            hub,
            bus,
            store,
            directory,
            presence,
            shutdown,
            workers,
        }
    }

    fn open(&self) -> MemoryClient {
        let (conn, client) = pair(64 * 1024);
        tokio::spawn(serve_connection(
            self.hub.clone(),
            Box::new(conn),
            self.shutdown.clone(),
        ));
        client
    }

    async fn connect(&self, token: &str) -> MemoryClient {
        let mut client = self.open();
        client.send(&Frame::connect(1, token, None)).unwrap();
        match next_frame(&mut client).await {
            Frame::Connected { .. } => client,
            other => panic!("expected connected, got {other:?}"),
        }
    }

    async fn notifications(&self) -> Box<dyn Subscription> {
        self.bus.subscribe(Topic::Notification).await.unwrap()
    }

    async fn attachment_ready(&self, message_id: &str, file_id: &str) {
        let payload = codec::encode_json(&PendingAttachment::new(message_id, file_id)).unwrap();
        self.bus
            .publish(Topic::AttachmentReady, payload)
            .await
            .unwrap();
    }
}

async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_frame(client: &mut MemoryClient) -> Frame {
    tokio::time::timeout(WAIT, client.recv())
        .await
        .expect("no frame in time")
        .unwrap()
        .expect("connection closed")
}

async fn assert_silent(client: &mut MemoryClient) {
    if let Ok(frame) = tokio::time::timeout(QUIET, client.recv()).await {
        panic!("unexpected frame {frame:?}");
    }
}

async fn assert_closed(client: &mut MemoryClient) {
    loop {
        match tokio::time::timeout(WAIT, client.recv())
            .await
            .expect("connection still open")
        {
            Ok(Some(_)) => continue,
            _ => return,
        }
    }
}

async fn no_notification(sub: &mut Box<dyn Subscription>) {
    if let Ok(payload) = tokio::time::timeout(QUIET, sub.recv()).await {
        panic!("unexpected notification {payload:?}");
    }
}

async fn next_notification(sub: &mut Box<dyn Subscription>) -> ReadyMessage {
    let payload = tokio::time::timeout(WAIT, sub.recv())
        .await
        .expect("no notification in time")
        .unwrap();
    codec::decode_json(&payload).unwrap()
}

fn room(id: &str) -> Destination {
    Destination::Room(id.into())
}

fn text(sender: &str, destination: Destination, body: &str) -> Frame {
    Frame::submit(Submission::text(sender, destination, body))
}

/// Read frames until an `accepted` or `error` reply shows up, returning it
/// together with the delivered messages seen on the way.
async fn reply(client: &mut MemoryClient) -> (Frame, Vec<Frame>) {
    let mut delivered = Vec::new();
    loop {
        match next_frame(client).await {
            frame @ (Frame::Accepted { .. } | Frame::Error { .. }) => return (frame, delivered),
            frame => delivered.push(frame),
        }
    }
}

fn error_code_of(frame: &Frame) -> u16 {
    match frame {
        Frame::Error { code, .. } => *code,
        other => panic!("expected error, got {other:?}"),
    }
}

fn accepted_id(frame: &Frame) -> String {
    match frame {
        Frame::Accepted { message_id } => message_id.clone(),
        other => panic!("expected accepted, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn room_message_reaches_local_member() {
    let h = Harness::start().await;
    let mut notifications = h.notifications().await;
    let mut alice = h.connect("t-alice").await;
    let mut bob = h.connect("t-bob").await;

    alice.send(&text("alice", room("lobby"), "hi")).unwrap();
    let (accepted, _) = reply(&mut alice).await;
    let message_id = accepted_id(&accepted);

    match next_frame(&mut bob).await {
        Frame::Message { message } => {
            assert_eq!(message.body, "hi");
            assert_eq!(message.message_id, message_id);
            assert_eq!(message.sender_id, "alice");
        }
        other => panic!("expected message, got {other:?}"),
    }
    no_notification(&mut notifications).await;
    assert!(h.hub.reconciler().is_empty());
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn media_waits_for_its_own_attachment() {
    let h = Harness::start().await;
    let mut alice = h.connect("t-alice").await;
    let mut bob = h.connect("t-bob").await;

    let submission = Submission::text("alice", room("lobby"), "look").with_media("m-b", 1);
    alice.send(&Frame::submit(submission)).unwrap();
    eventually(|| h.hub.reconciler().waiting_count() == 1).await;

    h.attachment_ready("someone-else", "f0").await;
    assert_silent(&mut bob).await;
    assert!(h.store.is_empty());

    h.attachment_ready("m-b", "f1").await;
    let (accepted, _) = reply(&mut alice).await;
    assert_eq!(accepted_id(&accepted), "m-b");

    match next_frame(&mut bob).await {
        Frame::Message { message } => {
            assert_eq!(message.message_id, "m-b");
            assert_eq!(
                message.attachments,
                [Attachment {
                    part: 0,
                    file_id: "f1".into()
                }]
            );
        }
        other => panic!("expected message, got {other:?}"),
    }

    let stored = h.store.list_by_destination("lobby").await.unwrap();
    assert_eq!(stored[0].attachments[0].file_id, "f1");
    // The unrelated event stays buffered for its own message
    assert_eq!(h.hub.reconciler().buffered_count(), 1);
}

#[tokio::test]
async fn attachment_arriving_first_is_claimed() {
    let h = Harness::start().await;
    let mut alice = h.connect("t-alice").await;

    h.attachment_ready("m-early", "f1").await;
    h.attachment_ready("m-early", "f2").await;
    eventually(|| h.hub.reconciler().buffered_count() == 1).await;

    let submission = Submission::text("alice", room("lobby"), "").with_media("m-early", 2);
    alice.send(&Frame::submit(submission)).unwrap();

    let (accepted, _) = reply(&mut alice).await;
    assert_eq!(accepted_id(&accepted), "m-early");
    let stored = h.store.list_by_destination("lobby").await.unwrap();
    let files: Vec<_> = stored[0].attachments.iter().map(|a| a.file_id.as_str()).collect();
    assert_eq!(files, ["f1", "f2"]);
}

#[tokio::test]
async fn offline_member_gets_one_notification() {
    let h = Harness::start().await;
    let mut notifications = h.notifications().await;
    let mut alice = h.connect("t-alice").await;

    alice.send(&text("alice", room("quiet"), "anyone?")).unwrap();
    let (accepted, _) = reply(&mut alice).await;
    let message_id = accepted_id(&accepted);

    let ready = next_notification(&mut notifications).await;
    assert_eq!(ready.receiver_id, "carol");
    assert_eq!(ready.message.message_id, message_id);
    assert_eq!(ready.credentials.access_token, "t-alice");
    assert!(!ready.online_elsewhere);
    no_notification(&mut notifications).await;
}

#[tokio::test]
async fn channel_post_from_non_admin_is_dropped() {
    let h = Harness::start().await;
    let mut notifications = h.notifications().await;
    let mut sam = h.connect("t-sam").await;
    let mut bob = h.connect("t-bob").await;

    sam.send(&text("sam", Destination::Channel("news".into()), "spam"))
        .unwrap();
    let (accepted, _) = reply(&mut sam).await;
    accepted_id(&accepted);

    eventually(|| h.directory.admin_calls() == 1).await;
    assert_silent(&mut bob).await;
    no_notification(&mut notifications).await;
    assert_eq!(h.directory.member_calls(), 0);
}

#[tokio::test]
async fn channel_post_from_admin_is_delivered() {
    let h = Harness::start().await;
    let mut alice = h.connect("t-alice").await;
    let mut bob = h.connect("t-bob").await;

    alice
        .send(&text("alice", Destination::Channel("news".into()), "update"))
        .unwrap();
    reply(&mut alice).await;

    match next_frame(&mut bob).await {
        Frame::Message { message } => assert_eq!(message.body, "update"),
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn media_wait_times_out_and_connection_continues() {
    let settings = HubSettings {
        reconcile_timeout: Duration::from_millis(100),
        ..HubSettings::default()
    };
    let h = Harness::start_with(settings).await;
    let mut alice = h.connect("t-alice").await;

    let submission = Submission::text("alice", room("lobby"), "").with_media("m-slow", 2);
    alice.send(&Frame::submit(submission)).unwrap();
    h.attachment_ready("m-slow", "f1").await;

    let (error, _) = reply(&mut alice).await;
    assert_eq!(error_code_of(&error), error_code::MEDIA_TIMEOUT);
    assert!(h.store.is_empty());
    assert_eq!(h.hub.reconciler().waiting_count(), 0);

    alice.send(&text("alice", room("lobby"), "still here")).unwrap();
    let (accepted, _) = reply(&mut alice).await;
    accepted_id(&accepted);
}

#[tokio::test]
async fn submissions_keep_their_order_across_media_waits() {
    let h = Harness::start().await;
    let mut alice = h.connect("t-alice").await;

    let first = Submission::text("alice", room("lobby"), "").with_media("m-first", 1);
    alice.send(&Frame::submit(first)).unwrap();
    let mut second = Submission::text("alice", room("lobby"), "after");
    second.message_id = Some("m-second".into());
    alice.send(&Frame::submit(second)).unwrap();

    eventually(|| h.hub.reconciler().waiting_count() == 1).await;
    assert!(h.store.is_empty());
    h.attachment_ready("m-first", "f1").await;

    let (a, _) = reply(&mut alice).await;
    let (b, _) = reply(&mut alice).await;
    assert_eq!(accepted_id(&a), "m-first");
    assert_eq!(accepted_id(&b), "m-second");
}

#[tokio::test]
async fn rejected_submissions_get_one_error_each() {
    let h = Harness::start().await;
    let mut alice = h.connect("t-alice").await;

    alice.send(&text("mallory", room("lobby"), "hi")).unwrap();
    let (error, _) = reply(&mut alice).await;
    assert_eq!(error_code_of(&error), error_code::VALIDATION);

    // Length prefix followed by a body that is not MessagePack
    alice
        .send_raw(vec![0u8, 0, 0, 3, 0xc1, 0xc1, 0xc1])
        .unwrap();
    let (error, _) = reply(&mut alice).await;
    assert_eq!(error_code_of(&error), error_code::MAPPING);

    let mut dup = Submission::text("alice", room("lobby"), "once");
    dup.message_id = Some("m-dup".into());
    alice.send(&Frame::submit(dup.clone())).unwrap();
    accepted_id(&reply(&mut alice).await.0);
    alice.send(&Frame::submit(dup)).unwrap();
    let (error, _) = reply(&mut alice).await;
    assert_eq!(error_code_of(&error), error_code::DATA_INTEGRITY);

    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn persistence_and_bus_failures_are_reported() {
    let settings = HubSettings {
        publish_attempts: 1,
        ..HubSettings::default()
    };
    let h = Harness::start_with(settings).await;
    let mut notifications = h.notifications().await;
    let mut alice = h.connect("t-alice").await;

    h.store.set_unavailable(true);
    alice.send(&text("alice", room("quiet"), "lost")).unwrap();
    let (error, _) = reply(&mut alice).await;
    assert_eq!(error_code_of(&error), error_code::DATABASE_INTERNAL);
    no_notification(&mut notifications).await;
    h.store.set_unavailable(false);

    h.bus.set_available(false);
    alice.send(&text("alice", room("quiet"), "unsent")).unwrap();
    let (error, _) = reply(&mut alice).await;
    assert_eq!(error_code_of(&error), error_code::PUBLISH);
    h.bus.set_available(true);

    alice.send(&text("alice", room("quiet"), "ok")).unwrap();
    accepted_id(&reply(&mut alice).await.0);
}

#[tokio::test]
async fn unpublished_message_is_published_on_resubmit() {
    let settings = HubSettings {
        publish_attempts: 1,
        republish_interval: Duration::from_secs(3600),
        ..HubSettings::default()
    };
    let h = Harness::start_with(settings).await;
    let mut alice = h.connect("t-alice").await;
    let mut bob = h.connect("t-bob").await;

    let submission = Submission::text("alice", room("lobby"), "again").with_media("m-retry", 1);
    h.attachment_ready("m-retry", "f1").await;
    eventually(|| h.hub.reconciler().buffered_count() == 1).await;

    h.bus.set_available(false);
    alice.send(&Frame::submit(submission.clone())).unwrap();
    let (error, _) = reply(&mut alice).await;
    assert_eq!(error_code_of(&error), error_code::PUBLISH);
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.hub.outbox().len(), 1);
    assert_silent(&mut bob).await;

    // The attachment event was consumed by the first attempt
    h.bus.set_available(true);
    alice.send(&Frame::submit(submission)).unwrap();
    let (accepted, _) = reply(&mut alice).await;
    assert_eq!(accepted_id(&accepted), "m-retry");

    match next_frame(&mut bob).await {
        Frame::Message { message } => {
            assert_eq!(message.message_id, "m-retry");
            assert_eq!(message.attachments[0].file_id, "f1");
        }
        other => panic!("expected message, got {other:?}"),
    }
    assert_eq!(h.store.len(), 1);
    assert!(h.hub.outbox().is_empty());
}

#[tokio::test]
async fn parked_message_is_published_when_the_bus_returns() {
    let settings = HubSettings {
        publish_attempts: 1,
        republish_interval: Duration::from_millis(20),
        ..HubSettings::default()
    };
    let h = Harness::start_with(settings).await;
    let mut alice = h.connect("t-alice").await;
    let mut bob = h.connect("t-bob").await;

    h.bus.set_available(false);
    alice.send(&text("alice", room("lobby"), "late")).unwrap();
    let (error, _) = reply(&mut alice).await;
    assert_eq!(error_code_of(&error), error_code::PUBLISH);
    h.bus.set_available(true);

    match next_frame(&mut bob).await {
        Frame::Message { message } => assert_eq!(message.body, "late"),
        other => panic!("expected message, got {other:?}"),
    }
    eventually(|| h.hub.outbox().is_empty()).await;
}

#[tokio::test]
async fn bad_credentials_close_the_connection() {
    let h = Harness::start().await;

    let mut client = h.open();
    client.send(&Frame::connect(1, "wrong", None)).unwrap();
    assert_eq!(
        error_code_of(&next_frame(&mut client).await),
        error_code::UNAUTHORIZED
    );
    assert_closed(&mut client).await;

    let mut client = h.open();
    client.send(&Frame::connect(9, "t-alice", None)).unwrap();
    assert_eq!(
        error_code_of(&next_frame(&mut client).await),
        error_code::UNSUPPORTED_VERSION
    );
    assert_closed(&mut client).await;

    assert!(h.hub.registry().is_empty());
}

#[tokio::test]
async fn second_connection_supersedes_the_first() {
    let h = Harness::start().await;
    let mut first = h.connect("t-alice").await;
    let mut second = h.connect("t-alice").await;

    assert_closed(&mut first).await;
    assert_eq!(h.hub.registry().len(), 1);
    eventually(|| {
        h.presence
            .get("alice")
            .is_some_and(|state| h.hub.registry().lookup("alice").is_some_and(|handle| {
                handle.connection_id().as_str() == state.connection_id
            }))
    })
    .await;

    let mut bob = h.connect("t-bob").await;
    bob.send(&text("bob", room("lobby"), "hello again")).unwrap();
    reply(&mut bob).await;

    match next_frame(&mut second).await {
        Frame::Message { message } => assert_eq!(message.body, "hello again"),
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn hangup_releases_registry_presence_and_media_wait() {
    let h = Harness::start().await;
    let mut bob = h.connect("t-bob").await;
    assert!(h.presence.is_online("bob").await.unwrap());

    let submission = Submission::text("bob", room("lobby"), "").with_media("m-gone", 1);
    bob.send(&Frame::submit(submission)).unwrap();
    eventually(|| h.hub.reconciler().waiting_count() == 1).await;

    bob.close();
    eventually(|| !h.hub.registry().contains("bob")).await;
    eventually(|| h.hub.reconciler().is_empty()).await;
    assert!(!h.presence.is_online("bob").await.unwrap());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn ping_is_answered() {
    let h = Harness::start().await;
    let mut alice = h.connect("t-alice").await;

    alice
        .send(&Frame::Ping {
            timestamp: Some(42),
        })
        .unwrap();
    assert_eq!(next_frame(&mut alice).await, Frame::pong(Some(42)));
}

#[tokio::test]
async fn shutdown_closes_connections_and_drains_workers() {
    let mut h = Harness::start().await;
    let mut alice = h.connect("t-alice").await;

    h.shutdown.cancel();
    assert_closed(&mut alice).await;

    tokio::time::timeout(WAIT, async {
        while let Some(result) = h.workers.join_next().await {
            result.unwrap();
        }
    })
    .await
    .expect("workers did not stop");
    eventually(|| h.hub.registry().is_empty()).await;
}

#[tokio::test]
async fn ping_is_answered_during_media_wait() {
    let h = Harness::start().await;
    let mut alice = h.connect("t-alice").await;

    let submission = Submission::text("alice", room("lobby"), "slow").with_media("m-ping", 1);
    alice.send(&Frame::submit(submission)).unwrap();
    eventually(|| h.hub.reconciler().waiting_count() == 1).await;

    alice
        .send(&Frame::Ping {
            timestamp: Some(7),
        })
        .unwrap();
    assert_eq!(next_frame(&mut alice).await, Frame::pong(Some(7)));

    h.attachment_ready("m-ping", "f1").await;
    let (accepted, _) = reply(&mut alice).await;
    assert_eq!(accepted_id(&accepted), "m-ping");
}
