//! The per-connection ingest pipeline.
//!
//! Every client connection runs one task that moves through
//! `Connected -> Authenticated -> Streaming -> Closing -> Closed`. While
//! streaming it processes submissions strictly in arrival order:
//! validate, reconcile media, persist, publish. A failed submission gets
//! exactly one error frame and the loop continues; only read failures,
//! hangups and close signals end it.

use crate::hub::{Hub, HubSettings};
use crate::message::{generate_message_id, Credentials, Envelope, Topic};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::outbox::ParkedEnvelope;
use crate::reconcile::ReconcileError;
use crate::registry::ConnectionHandle;
use crate::services::StoreError;
use bytes::Bytes;
use parley_protocol::{
    codec, error_code, now_millis, Attachment, Frame, Message, MessageId, Submission, UserId,
    PROTOCOL_VERSION,
};
use parley_transport::{Connection, ConnectionId, FrameReader, FrameWriter};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Frames read ahead while a submission waits for its media.
const MAX_READ_AHEAD: usize = 16;

/// Lifecycle of a connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, waiting for credentials.
    Connected,
    /// Credentials verified and the connection registered.
    Authenticated,
    /// Reading submissions.
    Streaming,
    /// Releasing the registry entry, presence record and media waits.
    Closing,
    /// Finished.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Errors raised while handling a connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    /// The submission is malformed or incomplete.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A frame could not be decoded.
    #[error("Malformed frame: {0}")]
    Mapping(String),

    /// The connection failed at the I/O level.
    #[error("Read failed: {0}")]
    Read(String),

    /// Persistence rejected the write.
    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),

    /// Persistence infrastructure failed.
    #[error("Database internal error: {0}")]
    DatabaseInternal(String),

    /// The bus did not accept the envelope.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Declared media parts did not all arrive.
    #[error("Media not ready: {0}")]
    Media(ReconcileError),

    /// The media wait was abandoned because the connection is closing.
    #[error("Media wait for {0} abandoned")]
    Cancelled(MessageId),

    /// The credentials were rejected.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The client speaks another protocol major version.
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}

impl IngestError {
    /// Error code carried by the error frame.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            IngestError::Validation(_) => error_code::VALIDATION,
            IngestError::Mapping(_) => error_code::MAPPING,
            IngestError::Read(_) | IngestError::Cancelled(_) => error_code::VALIDATION,
            IngestError::DataIntegrity(_) => error_code::DATA_INTEGRITY,
            IngestError::DatabaseInternal(_) => error_code::DATABASE_INTERNAL,
            IngestError::Publish(_) => error_code::PUBLISH,
            IngestError::Media(ReconcileError::AlreadyAwaiting(_)) => error_code::VALIDATION,
            IngestError::Media(_) => error_code::MEDIA_TIMEOUT,
            IngestError::Unauthorized(_) => error_code::UNAUTHORIZED,
            IngestError::UnsupportedVersion(_) => error_code::UNSUPPORTED_VERSION,
        }
    }

    /// Whether the error ends the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Read(_)
                | IngestError::Cancelled(_)
                | IngestError::Unauthorized(_)
                | IngestError::UnsupportedVersion(_)
        )
    }

    /// Short label used for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Validation(_) => "validation",
            IngestError::Mapping(_) => "mapping",
            IngestError::Read(_) => "read",
            IngestError::DataIntegrity(_) => "data_integrity",
            IngestError::DatabaseInternal(_) => "database_internal",
            IngestError::Publish(_) => "publish",
            IngestError::Media(_) => "media",
            IngestError::Cancelled(_) => "cancelled",
            IngestError::Unauthorized(_) => "unauthorized",
            IngestError::UnsupportedVersion(_) => "unsupported_version",
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Integrity(reason) => IngestError::DataIntegrity(reason),
            StoreError::Internal(reason) => IngestError::DatabaseInternal(reason),
        }
    }
}

impl From<ReconcileError> for IngestError {
    fn from(e: ReconcileError) -> Self {
        IngestError::Media(e)
    }
}

/// Check a submission from `user_id` and build the message it describes.
///
/// # Errors
///
/// Returns a [`IngestError::Validation`] naming the first rule broken.
pub fn validate_submission(
    submission: Submission,
    user_id: &str,
    settings: &HubSettings,
) -> Result<Message, IngestError> {
    let invalid = |reason: &str| Err(IngestError::Validation(reason.to_string()));

    if submission.sender_id.is_empty() {
        return invalid("sender_id is required");
    }
    if submission.sender_id != user_id {
        return invalid("sender_id does not match the authenticated user");
    }
    let Some(destination) = submission.destination else {
        return invalid("destination is required");
    };
    if destination.id().is_empty() {
        return invalid("destination id is required");
    }
    if submission.media_count == 0 && submission.body.trim().is_empty() {
        return invalid("body is required");
    }
    if submission.body.len() > settings.max_body_len {
        return Err(IngestError::Validation(format!(
            "body exceeds {} bytes",
            settings.max_body_len
        )));
    }
    if submission.media_count > settings.max_media_parts {
        return Err(IngestError::Validation(format!(
            "at most {} media parts are allowed",
            settings.max_media_parts
        )));
    }

    let message_id = match submission.message_id {
        Some(id) if id.trim().is_empty() => return invalid("message_id must not be empty"),
        Some(id) => id,
        None if submission.media_count > 0 => {
            return invalid("message_id is required when media is declared")
        }
        None => generate_message_id(),
    };

    Ok(Message {
        message_id,
        sender_id: submission.sender_id,
        destination,
        body: submission.body,
        created_at: submission.created_at.unwrap_or_else(now_millis),
        media_count: submission.media_count,
        attachments: Vec::new(),
    })
}

/// Serve one client connection until it closes or `shutdown` fires.
///
/// Cleanup runs exactly once on the way out: the registry entry and the
/// presence record owned by this connection are released, and any media
/// wait still in flight is dropped.
pub async fn serve_connection(
    hub: Arc<Hub>,
    connection: Box<dyn Connection>,
    shutdown: CancellationToken,
) {
    let connection_id = connection.id().clone();
    let remote = connection.remote_addr();
    let (reader, writer) = connection.split();

    let (outbound, queue) = mpsc::channel(hub.settings().outbound_queue.max(1));
    let closed = shutdown.child_token();
    let writer_task = tokio::spawn(run_writer(
        writer,
        queue,
        closed.clone(),
        connection_id.clone(),
    ));

    debug!(connection = %connection_id, remote = ?remote, "Connection opened");

    let mut session = Session {
        hub,
        connection_id: connection_id.clone(),
        reader,
        outbound,
        closed: closed.clone(),
        state: ConnectionState::Connected,
        read_ahead: VecDeque::new(),
        hung_up: false,
    };
    session.run().await;
    drop(session);

    closed.cancel();
    if let Err(e) = writer_task.await {
        error!(connection = %connection_id, error = %e, "Writer task failed");
    }
    debug!(connection = %connection_id, "Connection finished");
}

async fn run_writer(
    mut writer: Box<dyn FrameWriter>,
    mut queue: mpsc::Receiver<Frame>,
    closed: CancellationToken,
    connection_id: ConnectionId,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = closed.cancelled() => {
                // Flush what was queued before the close
                while let Ok(frame) = queue.try_recv() {
                    if writer.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };

        if let Err(e) = writer.send(frame).await {
            debug!(connection = %connection_id, error = %e, "Write failed");
            closed.cancel();
            break;
        }
    }

    if let Err(e) = writer.close().await {
        trace!(connection = %connection_id, error = %e, "Close failed");
    }
}

enum Inbound {
    Frame(Frame),
    Malformed(String),
}

struct Session {
    hub: Arc<Hub>,
    connection_id: ConnectionId,
    reader: Box<dyn FrameReader>,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
    state: ConnectionState,
    read_ahead: VecDeque<Inbound>,
    hung_up: bool,
}

impl Session {
    fn transition(&mut self, next: ConnectionState) {
        trace!(connection = %self.connection_id, from = %self.state, to = %next, "State change");
        self.state = next;
    }

    async fn run(&mut self) {
        let (user_id, credentials) = match self.handshake().await {
            Ok(identity) => identity,
            Err(e) => {
                info!(connection = %self.connection_id, error = %e, "Handshake failed");
                metrics::record_error(e.kind());
                if !matches!(e, IngestError::Read(_)) {
                    self.send(Frame::error(e.code(), e.to_string())).await;
                }
                self.transition(ConnectionState::Closed);
                return;
            }
        };

        let handle = ConnectionHandle::new(
            self.connection_id.clone(),
            user_id.clone(),
            self.outbound.clone(),
            self.closed.clone(),
        );
        if let Some(previous) = self.hub.registry().register(handle) {
            info!(
                user = %user_id,
                connection = %self.connection_id,
                superseded = %previous.connection_id(),
                "Closing superseded connection"
            );
            previous.close();
        }
        if let Err(e) = self
            .hub
            .presence()
            .set_online(&user_id, self.connection_id.as_str(), &self.hub.settings().node_id)
            .await
        {
            warn!(user = %user_id, error = %e, "Failed to record presence");
        }
        let _metrics = ConnectionMetricsGuard::new();
        self.transition(ConnectionState::Authenticated);
        info!(user = %user_id, connection = %self.connection_id, "Client authenticated");

        let heartbeat = u32::try_from(self.hub.settings().heartbeat_interval.as_millis())
            .unwrap_or(u32::MAX);
        self.send(Frame::connected(
            self.connection_id.as_str(),
            user_id.as_str(),
            PROTOCOL_VERSION.major,
            heartbeat,
        ))
        .await;

        self.transition(ConnectionState::Streaming);
        self.stream(&user_id, &credentials).await;

        self.transition(ConnectionState::Closing);
        self.release(&user_id).await;
        self.transition(ConnectionState::Closed);
        info!(user = %user_id, connection = %self.connection_id, "Client disconnected");
    }

    async fn handshake(&mut self) -> Result<(UserId, Credentials), IngestError> {
        let timeout = self.hub.settings().handshake_timeout;
        let first = tokio::select! {
            _ = self.closed.cancelled() => {
                return Err(IngestError::Read("closed during handshake".into()));
            }
            r = tokio::time::timeout(timeout, self.reader.recv()) => r,
        };

        let frame = match first {
            Err(_) => return Err(IngestError::Unauthorized("handshake timed out".into())),
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return Err(IngestError::Read("closed during handshake".into())),
            Ok(Err(e)) if e.is_recoverable() => {
                return Err(IngestError::Unauthorized(format!("malformed connect frame: {e}")))
            }
            Ok(Err(e)) => return Err(IngestError::Read(e.to_string())),
        };

        let frame_type = frame.frame_type();
        let Frame::Connect {
            version,
            access_token,
            refresh_token,
        } = frame
        else {
            return Err(IngestError::Unauthorized(format!(
                "expected connect frame, got {frame_type}"
            )));
        };

        if !PROTOCOL_VERSION.accepts_major(version) {
            return Err(IngestError::UnsupportedVersion(version));
        }

        let credentials = Credentials {
            access_token,
            refresh_token,
        };
        let user_id = self
            .hub
            .authenticator()
            .authenticate(&credentials)
            .await
            .map_err(|e| IngestError::Unauthorized(e.to_string()))?;
        Ok((user_id, credentials))
    }

    async fn stream(&mut self, user_id: &str, credentials: &Credentials) {
        loop {
            let inbound = match self.read_ahead.pop_front() {
                Some(inbound) => inbound,
                None if self.hung_up => break,
                None => {
                    let next = tokio::select! {
                        _ = self.closed.cancelled() => {
                            debug!(connection = %self.connection_id, "Close signalled");
                            break;
                        }
                        r = self.reader.recv() => r,
                    };
                    match next {
                        Ok(Some(frame)) => Inbound::Frame(frame),
                        Ok(None) => {
                            debug!(connection = %self.connection_id, "Client hung up");
                            break;
                        }
                        Err(e) if e.is_recoverable() => Inbound::Malformed(e.to_string()),
                        Err(e) => {
                            warn!(connection = %self.connection_id, error = %e, "Read failed");
                            metrics::record_error("read");
                            break;
                        }
                    }
                }
            };

            let result = match inbound {
                Inbound::Frame(frame) => self.handle_frame(frame, user_id, credentials).await,
                Inbound::Malformed(reason) => Err(IngestError::Mapping(reason)),
            };

            if let Err(e) = result {
                if e.is_fatal() {
                    debug!(connection = %self.connection_id, error = %e, "Ending stream");
                    break;
                }
                self.reject(e).await;
            }
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        user_id: &str,
        credentials: &Credentials,
    ) -> Result<(), IngestError> {
        match frame {
            Frame::Submit(submission) => {
                let message_id = self.ingest(submission, user_id, credentials).await?;
                metrics::record_submission("accepted");
                self.send(Frame::accepted(message_id)).await;
                Ok(())
            }
            Frame::Ping { timestamp } => {
                self.answer_ping(timestamp, user_id).await;
                Ok(())
            }
            Frame::Pong { .. } => Ok(()),
            other => Err(IngestError::Validation(format!(
                "unexpected {} frame",
                other.frame_type()
            ))),
        }
    }

    async fn ingest(
        &mut self,
        submission: Submission,
        user_id: &str,
        credentials: &Credentials,
    ) -> Result<MessageId, IngestError> {
        let mut message = validate_submission(submission, user_id, self.hub.settings())?;

        // Saved earlier but never published: publish that, do not save again
        if let Some(parked) = self.hub.outbox().parked_for(&message.message_id, user_id) {
            return self.republish(message.message_id, parked).await;
        }

        if message.media_count > 0 {
            let started = Instant::now();
            let message_id = message.message_id.clone();
            message.attachments = self
                .await_media(&message_id, message.media_count as usize, user_id)
                .await?;
            metrics::record_reconcile_wait(started.elapsed().as_secs_f64());
        }

        let topic = Topic::for_destination(&message.destination);
        let envelope = Envelope::new(message, credentials.clone());
        let payload =
            codec::encode_json(&envelope).map_err(|e| IngestError::Publish(e.to_string()))?;

        self.hub.store().save(&envelope.message).await?;

        let message_id = envelope.message.message_id.clone();
        if let Err(e) = self.publish(topic, payload.clone()).await {
            error!(
                message_id = %message_id,
                error = %e,
                "Message persisted but not published, parking it"
            );
            self.hub.outbox().park(message_id, user_id, topic, payload);
            metrics::record_parked(self.hub.outbox().len());
            return Err(e);
        }

        debug!(
            message_id = %message_id,
            destination = %envelope.message.destination,
            parts = envelope.message.attachments.len(),
            "Submission ingested"
        );
        Ok(message_id)
    }

    async fn republish(
        &self,
        message_id: MessageId,
        parked: ParkedEnvelope,
    ) -> Result<MessageId, IngestError> {
        info!(message_id = %message_id, "Resubmitted message is parked, publishing it");
        self.publish(parked.topic, parked.payload).await?;
        if self.hub.outbox().published(&message_id) {
            metrics::record_republished("resubmit");
        }
        metrics::record_parked(self.hub.outbox().len());
        Ok(message_id)
    }

    /// Wait for media while watching the connection.
    ///
    /// Frames that arrive meanwhile are kept for later, so the wait never
    /// reorders submissions. Pings carry no submission and are answered
    /// right away. A hangup abandons the wait.
    async fn await_media(
        &mut self,
        message_id: &str,
        expected: usize,
        user_id: &str,
    ) -> Result<Vec<Attachment>, IngestError> {
        let hub = self.hub.clone();
        let wait = hub.reconciler().await_attachments(
            message_id,
            expected,
            hub.settings().reconcile_timeout,
        );
        tokio::pin!(wait);

        loop {
            tokio::select! {
                r = &mut wait => return r.map_err(IngestError::from),
                _ = self.closed.cancelled() => {
                    return Err(IngestError::Cancelled(message_id.to_string()));
                }
                r = self.reader.recv(), if !self.hung_up && self.read_ahead.len() < MAX_READ_AHEAD => {
                    match r {
                        Ok(Some(Frame::Ping { timestamp })) => {
                            self.answer_ping(timestamp, user_id).await;
                        }
                        Ok(Some(frame)) => self.read_ahead.push_back(Inbound::Frame(frame)),
                        Err(e) if e.is_recoverable() => {
                            self.read_ahead.push_back(Inbound::Malformed(e.to_string()));
                        }
                        Ok(None) | Err(_) => {
                            self.hung_up = true;
                            return Err(IngestError::Cancelled(message_id.to_string()));
                        }
                    }
                }
            }
        }
    }

    async fn answer_ping(&self, timestamp: Option<u64>, user_id: &str) {
        if let Err(e) = self.hub.presence().touch(user_id).await {
            trace!(user = %user_id, error = %e, "Presence refresh failed");
        }
        self.send(Frame::pong(timestamp)).await;
    }

    async fn publish(&self, topic: Topic, payload: Bytes) -> Result<(), IngestError> {
        let attempts = self.hub.settings().publish_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.hub.bus().publish(topic, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(topic = %topic, attempt, error = %e, "Publish failed, retrying");
                    tokio::time::sleep(Duration::from_millis(50) * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(IngestError::Publish(e.to_string())),
            }
        }
    }

    async fn reject(&self, e: IngestError) {
        debug!(connection = %self.connection_id, error = %e, "Submission rejected");
        metrics::record_submission(e.kind());
        self.send(Frame::error(e.code(), e.to_string())).await;
    }

    async fn send(&self, frame: Frame) {
        let sent = tokio::select! {
            r = self.outbound.send(frame) => r.is_ok(),
            _ = self.closed.cancelled() => false,
        };
        if !sent {
            trace!(connection = %self.connection_id, "Dropped reply to closing connection");
        }
    }

    async fn release(&mut self, user_id: &str) {
        self.read_ahead.clear();
        self.hub
            .registry()
            .unregister_connection(user_id, &self.connection_id);
        if let Err(e) = self
            .hub
            .presence()
            .set_offline(user_id, self.connection_id.as_str())
            .await
        {
            warn!(user = %user_id, error = %e, "Failed to clear presence");
        }
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::Destination;

    fn settings() -> HubSettings {
        HubSettings::default()
    }

    #[test]
    fn test_validate_text_submission() {
        let submission = Submission::text("alice", Destination::Room("r1".into()), "hi");
        let message = validate_submission(submission, "alice", &settings()).unwrap();

        assert!(!message.message_id.is_empty());
        assert_eq!(message.sender_id, "alice");
        assert_eq!(message.media_count, 0);
        assert!(message.attachments.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_submissions() {
        let room = || Some(Destination::Room("r1".into()));
        let base = Submission {
            sender_id: "alice".into(),
            destination: room(),
            body: "hi".into(),
            ..Submission::default()
        };

        let cases = [
            Submission {
                sender_id: String::new(),
                ..base.clone()
            },
            Submission {
                sender_id: "mallory".into(),
                ..base.clone()
            },
            Submission {
                destination: None,
                ..base.clone()
            },
            Submission {
                destination: Some(Destination::Channel(String::new())),
                ..base.clone()
            },
            Submission {
                body: "  ".into(),
                ..base.clone()
            },
            Submission {
                body: "x".repeat(5000),
                ..base.clone()
            },
            Submission {
                media_count: 2,
                ..base.clone()
            },
            Submission {
                message_id: Some(" ".into()),
                ..base.clone()
            },
            Submission {
                message_id: Some("m1".into()),
                media_count: 11,
                ..base.clone()
            },
        ];

        for submission in cases {
            let err = validate_submission(submission.clone(), "alice", &settings()).unwrap_err();
            assert!(
                matches!(err, IngestError::Validation(_)),
                "{submission:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_validate_media_without_body() {
        let submission = Submission {
            sender_id: "alice".into(),
            destination: Some(Destination::Room("r1".into())),
            ..Submission::default()
        }
        .with_media("m1", 2);

        let message = validate_submission(submission, "alice", &settings()).unwrap();
        assert_eq!(message.message_id, "m1");
        assert_eq!(message.media_count, 2);
        assert!(message.created_at > 0);
    }

    #[test]
    fn test_error_classification() {
        assert!(!IngestError::Validation("x".into()).is_fatal());
        assert!(!IngestError::DataIntegrity("x".into()).is_fatal());
        assert!(!IngestError::Publish("x".into()).is_fatal());
        assert!(IngestError::Read("x".into()).is_fatal());
        assert!(IngestError::Unauthorized("x".into()).is_fatal());

        assert_eq!(
            IngestError::from(StoreError::Integrity("dup".into())).code(),
            error_code::DATA_INTEGRITY
        );
        assert_eq!(
            IngestError::from(StoreError::Internal("down".into())).code(),
            error_code::DATABASE_INTERNAL
        );
        assert_eq!(
            IngestError::from(ReconcileError::TimedOut {
                message_id: "m".into(),
                expected: 2,
                received: 1
            })
            .code(),
            error_code::MEDIA_TIMEOUT
        );
        assert_eq!(
            IngestError::from(ReconcileError::AlreadyAwaiting("m".into())).code(),
            error_code::VALIDATION
        );
    }

    #[test]
    fn test_connection_task_can_be_spawned() {
        use crate::bus::MemoryBus;
        use crate::hub::Collaborators;
        use crate::presence::MemoryPresence;
        use crate::services::{MemoryStore, StaticAuthenticator, StaticDirectory};

        fn assert_send<T: Send + 'static>(_: &T) {}

        let directory = Arc::new(StaticDirectory::new());
        let hub = Arc::new(Hub::new(
            Collaborators {
                authenticator: Arc::new(StaticAuthenticator::new()),
                store: Arc::new(MemoryStore::new()),
                membership: directory.clone(),
                admins: directory,
                presence: Arc::new(MemoryPresence::new()),
                bus: Arc::new(MemoryBus::new()),
            },
            settings(),
        ));
        let (conn, _client) = parley_transport::memory::pair(1024);

        let task = serve_connection(hub, Box::new(conn), CancellationToken::new());
        assert_send(&task);
    }
}
