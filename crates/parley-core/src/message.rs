//! Message types carried between the ingest pipeline, the bus and the relays.

use parley_protocol::{Destination, Message, MessageId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    uuid::Uuid::new_v4().to_string()
}

/// Authorization credentials supplied by a client at connect time.
///
/// They are forwarded unchanged with every call made on the user's behalf.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Access token.
    pub access_token: String,
    /// Refresh token, if the client supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Credentials {
    /// Create credentials from an access token.
    #[must_use]
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
        }
    }

    /// Attach a refresh token.
    #[must_use]
    pub fn with_refresh(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }
}

// Tokens never reach the logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Envelopes addressed to chat rooms.
    RoomMessages,
    /// Envelopes addressed to broadcast channels.
    ChannelMessages,
    /// Ready messages for recipients without a local connection.
    Notification,
    /// Media parts reported ready by the upload collaborator.
    AttachmentReady,
}

impl Topic {
    /// Wire name of the topic.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::RoomMessages => "room-messages",
            Topic::ChannelMessages => "channel-messages",
            Topic::Notification => "notification",
            Topic::AttachmentReady => "attachment-ready",
        }
    }

    /// The topic a message to `destination` is published on.
    #[must_use]
    pub fn for_destination(destination: &Destination) -> Self {
        match destination {
            Destination::Room(_) => Topic::RoomMessages,
            Destination::Channel(_) => Topic::ChannelMessages,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted message on its way to fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The persisted message.
    pub message: Message,
    /// The sender's forwarded credentials.
    pub credentials: Credentials,
    /// Resolved receivers; empty until a relay resolves them.
    #[serde(default)]
    pub receivers: Vec<UserId>,
}

impl Envelope {
    /// Create an unresolved envelope.
    #[must_use]
    pub fn new(message: Message, credentials: Credentials) -> Self {
        Self {
            message,
            credentials,
            receivers: Vec::new(),
        }
    }
}

/// A message handed to the notification subsystem for one receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMessage {
    /// The message to deliver.
    pub message: Message,
    /// Receiver without a live connection on the publishing process.
    pub receiver_id: UserId,
    /// The sender's forwarded credentials.
    pub credentials: Credentials,
    /// Presence hint: the receiver is connected to some other process.
    #[serde(default)]
    pub online_elsewhere: bool,
}

/// One media part reported retrievable by the upload collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAttachment {
    /// The message the part belongs to.
    pub message_id: MessageId,
    /// Storage reference of the part.
    pub file_id: String,
}

impl PendingAttachment {
    /// Create a new pending attachment event.
    #[must_use]
    pub fn new(message_id: impl Into<MessageId>, file_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            file_id: file_id.into(),
        }
    }
}
