//! Chat data model shared by the wire protocol and the delivery core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A message identifier.
pub type MessageId = String;

/// An authenticated user identifier.
pub type UserId = String;

/// Milliseconds since the UNIX epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Where a message is addressed.
///
/// Room and channel destinations are mutually exclusive: a message belongs to
/// exactly one of them, which also decides the bus topic it travels on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Destination {
    /// A chat room; every member may post.
    Room(String),
    /// A broadcast channel; only admins may post.
    Channel(String),
}

impl Destination {
    /// The destination identifier, regardless of kind.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Destination::Room(id) | Destination::Channel(id) => id,
        }
    }

    /// Short kind label, used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Destination::Room(_) => "room",
            Destination::Channel(_) => "channel",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// One reconciled media part of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Position of the part, in arrival order.
    pub part: u32,
    /// Storage reference returned by the upload collaborator.
    pub file_id: String,
}

/// A chat message.
///
/// Built by the ingest pipeline from a [`Submission`] and immutable once
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub message_id: MessageId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Room or channel the message is addressed to.
    pub destination: Destination,
    /// Text body.
    pub body: String,
    /// Creation timestamp in milliseconds.
    pub created_at: u64,
    /// Number of media parts the sender declared.
    pub media_count: u32,
    /// Reconciled media parts; empty until reconciliation completes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// A message submission as sent by a client.
///
/// Fields are lenient at the decoding layer so that missing values surface
/// as validation failures instead of decode failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Client-chosen identifier; required when media is declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Claimed author; must match the authenticated identity.
    #[serde(default)]
    pub sender_id: UserId,
    /// Target room or channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
    /// Text body.
    #[serde(default)]
    pub body: String,
    /// Client creation timestamp in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    /// Number of media parts uploaded out of band.
    #[serde(default)]
    pub media_count: u32,
}

impl Submission {
    /// Create a text submission to a destination.
    #[must_use]
    pub fn text(
        sender_id: impl Into<UserId>,
        destination: Destination,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: None,
            sender_id: sender_id.into(),
            destination: Some(destination),
            body: body.into(),
            created_at: Some(now_millis()),
            media_count: 0,
        }
    }

    /// Declare out-of-band media parts under a client-chosen message id.
    #[must_use]
    pub fn with_media(mut self, message_id: impl Into<MessageId>, count: u32) -> Self {
        self.message_id = Some(message_id.into());
        self.media_count = count;
        self
    }
}
