//! Frame types for the Parley protocol.
//!
//! Frames are the unit of communication between a chat client and the
//! delivery core. Each frame is serialized using MessagePack.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{Message, MessageId, Submission};

/// The kind of a frame, named as in its `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Connect,
    Connected,
    Submit,
    Accepted,
    Message,
    Error,
    Ping,
    Pong,
}

impl FrameType {
    /// The `type` tag this kind carries on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FrameType::Connect => "connect",
            FrameType::Connected => "connected",
            FrameType::Submit => "submit",
            FrameType::Accepted => "accepted",
            FrameType::Message => "message",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried by [`Frame::Error`].
pub mod error_code {
    /// Malformed or incomplete submission.
    pub const VALIDATION: u16 = 1001;
    /// Frame could not be decoded into a submission.
    pub const MAPPING: u16 = 1002;
    /// Persistence rejected the message (constraint violation).
    pub const DATA_INTEGRITY: u16 = 1003;
    /// Persistence infrastructure failure; the submission may be retried.
    pub const DATABASE_INTERNAL: u16 = 1004;
    /// Message bus unavailable; the submission may be retried.
    pub const PUBLISH: u16 = 1005;
    /// Media parts did not arrive in time.
    pub const MEDIA_TIMEOUT: u16 = 1006;
    /// Credentials were rejected during the handshake.
    pub const UNAUTHORIZED: u16 = 1101;
    /// Client speaks an incompatible protocol version.
    pub const UNSUPPORTED_VERSION: u16 = 1102;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial handshake carrying the client's credentials.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol major version.
        version: u8,
        /// Access token.
        access_token: String,
        /// Refresh token, forwarded unchanged.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
    },

    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Verified user identity.
        user_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// A message submission.
    #[serde(rename = "submit")]
    Submit(Submission),

    /// The submission was persisted and published.
    #[serde(rename = "accepted")]
    Accepted {
        /// Identifier assigned to the stored message.
        message_id: MessageId,
    },

    /// A delivered message.
    #[serde(rename = "message")]
    Message {
        /// The message.
        message: Message,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// Error code, see [`error_code`].
        code: u16,
        /// Human-readable error message.
        error: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Submit(_) => FrameType::Submit,
            Frame::Accepted { .. } => FrameType::Accepted,
            Frame::Message { .. } => FrameType::Message,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(
        version: u8,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
    ) -> Self {
        Frame::Connect {
            version,
            access_token: access_token.into(),
            refresh_token,
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        version: u8,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Submit frame.
    #[must_use]
    pub fn submit(submission: Submission) -> Self {
        Frame::Submit(submission)
    }

    /// Create a new Accepted frame.
    #[must_use]
    pub fn accepted(message_id: impl Into<MessageId>) -> Self {
        Frame::Accepted {
            message_id: message_id.into(),
        }
    }

    /// Create a new Message frame.
    #[must_use]
    pub fn message(message: Message) -> Self {
        Frame::Message { message }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, error: impl Into<String>) -> Self {
        Frame::Error {
            code,
            error: error.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}
