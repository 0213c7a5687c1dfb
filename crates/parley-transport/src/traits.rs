//! Transport abstraction traits for Parley.
//!
//! A live client connection is split into a read half, owned by the
//! connection's ingest task, and a write half, owned by its writer task.

use async_trait::async_trait;
use bytes::Bytes;
use parley_protocol::{Frame, ProtocolError};
use std::fmt;
use thiserror::Error;

/// Identifies one accepted connection for its whole lifetime.
///
/// A user who reconnects gets a fresh id, which lets cleanup of the old
/// connection tell its own registry slot apart from the replacement's.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap an id chosen by the transport.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A random `conn_`-prefixed id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    /// The id as logged and compared.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer went away or the socket was closed locally.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The write half could not hand a frame to the peer.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The underlying stream reported an error while reading.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// A frame could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Whether the connection can keep reading after this error.
    ///
    /// Only a frame whose body failed to decode qualifies; every other error
    /// means the stream is gone or misaligned.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Protocol(e) if e.is_recoverable())
    }
}

/// The read half of a client connection.
///
/// The connection task holding a reader is spawned on the multi-threaded
/// runtime and keeps shared borrows of it across awaits.
#[async_trait]
pub trait FrameReader: Send + Sync {
    /// Receive the next frame from the connection.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// The write half of a client connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Encode and send a frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let data = parley_protocol::encode(&frame)?;
        self.send_raw(data).await
    }

    /// Send an already length-prefixed frame.
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Flush and close the write side.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An accepted client connection, ready to be split into its halves.
pub trait Connection: Send {
    /// Id assigned when the connection was accepted.
    fn id(&self) -> &ConnectionId;

    /// Peer address for logging, when the transport knows it.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split the connection into independently owned read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>);
}
