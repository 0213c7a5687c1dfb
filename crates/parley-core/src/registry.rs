//! Per-process registry of live client connections.
//!
//! The registry maps an authenticated user to the handle of its live
//! connection. At most one handle is registered per user; registering a new
//! one hands the superseded handle back to the caller, who must close it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::{Frame, UserId};
use parley_transport::ConnectionId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors writing to a connection handle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The connection is closed or its writer is gone.
    #[error("Connection closed")]
    Closed,

    /// The outbound queue is full; the client is not keeping up.
    #[error("Outbound queue full")]
    Full,
}

/// A cloneable handle to a live connection.
///
/// Frames are queued to the connection's writer task. Closing the handle
/// signals the connection's own task to shut down.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle from its parts.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        user_id: impl Into<UserId>,
        outbound: mpsc::Sender<Frame>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            user_id: user_id.into(),
            outbound,
            closed,
        }
    }

    /// Create a handle together with the receiving end of its outbound queue.
    #[must_use]
    pub fn channel(
        connection_id: ConnectionId,
        user_id: impl Into<UserId>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self::new(connection_id, user_id, tx, CancellationToken::new()),
            rx,
        )
    }

    /// The connection identifier.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// The user bound to this connection.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue a frame for the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or its queue is full.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Signal the connection to close.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the connection has been told to close.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the connection closes.
    #[must_use]
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// The connection registry.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<UserId, ConnectionHandle>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for its user.
    ///
    /// Returns the handle it replaced, if any. The registry does not close
    /// the superseded connection; that is the caller's job.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let user_id = handle.user_id.clone();
        let connection = handle.connection_id.clone();
        let previous = self.connections.insert(user_id.clone(), handle);

        debug!(
            user = %user_id,
            connection = %connection,
            replaced = previous.is_some(),
            "Registered connection"
        );

        previous
    }

    /// Remove whatever connection is registered for a user.
    pub fn unregister(&self, user_id: &str) -> Option<ConnectionHandle> {
        let removed = self.connections.remove(user_id).map(|(_, h)| h);
        if removed.is_some() {
            debug!(user = %user_id, "Unregistered connection");
        }
        removed
    }

    /// Remove a user's entry only if it still belongs to `connection_id`.
    ///
    /// Returns `true` if the entry was removed. A connection that was
    /// superseded leaves its replacement in place.
    pub fn unregister_connection(&self, user_id: &str, connection_id: &ConnectionId) -> bool {
        match self.connections.entry(user_id.to_string()) {
            Entry::Occupied(entry) if entry.get().connection_id == *connection_id => {
                entry.remove();
                debug!(user = %user_id, connection = %connection_id, "Unregistered connection");
                true
            }
            _ => false,
        }
    }

    /// Look up the live connection of a user.
    #[must_use]
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.connections.get(user_id).map(|e| e.value().clone())
    }

    /// Check if a user has a live connection.
    #[must_use]
    pub fn contains(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    /// Users with a live connection, in no particular order.
    #[must_use]
    pub fn users(&self) -> Vec<UserId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close and remove every connection.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.connections.clear();
    }
}
