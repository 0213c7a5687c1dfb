//! Presence tracking for Parley.
//!
//! The presence store is a key space shared by every process, recording
//! which users currently hold a live connection somewhere. It is a hint for
//! routing decisions only: the connection registry stays authoritative for
//! local delivery.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::{now_millis, UserId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Presence store errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// The store could not be reached.
    #[error("Presence store unavailable: {0}")]
    Unavailable(String),
}

/// Presence record for a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    /// User the record belongs to.
    pub user_id: UserId,
    /// Connection that owns the record.
    pub connection_id: String,
    /// Process holding the connection.
    pub node_id: String,
    /// When the user connected.
    pub joined_at: u64,
    /// Last activity timestamp.
    pub last_seen: u64,
}

impl PresenceState {
    /// Create a new presence record.
    #[must_use]
    pub fn new(
        user_id: impl Into<UserId>,
        connection_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            user_id: user_id.into(),
            connection_id: connection_id.into(),
            node_id: node_id.into(),
            joined_at: now,
            last_seen: now,
        }
    }

    /// Update the last seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = now_millis();
    }

    /// Check if this presence is stale (no activity for the given duration).
    #[must_use]
    pub fn is_stale(&self, timeout: Duration) -> bool {
        now_millis().saturating_sub(self.last_seen) > timeout.as_millis() as u64
    }
}

/// Shared presence key space.
///
/// Writes are owned by the connection that created the record: clearing a
/// record with a stale connection id is a no-op, so a superseded
/// connection cannot mark its replacement offline.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Record that `user_id` is connected through `connection_id`.
    async fn set_online(
        &self,
        user_id: &str,
        connection_id: &str,
        node_id: &str,
    ) -> Result<(), PresenceError>;

    /// Clear the record of `user_id` if `connection_id` still owns it.
    async fn set_offline(&self, user_id: &str, connection_id: &str) -> Result<(), PresenceError>;

    /// Check whether `user_id` is connected anywhere.
    async fn is_online(&self, user_id: &str) -> Result<bool, PresenceError>;

    /// Refresh the activity timestamp of a user's record.
    async fn touch(&self, user_id: &str) -> Result<(), PresenceError>;

    /// Remove records nobody refreshed within `max_idle`.
    ///
    /// Returns the users whose records were removed.
    async fn prune_stale(&self, max_idle: Duration) -> Result<Vec<UserId>, PresenceError>;
}

/// In-memory presence store.
#[derive(Debug, Default)]
pub struct MemoryPresence {
    members: DashMap<UserId, PresenceState>,
}

impl MemoryPresence {
    /// Create an empty presence store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the presence record of a user.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<PresenceState> {
        self.members.get(user_id).map(|e| e.value().clone())
    }

    /// Get the number of present users.
    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn set_online(
        &self,
        user_id: &str,
        connection_id: &str,
        node_id: &str,
    ) -> Result<(), PresenceError> {
        self.members.insert(
            user_id.to_string(),
            PresenceState::new(user_id, connection_id, node_id),
        );
        debug!(user = %user_id, connection = %connection_id, "Presence: online");
        Ok(())
    }

    async fn set_offline(&self, user_id: &str, connection_id: &str) -> Result<(), PresenceError> {
        if let Entry::Occupied(entry) = self.members.entry(user_id.to_string()) {
            if entry.get().connection_id == connection_id {
                entry.remove();
                debug!(user = %user_id, connection = %connection_id, "Presence: offline");
            }
        }
        Ok(())
    }

    async fn is_online(&self, user_id: &str) -> Result<bool, PresenceError> {
        Ok(self.members.contains_key(user_id))
    }

    async fn touch(&self, user_id: &str) -> Result<(), PresenceError> {
        if let Some(mut state) = self.members.get_mut(user_id) {
            state.touch();
        }
        Ok(())
    }

    async fn prune_stale(&self, max_idle: Duration) -> Result<Vec<UserId>, PresenceError> {
        let mut pruned = Vec::new();
        self.members.retain(|user_id, state| {
            if state.is_stale(max_idle) {
                debug!(user = %user_id, node = %state.node_id, "Presence: pruned stale record");
                pruned.push(user_id.clone());
                false
            } else {
                true
            }
        });
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_presence_online_offline() {
        let presence = MemoryPresence::new();

        presence.set_online("alice", "c1", "node-a").await.unwrap();
        assert!(presence.is_online("alice").await.unwrap());
        assert_eq!(presence.get("alice").unwrap().node_id, "node-a");

        presence.set_offline("alice", "c1").await.unwrap();
        assert!(!presence.is_online("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_clear_record() {
        let presence = MemoryPresence::new();

        presence.set_online("alice", "c1", "node-a").await.unwrap();
        presence.set_online("alice", "c2", "node-b").await.unwrap();
        presence.set_offline("alice", "c1").await.unwrap();

        assert!(presence.is_online("alice").await.unwrap());
        assert_eq!(presence.get("alice").unwrap().connection_id, "c2");
    }

    #[tokio::test]
    async fn test_prune_stale() {
        let presence = MemoryPresence::new();
        presence.set_online("alice", "c1", "n").await.unwrap();

        presence.set_online("bob", "c2", "n").await.unwrap();

        assert!(presence
            .prune_stale(Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());

        if let Some(mut state) = presence.members.get_mut("alice") {
            state.last_seen = 0;
        }
        assert_eq!(
            presence.prune_stale(Duration::from_secs(60)).await.unwrap(),
            vec!["alice"]
        );
        assert_eq!(presence.count(), 1);
        assert!(presence.is_online("bob").await.unwrap());
    }

    #[test]
    fn test_presence_state_staleness() {
        let mut state = PresenceState::new("alice", "c1", "n");
        assert!(!state.is_stale(Duration::from_secs(1)));
        state.last_seen = 0;
        assert!(state.is_stale(Duration::from_secs(1)));
        state.touch();
        assert!(!state.is_stale(Duration::from_secs(1)));
    }
}
