//! Contracts of the external collaborators the delivery core calls.
//!
//! Authentication, persistence, membership and channel administration live
//! outside this crate. The in-memory implementations back tests and the
//! single-process development server.

use crate::message::Credentials;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parley_protocol::{Message, UserId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::debug;

/// Authentication errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The credentials were not accepted.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The identity provider could not be reached.
    #[error("Authentication service unavailable: {0}")]
    Unavailable(String),
}

/// Persistence errors, classified by whether a retry can help.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The write violated a constraint; retrying will not help.
    #[error("Data integrity violation: {0}")]
    Integrity(String),

    /// The storage infrastructure failed; the write may be retried.
    #[error("Database internal error: {0}")]
    Internal(String),
}

/// Errors from membership and admin-check calls.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The destination does not exist.
    #[error("Unknown destination: {0}")]
    NotFound(String),

    /// The call failed.
    #[error("Collaborator call failed: {0}")]
    Unavailable(String),
}

/// Exchanges connect-time credentials for a verified identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify credentials and return the user they belong to.
    async fn authenticate(&self, credentials: &Credentials) -> Result<UserId, AuthError>;
}

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message.
    async fn save(&self, message: &Message) -> Result<(), StoreError>;

    /// List the messages stored for a room or channel, oldest first.
    async fn list_by_destination(&self, destination_id: &str) -> Result<Vec<Message>, StoreError>;
}

/// Resolves the members of a room or channel.
#[async_trait]
pub trait MembershipService: Send + Sync {
    /// Get the members of a destination.
    async fn members(
        &self,
        destination_id: &str,
        credentials: &Credentials,
    ) -> Result<Vec<UserId>, CollaboratorError>;
}

/// Verifies channel administrators.
#[async_trait]
pub trait AdminService: Send + Sync {
    /// Check whether `user_id` administers `channel_id`.
    async fn is_admin(
        &self,
        channel_id: &str,
        user_id: &str,
        credentials: &Credentials,
    ) -> Result<bool, CollaboratorError>;
}

/// Authenticator backed by a static token table.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    tokens: DashMap<String, UserId>,
}

impl StaticAuthenticator {
    /// Create an authenticator that accepts no tokens.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `access_token` as proof of `user_id`.
    #[must_use]
    pub fn with_token(self, access_token: impl Into<String>, user_id: impl Into<UserId>) -> Self {
        self.tokens.insert(access_token.into(), user_id.into());
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<UserId, AuthError> {
        self.tokens
            .get(&credentials.access_token)
            .map(|e| e.value().clone())
            .ok_or(AuthError::InvalidCredentials)
    }
}

/// In-memory message store.
///
/// Message ids are unique: saving the same id twice is an integrity
/// violation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ids: DashSet<String>,
    by_destination: DashMap<String, Vec<Message>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save fail with an internal error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, message: &Message) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Internal("store marked unavailable".into()));
        }
        if !self.ids.insert(message.message_id.clone()) {
            return Err(StoreError::Integrity(format!(
                "duplicate message id {}",
                message.message_id
            )));
        }
        self.by_destination
            .entry(message.destination.id().to_string())
            .or_default()
            .push(message.clone());
        debug!(message_id = %message.message_id, destination = %message.destination, "Stored message");
        Ok(())
    }

    async fn list_by_destination(&self, destination_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .by_destination
            .get(destination_id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }
}

/// Static room and channel directory.
///
/// Serves both membership and admin checks, and counts the calls it
/// receives.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    members: DashMap<String, Vec<UserId>>,
    admins: DashMap<String, HashSet<UserId>>,
    unavailable: AtomicBool,
    member_calls: AtomicUsize,
    admin_calls: AtomicUsize,
}

impl StaticDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a room with its members.
    #[must_use]
    pub fn with_room<I, S>(self, room_id: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        self.members
            .insert(room_id.into(), members.into_iter().map(Into::into).collect());
        self
    }

    /// Add a channel with its members and admins.
    #[must_use]
    pub fn with_channel<I, J, S, T>(self, channel_id: impl Into<String>, members: I, admins: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<UserId>,
        T: Into<UserId>,
    {
        let channel_id = channel_id.into();
        self.members.insert(
            channel_id.clone(),
            members.into_iter().map(Into::into).collect(),
        );
        self.admins
            .insert(channel_id, admins.into_iter().map(Into::into).collect());
        self
    }

    /// Make every call fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of membership calls served.
    #[must_use]
    pub fn member_calls(&self) -> usize {
        self.member_calls.load(Ordering::SeqCst)
    }

    /// Number of admin checks served.
    #[must_use]
    pub fn admin_calls(&self) -> usize {
        self.admin_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), CollaboratorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CollaboratorError::Unavailable(
                "directory marked unavailable".into(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MembershipService for StaticDirectory {
    async fn members(
        &self,
        destination_id: &str,
        _credentials: &Credentials,
    ) -> Result<Vec<UserId>, CollaboratorError> {
        self.member_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.members
            .get(destination_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CollaboratorError::NotFound(destination_id.to_string()))
    }
}

#[async_trait]
impl AdminService for StaticDirectory {
    async fn is_admin(
        &self,
        channel_id: &str,
        user_id: &str,
        _credentials: &Credentials,
    ) -> Result<bool, CollaboratorError> {
        self.admin_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self
            .admins
            .get(channel_id)
            .map(|admins| admins.contains(user_id))
            .unwrap_or(false))
    }
}
