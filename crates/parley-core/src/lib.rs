//! # parley-core
//!
//! Message delivery core for the Parley chat platform.
//!
//! This crate provides the moving parts between a client connection and
//! the message bus:
//!
//! - **Registry** - Live connections of this process, keyed by user
//! - **Presence** - Shared hint of which users are connected anywhere
//! - **Reconciler** - Keyed waiter table matching media parts to messages
//! - **Ingest** - Per-connection pipeline: validate, reconcile, persist, publish
//! - **Outbox** - Persisted envelopes still waiting for the bus
//! - **Fan-out** - Per-topic relays resolving receivers and delivering
//! - **Hub** - Owns the shared state and starts the background workers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Ingest    │────▶│     Bus     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Registry   │◀────│ Reconciler  │     │   Fan-out   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                                       │
//!        └───────────────────────────────────────┘
//! ```

pub mod bus;
pub mod fanout;
pub mod hub;
pub mod ingest;
pub mod message;
pub mod metrics;
pub mod outbox;
pub mod presence;
pub mod reconcile;
pub mod registry;
pub mod services;

pub use bus::{Backoff, Bus, BusError, MemoryBus, Subscription};
pub use fanout::{DeliveryReport, FanoutRelay, RelayError, RelayKind};
pub use hub::{Collaborators, Hub, HubSettings};
pub use ingest::{serve_connection, validate_submission, ConnectionState, IngestError};
pub use message::{Credentials, Envelope, PendingAttachment, ReadyMessage, Topic};
pub use outbox::{Outbox, ParkedEnvelope};
pub use presence::{MemoryPresence, PresenceError, PresenceState, PresenceStore};
pub use reconcile::{DeliverOutcome, MediaReconciler, ReconcileError};
pub use registry::{ConnectionHandle, ConnectionRegistry, SendError};
pub use services::{
    AdminService, AuthError, Authenticator, CollaboratorError, MembershipService, MemoryStore,
    MessageStore, StaticAuthenticator, StaticDirectory, StoreError,
};
