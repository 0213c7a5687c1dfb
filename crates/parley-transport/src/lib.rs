//! # parley-transport
//!
//! Transport abstraction layer for the Parley chat delivery core.
//!
//! - **WebSocket** - Upgraded axum sockets, the production transport
//! - **Memory** - In-process pairs for tests and embedding
//!
//! ## Transport Abstraction
//!
//! Every transport yields a [`Connection`] that splits into a
//! [`FrameReader`] and a [`FrameWriter`], so the ingest pipeline can own the
//! read half while a writer task owns the other.
//!
//! ```rust,ignore
//! use parley_transport::{Connection, FrameReader};
//!
//! async fn read_all(conn: Box<dyn Connection>) {
//!     let (mut reader, _writer) = conn.split();
//!     while let Ok(Some(frame)) = reader.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, ConnectionId, FrameReader, FrameWriter, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
