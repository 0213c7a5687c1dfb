//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat delivery core.
//!
//! This crate defines the binary protocol spoken between chat clients and
//! the delivery core, plus the chat data model shared with it.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Credential handshake
//! - `Submit` / `Accepted` - Message submission and acknowledgment
//! - `Message` - Delivered message
//! - `Error` - Structured rejection
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Destination, Frame, Submission};
//!
//! let frame = Frame::submit(Submission::text("alice", Destination::Room("lobby".into()), "hi"));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod model;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{error_code, Frame, FrameType};
pub use model::{now_millis, Attachment, Destination, Message, MessageId, Submission, UserId};
pub use version::{Version, PROTOCOL_VERSION};
