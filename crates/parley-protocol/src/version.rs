//! Protocol versioning.
//!
//! A client names only its major version in `connect`. Minor revisions add
//! optional fields and never change the meaning of existing ones, so any
//! client on the server's major line is accepted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version spoken by this build.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

/// A `major.minor` protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether a client announcing `major` may complete the handshake.
    #[must_use]
    pub const fn accepts_major(&self, major: u8) -> bool {
        self.major == major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_major_line_is_accepted() {
        assert!(PROTOCOL_VERSION.accepts_major(PROTOCOL_VERSION.major));
        assert!(!PROTOCOL_VERSION.accepts_major(0));
        assert!(!Version::new(1, 4).accepts_major(2));
    }

    #[test]
    fn test_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
        assert_eq!(Version::new(2, 13).to_string(), "2.13");
    }
}
