//! Protocol versions and the capability flags they imply.
//!
//! | Version | Adds on the wire                          | Flag          |
//! |---------|-------------------------------------------|---------------|
//! | 1       | base layout                               |               |
//! | 2       | per-device time stamp (`u64` µs)          | `TIME_STAMPS` |
//! | 3       | per-device validity flag (`u8`)           | `VALIDITY`    |
//! | 4       | per-device linear + angular velocity      | `VELOCITIES`  |
//!
//! Flags are never negotiated on their own; both ends derive them from the
//! session version with [`Capabilities::for_version`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::MIN_PROTOCOL_VERSION;

/// Optional wire fields available in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const TIME_STAMPS: u32 = 1 << 0;
    pub const VALIDITY: u32 = 1 << 1;
    pub const VELOCITIES: u32 = 1 << 2;

    /// No optional fields; used for the handshake frames themselves.
    pub const fn none() -> Self {
        Self(0)
    }

    /// The capability set implied by `version`.
    pub const fn for_version(version: u32) -> Self {
        let mut bits = 0;
        if version >= 2 {
            bits |= Self::TIME_STAMPS;
        }
        if version >= 3 {
            bits |= Self::VALIDITY;
        }
        if version >= 4 {
            bits |= Self::VELOCITIES;
        }
        Self(bits)
    }

    /// Raw flags as they travel in `ServerHello`.  Decoded values are only
    /// ever compared against [`Capabilities::for_version`].
    pub(crate) const fn from_wire(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn has_time_stamps(self) -> bool {
        self.0 & Self::TIME_STAMPS != 0
    }

    pub const fn has_validity(self) -> bool {
        self.0 & Self::VALIDITY != 0
    }

    pub const fn has_velocities(self) -> bool {
        self.0 & Self::VELOCITIES != 0
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (self.has_time_stamps(), "time_stamps"),
            (self.has_validity(), "validity"),
            (self.has_velocities(), "velocities"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// The session version for a client and server advertising their highest
/// supported versions.
///
/// # Errors
///
/// [`ProtocolError::UnsupportedVersion`] if the minimum is older than
/// [`MIN_PROTOCOL_VERSION`].
pub fn negotiate_version(client: u32, server: u32) -> Result<u32, ProtocolError> {
    let version = client.min(server);
    if version < MIN_PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(version)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::PROTOCOL_VERSION;

    #[test]
    fn test_negotiated_version_is_minimum_for_all_pairs() {
        for client in MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION {
            for server in MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION {
                assert_eq!(negotiate_version(client, server), Ok(client.min(server)));
            }
        }
    }

    #[test]
    fn test_version_zero_is_unsupported() {
        assert_eq!(negotiate_version(0, 4), Err(ProtocolError::UnsupportedVersion(0)));
    }

    #[test]
    fn test_newer_peer_than_this_build_negotiates_down() {
        assert_eq!(negotiate_version(9, PROTOCOL_VERSION), Ok(PROTOCOL_VERSION));
    }

    #[test]
    fn test_capabilities_grow_with_version() {
        assert_eq!(Capabilities::for_version(1), Capabilities::none());
        assert!(Capabilities::for_version(2).has_time_stamps());
        assert!(!Capabilities::for_version(2).has_validity());
        assert!(Capabilities::for_version(3).has_validity());
        assert!(!Capabilities::for_version(3).has_velocities());
        assert!(Capabilities::for_version(4).has_velocities());
        assert_eq!(Capabilities::for_version(4).bits(), 0b111);
    }

    #[test]
    fn test_display_lists_flags() {
        assert_eq!(Capabilities::for_version(1).to_string(), "none");
        assert_eq!(Capabilities::for_version(3).to_string(), "time_stamps|validity");
    }
}
