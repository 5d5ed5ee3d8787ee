//! QUIC Initial detection
//!
//! # QUIC Long Header Format
//!
//! ```text
//! +-+-+-+-+-+-+-+-+
//! |1|F|T T|X X X X|   First byte: header form (bit 7), fixed bit, type
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Version (32)         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | DCID Len (8)  |     ...       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Detection keys on the header-form bit and a recognized version number.
//! Version negotiation and draft versions are not targeted: a decoy burst
//! against a version the middlebox does not classify buys nothing.

use tracing::trace;

/// Known QUIC versions the dataplane targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuicVersion {
    /// QUIC version 1 (RFC 9000)
    V1,
    /// QUIC version 2 (RFC 9369)
    V2,
}

impl QuicVersion {
    /// Parse a recognized version from the wire value
    #[must_use]
    pub const fn from_u32(version: u32) -> Option<Self> {
        match version {
            0x0000_0001 => Some(Self::V1),
            0x6b33_43cf => Some(Self::V2),
            _ => None,
        }
    }

    /// The wire value of this version
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::V1 => 0x0000_0001,
            Self::V2 => 0x6b33_43cf,
        }
    }
}

impl std::fmt::Display for QuicVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "QUICv1"),
            Self::V2 => write!(f, "QUICv2"),
        }
    }
}

/// Check whether a UDP payload looks like a QUIC Initial
///
/// Requires the long-header bit and a v1/v2 version field. The packet type
/// bits are not inspected: the first long-header packet of a flow with a
/// recognized version is what DPI classifiers key on.
#[must_use]
pub fn is_quic_initial(payload: &[u8]) -> bool {
    if payload.len() < 5 {
        return false;
    }

    // Long header: bit 7 must be set
    if payload[0] & 0x80 == 0 {
        return false;
    }

    let version = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    match QuicVersion::from_u32(version) {
        Some(_) => true,
        None => {
            trace!("long header with untargeted version 0x{version:08x}");
            false
        }
    }
}
