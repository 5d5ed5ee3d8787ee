//! TLS `ClientHello` detection
//!
//! # TLS Record Format
//!
//! ```text
//! ContentType (1 byte)      = 0x16 for Handshake
//! ProtocolVersion (2 bytes)
//! Length (2 bytes)
//! HandshakeType (1 byte)    = 0x01 for ClientHello
//! ...
//! ```
//!
//! Only the content type and handshake type are checked; length and
//! version fields are not validated. The detector gates a wire
//! perturbation, not a parser, so looseness is intentional.

use tracing::trace;

/// TLS `ContentType` for Handshake
const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// TLS `HandshakeType` for `ClientHello`
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// Minimum bytes needed to see both discriminating fields
const MIN_DETECT_LEN: usize = 6;

/// Check whether a TCP payload starts with a TLS `ClientHello`
#[must_use]
pub fn is_tls_client_hello(payload: &[u8]) -> bool {
    if payload.len() < MIN_DETECT_LEN {
        return false;
    }

    if payload[0] != TLS_CONTENT_TYPE_HANDSHAKE {
        return false;
    }

    if payload[5] != TLS_HANDSHAKE_TYPE_CLIENT_HELLO {
        trace!("TLS handshake but not ClientHello (0x{:02x})", payload[5]);
        return false;
    }

    true
}
