//! L7 signature detection
//!
//! Cheap byte-pattern detectors for the two signatures the dataplane
//! perturbs: TLS `ClientHello` (TCP) and QUIC Initial (UDP). Both are
//! total functions over arbitrary byte input and deliberately loose — a
//! false positive costs one harmless split or decoy burst, while a parser
//! would cost cycles on every first segment.

pub mod quic;
pub mod tls;

pub use quic::{is_quic_initial, QuicVersion};
pub use tls::is_tls_client_hello;
