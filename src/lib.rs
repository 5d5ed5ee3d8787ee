//! dpi-bypass: userspace DPI-bypass dataplane
//!
//! A dataplane that defeats deep-packet-inspection classification of TCP
//! and UDP flows by perturbing how the first inspectable bytes of each
//! flow appear on the wire, while relaying every other byte untouched.
//!
//! # Architecture
//!
//! ```text
//! App → virtual tunnel iface → Processor ─┬→ TcpRelay → upstream socket
//!                                         │     (first TLS record split)
//!                                         └→ UdpRelay → upstream socket
//!                                               (QUIC decoys, low TTL)
//!          responses re-framed as IPv4 and written back into the iface
//! ```
//!
//! Two dataplane variants share the codec and detectors:
//!
//! - **Tunnel relays** ([`processor::Processor`]): the host routes whole
//!   apps into a tunnel interface; per-flow relays terminate the app side
//!   and carry the bytes over ordinary kernel sockets.
//! - **Raw-socket emitter** ([`emitter::DecoyEmitter`], the `udp-bypass`
//!   binary): the host firewall routes only target UDP flows through a
//!   point-to-point tunnel; captured packets are forwarded through a raw
//!   socket carrying a DSCP loop-prevention mark, with decoy QUIC
//!   Initials injected ahead of the real ones.
//!
//! # Modules
//!
//! - [`packet`]: IPv4/TCP/UDP parse, build, checksums
//! - [`sniff`]: TLS `ClientHello` and QUIC Initial detection
//! - [`relay`]: per-flow TCP and UDP session relays
//! - [`tun`]: tunnel interface device and traits
//! - [`processor`]: the readiness loop tying tunnel and relays together
//! - [`emitter`]: the raw-socket decoy dataplane
//! - [`config`]: start-time configuration
//! - [`pidfile`]: single-instance interlock for the CLI
//! - [`error`]: error hierarchy

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod emitter;
pub mod error;
pub mod packet;
pub mod pidfile;
pub mod processor;
pub mod relay;
pub mod sniff;
pub mod tun;

pub use config::{load_config, load_fake_payload, DataplaneConfig, FakeConfig, SplitConfig};
pub use emitter::{DecoyEmitter, EmitterConfig, EmitterStats, LOOP_PREVENTION_TOS};
pub use error::{BypassError, ConfigError, PacketError, RelayError, Result, TunnelError};
pub use packet::{
    build_ipv4_tcp, build_ipv4_udp, build_udp_datagram, checksum, parse_ipv4, parse_tcp, parse_udp,
    transport_checksum, IpInfo, TcpInfo, TcpSegment, UdpInfo,
};
pub use processor::{spawn, Processor, ProcessorHandle, ProcessorStats};
pub use relay::{
    allow_all, ResponseStatus, SessionKey, SocketProtector, TcpRelay, TcpRelayConfig,
    TcpRelayStats, TcpState, UdpRelay, UdpRelayConfig, UdpRelayStats,
};
pub use sniff::{is_quic_initial, is_tls_client_hello, QuicVersion};
pub use tun::{FrameSink, PacketTunnel, TunDevice};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
