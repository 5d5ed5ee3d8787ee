//! Per-flow relays
//!
//! The relays terminate the app side of each flow on the tunnel interface
//! and speak to the real destination through ordinary kernel sockets. The
//! TCP relay forges the remote's handshake and acknowledgments; the UDP
//! relay forwards datagrams and injects QUIC decoys. Both own dense
//! per-flow session tables keyed on the app's view of the flow.
//!
//! All relay state is owned by the dataplane loop thread; nothing here is
//! synchronized.

use std::net::SocketAddrV4;

pub mod protect;
pub mod tcp;
pub mod udp;

pub use protect::{allow_all, SocketProtector};
pub use tcp::{TcpRelay, TcpRelayConfig, TcpRelayStats, TcpState};
pub use udp::{UdpRelay, UdpRelayConfig, UdpRelayStats};

/// Hard cap on concurrent TCP sessions
pub const TCP_MAX_SESSIONS: usize = 2048;

/// Hard cap on concurrent UDP sessions
pub const UDP_MAX_SESSIONS: usize = 4096;

/// TCP session idle timeout in seconds
pub const TCP_IDLE_TIMEOUT_SECS: u64 = 300;

/// UDP session idle timeout in seconds
pub const UDP_IDLE_TIMEOUT_SECS: u64 = 120;

/// Largest frame the dataplane reads or writes
pub const MAX_PACKET_SIZE: usize = 65536;

/// Window advertised to the app on every emitted segment
///
/// The relay does not implement flow control; the constant merely has to
/// be large enough that the app keeps sending.
pub const TUN_WINDOW: u16 = 32768;

/// Identity of a flow as the app sees it
///
/// The app's source address is always the tunnel address, so the source
/// port plus the destination socket address uniquely identify a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// App-side source port
    pub src_port: u16,
    /// Real destination
    pub dst: SocketAddrV4,
}

impl SessionKey {
    /// Create a new session key
    #[must_use]
    pub const fn new(src_port: u16, dst: SocketAddrV4) -> Self {
        Self { src_port, dst }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ":{} -> {}", self.src_port, self.dst)
    }
}

/// Outcome of handing a ready upstream socket to a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// The socket does not belong to this relay
    NotOurs,
    /// One response was forwarded into the tunnel; more may be pending
    Forwarded,
    /// Nothing to read right now
    Idle,
    /// The socket is finished; deregister it from the multiplexer
    Closed,
}
