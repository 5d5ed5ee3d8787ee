//! UDP relay with QUIC decoy injection
//!
//! Each app-side flow gets a connected upstream UDP socket. Outbound
//! datagrams are forwarded verbatim, except that a flow's QUIC Initial is
//! preceded by a burst of short-TTL decoy packets: the decoys die between
//! the DPI device and the real server, poisoning the classifier's view of
//! the flow while the server never sees them.
//!
//! Responses arriving on an upstream socket are re-framed as IPv4+UDP from
//! the original destination to the tunnel address and written back into
//! the tunnel.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, trace, warn};

use crate::config::{DEFAULT_FAKE_REPEATS, DEFAULT_FAKE_TTL};
use crate::error::RelayError;
use crate::packet::{build_ipv4_udp, DEFAULT_TTL};
use crate::relay::{
    ResponseStatus, SessionKey, SocketProtector, MAX_PACKET_SIZE, UDP_IDLE_TIMEOUT_SECS,
    UDP_MAX_SESSIONS,
};
use crate::sniff::is_quic_initial;
use crate::tun::FrameSink;

/// UDP relay settings
#[derive(Debug, Clone)]
pub struct UdpRelayConfig {
    /// Decoy payload; empty disables injection
    pub fake_payload: Vec<u8>,
    /// Hop limit for decoy packets
    pub fake_ttl: u8,
    /// Decoy copies per detected QUIC Initial
    pub fake_repeats: u32,
    /// Session table capacity
    pub max_sessions: usize,
    /// Idle lifetime before a session is reaped
    pub idle_timeout: Duration,
}

impl Default for UdpRelayConfig {
    fn default() -> Self {
        Self {
            fake_payload: Vec::new(),
            fake_ttl: DEFAULT_FAKE_TTL,
            fake_repeats: DEFAULT_FAKE_REPEATS,
            max_sessions: UDP_MAX_SESSIONS,
            idle_timeout: Duration::from_secs(UDP_IDLE_TIMEOUT_SECS),
        }
    }
}

/// Counters, readable at any time
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct UdpRelayStats {
    /// Sessions created over the relay's lifetime
    pub sessions_created: u64,
    /// Sessions reaped by the idle sweep
    pub sessions_reaped: u64,
    /// Datagrams dropped because the table was full
    pub dropped_full: u64,
    /// Datagrams dropped because the upstream socket could not be opened
    pub dropped_refused: u64,
    /// App datagrams forwarded upstream
    pub forwarded: u64,
    /// Upstream datagrams re-framed into the tunnel
    pub responses: u64,
    /// Decoy packets emitted
    pub fakes_sent: u64,
}

struct UdpSession {
    socket: UdpSocket,
    last_activity: Instant,
}

/// Per-flow UDP forwarder with decoy injection
pub struct UdpRelay {
    config: UdpRelayConfig,
    tun_addr: Ipv4Addr,
    protector: SocketProtector,
    sessions: HashMap<SessionKey, UdpSession>,
    by_fd: HashMap<RawFd, SessionKey>,
    recv_buf: Vec<u8>,
    frame_buf: Vec<u8>,
    stats: UdpRelayStats,
}

impl UdpRelay {
    /// Create a relay
    ///
    /// `tun_addr` is stamped as the destination of response frames;
    /// `protector` runs once per upstream socket.
    #[must_use]
    pub fn new(tun_addr: Ipv4Addr, config: UdpRelayConfig, protector: SocketProtector) -> Self {
        Self {
            config,
            tun_addr,
            protector,
            sessions: HashMap::new(),
            by_fd: HashMap::new(),
            recv_buf: vec![0u8; MAX_PACKET_SIZE],
            frame_buf: vec![0u8; MAX_PACKET_SIZE],
            stats: UdpRelayStats::default(),
        }
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether a session exists for `key`
    #[must_use]
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> UdpRelayStats {
        self.stats
    }

    /// Handle one app-side datagram
    ///
    /// Looks up or creates the session for `key` and forwards `payload`
    /// upstream, running the decoy ritual first when the payload is a QUIC
    /// Initial and a decoy payload is configured. All failures drop the
    /// datagram; none propagate.
    pub fn process(&mut self, key: SessionKey, payload: &[u8]) {
        if !self.sessions.contains_key(&key) {
            match self.create_session(key) {
                Ok(()) => {}
                Err(e) => {
                    match e {
                        RelayError::TableFull { .. } => self.stats.dropped_full += 1,
                        _ => self.stats.dropped_refused += 1,
                    }
                    trace!("udp {key}: dropped: {e}");
                    return;
                }
            }
        }

        let session = self
            .sessions
            .get_mut(&key)
            .expect("session exists after create");
        session.last_activity = Instant::now();

        if !self.config.fake_payload.is_empty() && is_quic_initial(payload) {
            debug!(
                "udp {key}: QUIC Initial, injecting {} fakes (ttl={})",
                self.config.fake_repeats, self.config.fake_ttl
            );
            let sent = send_with_fakes(
                &session.socket,
                &self.config.fake_payload,
                self.config.fake_ttl,
                self.config.fake_repeats,
                payload,
            );
            self.stats.fakes_sent += sent;
        } else if let Err(e) = session.socket.send(payload) {
            trace!("udp {key}: send: {e}");
        }
        self.stats.forwarded += 1;
    }

    /// Handle readiness on an upstream socket
    ///
    /// Receives one datagram, frames it as IPv4+UDP from the destination
    /// to the tunnel address with the ports swapped, and writes it into
    /// the tunnel.
    pub fn handle_response(&mut self, tun: &mut dyn FrameSink, fd: RawFd) -> ResponseStatus {
        let Some(&key) = self.by_fd.get(&fd) else {
            return ResponseStatus::NotOurs;
        };
        let Some(session) = self.sessions.get_mut(&key) else {
            return ResponseStatus::NotOurs;
        };

        match session.socket.recv(&mut self.recv_buf) {
            Ok(n) if n > 0 => {
                session.last_activity = Instant::now();
                match build_ipv4_udp(
                    &mut self.frame_buf,
                    *key.dst.ip(),
                    self.tun_addr,
                    key.dst.port(),
                    key.src_port,
                    &self.recv_buf[..n],
                ) {
                    Ok(len) => {
                        if let Err(e) = tun.write_frame(&self.frame_buf[..len]) {
                            trace!("udp {key}: tun write: {e}");
                        }
                        self.stats.responses += 1;
                        ResponseStatus::Forwarded
                    }
                    Err(e) => {
                        trace!("udp {key}: frame build: {e}");
                        ResponseStatus::Forwarded
                    }
                }
            }
            Ok(_) => ResponseStatus::Closed,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                ResponseStatus::Idle
            }
            Err(e) => {
                trace!("udp {key}: recv: {e}");
                ResponseStatus::Closed
            }
        }
    }

    /// Append all live upstream fds to `out` for multiplexer registration
    pub fn collect_fds(&self, out: &mut Vec<RawFd>) {
        out.extend(self.by_fd.keys().copied());
    }

    /// Reap sessions idle past the configured timeout
    pub fn sweep_idle(&mut self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&mut self, now: Instant) {
        let timeout = self.config.idle_timeout;
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) > timeout)
            .map(|(k, _)| *k)
            .collect();

        for key in expired {
            debug!("udp {key}: idle, reaping");
            self.remove_session(&key);
            self.stats.sessions_reaped += 1;
        }
    }

    /// Drop every session
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.by_fd.clear();
    }

    fn create_session(&mut self, key: SessionKey) -> Result<(), RelayError> {
        if self.sessions.len() >= self.config.max_sessions {
            return Err(RelayError::TableFull {
                max: self.config.max_sessions,
            });
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| RelayError::refused(key.dst, e))?;

        if !(self.protector)(socket.as_raw_fd()) {
            return Err(RelayError::ProtectorRejected { dst: key.dst });
        }

        // Connected socket: recv() returns only this peer's datagrams
        socket
            .connect(&SocketAddr::V4(key.dst).into())
            .map_err(|e| RelayError::refused(key.dst, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| RelayError::refused(key.dst, e))?;

        let socket: UdpSocket = socket.into();
        let fd = socket.as_raw_fd();

        self.sessions.insert(
            key,
            UdpSession {
                socket,
                last_activity: Instant::now(),
            },
        );
        self.by_fd.insert(fd, key);
        self.stats.sessions_created += 1;
        debug!("udp {key}: session created (fd {fd})");
        Ok(())
    }

    fn remove_session(&mut self, key: &SessionKey) {
        if let Some(session) = self.sessions.remove(key) {
            self.by_fd.remove(&session.socket.as_raw_fd());
        }
    }
}

impl Drop for UdpRelay {
    fn drop(&mut self) {
        self.clear();
    }
}

/// The decoy ritual: low-TTL fakes, then the real payload at normal TTL
///
/// Best-effort throughout; individual send errors are not surfaced.
/// Returns the number of fakes actually sent.
fn send_with_fakes(
    socket: &UdpSocket,
    fake_payload: &[u8],
    fake_ttl: u8,
    fake_repeats: u32,
    payload: &[u8],
) -> u64 {
    let sock = SockRef::from(socket);
    if let Err(e) = sock.set_ttl(u32::from(fake_ttl)) {
        warn!("set_ttl({fake_ttl}): {e}");
    }

    let mut sent = 0u64;
    for _ in 0..fake_repeats {
        match socket.send(fake_payload) {
            Ok(_) => sent += 1,
            Err(e) => trace!("fake send: {e}"),
        }
    }

    if let Err(e) = sock.set_ttl(u32::from(DEFAULT_TTL)) {
        warn!("set_ttl({DEFAULT_TTL}): {e}");
    }
    if let Err(e) = socket.send(payload) {
        trace!("payload send after fakes: {e}");
    }

    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{parse_ipv4, parse_udp, PROTO_UDP};
    use crate::relay::allow_all;
    use std::sync::Arc;

    /// Records every frame the relay writes toward the tunnel
    #[derive(Default)]
    struct FrameLog(Vec<Vec<u8>>);

    impl FrameSink for FrameLog {
        fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<usize> {
            self.0.push(frame.to_vec());
            Ok(frame.len())
        }
    }

    fn tun_addr() -> Ipv4Addr {
        Ipv4Addr::new(10, 120, 0, 1)
    }

    /// Bind a local "server" socket and derive the session key toward it
    fn local_server() -> (UdpSocket, SessionKey) {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let SocketAddr::V4(addr) = server.local_addr().unwrap() else {
            unreachable!()
        };
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (server, SessionKey::new(40000, addr))
    }

    fn quic_initial_payload() -> Vec<u8> {
        let mut p = vec![0xc0, 0x00, 0x00, 0x00, 0x01, 0x08];
        p.resize(64, 0);
        p
    }

    #[test]
    fn test_plain_datagram_forwarded_verbatim() {
        let (server, key) = local_server();
        let mut relay = UdpRelay::new(tun_addr(), UdpRelayConfig::default(), allow_all());

        relay.process(key, b"plain dns query");
        assert_eq!(relay.session_count(), 1);

        let mut buf = [0u8; 128];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"plain dns query");
    }

    #[test]
    fn test_decoy_ritual_ordering() {
        let (server, key) = local_server();
        let config = UdpRelayConfig {
            fake_payload: vec![0xaa; 32],
            fake_ttl: 3,
            fake_repeats: 6,
            ..UdpRelayConfig::default()
        };
        let mut relay = UdpRelay::new(tun_addr(), config, allow_all());

        let initial = quic_initial_payload();
        relay.process(key, &initial);

        // Exactly six fakes arrive first, then the real Initial
        let mut buf = [0u8; 256];
        for _ in 0..6 {
            let n = server.recv(&mut buf).unwrap();
            assert_eq!(&buf[..n], &[0xaa; 32]);
        }
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &initial[..]);

        assert_eq!(relay.stats().fakes_sent, 6);

        // TTL restored after the ritual
        let ttl = relay.sessions.get(&key).unwrap().socket.ttl().unwrap();
        assert_eq!(ttl, u32::from(DEFAULT_TTL));
    }

    #[test]
    fn test_quic_without_fake_payload_forwarded_verbatim() {
        let (server, key) = local_server();
        let mut relay = UdpRelay::new(tun_addr(), UdpRelayConfig::default(), allow_all());

        let initial = quic_initial_payload();
        relay.process(key, &initial);

        let mut buf = [0u8; 256];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &initial[..]);
        assert_eq!(relay.stats().fakes_sent, 0);
    }

    #[test]
    fn test_session_reused_for_same_key() {
        let (server, key) = local_server();
        let mut relay = UdpRelay::new(tun_addr(), UdpRelayConfig::default(), allow_all());

        relay.process(key, b"one");
        relay.process(key, b"two");
        assert_eq!(relay.session_count(), 1);
        assert_eq!(relay.stats().sessions_created, 1);

        let mut buf = [0u8; 64];
        server.recv(&mut buf).unwrap();
        server.recv(&mut buf).unwrap();
    }

    #[test]
    fn test_table_full_drops_silently() {
        let (_server_a, key_a) = local_server();
        let (server_b, key_b) = local_server();
        let config = UdpRelayConfig {
            max_sessions: 1,
            ..UdpRelayConfig::default()
        };
        let mut relay = UdpRelay::new(tun_addr(), config, allow_all());

        relay.process(key_a, b"first");
        relay.process(key_b, b"second");

        assert_eq!(relay.session_count(), 1);
        assert!(relay.contains(&key_a));
        assert!(!relay.contains(&key_b));
        assert_eq!(relay.stats().dropped_full, 1);

        // The dropped flow's server must see nothing
        server_b
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(server_b.recv(&mut buf).is_err());
    }

    #[test]
    fn test_protector_rejection_drops_flow() {
        let (_server, key) = local_server();
        let deny: SocketProtector = Arc::new(|_| false);
        let mut relay = UdpRelay::new(tun_addr(), UdpRelayConfig::default(), deny);

        relay.process(key, b"data");
        assert_eq!(relay.session_count(), 0);
        assert_eq!(relay.stats().dropped_refused, 1);
    }

    #[test]
    fn test_response_reframed_toward_tunnel() {
        let (server, key) = local_server();
        let mut relay = UdpRelay::new(tun_addr(), UdpRelayConfig::default(), allow_all());
        let mut tun = FrameLog::default();

        relay.process(key, b"ping");
        let mut buf = [0u8; 64];
        let (_, from) = server.recv_from(&mut buf).unwrap();

        server.send_to(b"pong", from).unwrap();

        let fd = relay.sessions.get(&key).unwrap().socket.as_raw_fd();
        let mut status = ResponseStatus::Idle;
        for _ in 0..100 {
            status = relay.handle_response(&mut tun, fd);
            if status == ResponseStatus::Forwarded {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(status, ResponseStatus::Forwarded);

        let frame = &tun.0[0];
        let ip = parse_ipv4(frame).unwrap();
        assert_eq!(ip.protocol, PROTO_UDP);
        assert_eq!(ip.src, *key.dst.ip());
        assert_eq!(ip.dst, tun_addr());
        let udp = parse_udp(ip.l4).unwrap();
        assert_eq!(udp.src_port, key.dst.port());
        assert_eq!(udp.dst_port, key.src_port);
        assert_eq!(udp.payload, b"pong");

        // Nothing further pending
        assert_eq!(relay.handle_response(&mut tun, fd), ResponseStatus::Idle);
    }

    #[test]
    fn test_handle_response_unknown_fd() {
        let mut relay = UdpRelay::new(tun_addr(), UdpRelayConfig::default(), allow_all());
        let mut tun = FrameLog::default();
        assert_eq!(
            relay.handle_response(&mut tun, 9999),
            ResponseStatus::NotOurs
        );
    }

    #[test]
    fn test_sweep_respects_timeout() {
        let (_server, key) = local_server();
        let mut relay = UdpRelay::new(tun_addr(), UdpRelayConfig::default(), allow_all());

        relay.process(key, b"x");
        let created = Instant::now();

        // Before the timeout: untouched
        relay.sweep_at(created + Duration::from_secs(30));
        assert_eq!(relay.session_count(), 1);

        // Past the timeout: reaped
        relay.sweep_at(created + Duration::from_secs(UDP_IDLE_TIMEOUT_SECS + 5));
        assert_eq!(relay.session_count(), 0);
        assert_eq!(relay.stats().sessions_reaped, 1);
    }

    #[test]
    fn test_clear_drops_everything() {
        let (_a, key_a) = local_server();
        let (_b, key_b) = local_server();
        let mut relay = UdpRelay::new(tun_addr(), UdpRelayConfig::default(), allow_all());

        relay.process(key_a, b"x");
        relay.process(key_b, b"y");
        assert_eq!(relay.session_count(), 2);

        relay.clear();
        assert_eq!(relay.session_count(), 0);

        let mut fds = Vec::new();
        relay.collect_fds(&mut fds);
        assert!(fds.is_empty());
    }
}
