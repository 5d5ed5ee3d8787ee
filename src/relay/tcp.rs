//! TCP relay with first-segment TLS split
//!
//! Only the app-facing half of TCP lives here. The app's SYN never reaches
//! the network: the relay forges the SYN-ACK, every data ACK, and the
//! closing FIN/RST on behalf of the remote, while a normal kernel socket
//! carries the bytes to the real destination with real TCP semantics.
//! There is consequently no retransmit queue and no congestion control —
//! bytes this relay drops are recovered by the endpoints themselves.
//!
//! The DPI evasion happens on the first app-to-upstream data segment: a
//! detected TLS `ClientHello` is pushed upstream as two separate writes so
//! it crosses the wire as two segments, misaligning pattern matchers that
//! expect the hello in one piece.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use crate::error::RelayError;
use crate::packet::{build_ipv4_tcp, tcp_flags, TcpSegment};
use crate::relay::{
    ResponseStatus, SessionKey, SocketProtector, MAX_PACKET_SIZE, TCP_IDLE_TIMEOUT_SECS,
    TCP_MAX_SESSIONS, TUN_WINDOW,
};
use crate::sniff::is_tls_client_hello;
use crate::tun::FrameSink;

/// TCP relay settings
#[derive(Debug, Clone)]
pub struct TcpRelayConfig {
    /// Split position for the first TLS segment; 0 disables splitting
    pub split_pos: usize,
    /// Send the second fragment before the first
    pub use_disorder: bool,
    /// Session table capacity
    pub max_sessions: usize,
    /// Idle lifetime before a session is reset and reaped
    pub idle_timeout: Duration,
}

impl Default for TcpRelayConfig {
    fn default() -> Self {
        Self {
            split_pos: 0,
            use_disorder: false,
            max_sessions: TCP_MAX_SESSIONS,
            idle_timeout: Duration::from_secs(TCP_IDLE_TIMEOUT_SECS),
        }
    }
}

/// App-facing connection state
///
/// A key with no session corresponds to the idle state; closed sessions
/// leave the table immediately, freeing the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// SYN seen, SYN-ACK not yet emitted
    SynReceived,
    /// Relaying
    Established,
    /// App sent FIN; upstream write side half-closed
    FinWait,
    /// Being torn down
    Closed,
}

/// Counters, readable at any time
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TcpRelayStats {
    /// Sessions created over the relay's lifetime
    pub sessions_created: u64,
    /// Sessions reaped by the idle sweep
    pub sessions_reaped: u64,
    /// SYNs dropped because the table was full
    pub dropped_full: u64,
    /// SYNs dropped because the upstream socket could not be opened
    pub dropped_refused: u64,
    /// First segments split in two
    pub splits: u64,
    /// Upstream segments re-framed into the tunnel
    pub responses: u64,
}

struct TcpSession {
    key: SessionKey,
    stream: TcpStream,
    state: TcpState,
    /// Next sequence number emitted toward the app
    tun_seq: u32,
    /// Next byte expected from the app
    tun_ack: u32,
    /// The app's SYN sequence, kept for diagnostics
    app_isn: u32,
    first_data_sent: bool,
    last_activity: Instant,
}

/// Half-TCP state machine terminating app flows on the tunnel
pub struct TcpRelay {
    config: TcpRelayConfig,
    tun_addr: Ipv4Addr,
    protector: SocketProtector,
    sessions: HashMap<SessionKey, TcpSession>,
    by_fd: HashMap<RawFd, SessionKey>,
    started: Instant,
    recv_buf: Vec<u8>,
    frame_buf: Vec<u8>,
    stats: TcpRelayStats,
}

impl TcpRelay {
    /// Create a relay
    #[must_use]
    pub fn new(tun_addr: Ipv4Addr, config: TcpRelayConfig, protector: SocketProtector) -> Self {
        Self {
            config,
            tun_addr,
            protector,
            sessions: HashMap::new(),
            by_fd: HashMap::new(),
            started: Instant::now(),
            recv_buf: vec![0u8; MAX_PACKET_SIZE],
            frame_buf: vec![0u8; MAX_PACKET_SIZE],
            stats: TcpRelayStats::default(),
        }
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// State of the session for `key`, if one exists
    #[must_use]
    pub fn state_of(&self, key: &SessionKey) -> Option<TcpState> {
        self.sessions.get(key).map(|s| s.state)
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> TcpRelayStats {
        self.stats
    }

    /// Handle one app-side segment
    ///
    /// `seq`, `flags` and `payload` come straight off the parsed segment.
    /// The segment's own ack field is deliberately not consulted: the app
    /// ultimately talks to a real TCP stack through the upstream socket,
    /// so the emulated peer never validates acknowledgments.
    pub fn process(
        &mut self,
        tun: &mut dyn FrameSink,
        key: SessionKey,
        seq: u32,
        flags: u8,
        payload: &[u8],
    ) {
        if flags & tcp_flags::RST != 0 {
            if self.sessions.contains_key(&key) {
                debug!("tcp {key}: RST from app");
                self.remove_session(&key);
            }
            return;
        }

        if flags & tcp_flags::SYN != 0 {
            self.handle_syn(tun, key, seq);
            return;
        }

        if !self.sessions.contains_key(&key) {
            return;
        }

        if flags & tcp_flags::FIN != 0 {
            self.handle_fin(tun, key, seq);
            return;
        }

        if !payload.is_empty() {
            self.handle_data(tun, key, seq, payload);
        }
    }

    /// Handle readiness on an upstream socket
    ///
    /// Reads once; data becomes an ACK|PSH segment toward the app, EOF
    /// becomes FIN|ACK and an error becomes RST, both collapsing the
    /// session.
    pub fn handle_response(&mut self, tun: &mut dyn FrameSink, fd: RawFd) -> ResponseStatus {
        let Some(&key) = self.by_fd.get(&fd) else {
            return ResponseStatus::NotOurs;
        };
        let Some(session) = self.sessions.get_mut(&key) else {
            return ResponseStatus::NotOurs;
        };

        match (&session.stream).read(&mut self.recv_buf) {
            Ok(0) => {
                debug!("tcp {key}: upstream EOF");
                Self::emit_segment(
                    &mut self.frame_buf,
                    tun,
                    self.tun_addr,
                    session,
                    tcp_flags::FIN | tcp_flags::ACK,
                    &[],
                );
                session.state = TcpState::Closed;
                self.remove_session(&key);
                ResponseStatus::Closed
            }
            Ok(n) => {
                session.last_activity = Instant::now();
                Self::emit_segment(
                    &mut self.frame_buf,
                    tun,
                    self.tun_addr,
                    session,
                    tcp_flags::ACK | tcp_flags::PSH,
                    &self.recv_buf[..n],
                );
                self.stats.responses += 1;
                ResponseStatus::Forwarded
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                ResponseStatus::Idle
            }
            Err(e) => {
                debug!("tcp {key}: upstream error: {e}");
                Self::emit_segment(
                    &mut self.frame_buf,
                    tun,
                    self.tun_addr,
                    session,
                    tcp_flags::RST,
                    &[],
                );
                session.state = TcpState::Closed;
                self.remove_session(&key);
                ResponseStatus::Closed
            }
        }
    }

    /// Append all live upstream fds to `out` for multiplexer registration
    pub fn collect_fds(&self, out: &mut Vec<RawFd>) {
        out.extend(self.by_fd.keys().copied());
    }

    /// Reset and reap sessions idle past the configured timeout
    pub fn sweep_idle(&mut self, tun: &mut dyn FrameSink) {
        self.sweep_at(tun, Instant::now());
    }

    fn sweep_at(&mut self, tun: &mut dyn FrameSink, now: Instant) {
        let timeout = self.config.idle_timeout;
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) > timeout)
            .map(|(k, _)| *k)
            .collect();

        for key in expired {
            if let Some(session) = self.sessions.get_mut(&key) {
                debug!("tcp {key}: idle, resetting");
                Self::emit_segment(
                    &mut self.frame_buf,
                    tun,
                    self.tun_addr,
                    session,
                    tcp_flags::RST,
                    &[],
                );
                session.state = TcpState::Closed;
            }
            self.remove_session(&key);
            self.stats.sessions_reaped += 1;
        }
    }

    /// Drop every session
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.by_fd.clear();
    }

    fn handle_syn(&mut self, tun: &mut dyn FrameSink, key: SessionKey, seq: u32) {
        if self.sessions.contains_key(&key) {
            // Re-SYN on a live key: tear down and start fresh
            debug!("tcp {key}: re-SYN, recreating session");
            self.remove_session(&key);
        }

        if self.sessions.len() >= self.config.max_sessions {
            trace!("tcp {key}: table full, SYN dropped");
            self.stats.dropped_full += 1;
            return;
        }

        let stream = match self.connect_upstream(key) {
            Ok(stream) => stream,
            Err(e) => {
                debug!("tcp {key}: dropped: {e}");
                self.stats.dropped_refused += 1;
                return;
            }
        };
        let fd = stream.as_raw_fd();

        let session = TcpSession {
            key,
            stream,
            state: TcpState::SynReceived,
            tun_seq: self.initial_seq(&key),
            tun_ack: seq.wrapping_add(1),
            app_isn: seq,
            first_data_sent: false,
            last_activity: Instant::now(),
        };
        self.sessions.insert(key, session);
        self.by_fd.insert(fd, key);
        self.stats.sessions_created += 1;

        let session = self
            .sessions
            .get_mut(&key)
            .expect("session inserted above");
        Self::emit_segment(
            &mut self.frame_buf,
            tun,
            self.tun_addr,
            session,
            tcp_flags::SYN | tcp_flags::ACK,
            &[],
        );
        session.state = TcpState::Established;
        debug!("tcp {key}: established (fd {fd}, app isn {})", session.app_isn);
    }

    fn handle_data(&mut self, tun: &mut dyn FrameSink, key: SessionKey, seq: u32, payload: &[u8]) {
        let split_pos = self.config.split_pos;
        let use_disorder = self.config.use_disorder;

        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        if session.state != TcpState::Established {
            return;
        }

        session.last_activity = Instant::now();
        session.tun_ack = seq.wrapping_add(payload.len() as u32);

        if !session.first_data_sent
            && split_pos > 0
            && payload.len() > split_pos
            && is_tls_client_hello(payload)
        {
            debug!("tcp {key}: ClientHello, splitting at {split_pos}");

            let (first, second) = if use_disorder {
                (&payload[split_pos..], &payload[..split_pos])
            } else {
                (&payload[..split_pos], &payload[split_pos..])
            };
            // Two writes, Nagle off since connect: each fragment leaves as
            // its own segment. An aggressively coalescing kernel could
            // still merge them; observed behavior is that it does not.
            if let Err(e) = (&session.stream).write(first) {
                trace!("tcp {key}: split write: {e}");
            }
            if let Err(e) = (&session.stream).write(second) {
                trace!("tcp {key}: split write: {e}");
            }
            self.stats.splits += 1;
        } else if let Err(e) = (&session.stream).write(payload) {
            trace!("tcp {key}: write: {e}");
        }
        session.first_data_sent = true;

        // Pure ACK back to the app
        Self::emit_segment(
            &mut self.frame_buf,
            tun,
            self.tun_addr,
            session,
            tcp_flags::ACK,
            &[],
        );
    }

    fn handle_fin(&mut self, tun: &mut dyn FrameSink, key: SessionKey, seq: u32) {
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };

        session.last_activity = Instant::now();
        session.tun_ack = seq.wrapping_add(1);
        Self::emit_segment(
            &mut self.frame_buf,
            tun,
            self.tun_addr,
            session,
            tcp_flags::ACK,
            &[],
        );

        // Half-close: the upstream may still have response data in flight
        if let Err(e) = session.stream.shutdown(Shutdown::Write) {
            trace!("tcp {key}: shutdown: {e}");
        }
        session.state = TcpState::FinWait;
        debug!("tcp {key}: fin-wait");
    }

    fn connect_upstream(&self, key: SessionKey) -> Result<TcpStream, RelayError> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| RelayError::refused(key.dst, e))?;

        if !(self.protector)(socket.as_raw_fd()) {
            return Err(RelayError::ProtectorRejected { dst: key.dst });
        }

        socket
            .set_nonblocking(true)
            .map_err(|e| RelayError::refused(key.dst, e))?;
        // Nagle off: the split depends on each write leaving promptly
        socket
            .set_nodelay(true)
            .map_err(|e| RelayError::refused(key.dst, e))?;

        match socket.connect(&SocketAddr::V4(key.dst).into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(RelayError::refused(key.dst, e)),
        }

        Ok(socket.into())
    }

    /// Initial sequence number toward the app
    ///
    /// Time-salted and port-mixed; not unpredictable, which is fine with
    /// the app on the same host. Stable for the session's lifetime.
    fn initial_seq(&self, key: &SessionKey) -> u32 {
        let ms = self.started.elapsed().as_secs().wrapping_mul(1000);
        (ms as u32) ^ ((u32::from(key.dst.port()) << 16) | u32::from(key.src_port))
    }

    /// Build one segment toward the app and advance the sequence space
    ///
    /// SYN and FIN each consume one sequence unit, data consumes its
    /// length, a pure ACK consumes nothing. All arithmetic wraps mod 2^32.
    fn emit_segment(
        frame_buf: &mut [u8],
        tun: &mut dyn FrameSink,
        tun_addr: Ipv4Addr,
        session: &mut TcpSession,
        flags: u8,
        payload: &[u8],
    ) {
        let seg = TcpSegment {
            src: *session.key.dst.ip(),
            dst: tun_addr,
            src_port: session.key.dst.port(),
            dst_port: session.key.src_port,
            seq: session.tun_seq,
            ack: session.tun_ack,
            flags,
            window: TUN_WINDOW,
            payload,
        };
        match build_ipv4_tcp(frame_buf, &seg) {
            Ok(len) => {
                if let Err(e) = tun.write_frame(&frame_buf[..len]) {
                    trace!("tcp {}: tun write: {e}", session.key);
                }
            }
            Err(e) => trace!("tcp {}: frame build: {e}", session.key),
        }

        session.tun_seq = session.tun_seq.wrapping_add(payload.len() as u32);
        if flags & (tcp_flags::SYN | tcp_flags::FIN) != 0 {
            session.tun_seq = session.tun_seq.wrapping_add(1);
        }
    }

    fn remove_session(&mut self, key: &SessionKey) {
        if let Some(session) = self.sessions.remove(key) {
            self.by_fd.remove(&session.stream.as_raw_fd());
        }
    }
}

impl Drop for TcpRelay {
    fn drop(&mut self) {
        self.clear();
    }
}
