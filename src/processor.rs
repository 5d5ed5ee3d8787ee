//! Tunnel packet loop
//!
//! Single-threaded, readiness-driven. One multiplexer watches the tunnel
//! handle and every upstream socket both relays own; the 1 s wait timeout
//! bounds shutdown latency and paces the periodic idle sweep. The loop
//! thread owns all relay state, all sockets and the tunnel handle, so
//! nothing is locked.
//!
//! Per iteration: frames read from the tunnel are parsed and dispatched to
//! the TCP or UDP relay by IP protocol; after each dispatch the
//! multiplexer set is refreshed with any upstream socket the dispatch
//! created (re-adding a known one is ignored). Readiness on any other
//! handle is offered to the TCP relay first, then the UDP relay, draining
//! until the socket runs dry.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, trace, warn};

use crate::config::DataplaneConfig;
use crate::error::TunnelError;
use crate::packet::{parse_ipv4, parse_tcp, parse_udp, PROTO_TCP, PROTO_UDP};
use crate::relay::{
    ResponseStatus, SessionKey, SocketProtector, TcpRelay, TcpRelayConfig, TcpRelayStats, UdpRelay,
    UdpRelayConfig, UdpRelayStats, MAX_PACKET_SIZE,
};
use crate::tun::PacketTunnel;

/// Multiplexer wait timeout; bounds shutdown latency
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Seconds between idle sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Readiness events drained per wait
const MAX_EVENTS: usize = 128;

/// Counters, readable at any time
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ProcessorStats {
    /// IPv4 frames read from the tunnel
    pub frames_in: u64,
    /// Frames dropped as unparseable
    pub malformed: u64,
    /// Frames carrying a protocol other than TCP/UDP
    pub other_protocol: u64,
}

/// The dataplane loop: tunnel in, relays out
pub struct Processor<T: PacketTunnel> {
    tun: T,
    /// The tunnel's token is its own fd, like every upstream socket's
    tun_token: Token,
    tcp: TcpRelay,
    udp: UdpRelay,
    poll: Poll,
    running: Arc<AtomicBool>,
    read_buf: Vec<u8>,
    fd_scratch: Vec<RawFd>,
    stats: ProcessorStats,
}

impl<T: PacketTunnel> Processor<T> {
    /// Create a processor over `tun`
    ///
    /// `fake_payload` is the already-loaded decoy bytes (empty disables
    /// injection); `protector` shields upstream sockets from system-wide
    /// capture.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Multiplexer` when the multiplexer cannot be
    /// created or the tunnel handle cannot be registered.
    pub fn new(
        tun: T,
        config: &DataplaneConfig,
        fake_payload: Vec<u8>,
        protector: SocketProtector,
    ) -> Result<Self, TunnelError> {
        let poll = Poll::new().map_err(TunnelError::Multiplexer)?;
        let tun_token = Token(tun.as_raw_fd() as usize);
        poll.registry()
            .register(&mut SourceFd(&tun.as_raw_fd()), tun_token, Interest::READABLE)
            .map_err(TunnelError::Multiplexer)?;

        let tcp = TcpRelay::new(
            config.tun_addr,
            TcpRelayConfig {
                split_pos: config.split.position,
                use_disorder: config.split.disorder,
                ..TcpRelayConfig::default()
            },
            Arc::clone(&protector),
        );
        let udp = UdpRelay::new(
            config.tun_addr,
            UdpRelayConfig {
                fake_payload,
                fake_ttl: config.fake.ttl,
                fake_repeats: config.fake.repeats,
                ..UdpRelayConfig::default()
            },
            protector,
        );

        Ok(Self {
            tun,
            tun_token,
            tcp,
            udp,
            poll,
            running: Arc::new(AtomicBool::new(true)),
            read_buf: vec![0u8; MAX_PACKET_SIZE],
            fd_scratch: Vec::new(),
            stats: ProcessorStats::default(),
        })
    }

    /// Flag that stops the loop when cleared
    #[must_use]
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Counter snapshots: loop, TCP relay, UDP relay
    #[must_use]
    pub fn stats(&self) -> (ProcessorStats, TcpRelayStats, UdpRelayStats) {
        (self.stats, self.tcp.stats(), self.udp.stats())
    }

    /// Run until the stop flag clears, then tear down both relays
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Multiplexer` on an unrecoverable wait
    /// failure. Per-packet and per-session problems never surface here.
    pub fn run(&mut self) -> Result<(), TunnelError> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        let mut last_sweep = Instant::now();

        info!("dataplane loop starting");

        while self.running.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TunnelError::Multiplexer(e)),
            }

            for event in &events {
                let token = event.token();
                if token == self.tun_token {
                    self.drain_tun();
                } else {
                    self.drain_upstream(token.0 as RawFd);
                }
            }

            if last_sweep.elapsed() >= SWEEP_INTERVAL {
                self.tcp.sweep_idle(&mut self.tun);
                self.udp.sweep_idle();
                last_sweep = Instant::now();
            }
        }

        info!("dataplane loop stopping");
        self.tcp.clear();
        self.udp.clear();
        Ok(())
    }

    /// Read tunnel frames until the handle runs dry
    fn drain_tun(&mut self) {
        let mut buf = std::mem::take(&mut self.read_buf);
        loop {
            match self.tun.read_frame(&mut buf) {
                Ok(Some(n)) => {
                    self.stats.frames_in += 1;
                    self.dispatch(&buf[..n]);
                }
                Ok(None) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    break;
                }
                Err(e) => {
                    warn!("tun read: {e}");
                    break;
                }
            }
        }
        self.read_buf = buf;
    }

    /// Parse one frame and hand it to the owning relay
    fn dispatch(&mut self, frame: &[u8]) {
        let ip = match parse_ipv4(frame) {
            Ok(ip) => ip,
            Err(e) => {
                self.stats.malformed += 1;
                trace!("malformed frame: {e}");
                return;
            }
        };

        match ip.protocol {
            PROTO_TCP => {
                let tcp = match parse_tcp(ip.l4) {
                    Ok(tcp) => tcp,
                    Err(e) => {
                        self.stats.malformed += 1;
                        trace!("malformed TCP: {e}");
                        return;
                    }
                };
                let key = SessionKey::new(
                    tcp.src_port,
                    std::net::SocketAddrV4::new(ip.dst, tcp.dst_port),
                );
                self.tcp
                    .process(&mut self.tun, key, tcp.seq, tcp.flags, tcp.payload);
                self.refresh_registrations();
            }
            PROTO_UDP => {
                let udp = match parse_udp(ip.l4) {
                    Ok(udp) => udp,
                    Err(e) => {
                        self.stats.malformed += 1;
                        trace!("malformed UDP: {e}");
                        return;
                    }
                };
                let key = SessionKey::new(
                    udp.src_port,
                    std::net::SocketAddrV4::new(ip.dst, udp.dst_port),
                );
                self.udp.process(key, udp.payload);
                self.refresh_registrations();
            }
            other => {
                self.stats.other_protocol += 1;
                trace!("protocol {other} ignored");
            }
        }
    }

    /// Register any upstream fds the last dispatch created
    ///
    /// Upstream fds double as their own tokens. Every live fd is offered
    /// to the multiplexer each time; re-adding a watched one fails with
    /// `AlreadyExists`, which is the no-op the contract asks for. No
    /// registration cache is kept: a closed fd number can come back as a
    /// different socket, and a cache would wrongly skip it.
    fn refresh_registrations(&mut self) {
        self.fd_scratch.clear();
        self.tcp.collect_fds(&mut self.fd_scratch);
        self.udp.collect_fds(&mut self.fd_scratch);

        for &fd in &self.fd_scratch {
            match self
                .poll
                .registry()
                .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
            {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => warn!("register fd {fd}: {e}"),
            }
        }
    }

    /// Offer a ready upstream socket to the relays until it runs dry
    fn drain_upstream(&mut self, fd: RawFd) {
        loop {
            let mut status = self.tcp.handle_response(&mut self.tun, fd);
            if status == ResponseStatus::NotOurs {
                status = self.udp.handle_response(&mut self.tun, fd);
            }

            match status {
                ResponseStatus::Forwarded => {}
                ResponseStatus::Idle => break,
                ResponseStatus::NotOurs => {
                    debug!("fd {fd} not owned by any relay, dropping registration");
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                    break;
                }
                ResponseStatus::Closed => {
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                    break;
                }
            }
        }
    }
}

/// A running dataplane: stop flag plus loop thread
pub struct ProcessorHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), TunnelError>>>,
}

impl ProcessorHandle {
    /// Clear the stop flag and join the loop thread
    ///
    /// # Errors
    ///
    /// Propagates the loop's exit result; a panicked loop thread becomes
    /// `TunnelError::Create`.
    pub fn stop(mut self) -> Result<(), TunnelError> {
        self.running.store(false, Ordering::Relaxed);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| TunnelError::Create("dataplane thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for ProcessorHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawn the loop on its own thread
#[must_use]
pub fn spawn<T: PacketTunnel + Send + 'static>(mut processor: Processor<T>) -> ProcessorHandle {
    let running = processor.stop_flag();
    let thread = std::thread::Builder::new()
        .name("dpi-dataplane".into())
        .spawn(move || processor.run())
        .expect("spawn dataplane thread");
    ProcessorHandle {
        running,
        thread: Some(thread),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_ipv4_tcp, parse_ipv4, parse_tcp, tcp_flags, TcpSegment};
    use crate::relay::allow_all;
    use std::net::{Ipv4Addr, SocketAddr, TcpListener};
    use std::os::unix::net::UnixDatagram;

    fn syn_frame(src_port: u16, dst: SocketAddr, seq: u32) -> Vec<u8> {
        let SocketAddr::V4(dst) = dst else {
            unreachable!()
        };
        let seg = TcpSegment {
            src: Ipv4Addr::new(10, 120, 0, 5),
            dst: *dst.ip(),
            src_port,
            dst_port: dst.port(),
            seq,
            ack: 0,
            flags: tcp_flags::SYN,
            window: 64240,
            payload: &[],
        };
        let mut buf = vec![0u8; 64];
        let n = build_ipv4_tcp(&mut buf, &seg).unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_loop_answers_syn_over_fake_tun() {
        let (loop_side, app_side) = UnixDatagram::pair().unwrap();
        loop_side.set_nonblocking(true).unwrap();
        app_side
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let dst = listener.local_addr().unwrap();

        let processor = Processor::new(
            loop_side,
            &DataplaneConfig::default(),
            Vec::new(),
            allow_all(),
        )
        .unwrap();
        let handle = spawn(processor);

        app_side.send(&syn_frame(40000, dst, 1000)).unwrap();

        let mut buf = [0u8; 256];
        let n = app_side.recv(&mut buf).unwrap();
        let ip = parse_ipv4(&buf[..n]).unwrap();
        let tcp = parse_tcp(ip.l4).unwrap();
        assert_eq!(tcp.flags, tcp_flags::SYN | tcp_flags::ACK);
        assert_eq!(tcp.ack, 1001);

        handle.stop().unwrap();
    }

    #[test]
    fn test_stop_terminates_promptly() {
        let (loop_side, _app_side) = UnixDatagram::pair().unwrap();
        loop_side.set_nonblocking(true).unwrap();

        let processor = Processor::new(
            loop_side,
            &DataplaneConfig::default(),
            Vec::new(),
            allow_all(),
        )
        .unwrap();
        let handle = spawn(processor);

        let started = Instant::now();
        handle.stop().unwrap();
        // Bounded by the 1 s poll timeout plus slack
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_malformed_frames_counted_not_fatal() {
        let (loop_side, app_side) = UnixDatagram::pair().unwrap();
        loop_side.set_nonblocking(true).unwrap();

        let mut processor = Processor::new(
            loop_side,
            &DataplaneConfig::default(),
            Vec::new(),
            allow_all(),
        )
        .unwrap();

        // Claims IPv4 but is all header lies
        app_side.send(&[0x45, 0, 0, 40, 0, 0]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        processor.drain_tun();

        let (stats, _, _) = processor.stats();
        assert_eq!(stats.malformed, 1);
    }
}
