//! Raw-socket decoy emitter
//!
//! Alternative dataplane for hosts whose firewall routes target UDP flows
//! through a point-to-point tunnel instead of capturing whole apps. The
//! emitter reads the routed IPv4 frames, and for each one sends the decoy
//! burst (when the payload is a QUIC Initial) followed by the original
//! UDP bytes, all through a raw `IPPROTO_UDP` socket. The kernel
//! synthesizes the IP header, so only UDP header + payload are handed in.
//!
//! # Loop prevention
//!
//! Everything leaving the raw socket is marked with DSCP/TOS `0x04`. The
//! firewall contract is that marked packets pass straight out instead of
//! being routed back into the tunnel; without the mark, every forwarded
//! packet would be re-captured forever. The mark is set once at socket
//! creation and never cleared. A TTL guard backstops the contract: a
//! captured packet whose TTL is already at or below the decoy TTL can
//! only be one of our own fakes and is dropped.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace};

use crate::error::TunnelError;
use crate::packet::{
    build_udp_datagram, parse_ipv4, parse_udp, IPV4_MIN_HEADER_LEN, PROTO_UDP, UDP_HEADER_LEN,
};
use crate::relay::MAX_PACKET_SIZE;
use crate::sniff::is_quic_initial;
use crate::tun::PacketTunnel;

/// DSCP/TOS marker carried by every packet the emitter sends
pub const LOOP_PREVENTION_TOS: u8 = 0x04;

/// Multiplexer wait timeout; bounds shutdown latency
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

const TUN_TOKEN: Token = Token(0);

/// Emitter settings
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Decoy payload; empty disables injection
    pub fake_payload: Vec<u8>,
    /// Hop limit for decoy packets
    pub fake_ttl: u8,
    /// Decoy copies per detected QUIC Initial
    pub fake_repeats: u32,
    /// Emit per-packet diagnostics on stderr
    pub verbose: bool,
}

/// Counters, readable at any time
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct EmitterStats {
    /// Original packets forwarded through the raw socket
    pub forwarded: u64,
    /// Decoy packets sent
    pub fakes_sent: u64,
    /// Frames skipped by the TTL loop guard
    pub skipped_low_ttl: u64,
    /// Frames skipped as unparseable
    pub skipped_malformed: u64,
    /// Frames skipped as non-UDP
    pub skipped_not_udp: u64,
}

/// What to do with one captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameAction {
    /// Too short for an IPv4 header, or the UDP header is truncated:
    /// dropped without a diagnostic
    SkipShort,
    /// The header declares an impossible length; carries the declared
    /// header length in bytes for the diagnostic
    SkipBadHeader(usize),
    SkipNotUdp,
    /// TTL at or below the decoy TTL: one of our own fakes came back
    SkipLowTtl(u8),
    Forward {
        inject_fakes: bool,
    },
}

/// Decide what a captured frame gets: drop, forward, or fakes + forward
pub(crate) fn assess_frame(frame: &[u8], fake_ttl: u8, have_fake: bool) -> FrameAction {
    if frame.len() < IPV4_MIN_HEADER_LEN {
        return FrameAction::SkipShort;
    }
    let Ok(ip) = parse_ipv4(frame) else {
        // Header-level lies get reported with the length the header
        // claimed for itself
        return FrameAction::SkipBadHeader(usize::from(frame[0] & 0x0f) * 4);
    };
    if ip.protocol != PROTO_UDP {
        return FrameAction::SkipNotUdp;
    }
    let Ok(udp) = parse_udp(ip.l4) else {
        return FrameAction::SkipShort;
    };

    if ip.ttl > 0 && ip.ttl <= fake_ttl {
        return FrameAction::SkipLowTtl(ip.ttl);
    }

    FrameAction::Forward {
        inject_fakes: have_fake && is_quic_initial(udp.payload),
    }
}

/// Forwards tunnel-routed UDP through a DSCP-marked raw socket
pub struct DecoyEmitter {
    raw: Socket,
    config: EmitterConfig,
    fake_buf: Vec<u8>,
    stats: EmitterStats,
}

impl DecoyEmitter {
    /// Create the raw socket and arm the loop-prevention mark
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::RawSocket` when the socket cannot be created
    /// or the TOS mark cannot be set. The mark failing is fatal: the
    /// emitter is unsafe to run without it.
    pub fn new(config: EmitterConfig) -> Result<Self, TunnelError> {
        let raw = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::UDP))
            .map_err(TunnelError::RawSocket)?;
        raw.set_tos(u32::from(LOOP_PREVENTION_TOS))
            .map_err(TunnelError::RawSocket)?;

        info!(
            "raw emitter ready: fake_ttl={} repeats={} fake_len={}",
            config.fake_ttl,
            config.fake_repeats,
            config.fake_payload.len()
        );

        Ok(Self {
            raw,
            config,
            fake_buf: vec![0u8; UDP_HEADER_LEN + MAX_PACKET_SIZE],
            stats: EmitterStats::default(),
        })
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> EmitterStats {
        self.stats
    }

    /// Read routed frames until the stop flag clears
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` on multiplexer failure or a tunnel read
    /// error that is not transient.
    pub fn run<T: PacketTunnel>(
        &mut self,
        tun: &mut T,
        running: &AtomicBool,
    ) -> Result<(), TunnelError> {
        let mut poll = Poll::new().map_err(TunnelError::Multiplexer)?;
        poll.registry()
            .register(
                &mut SourceFd(&tun.as_raw_fd()),
                TUN_TOKEN,
                Interest::READABLE,
            )
            .map_err(TunnelError::Multiplexer)?;
        let mut events = Events::with_capacity(4);
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        while running.load(Ordering::Relaxed) {
            match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TunnelError::Multiplexer(e)),
            }
            if events.is_empty() {
                continue;
            }

            loop {
                match tun.read_frame(&mut buf) {
                    Ok(Some(n)) => self.process_frame(&buf[..n]),
                    Ok(None) => {}
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        break;
                    }
                    Err(e) => return Err(TunnelError::IoError(e)),
                }
            }
        }

        Ok(())
    }

    /// Handle one captured IPv4 frame
    pub fn process_frame(&mut self, frame: &[u8]) {
        match assess_frame(frame, self.config.fake_ttl, !self.config.fake_payload.is_empty()) {
            FrameAction::SkipShort => {
                self.stats.skipped_malformed += 1;
            }
            FrameAction::SkipBadHeader(hlen) => {
                self.stats.skipped_malformed += 1;
                if self.config.verbose {
                    eprintln!("udp-bypass:skip malformed IP hlen={hlen}");
                }
            }
            FrameAction::SkipNotUdp => {
                self.stats.skipped_not_udp += 1;
            }
            FrameAction::SkipLowTtl(ttl) => {
                self.stats.skipped_low_ttl += 1;
                if self.config.verbose {
                    eprintln!("udp-bypass:skip looped pkt TTL={ttl}");
                }
            }
            FrameAction::Forward { inject_fakes } => {
                // Both parses succeeded inside assess_frame
                let Ok(ip) = parse_ipv4(frame) else { return };
                let Ok(udp) = parse_udp(ip.l4) else { return };

                if self.config.verbose {
                    eprintln!(
                        "udp-bypass:pkt {}:{} -> {}:{} len={} ttl={}",
                        ip.src,
                        udp.src_port,
                        ip.dst,
                        udp.dst_port,
                        udp.payload.len(),
                        ip.ttl
                    );
                }

                if inject_fakes {
                    if self.config.verbose {
                        eprintln!("udp-bypass:QUIC Initial detected, injecting fakes");
                    }
                    self.send_fakes(ip.dst, udp.src_port, udp.dst_port);
                }

                // Forward the original UDP header + payload at the
                // original TTL; the kernel rebuilds the IP header
                match self.send_raw(ip.l4, ip.dst, ip.ttl) {
                    Ok(_) => self.stats.forwarded += 1,
                    Err(e) => self.log_send_error(&e, ip.l4.len(), ip.ttl),
                }
            }
        }
    }

    /// The decoy burst: `fake_repeats` copies at the decoy TTL
    fn send_fakes(&mut self, dst: Ipv4Addr, src_port: u16, dst_port: u16) {
        let fake_len = match build_udp_datagram(
            &mut self.fake_buf,
            src_port,
            dst_port,
            &self.config.fake_payload,
        ) {
            Ok(n) => n,
            Err(e) => {
                trace!("fake datagram build: {e}");
                return;
            }
        };

        for _ in 0..self.config.fake_repeats {
            match self.send_raw(&self.fake_buf[..fake_len], dst, self.config.fake_ttl) {
                Ok(_) => self.stats.fakes_sent += 1,
                Err(e) => self.log_send_error(&e, fake_len, self.config.fake_ttl),
            }
        }

        if self.config.verbose {
            eprintln!(
                "udp-bypass:fake x{} TTL={} -> {}:{}",
                self.config.fake_repeats, self.config.fake_ttl, dst, dst_port
            );
        }
    }

    /// One raw send at the given TTL
    fn send_raw(&self, udp_bytes: &[u8], dst: Ipv4Addr, ttl: u8) -> io::Result<usize> {
        self.raw.set_ttl(u32::from(ttl))?;
        let addr = SocketAddr::V4(SocketAddrV4::new(dst, 0));
        self.raw.send_to(udp_bytes, &addr.into())
    }

    fn log_send_error(&self, e: &io::Error, len: usize, ttl: u8) {
        // Unreachable destinations are routine on flaky uplinks
        let unreachable = matches!(
            e.raw_os_error(),
            Some(libc::ENETUNREACH) | Some(libc::EHOSTUNREACH)
        );
        if self.config.verbose || !unreachable {
            eprintln!("udp-bypass:sendto: {e} (len={len}, ttl={ttl})");
        }
        debug!("raw send: {e}");
    }
}
