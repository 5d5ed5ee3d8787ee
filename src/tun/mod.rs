//! Virtual tunnel interface
//!
//! The dataplane exchanges raw IPv4 frames with the host through a
//! file-handle abstraction, one frame per read/write. On loopback-style
//! platforms each frame is prefixed with a 4-byte big-endian
//! address-family word which the device strips and prepends; on platforms
//! that hand over bare IPv4 the prefix is absent. Which framing applies is
//! a build-time property of the platform, not a runtime switch.
//!
//! Two seams keep the rest of the dataplane testable without privileges:
//! [`FrameSink`] is the write side the relays emit into, and
//! [`PacketTunnel`] is the full read/write surface the loop drives. Any
//! datagram-preserving fd pair can stand in for the device.

use std::io;
use std::os::fd::AsRawFd;

mod device;

pub use device::TunDevice;

/// Write side of the tunnel: accepts one IPv4 frame per call
pub trait FrameSink {
    /// Write a single IPv4 frame
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O error; callers treat frame writes as
    /// best-effort.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize>;
}

/// Full tunnel surface: readable, writable, multiplexer-registrable
pub trait PacketTunnel: FrameSink + AsRawFd {
    /// Read one frame into `buf`
    ///
    /// Returns `Ok(Some(n))` with the IPv4 frame length, `Ok(None)` when a
    /// frame arrived but is not IPv4 (skipped), and the underlying error
    /// otherwise (`WouldBlock` when nothing is pending).
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O error.
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

/// `FrameSink` over any datagram-preserving Unix socket
///
/// Stands in for the tunnel device where one `send` is one frame; used by
/// the loop tests and available to embedders that receive frames over a
/// socket pair rather than a kernel interface.
impl FrameSink for std::os::unix::net::UnixDatagram {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.send(frame)
    }
}

impl PacketTunnel for std::os::unix::net::UnixDatagram {
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let n = self.recv(buf)?;
        // A datagram socket carries bare IPv4 frames; version-check only
        if n == 0 || buf[0] >> 4 != 4 {
            return Ok(None);
        }
        Ok(Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn test_unix_datagram_frame_round_trip() {
        let (mut a, mut b) = UnixDatagram::pair().unwrap();

        let frame = [0x45u8, 0, 0, 20];
        a.write_frame(&frame).unwrap();

        let mut buf = [0u8; 64];
        let n = b.read_frame(&mut buf).unwrap();
        assert_eq!(n, Some(4));
        assert_eq!(&buf[..4], &frame);
    }

    #[test]
    fn test_unix_datagram_skips_non_ipv4() {
        let (mut a, mut b) = UnixDatagram::pair().unwrap();

        a.write_frame(&[0x60, 0, 0, 0]).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(b.read_frame(&mut buf).unwrap(), None);
    }
}
