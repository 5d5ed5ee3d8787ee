//! Tunnel device creation and configuration
//!
//! Linux: clones `/dev/net/tun` with `IFF_TUN | IFF_NO_PI`, so the handle
//! carries bare IPv4 frames. macOS: connects a kernel-control socket to
//! the utun subsystem, where every frame is prefixed with a 4-byte
//! big-endian address-family word. Both paths scan unit numbers upward
//! from a starting hint until a free interface is found.
//!
//! Address assignment and interface-up are done with the classic
//! `SIOCSIFADDR`/`SIOCSIFDSTADDR`/`SIOCSIFFLAGS` ioctls on a throwaway
//! datagram socket, so no shelling out to ifconfig is needed.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};
#[cfg(target_os = "macos")]
use std::os::fd::FromRawFd;

use tracing::{debug, info};

use crate::error::TunnelError;
use crate::tun::{FrameSink, PacketTunnel};

/// How many unit numbers to try past the starting hint
const UNIT_SCAN: u32 = 50;

/// Length of the utun address-family frame prefix
#[cfg(target_os = "macos")]
const AF_HEADER_LEN: usize = 4;

/// A point-to-point tunnel interface
pub struct TunDevice {
    file: File,
    name: String,
    #[cfg(target_os = "macos")]
    write_buf: Vec<u8>,
}

impl TunDevice {
    /// Create a tunnel interface, scanning unit numbers from `unit_start`
    ///
    /// The handle is left nonblocking, ready for a readiness loop.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Create` when no unit in the scanned range can
    /// be claimed (typically a privilege problem).
    pub fn create(unit_start: u32) -> Result<Self, TunnelError> {
        let (file, name) = create_platform(unit_start)?;
        set_nonblocking(file.as_raw_fd())
            .map_err(|e| TunnelError::Create(format!("set nonblocking: {e}")))?;
        info!("created tunnel interface {name}");
        Ok(Self {
            file,
            name,
            #[cfg(target_os = "macos")]
            write_buf: Vec::new(),
        })
    }

    /// Interface name, e.g. `utun20`
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assign point-to-point addresses and bring the interface up
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Configure` naming the interface and the
    /// failing step.
    pub fn configure(&self, local: Ipv4Addr, peer: Ipv4Addr) -> Result<(), TunnelError> {
        configure_platform(&self.name, local, peer)?;
        debug!("{}: configured {local} -> {peer}, up", self.name);
        Ok(())
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl FrameSink for TunDevice {
    #[cfg(target_os = "macos")]
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        // utun requires the AF word and the frame in a single write
        self.write_buf.clear();
        self.write_buf
            .extend_from_slice(&(libc::AF_INET as u32).to_be_bytes());
        self.write_buf.extend_from_slice(frame);
        let n = self.file.write(&self.write_buf)?;
        Ok(n.saturating_sub(AF_HEADER_LEN))
    }

    #[cfg(not(target_os = "macos"))]
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.file.write(frame)
    }
}

impl PacketTunnel for TunDevice {
    #[cfg(target_os = "macos")]
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let n = self.file.read(buf)?;
        if n < AF_HEADER_LEN {
            return Ok(None);
        }
        let af = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if af != libc::AF_INET as u32 {
            return Ok(None);
        }
        buf.copy_within(AF_HEADER_LEN..n, 0);
        Ok(Some(n - AF_HEADER_LEN))
    }

    #[cfg(not(target_os = "macos"))]
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let n = self.file.read(buf)?;
        if n == 0 || buf[0] >> 4 != 4 {
            return Ok(None);
        }
        Ok(Some(n))
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Safety: plain fcntl on an fd we own
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn sockaddr_in(addr: Ipv4Addr) -> libc::sockaddr_in {
    // Safety: sockaddr_in is plain old data
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    #[cfg(target_os = "macos")]
    {
        sa.sin_len = std::mem::size_of::<libc::sockaddr_in>() as u8;
    }
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    };
    sa
}

// ---------------------------------------------------------------------
// Linux: /dev/net/tun
// ---------------------------------------------------------------------

#[cfg(target_os = "linux")]
mod sys {
    /// `struct ifreq` with the flags arm of the union
    #[repr(C)]
    pub struct IfReqFlags {
        pub name: [libc::c_char; libc::IFNAMSIZ],
        pub flags: libc::c_short,
        pub _pad: [u8; 22],
    }

    /// `struct ifreq` with the sockaddr arm of the union
    #[repr(C)]
    pub struct IfReqAddr {
        pub name: [libc::c_char; libc::IFNAMSIZ],
        pub addr: libc::sockaddr_in,
        pub _pad: [u8; 8],
    }

    pub fn ifr_name(name: &str) -> [libc::c_char; libc::IFNAMSIZ] {
        let mut out = [0 as libc::c_char; libc::IFNAMSIZ];
        for (dst, src) in out.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        out
    }
}

#[cfg(target_os = "linux")]
fn create_platform(unit_start: u32) -> Result<(File, String), TunnelError> {
    use std::fs::OpenOptions;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .map_err(|e| TunnelError::Create(format!("/dev/net/tun: {e}")))?;

    for unit in unit_start..unit_start + UNIT_SCAN {
        let name = format!("utun{unit}");
        let mut ifr = sys::IfReqFlags {
            name: sys::ifr_name(&name),
            flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
            _pad: [0; 22],
        };
        // Safety: TUNSETIFF reads the ifreq we pass
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), libc::TUNSETIFF, &mut ifr) };
        if ret == 0 {
            return Ok((file, name));
        }
    }

    Err(TunnelError::Create(format!(
        "no free unit in utun{unit_start}..utun{}",
        unit_start + UNIT_SCAN - 1
    )))
}

#[cfg(target_os = "linux")]
fn configure_platform(name: &str, local: Ipv4Addr, peer: Ipv4Addr) -> Result<(), TunnelError> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(TunnelError::configure(
            name,
            format!("socket: {}", io::Error::last_os_error()),
        ));
    }

    let result = (|| {
        let mut ifr = sys::IfReqAddr {
            name: sys::ifr_name(name),
            addr: sockaddr_in(local),
            _pad: [0; 8],
        };
        // Safety: the ioctls read/write only the ifreq we pass
        unsafe {
            if libc::ioctl(sock, libc::SIOCSIFADDR, &mut ifr) < 0 {
                return Err(format!("SIOCSIFADDR: {}", io::Error::last_os_error()));
            }

            ifr.addr = sockaddr_in(peer);
            if libc::ioctl(sock, libc::SIOCSIFDSTADDR, &mut ifr) < 0 {
                return Err(format!("SIOCSIFDSTADDR: {}", io::Error::last_os_error()));
            }

            let mut flags_req = sys::IfReqFlags {
                name: sys::ifr_name(name),
                flags: 0,
                _pad: [0; 22],
            };
            if libc::ioctl(sock, libc::SIOCGIFFLAGS, &mut flags_req) < 0 {
                return Err(format!("SIOCGIFFLAGS: {}", io::Error::last_os_error()));
            }
            flags_req.flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
            if libc::ioctl(sock, libc::SIOCSIFFLAGS, &mut flags_req) < 0 {
                return Err(format!("SIOCSIFFLAGS: {}", io::Error::last_os_error()));
            }
        }
        Ok(())
    })();

    unsafe { libc::close(sock) };
    result.map_err(|reason| TunnelError::configure(name, reason))
}

// ---------------------------------------------------------------------
// macOS: utun kernel control
// ---------------------------------------------------------------------

#[cfg(target_os = "macos")]
mod sys {
    pub const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";
    pub const SYSPROTO_CONTROL: libc::c_int = 2;
    pub const AF_SYS_CONTROL: u16 = 2;
    /// _IOWR('N', 3, struct ctl_info)
    pub const CTLIOCGINFO: libc::c_ulong = 0xc064_4e03;

    #[repr(C)]
    pub struct CtlInfo {
        pub ctl_id: u32,
        pub ctl_name: [libc::c_char; 96],
    }

    #[repr(C)]
    pub struct SockaddrCtl {
        pub sc_len: u8,
        pub sc_family: u8,
        pub ss_sysaddr: u16,
        pub sc_id: u32,
        pub sc_unit: u32,
        pub sc_reserved: [u32; 5],
    }
}

#[cfg(target_os = "macos")]
fn create_platform(unit_start: u32) -> Result<(File, String), TunnelError> {
    // Safety: standard kernel-control socket dance; fd ownership moves
    // into the returned File.
    unsafe {
        let fd = libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, sys::SYSPROTO_CONTROL);
        if fd < 0 {
            return Err(TunnelError::Create(format!(
                "socket(PF_SYSTEM): {}",
                io::Error::last_os_error()
            )));
        }

        let mut info = sys::CtlInfo {
            ctl_id: 0,
            ctl_name: [0; 96],
        };
        for (dst, src) in info.ctl_name.iter_mut().zip(sys::UTUN_CONTROL_NAME) {
            *dst = *src as libc::c_char;
        }
        if libc::ioctl(fd, sys::CTLIOCGINFO, &mut info) < 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(TunnelError::Create(format!("CTLIOCGINFO: {e}")));
        }

        for unit in unit_start..unit_start + UNIT_SCAN {
            let sc = sys::SockaddrCtl {
                sc_len: std::mem::size_of::<sys::SockaddrCtl>() as u8,
                sc_family: libc::AF_SYSTEM as u8,
                ss_sysaddr: sys::AF_SYS_CONTROL,
                sc_id: info.ctl_id,
                // utunN corresponds to sc_unit N+1
                sc_unit: unit + 1,
                sc_reserved: [0; 5],
            };
            if libc::connect(
                fd,
                std::ptr::addr_of!(sc).cast(),
                std::mem::size_of::<sys::SockaddrCtl>() as libc::socklen_t,
            ) == 0
            {
                return Ok((File::from_raw_fd(fd), format!("utun{unit}")));
            }
        }

        libc::close(fd);
        Err(TunnelError::Create(format!(
            "no free unit in utun{unit_start}..utun{}",
            unit_start + UNIT_SCAN - 1
        )))
    }
}

#[cfg(target_os = "macos")]
fn configure_platform(name: &str, local: Ipv4Addr, peer: Ipv4Addr) -> Result<(), TunnelError> {
    #[repr(C)]
    struct IfReqAddr {
        name: [libc::c_char; libc::IFNAMSIZ],
        addr: libc::sockaddr_in,
    }
    #[repr(C)]
    struct IfReqFlags {
        name: [libc::c_char; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 14],
    }

    const SIOCSIFADDR: libc::c_ulong = 0x8020_690c;
    const SIOCSIFDSTADDR: libc::c_ulong = 0x8020_690e;
    const SIOCGIFFLAGS: libc::c_ulong = 0xc020_6911;
    const SIOCSIFFLAGS: libc::c_ulong = 0x8020_6910;

    fn ifr_name(name: &str) -> [libc::c_char; libc::IFNAMSIZ] {
        let mut out = [0 as libc::c_char; libc::IFNAMSIZ];
        for (dst, src) in out.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        out
    }

    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(TunnelError::configure(
            name,
            format!("socket: {}", io::Error::last_os_error()),
        ));
    }

    let result = (|| {
        // Safety: the ioctls read only the ifreq we pass
        unsafe {
            let mut ifr = IfReqAddr {
                name: ifr_name(name),
                addr: sockaddr_in(local),
            };
            if libc::ioctl(sock, SIOCSIFADDR, &mut ifr) < 0 {
                return Err(format!("SIOCSIFADDR: {}", io::Error::last_os_error()));
            }

            ifr.addr = sockaddr_in(peer);
            if libc::ioctl(sock, SIOCSIFDSTADDR, &mut ifr) < 0 {
                return Err(format!("SIOCSIFDSTADDR: {}", io::Error::last_os_error()));
            }

            let mut flags_req = IfReqFlags {
                name: ifr_name(name),
                flags: 0,
                _pad: [0; 14],
            };
            if libc::ioctl(sock, SIOCGIFFLAGS, &mut flags_req) < 0 {
                return Err(format!("SIOCGIFFLAGS: {}", io::Error::last_os_error()));
            }
            flags_req.flags |= libc::IFF_UP as libc::c_short;
            if libc::ioctl(sock, SIOCSIFFLAGS, &mut flags_req) < 0 {
                return Err(format!("SIOCSIFFLAGS: {}", io::Error::last_os_error()));
            }
        }
        Ok(())
    })();

    unsafe { libc::close(sock) };
    result.map_err(|reason| TunnelError::configure(name, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_root() -> bool {
        // Safety: geteuid has no failure mode
        unsafe { libc::geteuid() == 0 }
    }

    #[test]
    fn test_create_and_configure() {
        if !is_root() {
            eprintln!("skipping: requires root");
            return;
        }

        let device = match TunDevice::create(60) {
            Ok(d) => d,
            Err(e) => {
                // Containers often lack /dev/net/tun even as root
                eprintln!("skipping: {e}");
                return;
            }
        };
        assert!(device.name().starts_with("utun"));

        device
            .configure(Ipv4Addr::new(10, 66, 0, 1), Ipv4Addr::new(10, 66, 0, 2))
            .unwrap();
    }

    #[test]
    fn test_create_without_privilege_fails_cleanly() {
        if is_root() {
            return;
        }
        let result = TunDevice::create(60);
        assert!(result.is_err());
        if let Err(e) = result {
            assert!(!e.is_recoverable());
        }
    }
}
