//! Error types for dpi-bypass
//!
//! This module defines the error hierarchy for the dataplane. Errors are
//! categorized by subsystem and carry a recoverability classification:
//! per-packet errors are recovered locally (the packet is dropped and a
//! counter bumped), per-session errors collapse the session, and only
//! initialization errors abort the dataplane.

use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;

/// Top-level error type for dpi-bypass
#[derive(Debug, Error)]
pub enum BypassError {
    /// Packet parse/build errors
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Relay session errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Tunnel interface errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BypassError {
    /// Check if this error is recoverable (the dataplane can keep running)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Packet(_) => true,
            Self::Relay(e) => e.is_recoverable(),
            Self::Tunnel(e) => e.is_recoverable(),
            Self::Config(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Packet parse and build errors
///
/// All of these are per-packet: the offending packet is dropped and
/// processing continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the minimum header
    #[error("packet too short: {got} bytes ({min} required)")]
    TooShort { got: usize, min: usize },

    /// Header fields are inconsistent with the buffer
    #[error("malformed header: {0}")]
    Malformed(&'static str),

    /// Output buffer cannot hold the constructed packet
    #[error("output buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Payload would overflow the 16-bit IPv4 total-length field
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Relay session errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Session table at capacity; the new flow is dropped
    #[error("session table full ({max} sessions)")]
    TableFull { max: usize },

    /// Upstream socket creation or connect failed
    #[error("failed to open upstream socket to {dst}: {source}")]
    SocketRefused {
        dst: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    /// The injected socket protector rejected the socket
    #[error("socket protector rejected upstream socket to {dst}")]
    ProtectorRejected { dst: SocketAddrV4 },

    /// I/O error on an established session
    #[error("relay I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl RelayError {
    /// Check if this error is recoverable
    ///
    /// Table-full and refused-socket errors drop a single flow; the relay
    /// itself keeps running.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TableFull { .. } | Self::SocketRefused { .. } | Self::ProtectorRejected { .. } => {
                true
            }
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a socket-refused error
    pub fn refused(dst: SocketAddrV4, source: io::Error) -> Self {
        Self::SocketRefused { dst, source }
    }
}

/// Tunnel interface and multiplexer errors
///
/// These are fatal to the dataplane instance: without a working tunnel
/// handle or multiplexer there is nothing to relay.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Failed to create the tunnel interface
    #[error("failed to create tunnel interface: {0}")]
    Create(String),

    /// Failed to configure interface addresses or bring it up
    #[error("failed to configure interface {name}: {reason}")]
    Configure { name: String, reason: String },

    /// Failed to create the raw send socket
    #[error("failed to create raw socket: {0}")]
    RawSocket(io::Error),

    /// Multiplexer setup failed
    #[error("multiplexer error: {0}")]
    Multiplexer(io::Error),

    /// I/O error on the tunnel handle
    #[error("tunnel I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TunnelError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Create(_) | Self::Configure { .. } | Self::RawSocket(_) | Self::Multiplexer(_) => {
                false
            }
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
        }
    }

    /// Create a configure error
    pub fn configure(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configure {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (out-of-range values)
    #[error("configuration validation failed: {0}")]
    ValidationError(String),

    /// Fake payload file invalid
    #[error("invalid fake payload {path}: {reason}")]
    FakePayload { path: String, reason: String },

    /// I/O error while reading configuration
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Type alias for Result with `BypassError`
pub type Result<T> = std::result::Result<T, BypassError>;
