//! Start-time configuration
//!
//! The dataplane is configured once at start; nothing here is reloadable.
//! Configuration can be built in code (embedding hosts hand the values in
//! directly) or loaded from a JSON file and validated.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Upper bound on the decoy payload size
pub const MAX_FAKE_PAYLOAD_SIZE: usize = 4096;

/// Default hop limit for decoy packets
pub const DEFAULT_FAKE_TTL: u8 = 3;

/// Default number of decoy repeats per QUIC Initial
pub const DEFAULT_FAKE_REPEATS: u32 = 6;

/// Default synthetic source address for tunnel responses
pub const DEFAULT_TUN_ADDR: Ipv4Addr = Ipv4Addr::new(10, 120, 0, 1);

/// TLS first-segment split settings
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Byte position of the split; 0 disables splitting
    #[serde(default)]
    pub position: usize,

    /// Send the second fragment before the first
    #[serde(default)]
    pub disorder: bool,
}

/// QUIC decoy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeConfig {
    /// File holding the decoy payload; `None` disables decoys
    #[serde(default)]
    pub payload_path: Option<PathBuf>,

    /// Hop limit stamped on decoy packets (1-255)
    #[serde(default = "default_fake_ttl")]
    pub ttl: u8,

    /// Decoy copies sent per detected QUIC Initial (1-100)
    #[serde(default = "default_fake_repeats")]
    pub repeats: u32,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            payload_path: None,
            ttl: DEFAULT_FAKE_TTL,
            repeats: DEFAULT_FAKE_REPEATS,
        }
    }
}

fn default_fake_ttl() -> u8 {
    DEFAULT_FAKE_TTL
}

fn default_fake_repeats() -> u32 {
    DEFAULT_FAKE_REPEATS
}

fn default_tun_addr() -> Ipv4Addr {
    DEFAULT_TUN_ADDR
}

/// Dataplane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataplaneConfig {
    /// Synthetic source address for responses written into the tunnel
    #[serde(default = "default_tun_addr")]
    pub tun_addr: Ipv4Addr,

    /// TCP first-segment split
    #[serde(default)]
    pub split: SplitConfig,

    /// UDP decoy injection
    #[serde(default)]
    pub fake: FakeConfig,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            tun_addr: DEFAULT_TUN_ADDR,
            split: SplitConfig::default(),
            fake: FakeConfig::default(),
        }
    }
}

impl DataplaneConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if any value is out of
    /// range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fake.ttl == 0 {
            return Err(ConfigError::validation("fake ttl must be 1-255"));
        }
        if self.fake.repeats == 0 || self.fake.repeats > 100 {
            return Err(ConfigError::validation(format!(
                "fake repeats {} out of range (1-100)",
                self.fake.repeats
            )));
        }
        Ok(())
    }
}

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<DataplaneConfig, ConfigError> {
    let path = path.as_ref();

    debug!("loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config: DataplaneConfig = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("{e} at {path:?}")))?;
    config.validate()?;

    info!(
        "configuration loaded: split_pos={} disorder={} fake_ttl={} fake_repeats={}",
        config.split.position, config.split.disorder, config.fake.ttl, config.fake.repeats
    );

    Ok(config)
}

/// Load the decoy payload from a file
///
/// # Errors
///
/// Returns `ConfigError::FakePayload` for empty or oversized files and
/// `ConfigError::FakePayload` naming the path on read failure.
pub fn load_fake_payload(path: impl AsRef<Path>) -> Result<Vec<u8>, ConfigError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| ConfigError::FakePayload {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    if bytes.is_empty() || bytes.len() > MAX_FAKE_PAYLOAD_SIZE {
        return Err(ConfigError::FakePayload {
            path: path.display().to_string(),
            reason: format!(
                "size {} out of range (1-{MAX_FAKE_PAYLOAD_SIZE})",
                bytes.len()
            ),
        });
    }

    debug!("loaded fake payload: {} bytes from {:?}", bytes.len(), path);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DataplaneConfig::default();
        assert_eq!(config.tun_addr, Ipv4Addr::new(10, 120, 0, 1));
        assert_eq!(config.split.position, 0);
        assert!(!config.split.disorder);
        assert_eq!(config.fake.ttl, 3);
        assert_eq!(config.fake.repeats, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = DataplaneConfig::default();
        config.fake.ttl = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_repeat_range() {
        let mut config = DataplaneConfig::default();
        config.fake.repeats = 0;
        assert!(config.validate().is_err());
        config.fake.repeats = 101;
        assert!(config.validate().is_err());
        config.fake.repeats = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_json() {
        let config: DataplaneConfig =
            serde_json::from_str(r#"{"split": {"position": 3, "disorder": true}}"#).unwrap();
        assert_eq!(config.split.position, 3);
        assert!(config.split.disorder);
        assert_eq!(config.fake.ttl, DEFAULT_FAKE_TTL);
        assert_eq!(config.tun_addr, DEFAULT_TUN_ADDR);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config("/nonexistent/dpi-bypass.json").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_fake_payload_size_limits() {
        let dir = std::env::temp_dir();

        let empty = dir.join("dpi-bypass-test-empty.bin");
        std::fs::write(&empty, []).unwrap();
        assert!(load_fake_payload(&empty).is_err());
        std::fs::remove_file(&empty).ok();

        let oversized = dir.join("dpi-bypass-test-big.bin");
        std::fs::write(&oversized, vec![0u8; MAX_FAKE_PAYLOAD_SIZE + 1]).unwrap();
        assert!(load_fake_payload(&oversized).is_err());
        std::fs::remove_file(&oversized).ok();

        let good = dir.join("dpi-bypass-test-ok.bin");
        std::fs::write(&good, vec![0xc0; 1200]).unwrap();
        let payload = load_fake_payload(&good).unwrap();
        assert_eq!(payload.len(), 1200);
        std::fs::remove_file(&good).ok();
    }
}
