//! Single-instance pid file
//!
//! Two raw-socket dataplanes forwarding the same tunnel would double every
//! packet, so startup takes a trivial interlock: a pid file whose staleness
//! is decided by probing the recorded process with `kill(pid, 0)`, not by
//! mere file existence. A crash that leaves the file behind therefore does
//! not wedge the next start.

use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

/// Default pid file location for the raw-socket dataplane
pub const DEFAULT_PID_FILE: &str = "/tmp/udp-bypass.pid";

/// Claim the pid file, refusing if the recorded process is still alive
///
/// Returns `Ok(Some(pid))` with the live holder's pid when another
/// instance is running, `Ok(None)` when the file was claimed.
///
/// # Errors
///
/// Propagates the write error when the file cannot be created.
pub fn acquire(path: impl AsRef<Path>) -> io::Result<Option<i32>> {
    let path = path.as_ref();

    if let Ok(contents) = fs::read_to_string(path) {
        if let Ok(pid) = contents.trim().parse::<i32>() {
            // Safety: signal 0 only probes for existence
            if pid > 0 && unsafe { libc::kill(pid, 0) } == 0 {
                return Ok(Some(pid));
            }
            debug!("stale pid file (pid {pid} gone), claiming");
        }
    }

    fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(None)
}

/// Remove the pid file; missing is fine
pub fn release(path: impl AsRef<Path>) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("dpi-bypass-pidfile-{tag}-{}", std::process::id()))
    }

    #[test]
    fn test_acquire_fresh() {
        let path = temp_path("fresh");
        release(&path);

        assert_eq!(acquire(&path).unwrap(), None);
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
        assert!(contents.ends_with('\n'));

        release(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_acquire_refuses_live_holder() {
        let path = temp_path("live");
        // Our own pid is certainly alive
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let holder = acquire(&path).unwrap();
        assert_eq!(holder, Some(std::process::id() as i32));

        release(&path);
    }

    #[test]
    fn test_acquire_reclaims_stale() {
        let path = temp_path("stale");
        // Max pid is bounded well below this on practical systems
        fs::write(&path, "999999999\n").unwrap();

        assert_eq!(acquire(&path).unwrap(), None);

        release(&path);
    }

    #[test]
    fn test_acquire_reclaims_garbage() {
        let path = temp_path("garbage");
        fs::write(&path, "not a pid\n").unwrap();

        assert_eq!(acquire(&path).unwrap(), None);

        release(&path);
    }
}
