//! Injected socket protection
//!
//! On platforms where a system-wide capture would otherwise swallow the
//! relay's own upstream sockets (a VPN service routing all traffic into
//! the tunnel this dataplane reads from), the embedding host supplies a
//! callback that exempts a socket from capture. The callback runs once,
//! immediately after each upstream socket is created; if it reports
//! failure the socket is closed and the flow is dropped.

use std::os::fd::RawFd;
use std::sync::Arc;

/// Callback that shields an upstream socket from system-wide capture
///
/// Returns `true` when the socket may be used. A `false` return drops the
/// flow the socket was created for.
pub type SocketProtector = Arc<dyn Fn(RawFd) -> bool + Send + Sync>;

/// Protector for platforms without system-wide capture: always allows
#[must_use]
pub fn allow_all() -> SocketProtector {
    Arc::new(|_fd| true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        let protector = allow_all();
        assert!(protector(3));
        assert!(protector(-1));
    }

    #[test]
    fn test_custom_protector_observes_fd() {
        use std::sync::atomic::{AtomicI32, Ordering};

        let seen = Arc::new(AtomicI32::new(0));
        let seen_clone = Arc::clone(&seen);
        let protector: SocketProtector = Arc::new(move |fd| {
            seen_clone.store(fd, Ordering::SeqCst);
            fd >= 0
        });

        assert!(protector(7));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(!protector(-2));
    }
}
