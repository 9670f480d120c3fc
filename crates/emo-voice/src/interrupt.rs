//! **InterruptToken**: the cancellation flag shared by the session, playback and barge-in threads.
//!
//! Raised by the barge-in monitor or an external stop request, polled by the playback unit.
//! Cleared only by the playback unit at the start of the next playback, never mid-flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cloneable handle to one shared interrupt flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    raised: Arc<AtomicBool>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the token. Idempotent; visible to every clone.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Reset before a new playback starts.
    pub(crate) fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }

    /// Poll until the token is raised or `timeout` elapses. Returns whether it was raised.
    pub fn wait_raised(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_raised() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(poll.min(deadline - now));
        }
    }
}
