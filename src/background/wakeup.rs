//! Auto-reset wakeup signal for the queue consumer.
//!
//! The signal has edge semantics: any number of `pulse` calls between two
//! waits collapse into a single wakeup, and a wait consumes the pending
//! state. One pulse delivered before the first wait is not lost.
//!
//! Implemented as a boolean guarded by a mutex with a condvar; `wait`
//! re-checks the flag on every wakeup so spurious condvar returns are
//! harmless.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Auto-reset edge signal.
#[derive(Debug, Default)]
pub struct WakeupSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WakeupSignal {
    /// Creates a signal with no pending wakeup.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the signal pending and wakes one waiter.
    pub fn pulse(&self) {
        let mut pending = self.pending.lock().expect("wakeup signal poisoned");
        *pending = true;
        self.cond.notify_one();
    }

    /// Blocks until the signal is pending, then consumes it.
    pub fn wait(&self) {
        let mut pending = self.pending.lock().expect("wakeup signal poisoned");
        while !*pending {
            pending = self.cond.wait(pending).expect("wakeup signal poisoned");
        }
        *pending = false;
    }

    /// Like `wait`, but gives up after `timeout`.
    ///
    /// Returns true if the signal was consumed, false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock().expect("wakeup signal poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while !*pending {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _result) = self
                .cond
                .wait_timeout(pending, deadline - now)
                .expect("wakeup signal poisoned");
            pending = guard;
        }
        *pending = false;
        true
    }
}
