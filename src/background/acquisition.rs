//! Reader–writer fence between enqueue producers and the consumer's
//! Git-lock release.
//!
//! This is not a data guard. Producers hold the reader side only across the
//! enqueue call; the consumer takes the writer side only while it releases
//! the Git lock after observing an empty queue. If the writer acquire times
//! out, a producer is mid-enqueue and the consumer must re-check the queue
//! instead of releasing; that closes the "queue observed empty, lock
//! released, item appears" race.
//!
//! # Design Notes
//!
//! - Uses Mutex + Condvar (not atomics) because:
//!   - The fence sits on the enqueue path, which is already store-flush bound
//!   - Simple, correct, no subtle memory ordering bugs
//!   - Condvar provides efficient blocking (no spin-wait)
//! - Exit paths use `notify_all()`: waiters with different predicates
//!   (readers waiting on the writer, the writer waiting on readers) share
//!   one condvar, and `notify_one` could wake the wrong class and strand
//!   the other.
//! - Exit paths are poison-tolerant; a release must go through even when
//!   another thread panicked while blocked on the fence.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Internal state protected by mutex.
#[derive(Debug, Default)]
struct State {
    /// Producers currently inside the fence.
    readers: usize,
    /// True while the consumer holds the writer side.
    writer: bool,
}

/// RW fence with a timed writer acquire.
///
/// # Thread Safety
///
/// Safe to share across threads via `Arc<AcquisitionFence>`. Typically:
/// many producer threads on the reader side, exactly one consumer on the
/// writer side.
#[derive(Debug, Default)]
pub struct AcquisitionFence {
    /// Mutable state.
    state: Mutex<State>,
    /// Condition variable for blocking entry on either side.
    cv: Condvar,
}

impl AcquisitionFence {
    /// Lock state with poison recovery.
    ///
    /// Used on exit paths, which must not panic: a producer that already
    /// entered the fence has to be able to leave it, or the consumer's
    /// writer acquire would wait forever on a reader count that can no
    /// longer drop.
    #[inline]
    fn lock_or_recover(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }
}

impl AcquisitionFence {
    /// Creates an uncontended fence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the reader side, blocking while a writer holds the fence.
    pub fn enter_reader(&self) {
        let mut st = self.state.lock().expect("fence mutex poisoned");
        while st.writer {
            st = self.cv.wait(st).expect("fence condvar poisoned");
        }
        st.readers += 1;
    }

    /// Exits the reader side.
    ///
    /// # Panics
    /// Panics if no reader is inside the fence; that is caller misuse.
    pub fn exit_reader(&self) {
        let mut st = self.lock_or_recover();
        assert!(st.readers > 0, "exit_reader without enter_reader");
        st.readers -= 1;
        // Drop lock before notifying to reduce contention.
        drop(st);
        self.cv.notify_all();
    }

    /// Attempts to take the writer side within `timeout`.
    ///
    /// Returns false if readers were still inside when the deadline passed.
    #[must_use]
    pub fn try_enter_writer(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock().expect("fence mutex poisoned");

        while st.readers > 0 || st.writer {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (new_st, timeout_result) = self
                .cv
                .wait_timeout(st, remaining)
                .expect("fence condvar poisoned");
            st = new_st;
            if timeout_result.timed_out() && (st.readers > 0 || st.writer) {
                return false;
            }
        }

        st.writer = true;
        true
    }

    /// Releases the writer side.
    ///
    /// # Panics
    /// Panics if the writer side is not held; that is caller misuse.
    pub fn exit_writer(&self) {
        let mut st = self.lock_or_recover();
        assert!(st.writer, "exit_writer without try_enter_writer");
        st.writer = false;
        drop(st);
        self.cv.notify_all();
    }
}
