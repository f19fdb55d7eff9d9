//! Process-wide mutual exclusion for Git mutations.
//!
//! Any actor that mutates the index or working tree must hold the Git lock
//! for the duration of the mutation. Acquisition is non-blocking; callers
//! that need the lock poll `try_acquire` at their own cadence.
//!
//! Release consumes a `GitTicket`, so a double release does not compile.
//! The lock is not reentrant: a holder calling `try_acquire` again gets
//! `None` like everyone else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Process-wide token gating Git mutations.
///
/// Shared between holders via `Arc`. The holder identity is recorded for
/// diagnostics only; it plays no role in lock semantics.
#[derive(Debug, Default)]
pub struct GitLock {
    held: AtomicBool,
    holder: Mutex<Option<String>>,
}

/// Proof of Git lock ownership.
///
/// Not `Clone`; surrender it through `GitLock::release`. Dropping a ticket
/// without releasing leaks the lock, which is deliberate: an unwinding
/// holder must not silently hand Git mutations to another actor.
#[derive(Debug)]
pub struct GitTicket {
    _private: (),
}

impl GitLock {
    /// Creates a free lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// On success the holder diagnostic string is recorded and a ticket is
    /// returned. Returns `None` when the lock is already held.
    #[must_use]
    pub fn try_acquire(&self, holder: &str) -> Option<GitTicket> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.holder.lock().expect("git lock holder poisoned") = Some(holder.to_string());
            Some(GitTicket { _private: () })
        } else {
            None
        }
    }

    /// Releases the lock, consuming the ticket.
    pub fn release(&self, ticket: GitTicket) {
        let _ = ticket;
        *self.holder.lock().expect("git lock holder poisoned") = None;
        self.held.store(false, Ordering::Release);
    }

    /// Returns the recorded holder identity, if the lock is held.
    #[must_use]
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().expect("git lock holder poisoned").clone()
    }

    /// Returns true if the lock is currently held.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}
