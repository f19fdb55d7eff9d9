//! Bounded-retry invocation of fallible I/O operations.
//!
//! The wrapper drives an operation through up to `max_attempts` attempts with
//! exponential backoff between failures. The operation reports, per attempt,
//! whether its failure is worth retrying; I/O failures are always considered
//! transient. Anything the operation flags as fatal aborts immediately and is
//! surfaced to the caller without consuming the remaining attempts.
//!
//! # Error taxonomy
//! - `AttemptError::Io`: transient disk/network failure, retried.
//! - `AttemptError::Signalled { retryable: true, .. }`: retried.
//! - `AttemptError::Signalled { retryable: false, .. }`: stops after the
//!   failing attempt even if attempts remain.
//! - `AttemptError::Fatal`: bubbles out of `invoke` as `Err` immediately.

use std::error::Error;
use std::fmt;
use std::io;
use std::thread;
use std::time::Duration;

/// Failure reported by a single attempt of a retried operation.
#[derive(Debug)]
#[non_exhaustive]
pub enum AttemptError {
    /// I/O failure. Always treated as retryable.
    Io(io::Error),
    /// Failure with an explicit retry verdict from the operation.
    Signalled { retryable: bool, detail: String },
    /// Unexpected failure class. Never retried; surfaced to the caller.
    Fatal(Box<dyn Error + Send + Sync>),
}

impl AttemptError {
    /// Creates a retryable signalled failure.
    #[inline]
    pub fn retryable(detail: impl Into<String>) -> Self {
        Self::Signalled {
            retryable: true,
            detail: detail.into(),
        }
    }

    /// Creates a non-retryable signalled failure.
    #[inline]
    pub fn permanent(detail: impl Into<String>) -> Self {
        Self::Signalled {
            retryable: false,
            detail: detail.into(),
        }
    }

    /// Returns true if another attempt may be made after this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::Signalled { retryable, .. } => *retryable,
            Self::Fatal(_) => false,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Signalled { retryable, detail } => {
                write!(f, "{detail} (retryable: {retryable})")
            }
            Self::Fatal(err) => write!(f, "fatal error: {err}"),
        }
    }
}

impl Error for AttemptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Fatal(err) => Some(err.as_ref()),
            Self::Signalled { .. } => None,
        }
    }
}

impl From<io::Error> for AttemptError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Outcome of a bounded-retry invocation.
#[derive(Debug)]
pub enum Invocation<T> {
    /// The operation succeeded on attempt `attempts`.
    Succeeded { attempts: u32, value: T },
    /// Every permitted attempt failed; `last_error` is from the final one.
    Exhausted { attempts: u32, last_error: AttemptError },
}

impl<T> Invocation<T> {
    /// Returns true if the operation produced a value.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Returns the number of attempts consumed.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// Converts into the produced value, if any.
    #[must_use]
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Succeeded { value, .. } => Some(value),
            Self::Exhausted { .. } => None,
        }
    }
}

/// Observer of per-attempt failures.
///
/// Receives exactly one call per failed attempt, in attempt order, with the
/// verdict on whether another attempt will follow.
pub trait RetryObserver {
    /// Called after a failed attempt, before any backoff sleep.
    fn on_failure(&self, attempt: u32, error: &AttemptError, will_retry: bool);
}

/// Invokes `op` with bounded retries and exponential backoff.
///
/// `op` receives the 1-based attempt number. After a retryable failure on
/// attempt `i < max_attempts`, the caller thread sleeps `backoff_base^i`
/// seconds; `backoff_base == 0.0` disables sleeping (test hook).
///
/// # Errors
/// Returns `Err` only for `AttemptError::Fatal`, which aborts immediately.
/// Retryable and non-retryable failures are reported through
/// `Invocation::Exhausted`.
pub fn invoke<T, F>(
    mut op: F,
    max_attempts: u32,
    backoff_base: f64,
    observer: Option<&dyn RetryObserver>,
) -> Result<Invocation<T>, AttemptError>
where
    F: FnMut(u32) -> Result<T, AttemptError>,
{
    assert!(max_attempts > 0, "max_attempts must be > 0");

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt) {
            Ok(value) => {
                return Ok(Invocation::Succeeded {
                    attempts: attempt,
                    value,
                })
            }
            Err(err @ AttemptError::Fatal(_)) => return Err(err),
            Err(err) => {
                let will_retry = err.is_retryable() && attempt < max_attempts;
                if let Some(observer) = observer {
                    observer.on_failure(attempt, &err, will_retry);
                }
                if !will_retry {
                    return Ok(Invocation::Exhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }
                if backoff_base > 0.0 {
                    thread::sleep(Duration::from_secs_f64(backoff_base.powi(attempt as i32)));
                }
            }
        }
    }
}
