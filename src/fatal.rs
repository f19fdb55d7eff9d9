//! Single process-exit route for unrecoverable failures.
//!
//! Every fatal path in the crate terminates through `die`, which emits one
//! error telemetry event and then calls into a `ProcessExit` implementation.
//! Production code installs `RealExit`; tests install a recorder so fatal
//! paths can be asserted without killing the test runner. A stubbed exit
//! returns, so callers must treat `die` as non-terminating and unwind their
//! own control flow after it.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::telemetry::{EventSink, TelemetryEvent};

/// Terminates (or pretends to terminate) the process.
pub trait ProcessExit: Send + Sync {
    /// Exits with the given code. Implementations for production never
    /// return; test stubs record the code and return.
    fn exit(&self, code: i32);
}

/// Production exit: `std::process::exit`.
#[derive(Debug, Default)]
pub struct RealExit;

impl ProcessExit for RealExit {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Test stub that records exit requests instead of terminating.
///
/// The fatal reason is carried by the `FatalTermination` telemetry event;
/// pair this stub with a `VecSink` to assert on it.
#[derive(Debug, Default)]
pub struct RecordingExit {
    code: AtomicI32,
}

impl RecordingExit {
    /// Creates a stub with no recorded exit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last recorded exit code, or 0 if none.
    #[must_use]
    pub fn code(&self) -> i32 {
        self.code.load(Ordering::Acquire)
    }
}

impl ProcessExit for RecordingExit {
    fn exit(&self, code: i32) {
        self.code.store(code, Ordering::Release);
    }
}

/// Emits a fatal telemetry event and terminates with exit code 1.
///
/// With a stubbed `ProcessExit` this returns; the caller is responsible for
/// stopping its own work afterwards.
pub fn die(events: &dyn EventSink, exit: &dyn ProcessExit, reason: &str) {
    tracing::error!(reason, "terminating after fatal error");
    events.emit(&TelemetryEvent::FatalTermination {
        reason: reason.to_string(),
    });
    exit.exit(1);
}
