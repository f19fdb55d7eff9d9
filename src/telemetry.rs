//! Telemetry events and sinks.
//!
//! Components report progress through typed events handed to an `EventSink`.
//! Emission must be cheap enough to call from worker threads; sinks take no
//! locks beyond what their backing writer needs, and event construction does
//! not allocate beyond the payload fields.
//!
//! The default `TracingSink` renders events as structured `tracing` records
//! with the JSON payload attached, so any subscriber installed by the host
//! process picks them up. `VecSink` records events for test assertions.

use std::sync::Mutex;

use serde::Serialize;

/// Telemetry event emitted by the background queue or the fetch pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum TelemetryEvent {
    /// Periodic progress from the background queue consumer.
    TaskProcessingStatus { processed: u64, remaining: usize },
    /// Periodic liveness report from the object downloader.
    DownloadHeartbeat { active_downloads: usize },
    /// Final accounting for a download job.
    DownloadStopped {
        request_count: u64,
        bytes_downloaded: u64,
        has_failures: bool,
    },
    /// The process is about to terminate with exit code 1.
    FatalTermination { reason: String },
}

/// Sink for telemetry events.
///
/// Implementations must be `Send + Sync`; events arrive from consumer and
/// worker threads concurrently.
pub trait EventSink: Send + Sync {
    /// Delivers one event. Must not panic on delivery failure.
    fn emit(&self, event: &TelemetryEvent);
}

/// Sink that forwards events to `tracing`.
///
/// Fatal terminations log at error level, everything else at info.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &TelemetryEvent) {
        let payload = serde_json::to_string(event).unwrap_or_else(|_| String::from("{}"));
        match event {
            TelemetryEvent::FatalTermination { reason } => {
                tracing::error!(target: "gitvfs::telemetry", %payload, %reason, "fatal termination");
            }
            TelemetryEvent::TaskProcessingStatus {
                processed,
                remaining,
            } => {
                tracing::info!(
                    target: "gitvfs::telemetry",
                    processed,
                    remaining,
                    "task processing status"
                );
            }
            TelemetryEvent::DownloadHeartbeat { active_downloads } => {
                tracing::info!(
                    target: "gitvfs::telemetry",
                    active_downloads,
                    "download heartbeat"
                );
            }
            TelemetryEvent::DownloadStopped {
                request_count,
                bytes_downloaded,
                has_failures,
            } => {
                tracing::info!(
                    target: "gitvfs::telemetry",
                    request_count,
                    bytes_downloaded,
                    has_failures,
                    "download stopped"
                );
            }
        }
    }
}

/// Sink that records events in memory for test inspection.
#[derive(Debug, Default)]
pub struct VecSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl VecSink {
    /// Creates an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the events emitted so far.
    #[must_use]
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().expect("event sink poisoned").clone()
    }
}

impl EventSink for VecSink {
    fn emit(&self, event: &TelemetryEvent) {
        self.events
            .lock()
            .expect("event sink poisoned")
            .push(event.clone());
    }
}
