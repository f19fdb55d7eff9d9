//! Core engine of a virtualizing Git client.
//!
//! Enormous repositories stay usable when object data is fetched on demand
//! instead of cloned up front. This crate implements the two subsystems
//! that make that work:
//!
//! - **Background queue** (`background`): a durable, single-consumer work
//!   queue that serializes filesystem-change notifications from the
//!   virtualization driver back into Git state. Every enqueue is persisted
//!   before acknowledgement, and all Git mutations happen under the
//!   process-wide [`git_lock::GitLock`].
//! - **Fetch pipeline** (`fetch`): a staged producer/consumer pipeline that
//!   discovers missing objects, downloads them over HTTP as loose objects
//!   or packs with bounded retries, indexes received packs, and streams
//!   available SHAs to checkout.
//!
//! Scheduling is plain OS threads end to end; crossbeam channels are the
//! only synchronization between pipeline stages. Fatal failures route
//! through [`fatal::die`] (one telemetry event, then exit code 1) and the
//! durable queue makes the restart safe.
//!
//! The kernel callback layer, Git repository internals, configuration
//! loading, and the CLI all live outside this crate; their seams are the
//! traits on the module boundaries (`QueueCallbacks`, `ObjectTransport`,
//! `ObjectPresence`, `PackIndexer`, `CheckoutSink`).

pub mod background;
pub mod enlistment;
pub mod fatal;
pub mod fetch;
pub mod git_lock;
pub mod object_id;
pub mod retry;
pub mod telemetry;

pub use background::{
    BackgroundOperation, BackgroundProcessor, CallbackOutcome, OperationId, OperationKind,
    ProcessorConfig, QueueCallbacks,
};
pub use enlistment::Enlistment;
pub use fetch::{FetchConfig, FetchPipeline, PipelineConfig, PipelineReport};
pub use git_lock::{GitLock, GitTicket};
pub use object_id::{ObjectFormat, OidBytes};
pub use telemetry::{EventSink, TelemetryEvent, TracingSink};
