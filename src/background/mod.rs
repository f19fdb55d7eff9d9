//! Durable background queue modules.
//!
//! Filesystem notifications from the virtualization driver must eventually
//! land in the Git index, and must survive a crash between the notification
//! and that reconciliation. The queue persists every operation before
//! acknowledging it, replays persisted operations on mount, and drives a
//! single consumer that holds the Git lock for the whole drain window.
//!
//! Queue overview:
//! 1. `operation` defines the payload and its durable record encoding.
//! 2. `store` is the persistence contract; `rocks_store` the production
//!    implementation.
//! 3. `wakeup` and `acquisition` are the two synchronization primitives:
//!    an auto-reset consumer signal and the producer/release fence.
//! 4. `processor` owns the consumer and the drain/release algorithm.
//!
//! # Invariants
//! - A persisted id is pending or in flight; it is deleted only after its
//!   callback succeeds.
//! - The Git lock is held from the pre-callback through the post-callback.
//! - At most one consumer thread per processor.

pub mod acquisition;
pub mod operation;
pub mod processor;
pub mod rocks_store;
pub mod store;
pub mod wakeup;

pub use operation::{BackgroundOperation, OperationId, OperationKind};
pub use processor::{
    BackgroundProcessor, CallbackOutcome, ProcessorConfig, QueueCallbacks, StartError,
};
pub use rocks_store::RocksOperationStore;
pub use store::{InMemoryOperationStore, OperationStore, StoreError};
