//! Parallel object fetch modules.
//!
//! The pipeline turns a stream of candidate SHAs into locally available
//! objects: filter out what is already on disk, download the rest in
//! batches, index any packs the server chose to send, and hand every
//! available SHA to the checkout stage.
//!
//! Pipeline overview:
//! 1. `chunker` batches SHAs off a blocking channel.
//! 2. `transport` speaks the object endpoints and classifies failures;
//!    `batched` decodes the framed multi-object response body.
//! 3. `loose` writes loose objects atomically; `indexer` turns temp packs
//!    into canonical packs.
//! 4. `fetcher` is the download stage; `pipeline` wires all stages and
//!    owns completion propagation.
//!
//! # Invariants
//! - Loose writes are atomic; a partial download never poisons the store.
//! - No global ordering: downstream SHAs arrive in any order.
//! - Stage failures mark the run and never abort sibling stages.

pub mod batched;
pub mod chunker;
pub mod errors;
pub mod fetcher;
pub mod indexer;
pub mod loose;
pub mod pipeline;
pub mod transport;

pub use errors::{FrameError, PackIndexError, TransportError};
pub use fetcher::{BlobDownloadRequest, BlobFetcher, FetchConfig, FetchReport};
pub use indexer::{GitPackIndexer, IndexPackRequest, PackIndexer};
pub use loose::LooseObjectStore;
pub use pipeline::{
    CheckoutSink, FetchPipeline, ObjectPresence, PipelineConfig, PipelineReport,
};
pub use transport::{
    HttpObjectTransport, ObjectContentType, ObjectResponse, ObjectTransport, RefEntry,
    RetryingObjectClient,
};
