//! Checkout fetch pipeline wiring.
//!
//! Stages, leaves first: a finder filters candidate SHAs against the local
//! store, the downloader acquires the missing ones, the indexer turns temp
//! packs into canonical packs, and the checkout stage consumes every SHA
//! that became available. Channels are the only synchronization between
//! stages; the sole shared state is the failure flag and counters.
//!
//! # Completion propagation
//! Ordering is load-bearing and matches the consumer/producer graph:
//! 1. Downloader, finder, and checkout workers start together.
//! 2. Finder completion closes the missing-objects channel.
//! 3. The indexer starts only now: indexing a pack competes with the
//!    finder for disk reads, so it waits out the discovery phase. Packs
//!    queue on an unbounded channel in the meantime.
//! 4. Downloader completion closes the packs channel.
//! 5. Indexer completion ends the last available-SHAs producer.
//! 6. Only then does the orchestrator drop its sender, closing checkout's
//!    input: earlier loses indexer output, later deadlocks the checkout.
//! 7. Checkout completion ends the run.
//!
//! A failed stage marks the run and keeps going; the report aggregates.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::object_id::OidBytes;
use crate::telemetry::EventSink;

use super::fetcher::{BlobFetcher, FetchConfig, FetchReport};
use super::indexer::{IndexPackRequest, PackIndexer};
use super::loose::LooseObjectStore;
use super::transport::ObjectTransport;

/// Answers "is this object already local?" for the finder stage.
pub trait ObjectPresence: Send + Sync {
    /// Returns true if `oid` needs no download.
    fn contains(&self, oid: &OidBytes) -> bool;
}

impl ObjectPresence for LooseObjectStore {
    fn contains(&self, oid: &OidBytes) -> bool {
        LooseObjectStore::contains(self, oid)
    }
}

/// Receives every SHA that became locally available.
///
/// The working-tree side of checkout lives outside this crate; this seam
/// is where those SHAs are handed over.
pub trait CheckoutSink: Send + Sync {
    /// Called once per available SHA, from checkout worker threads.
    ///
    /// # Errors
    /// An error marks the run as failed but does not stop the drain.
    fn on_object_available(&self, oid: &OidBytes) -> io::Result<()>;
}

/// Worker counts and channel capacity for one pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Finder worker threads.
    pub find_workers: usize,
    /// Checkout worker threads.
    pub checkout_workers: usize,
    /// Pack indexer worker threads.
    pub index_workers: usize,
    /// Capacity of the missing- and available-SHAs channels.
    pub channel_capacity: usize,
    /// Downloader configuration.
    pub fetch: FetchConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            find_workers: 2,
            checkout_workers: 4,
            index_workers: 1,
            channel_capacity: 4_096,
            fetch: FetchConfig::default(),
        }
    }
}

/// Aggregate result of a pipeline run.
#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineReport {
    /// True when any stage recorded a failure.
    pub has_failures: bool,
    /// Body bytes written by the downloader.
    pub bytes_downloaded: u64,
    /// Download requests issued.
    pub request_count: u64,
    /// SHAs that were not local and entered the download stage.
    pub missing_objects: u64,
    /// SHAs delivered to the checkout sink.
    pub objects_checked_out: u64,
}

/// Wires and runs the checkout fetch stages.
pub struct FetchPipeline {
    presence: Arc<dyn ObjectPresence>,
    transport: Arc<dyn ObjectTransport>,
    indexer: Arc<dyn PackIndexer>,
    checkout: Arc<dyn CheckoutSink>,
    store: Arc<LooseObjectStore>,
    pack_dir: PathBuf,
    temp_pack_dir: PathBuf,
    events: Arc<dyn EventSink>,
    config: PipelineConfig,
}

impl FetchPipeline {
    /// Creates a pipeline over the given seams.
    ///
    /// `pack_dir` is where indexed packs land; `temp_pack_dir` holds packs
    /// between download and indexing.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        presence: Arc<dyn ObjectPresence>,
        transport: Arc<dyn ObjectTransport>,
        indexer: Arc<dyn PackIndexer>,
        checkout: Arc<dyn CheckoutSink>,
        store: Arc<LooseObjectStore>,
        pack_dir: PathBuf,
        temp_pack_dir: PathBuf,
        events: Arc<dyn EventSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            presence,
            transport,
            indexer,
            checkout,
            store,
            pack_dir,
            temp_pack_dir,
            events,
            config,
        }
    }

    /// Runs the pipeline until `input` is exhausted and every stage drains.
    ///
    /// Blocks the calling thread for the duration of the run.
    pub fn run(&self, input: Receiver<OidBytes>) -> PipelineReport {
        let has_failures = Arc::new(AtomicBool::new(false));
        let missing_count = Arc::new(AtomicU64::new(0));
        let checked_out = Arc::new(AtomicU64::new(0));

        let (missing_tx, missing_rx) = bounded::<OidBytes>(self.config.channel_capacity);
        let (available_tx, available_rx) = bounded::<OidBytes>(self.config.channel_capacity);
        // Unbounded: packs produced before the indexer starts must not
        // block the downloader.
        let (packs_tx, packs_rx) = unbounded::<IndexPackRequest>();

        // Stage 1: downloader, finder, and checkout start together.
        let downloader = {
            let fetcher = BlobFetcher::new(
                Arc::clone(&self.transport),
                Arc::clone(&self.store),
                self.temp_pack_dir.clone(),
                Arc::clone(&self.events),
                self.config.fetch.clone(),
            );
            let missing_rx = missing_rx.clone();
            let available_tx = available_tx.clone();
            thread::Builder::new()
                .name(String::from("fetch-downloader"))
                .spawn(move || fetcher.run(missing_rx, available_tx, packs_tx))
                .expect("spawn downloader")
        };
        drop(missing_rx);

        let finders = self.spawn_finders(&input, &missing_tx, &missing_count);
        drop(input);
        let checkouts = self.spawn_checkouts(&available_rx, &has_failures, &checked_out);
        drop(available_rx);

        // Stage 2: finder completion closes the downloader's input.
        join_all(finders, &has_failures, "finder");
        drop(missing_tx);

        // Stage 3: indexer starts only after discovery quiesces.
        let indexers = self.spawn_indexers(&packs_rx, &available_tx, &has_failures);
        drop(packs_rx);

        // Stage 4: downloader completion closes the packs channel.
        let fetch_report: FetchReport = match downloader.join() {
            Ok(report) => report,
            Err(_) => {
                tracing::error!("downloader thread panicked");
                has_failures.store(true, Ordering::Release);
                FetchReport::default()
            }
        };
        if fetch_report.has_failures {
            has_failures.store(true, Ordering::Release);
        }

        // Stage 5: indexer completion ends the last available-SHAs producer.
        join_all(indexers, &has_failures, "indexer");

        // Stage 6: only now close checkout's input.
        drop(available_tx);

        // Stage 7: checkout drains to the end.
        join_all(checkouts, &has_failures, "checkout");

        PipelineReport {
            has_failures: has_failures.load(Ordering::Acquire),
            bytes_downloaded: fetch_report.bytes_downloaded,
            request_count: fetch_report.request_count,
            missing_objects: missing_count.load(Ordering::Acquire),
            objects_checked_out: checked_out.load(Ordering::Acquire),
        }
    }

    fn spawn_finders(
        &self,
        input: &Receiver<OidBytes>,
        missing_tx: &Sender<OidBytes>,
        missing_count: &Arc<AtomicU64>,
    ) -> Vec<JoinHandle<()>> {
        // Shared across workers so a SHA requested twice downloads once.
        let seen: Arc<Mutex<HashSet<OidBytes>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = Vec::with_capacity(self.config.find_workers.max(1));
        for idx in 0..self.config.find_workers.max(1) {
            let input = input.clone();
            let missing_tx = missing_tx.clone();
            let presence = Arc::clone(&self.presence);
            let seen = Arc::clone(&seen);
            let missing_count = Arc::clone(missing_count);
            let handle = thread::Builder::new()
                .name(format!("fetch-finder-{idx}"))
                .spawn(move || {
                    for oid in input.iter() {
                        let fresh = seen.lock().expect("seen set poisoned").insert(oid);
                        if !fresh || presence.contains(&oid) {
                            continue;
                        }
                        missing_count.fetch_add(1, Ordering::AcqRel);
                        if missing_tx.send(oid).is_err() {
                            return;
                        }
                    }
                })
                .expect("spawn finder");
            handles.push(handle);
        }
        handles
    }

    fn spawn_checkouts(
        &self,
        available_rx: &Receiver<OidBytes>,
        has_failures: &Arc<AtomicBool>,
        checked_out: &Arc<AtomicU64>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.checkout_workers.max(1));
        for idx in 0..self.config.checkout_workers.max(1) {
            let available_rx = available_rx.clone();
            let checkout = Arc::clone(&self.checkout);
            let has_failures = Arc::clone(has_failures);
            let checked_out = Arc::clone(checked_out);
            let handle = thread::Builder::new()
                .name(format!("fetch-checkout-{idx}"))
                .spawn(move || {
                    for oid in available_rx.iter() {
                        match checkout.on_object_available(&oid) {
                            Ok(()) => {
                                checked_out.fetch_add(1, Ordering::AcqRel);
                            }
                            Err(err) => {
                                tracing::warn!(%oid, error = %err, "checkout failed");
                                has_failures.store(true, Ordering::Release);
                            }
                        }
                    }
                })
                .expect("spawn checkout");
            handles.push(handle);
        }
        handles
    }

    fn spawn_indexers(
        &self,
        packs_rx: &Receiver<IndexPackRequest>,
        available_tx: &Sender<OidBytes>,
        has_failures: &Arc<AtomicBool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.index_workers.max(1));
        for idx in 0..self.config.index_workers.max(1) {
            let packs_rx = packs_rx.clone();
            let available_tx = available_tx.clone();
            let indexer = Arc::clone(&self.indexer);
            let pack_dir = self.pack_dir.clone();
            let has_failures = Arc::clone(has_failures);
            let handle = thread::Builder::new()
                .name(format!("fetch-indexer-{idx}"))
                .spawn(move || {
                    for request in packs_rx.iter() {
                        match indexer.index_pack(&request.temp_pack_path, &pack_dir) {
                            Ok(()) => {
                                for oid in &request.request.oids {
                                    if available_tx.send(*oid).is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(err) => {
                                tracing::warn!(
                                    pack_id = request.request.pack_id,
                                    error = %err,
                                    "pack indexing failed"
                                );
                                has_failures.store(true, Ordering::Release);
                            }
                        }
                    }
                })
                .expect("spawn indexer");
            handles.push(handle);
        }
        handles
    }
}

fn join_all(handles: Vec<JoinHandle<()>>, has_failures: &Arc<AtomicBool>, stage: &str) {
    for handle in handles {
        if handle.join().is_err() {
            tracing::error!(stage, "stage worker panicked");
            has_failures.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::errors::{PackIndexError, TransportError};
    use crate::fetch::transport::{ObjectResponse, RefEntry};
    use std::sync::Mutex;

    struct SetPresence(HashSet<OidBytes>);
    impl ObjectPresence for SetPresence {
        fn contains(&self, oid: &OidBytes) -> bool {
            self.0.contains(oid)
        }
    }

    #[derive(Default)]
    struct RecordingCheckout {
        seen: Mutex<Vec<OidBytes>>,
    }
    impl CheckoutSink for RecordingCheckout {
        fn on_object_available(&self, oid: &OidBytes) -> io::Result<()> {
            self.seen.lock().unwrap().push(*oid);
            Ok(())
        }
    }

    // End-to-end pipeline coverage with a scripted transport lives in
    // tests/fetch_pipeline.rs; these tests pin the finder semantics.

    #[test]
    fn finder_filters_present_and_duplicate_shas() {
        let present = OidBytes::sha1([0xee; 20]);
        let missing = OidBytes::sha1([0x99; 20]);

        let pipeline = test_pipeline(Arc::new(SetPresence(HashSet::from([present]))));
        let (in_tx, in_rx) = unbounded();
        for oid in [present, missing, missing, present] {
            in_tx.send(oid).unwrap();
        }
        drop(in_tx);

        let (missing_tx, missing_rx) = bounded(16);
        let count = Arc::new(AtomicU64::new(0));
        let finders = pipeline.spawn_finders(&in_rx, &missing_tx, &count);
        drop(missing_tx);
        for handle in finders {
            handle.join().unwrap();
        }

        assert_eq!(missing_rx.iter().collect::<Vec<_>>(), vec![missing]);
        assert_eq!(count.load(Ordering::Acquire), 1);
    }

    fn test_pipeline(presence: Arc<dyn ObjectPresence>) -> FetchPipeline {
        struct NoTransport;
        impl ObjectTransport for NoTransport {
            fn get_loose(&self, _oid: &OidBytes) -> Result<ObjectResponse, TransportError> {
                Err(TransportError::Status { code: 500 })
            }
            fn post_objects(
                &self,
                _oids: &[OidBytes],
                _commit_depth: u32,
                _prefer_batched: bool,
            ) -> Result<ObjectResponse, TransportError> {
                Err(TransportError::Status { code: 500 })
            }
            fn get_refs(&self) -> Result<Vec<RefEntry>, TransportError> {
                Ok(Vec::new())
            }
        }
        struct NoIndexer;
        impl PackIndexer for NoIndexer {
            fn index_pack(
                &self,
                _temp_pack: &std::path::Path,
                _pack_dir: &std::path::Path,
            ) -> Result<(), PackIndexError> {
                Ok(())
            }
        }

        let dir = std::env::temp_dir();
        FetchPipeline::new(
            presence,
            Arc::new(NoTransport),
            Arc::new(NoIndexer),
            Arc::new(RecordingCheckout::default()),
            Arc::new(LooseObjectStore::new(dir.join("objects"))),
            dir.join("pack"),
            dir.join("tmp"),
            Arc::new(crate::telemetry::VecSink::new()),
            PipelineConfig {
                find_workers: 2,
                ..PipelineConfig::default()
            },
        )
    }
}
