//! End-to-end behavior of the fetch pipeline: partial batched retries,
//! failure propagation, pack indexing hand-off, and channel completion.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::unbounded;

use gitvfs::fetch::batched::encode_batched_objects;
use gitvfs::fetch::{
    BlobFetcher, CheckoutSink, FetchConfig, FetchPipeline, ObjectContentType, ObjectPresence,
    ObjectResponse, ObjectTransport, PackIndexError, PackIndexer, PipelineConfig, RefEntry,
    TransportError,
};
use gitvfs::fetch::LooseObjectStore;
use gitvfs::object_id::OidBytes;
use gitvfs::telemetry::{EventSink, VecSink};

fn test_fetch_config(batch_size: usize, max_attempts: u32) -> FetchConfig {
    FetchConfig {
        workers: 2,
        batch_size,
        commit_depth: 1,
        max_attempts,
        backoff_base: 0.0,
        prefer_batched_loose_objects: true,
        heartbeat_period: Duration::from_secs(60),
    }
}

/// Transport that computes responses instead of scripting them: loose
/// requests fail for a configured id set, bulk requests answer with the
/// configured mode.
struct RuleTransport {
    loose_fail: HashSet<OidBytes>,
    bulk_mode: BulkMode,
    bulk_requests: Mutex<Vec<Vec<OidBytes>>>,
}

enum BulkMode {
    /// Answer with a batched body containing every requested object.
    BatchedAll,
    /// Answer with a pack body; contents are opaque to the client.
    Pack,
}

impl RuleTransport {
    fn new(bulk_mode: BulkMode) -> Self {
        Self {
            loose_fail: HashSet::new(),
            bulk_mode,
            bulk_requests: Mutex::new(Vec::new()),
        }
    }
}

fn loose_body(oid: &OidBytes) -> Vec<u8> {
    format!("body-of-{oid}").into_bytes()
}

impl ObjectTransport for RuleTransport {
    fn get_loose(&self, oid: &OidBytes) -> Result<ObjectResponse, TransportError> {
        if self.loose_fail.contains(oid) {
            return Err(TransportError::Status { code: 503 });
        }
        Ok(ObjectResponse {
            content_type: ObjectContentType::LooseObject,
            body: Box::new(io::Cursor::new(loose_body(oid))),
        })
    }

    fn post_objects(
        &self,
        oids: &[OidBytes],
        _commit_depth: u32,
        _prefer_batched: bool,
    ) -> Result<ObjectResponse, TransportError> {
        self.bulk_requests.lock().unwrap().push(oids.to_vec());
        match self.bulk_mode {
            BulkMode::BatchedAll => {
                let records: Vec<_> = oids.iter().map(|oid| (*oid, loose_body(oid))).collect();
                Ok(ObjectResponse {
                    content_type: ObjectContentType::BatchedLooseObjects,
                    body: Box::new(io::Cursor::new(encode_batched_objects(&records))),
                })
            }
            BulkMode::Pack => Ok(ObjectResponse {
                content_type: ObjectContentType::PackFile,
                body: Box::new(io::Cursor::new(b"PACKcontents".to_vec())),
            }),
        }
    }

    fn get_refs(&self) -> Result<Vec<RefEntry>, TransportError> {
        Ok(Vec::new())
    }
}

struct NothingLocal;
impl ObjectPresence for NothingLocal {
    fn contains(&self, _oid: &OidBytes) -> bool {
        false
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

#[derive(Default)]
struct CountingIndexer {
    calls: AtomicUsize,
}
impl PackIndexer for CountingIndexer {
    fn index_pack(
        &self,
        temp_pack: &std::path::Path,
        _pack_dir: &std::path::Path,
    ) -> Result<(), PackIndexError> {
        assert!(temp_pack.is_file(), "indexer must own an existing pack");
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct PipelineParts {
    _dir: tempfile::TempDir,
    pipeline: FetchPipeline,
    checkout: Arc<RecordingCheckout>,
    indexer: Arc<CountingIndexer>,
    sink: Arc<VecSink>,
}

fn build_pipeline(transport: Arc<dyn ObjectTransport>, fetch: FetchConfig) -> PipelineParts {
    let dir = tempfile::tempdir().unwrap();
    let objects = dir.path().join("objects");
    std::fs::create_dir_all(&objects).unwrap();
    let temp_packs = dir.path().join("tmp");
    std::fs::create_dir_all(&temp_packs).unwrap();

    let checkout = Arc::new(RecordingCheckout::default());
    let indexer = Arc::new(CountingIndexer::default());
    let sink = Arc::new(VecSink::new());
    let pipeline = FetchPipeline::new(
        Arc::new(NothingLocal),
        transport,
        Arc::clone(&indexer) as Arc<dyn PackIndexer>,
        Arc::clone(&checkout) as Arc<dyn CheckoutSink>,
        Arc::new(LooseObjectStore::new(objects)),
        dir.path().join("pack"),
        temp_packs,
        Arc::clone(&sink) as Arc<dyn EventSink>,
        PipelineConfig {
            find_workers: 2,
            checkout_workers: 2,
            index_workers: 1,
            channel_capacity: 64,
            fetch,
        },
    );
    PipelineParts {
        _dir: dir,
        pipeline,
        checkout,
        indexer,
        sink,
    }
}

fn oid(fill: u8) -> OidBytes {
    OidBytes::sha1([fill; 20])
}

/// A 3-SHA batch answered partially, then completed on retry: three SHAs
/// downstream, no duplicates, and the retry requests only the missing id.
#[test]
fn partial_batched_response_completes_without_duplicates() {
    struct PartialThenRest {
        inner: RuleTransport,
        first_call: AtomicUsize,
    }
    impl ObjectTransport for PartialThenRest {
        fn get_loose(&self, oid: &OidBytes) -> Result<ObjectResponse, TransportError> {
            self.inner.get_loose(oid)
        }
        fn post_objects(
            &self,
            oids: &[OidBytes],
            commit_depth: u32,
            prefer_batched: bool,
        ) -> Result<ObjectResponse, TransportError> {
            if self.first_call.fetch_add(1, Ordering::SeqCst) == 0 {
                // Drop the last requested id from the first answer.
                let partial = &oids[..oids.len() - 1];
                return self.inner.post_objects(partial, commit_depth, prefer_batched);
            }
            self.inner.post_objects(oids, commit_depth, prefer_batched)
        }
        fn get_refs(&self) -> Result<Vec<RefEntry>, TransportError> {
            self.inner.get_refs()
        }
    }

    let transport = Arc::new(PartialThenRest {
        inner: RuleTransport::new(BulkMode::BatchedAll),
        first_call: AtomicUsize::new(0),
    });

    // Drive the downloader directly with one pre-filled batch so the
    // partition is deterministic.
    let dir = tempfile::tempdir().unwrap();
    let objects = dir.path().join("objects");
    std::fs::create_dir_all(&objects).unwrap();
    let sink = Arc::new(VecSink::new());
    let fetcher = BlobFetcher::new(
        Arc::clone(&transport) as Arc<dyn ObjectTransport>,
        Arc::new(LooseObjectStore::new(objects)),
        dir.path().to_path_buf(),
        Arc::clone(&sink) as Arc<dyn EventSink>,
        FetchConfig {
            // One worker so the whole triple forms a single batch.
            workers: 1,
            ..test_fetch_config(10, 3)
        },
    );

    let (in_tx, in_rx) = unbounded();
    let (avail_tx, avail_rx) = unbounded();
    let (packs_tx, _packs_rx) = unbounded();
    let (x, y, z) = (oid(1), oid(2), oid(3));
    for id in [x, y, z] {
        in_tx.send(id).unwrap();
    }
    drop(in_tx);

    let report = fetcher.run(in_rx, avail_tx, packs_tx);

    assert!(!report.has_failures);
    let mut downstream: Vec<_> = avail_rx.iter().collect();
    downstream.sort();
    assert_eq!(downstream, vec![x, y, z]);

    let bulk = transport.inner.bulk_requests.lock().unwrap();
    assert_eq!(bulk.len(), 2);
    assert_eq!(bulk[1], vec![z], "retry must request only the missing id");
}

/// 3 of 50 downloads exhaust retries: the run reports failure, the other
/// 47 SHAs still reach checkout, and the pipeline drains completely.
#[test]
fn download_failures_propagate_without_stalling_checkout() {
    let all: Vec<OidBytes> = (1..=50).map(|i| oid(i)).collect();
    let mut transport = RuleTransport::new(BulkMode::BatchedAll);
    transport.loose_fail = HashSet::from([oid(7), oid(21), oid(42)]);
    let transport = Arc::new(transport);

    // Batch size 1 forces every SHA through the loose endpoint so the
    // failing ids are isolated to their own requests.
    let parts = build_pipeline(
        Arc::clone(&transport) as Arc<dyn ObjectTransport>,
        test_fetch_config(1, 2),
    );

    let (in_tx, in_rx) = unbounded();
    for id in &all {
        in_tx.send(*id).unwrap();
    }
    drop(in_tx);

    let report = parts.pipeline.run(in_rx);

    assert!(report.has_failures);
    assert_eq!(report.missing_objects, 50);
    assert_eq!(report.objects_checked_out, 47);

    let seen: HashSet<OidBytes> = parts.checkout.seen.lock().unwrap().iter().copied().collect();
    assert_eq!(seen.len(), 47);
    assert!(!seen.contains(&oid(7)));
    assert!(!seen.contains(&oid(21)));
    assert!(!seen.contains(&oid(42)));
    assert!(parts.sink.events().iter().any(|event| matches!(
        event,
        gitvfs::telemetry::TelemetryEvent::DownloadStopped {
            has_failures: true,
            ..
        }
    )));
}

/// Pack responses travel through the indexer, which publishes the request's
/// SHAs; checkout sees every SHA exactly once.
#[test]
fn pack_responses_flow_through_indexer_to_checkout() {
    let all: Vec<OidBytes> = (1..=20).map(|i| oid(i)).collect();
    let transport = Arc::new(RuleTransport::new(BulkMode::Pack));

    let parts = build_pipeline(
        Arc::clone(&transport) as Arc<dyn ObjectTransport>,
        test_fetch_config(20, 2),
    );

    let (in_tx, in_rx) = unbounded();
    for id in &all {
        in_tx.send(*id).unwrap();
    }
    drop(in_tx);

    let report = parts.pipeline.run(in_rx);

    assert!(!report.has_failures);
    assert!(parts.indexer.calls.load(Ordering::SeqCst) >= 1);

    let mut seen: Vec<OidBytes> = parts.checkout.seen.lock().unwrap().clone();
    seen.sort();
    let mut expected = all.clone();
    expected.sort();
    assert_eq!(seen, expected, "each SHA exactly once, none dropped");
    assert_eq!(report.objects_checked_out, 20);
}

/// Closing the input with nothing in it still propagates completion all
/// the way to checkout.
#[test]
fn empty_input_drains_cleanly() {
    let transport = Arc::new(RuleTransport::new(BulkMode::BatchedAll));
    let parts = build_pipeline(
        Arc::clone(&transport) as Arc<dyn ObjectTransport>,
        test_fetch_config(10, 2),
    );

    let (in_tx, in_rx) = unbounded::<OidBytes>();
    drop(in_tx);

    let report = parts.pipeline.run(in_rx);

    assert!(!report.has_failures);
    assert_eq!(report.missing_objects, 0);
    assert_eq!(report.objects_checked_out, 0);
    assert!(parts.checkout.seen.lock().unwrap().is_empty());
}

/// Objects already local never reach the downloader.
#[test]
fn present_objects_are_filtered_before_download() {
    struct HalfLocal;
    impl ObjectPresence for HalfLocal {
        fn contains(&self, oid: &OidBytes) -> bool {
            oid.as_slice()[0] % 2 == 0
        }
    }

    let transport = Arc::new(RuleTransport::new(BulkMode::BatchedAll));
    let dir = tempfile::tempdir().unwrap();
    let objects = dir.path().join("objects");
    std::fs::create_dir_all(&objects).unwrap();

    let checkout = Arc::new(RecordingCheckout::default());
    let pipeline = FetchPipeline::new(
        Arc::new(HalfLocal),
        Arc::clone(&transport) as Arc<dyn ObjectTransport>,
        Arc::new(CountingIndexer::default()),
        Arc::clone(&checkout) as Arc<dyn CheckoutSink>,
        Arc::new(LooseObjectStore::new(objects)),
        dir.path().join("pack"),
        dir.path().join("tmp"),
        Arc::new(VecSink::new()),
        PipelineConfig {
            fetch: test_fetch_config(10, 2),
            ..PipelineConfig::default()
        },
    );

    let (in_tx, in_rx) = unbounded();
    for i in 1..=10u8 {
        in_tx.send(oid(i)).unwrap();
    }
    drop(in_tx);

    let report = pipeline.run(in_rx);

    assert_eq!(report.missing_objects, 5);
    assert_eq!(report.objects_checked_out, 5);
    let seen = checkout.seen.lock().unwrap();
    assert!(seen.iter().all(|oid| oid.as_slice()[0] % 2 == 1));
}
