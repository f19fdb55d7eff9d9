//! Batch object downloader.
//!
//! Workers pull SHA batches off the missing-objects channel and download
//! them: single ids through the loose endpoint, larger batches through the
//! bulk endpoint with the batched-loose-objects media type preferred.
//! Responses dispatch on content type: loose bodies land in the object
//! store and their SHAs go straight downstream, packs stream to a temp file
//! and travel to the indexer, batched frames do both per record.
//!
//! # Retry bookkeeping
//! Each batch keeps a succeeded set shared between the response handler and
//! the retry closure, so a retry after a partial batched response requests
//! only the ids still missing. A pack response satisfies everything still
//! outstanding at that moment; its `IndexPackRequest` carries exactly those
//! ids so downstream publication never duplicates a SHA already announced.
//!
//! Exhausted retries mark the job's `has_failures` flag and move on;
//! sibling batches are unaffected.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::object_id::OidBytes;
use crate::retry::AttemptError;
use crate::telemetry::{EventSink, TelemetryEvent};

use super::batched::decode_batched_objects;
use super::errors::FrameError;
use super::indexer::IndexPackRequest;
use super::loose::LooseObjectStore;
use super::transport::{ObjectContentType, ObjectResponse, ObjectTransport, RetryingObjectClient};

/// An ordered, non-empty set of SHAs to download as one unit.
///
/// The pack id exists for telemetry correlation only; it carries no
/// protocol meaning.
#[derive(Clone, Debug)]
pub struct BlobDownloadRequest {
    /// Requested ids in arrival order.
    pub oids: Vec<OidBytes>,
    /// Monotonic id tying logs, temp packs, and index requests together.
    pub pack_id: u64,
}

/// Downloader configuration.
#[derive(Clone, Debug)]
pub struct FetchConfig {
    /// Worker thread count.
    pub workers: usize,
    /// Maximum SHAs per download request.
    pub batch_size: usize,
    /// Commit-depth parameter forwarded to the bulk endpoint.
    pub commit_depth: u32,
    /// Retry attempts per request.
    pub max_attempts: u32,
    /// Exponential backoff base in seconds; 0.0 disables sleeping.
    pub backoff_base: f64,
    /// Advertise the batched-loose-objects media type on bulk requests.
    pub prefer_batched_loose_objects: bool,
    /// Heartbeat cadence.
    pub heartbeat_period: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            batch_size: 4_000,
            commit_depth: 1,
            max_attempts: 6,
            backoff_base: 2.0,
            prefer_batched_loose_objects: true,
            heartbeat_period: Duration::from_secs(20),
        }
    }
}

/// Final accounting for one downloader run.
#[derive(Clone, Copy, Debug, Default)]
pub struct FetchReport {
    /// Download requests issued (== pack ids consumed).
    pub request_count: u64,
    /// Total body bytes written to disk.
    pub bytes_downloaded: u64,
    /// True when any batch exhausted its retries.
    pub has_failures: bool,
}

struct FetcherShared {
    client: RetryingObjectClient,
    store: Arc<LooseObjectStore>,
    temp_pack_dir: PathBuf,
    events: Arc<dyn EventSink>,
    config: FetchConfig,
    bytes_downloaded: AtomicU64,
    has_failures: AtomicBool,
    active_downloads: AtomicUsize,
    request_count: AtomicU64,
}

/// Multi-worker object downloader (one stage of the fetch pipeline).
pub struct BlobFetcher {
    shared: Arc<FetcherShared>,
}

impl BlobFetcher {
    /// Creates a fetcher writing loose objects into `store` and temp packs
    /// into `temp_pack_dir`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn ObjectTransport>,
        store: Arc<LooseObjectStore>,
        temp_pack_dir: PathBuf,
        events: Arc<dyn EventSink>,
        config: FetchConfig,
    ) -> Self {
        let client =
            RetryingObjectClient::new(transport, config.max_attempts, config.backoff_base);
        Self {
            shared: Arc::new(FetcherShared {
                client,
                store,
                temp_pack_dir,
                events,
                config,
                bytes_downloaded: AtomicU64::new(0),
                has_failures: AtomicBool::new(false),
                active_downloads: AtomicUsize::new(0),
                request_count: AtomicU64::new(0),
            }),
        }
    }

    /// Runs the download stage to completion.
    ///
    /// Blocks until `input` is disconnected and drained, then drops the
    /// output senders this stage owns and emits the stop event. Wrap in a
    /// thread to run alongside other stages.
    pub fn run(
        &self,
        input: Receiver<OidBytes>,
        available: Sender<OidBytes>,
        packs: Sender<IndexPackRequest>,
    ) -> FetchReport {
        let worker_count = self.shared.config.workers.max(1);
        let (heartbeat_stop_tx, heartbeat_stop_rx) = crossbeam_channel::bounded::<()>(0);
        let heartbeat = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name(String::from("fetch-heartbeat"))
                .spawn(move || heartbeat_loop(&shared, &heartbeat_stop_rx))
                .expect("spawn heartbeat thread")
        };

        let mut handles = Vec::with_capacity(worker_count);
        for worker_idx in 0..worker_count {
            let shared = Arc::clone(&self.shared);
            let input = input.clone();
            let available = available.clone();
            let packs = packs.clone();
            let handle = thread::Builder::new()
                .name(format!("fetch-worker-{worker_idx}"))
                .spawn(move || worker_loop(&shared, &input, &available, &packs))
                .expect("spawn fetch worker");
            handles.push(handle);
        }
        // This stage's own clones must not keep downstream channels open.
        drop(input);
        drop(available);
        drop(packs);

        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("fetch worker panicked");
                self.shared.has_failures.store(true, Ordering::Release);
            }
        }
        drop(heartbeat_stop_tx);
        let _ = heartbeat.join();

        let report = FetchReport {
            request_count: self.shared.request_count.load(Ordering::Acquire),
            bytes_downloaded: self.shared.bytes_downloaded.load(Ordering::Acquire),
            has_failures: self.shared.has_failures.load(Ordering::Acquire),
        };
        self.shared.events.emit(&TelemetryEvent::DownloadStopped {
            request_count: report.request_count,
            bytes_downloaded: report.bytes_downloaded,
            has_failures: report.has_failures,
        });
        report
    }

    /// True when any batch exhausted its retries so far.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.shared.has_failures.load(Ordering::Acquire)
    }
}

fn heartbeat_loop(shared: &FetcherShared, stop: &Receiver<()>) {
    loop {
        match stop.recv_timeout(shared.config.heartbeat_period) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                shared.events.emit(&TelemetryEvent::DownloadHeartbeat {
                    active_downloads: shared.active_downloads.load(Ordering::Acquire),
                });
            }
        }
    }
}

fn worker_loop(
    shared: &FetcherShared,
    input: &Receiver<OidBytes>,
    available: &Sender<OidBytes>,
    packs: &Sender<IndexPackRequest>,
) {
    while let Some(batch) = super::chunker::take_batch(input, shared.config.batch_size) {
        shared.active_downloads.fetch_add(1, Ordering::AcqRel);
        download_batch(shared, batch, available, packs);
        shared.active_downloads.fetch_sub(1, Ordering::AcqRel);
    }
}

fn download_batch(
    shared: &FetcherShared,
    batch: Vec<OidBytes>,
    available: &Sender<OidBytes>,
    packs: &Sender<IndexPackRequest>,
) {
    let pack_id = shared.request_count.fetch_add(1, Ordering::AcqRel);
    let request = BlobDownloadRequest {
        oids: batch,
        pack_id,
    };
    let succeeded: Mutex<HashSet<OidBytes>> = Mutex::new(HashSet::new());

    let outcome = if request.oids.len() == 1 {
        let oid = request.oids[0];
        shared.client.try_download_loose_object(
            &oid,
            &mut |_attempt, response| {
                write_object_or_pack(shared, &request, &succeeded, response, available, packs)
            },
            None,
        )
    } else {
        shared.client.try_download_objects(
            &mut || {
                let done = succeeded.lock().expect("succeeded set poisoned");
                request
                    .oids
                    .iter()
                    .filter(|oid| !done.contains(oid))
                    .copied()
                    .collect()
            },
            shared.config.commit_depth,
            shared.config.prefer_batched_loose_objects,
            &mut |_attempt, response| {
                write_object_or_pack(shared, &request, &succeeded, response, available, packs)
            },
            None,
        )
    };

    match outcome {
        Ok(invocation) if invocation.succeeded() => {}
        Ok(invocation) => {
            tracing::warn!(
                pack_id,
                attempts = invocation.attempts(),
                "download exhausted retries"
            );
            shared.has_failures.store(true, Ordering::Release);
        }
        Err(err) => {
            tracing::error!(pack_id, error = %err, "download failed fatally");
            shared.has_failures.store(true, Ordering::Release);
        }
    }
}

/// Dispatches one response by content type.
///
/// Returns a retryable error for transient body failures so the retry layer
/// can re-request whatever the succeeded set still misses.
fn write_object_or_pack(
    shared: &FetcherShared,
    request: &BlobDownloadRequest,
    succeeded: &Mutex<HashSet<OidBytes>>,
    mut response: ObjectResponse,
    available: &Sender<OidBytes>,
    packs: &Sender<IndexPackRequest>,
) -> Result<(), AttemptError> {
    match response.content_type {
        ObjectContentType::LooseObject => {
            if request.oids.len() != 1 {
                return Err(AttemptError::permanent(
                    "loose-object response to a multi-object request",
                ));
            }
            let oid = request.oids[0];
            let written = shared
                .store
                .write_object(&oid, &mut *response.body)
                .map_err(AttemptError::Io)?;
            shared
                .bytes_downloaded
                .fetch_add(written, Ordering::AcqRel);
            succeeded
                .lock()
                .expect("succeeded set poisoned")
                .insert(oid);
            publish(available, oid)?;
            Ok(())
        }
        ObjectContentType::PackFile => {
            let temp_path = shared.temp_pack_dir.join(format!(
                "fetch_{}_{}.pack",
                process::id(),
                request.pack_id
            ));
            let written = {
                let mut file = File::create(&temp_path).map_err(AttemptError::Io)?;
                io::copy(&mut response.body, &mut file).map_err(AttemptError::Io)?
            };
            if written == 0 {
                let _ = std::fs::remove_file(&temp_path);
                return Err(AttemptError::retryable("server sent an empty pack"));
            }
            shared
                .bytes_downloaded
                .fetch_add(written, Ordering::AcqRel);

            // The pack satisfies everything still outstanding; downstream
            // publication of those ids is the indexer's job.
            let outstanding: Vec<OidBytes> = {
                let mut done = succeeded.lock().expect("succeeded set poisoned");
                let remaining: Vec<OidBytes> = request
                    .oids
                    .iter()
                    .filter(|oid| !done.contains(oid))
                    .copied()
                    .collect();
                done.extend(remaining.iter().copied());
                remaining
            };
            let index_request = IndexPackRequest {
                temp_pack_path: temp_path,
                request: BlobDownloadRequest {
                    oids: outstanding,
                    pack_id: request.pack_id,
                },
            };
            packs
                .send(index_request)
                .map_err(|_| AttemptError::permanent("pack indexer channel closed"))?;
            Ok(())
        }
        ObjectContentType::BatchedLooseObjects => {
            let result = decode_batched_objects(&mut response.body, |oid, payload| {
                let written = shared
                    .store
                    .write_object_bytes(&oid, &payload)
                    .map_err(FrameError::Io)?;
                shared
                    .bytes_downloaded
                    .fetch_add(written, Ordering::AcqRel);
                succeeded
                    .lock()
                    .expect("succeeded set poisoned")
                    .insert(oid);
                publish(available, oid)
                    .map_err(|_| FrameError::Io(io::Error::other("downstream closed")))?;
                Ok(())
            });
            match result {
                Ok(_count) => {
                    let done = succeeded.lock().expect("succeeded set poisoned");
                    let missing = request
                        .oids
                        .iter()
                        .any(|oid| !done.contains(oid));
                    if missing {
                        // Objects already written stay written; the retry
                        // only asks for the remainder.
                        Err(AttemptError::retryable("batched response was partial"))
                    } else {
                        Ok(())
                    }
                }
                Err(FrameError::Io(err)) => Err(AttemptError::Io(err)),
                Err(err) => Err(AttemptError::retryable(err.to_string())),
            }
        }
    }
}

fn publish(available: &Sender<OidBytes>, oid: OidBytes) -> Result<(), AttemptError> {
    available
        .send(oid)
        .map_err(|_| AttemptError::permanent("available-objects channel closed"))
}
