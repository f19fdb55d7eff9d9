//! Single-consumer processor for the durable background queue.
//!
//! The processor serializes filesystem-change notifications back into Git
//! state. Producers persist an operation, then signal the consumer; the
//! consumer takes the process-wide Git lock, runs the session callbacks
//! around a drain of the in-memory queue, and releases the lock only once
//! the queue is provably empty.
//!
//! # Lock discipline
//! The Git lock is held for the whole window from the pre-callback through
//! the post-callback. Release goes through the acquisition fence: the
//! consumer takes the writer side with a short timeout, re-checks emptiness,
//! and backs into another drain if a producer slipped an item in. Producers
//! must wrap `enqueue` in `obtain_acquisition_lock`/`release_acquisition_lock`.
//!
//! # Failure semantics
//! Retryable callback failures are retried in place with a short backoff and
//! respect shutdown. Fatal callback results and store failures outside
//! shutdown terminate the process through `fatal::die`. Store failures while
//! stopping abort the drain and leave the durable records for the next
//! mount.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::fatal::{self, ProcessExit};
use crate::git_lock::{GitLock, GitTicket};
use crate::telemetry::{EventSink, TelemetryEvent};

use super::acquisition::AcquisitionFence;
use super::operation::BackgroundOperation;
use super::store::{OperationStore, StoreError};
use super::wakeup::WakeupSignal;

/// Emit a progress event every this many processed items.
const PROGRESS_INTERVAL: u64 = 25_000;

/// Emit a final status after a drain that processed at least this many.
const BATCH_STATUS_THRESHOLD: u64 = 1_000;

/// Result of one callback invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The work is done; the consumer advances.
    Success,
    /// Transient failure; the same item (or phase) is retried after a
    /// short backoff without dequeueing.
    Retryable,
    /// Unrecoverable failure; the process terminates with exit code 1.
    Fatal,
}

/// Session callbacks driven by the consumer.
///
/// `pre` runs once after the Git lock is acquired, `per_item` once per
/// queued operation, `post` once before the lock is released.
///
/// # Idempotency
/// An operation is deleted from the durable store after `per_item` returns
/// `Success` and before the next item is processed. A crash inside that
/// window replays the completed operation on the next mount, so `per_item`
/// must be idempotent.
pub trait QueueCallbacks: Send + 'static {
    /// Runs before the first item of a drain session.
    fn pre(&mut self) -> CallbackOutcome {
        CallbackOutcome::Success
    }

    /// Applies one operation to Git state.
    fn per_item(&mut self, op: &BackgroundOperation) -> CallbackOutcome;

    /// Runs after the queue is drained, before lock release.
    fn post(&mut self) -> CallbackOutcome {
        CallbackOutcome::Success
    }
}

/// Timing knobs for the consumer loop.
///
/// The defaults are the production cadence; tests shrink them to keep
/// polling loops fast.
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Holder string recorded on Git lock acquisition.
    pub holder_name: String,
    /// Sleep between Git lock acquisition attempts.
    pub git_lock_poll: Duration,
    /// Backoff after a retryable callback failure.
    pub retry_backoff: Duration,
    /// Writer-side timeout on the acquisition fence during release.
    pub writer_fence_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            holder_name: String::from("background-queue"),
            git_lock_poll: Duration::from_millis(50),
            retry_backoff: Duration::from_millis(50),
            writer_fence_timeout: Duration::from_millis(10),
        }
    }
}

/// Errors from starting the processor.
#[derive(Debug)]
#[non_exhaustive]
pub enum StartError {
    /// The consumer thread is already running.
    AlreadyStarted,
    /// Replaying persisted operations failed.
    Store(StoreError),
    /// The consumer thread could not be spawned.
    Spawn(std::io::Error),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "processor already started"),
            Self::Store(err) => write!(f, "replay failed: {err}"),
            Self::Spawn(err) => write!(f, "consumer spawn failed: {err}"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Spawn(err) => Some(err),
            Self::AlreadyStarted => None,
        }
    }
}

impl From<StoreError> for StartError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

struct Shared {
    store: Mutex<Box<dyn OperationStore>>,
    queue: Mutex<VecDeque<BackgroundOperation>>,
    wakeup: WakeupSignal,
    fence: AcquisitionFence,
    stopping: AtomicBool,
    processed: AtomicU64,
    git_lock: Arc<GitLock>,
    events: Arc<dyn EventSink>,
    exit: Arc<dyn ProcessExit>,
    config: ProcessorConfig,
}

/// Durable single-consumer work queue for virtualization notifications.
pub struct BackgroundProcessor {
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundProcessor {
    /// Creates a processor over `store`. Nothing runs until `start`.
    #[must_use]
    pub fn new(
        store: Box<dyn OperationStore>,
        git_lock: Arc<GitLock>,
        events: Arc<dyn EventSink>,
        exit: Arc<dyn ProcessExit>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(store),
                queue: Mutex::new(VecDeque::new()),
                wakeup: WakeupSignal::new(),
                fence: AcquisitionFence::new(),
                stopping: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                git_lock,
                events,
                exit,
                config,
            }),
            consumer: Mutex::new(None),
        }
    }

    /// Replays persisted operations and spawns the single consumer thread.
    ///
    /// Replay order is whatever the store enumerates; callers must not
    /// depend on it matching enqueue order.
    ///
    /// # Errors
    /// `AlreadyStarted` on a second call, `Store` when replay fails.
    pub fn start(&self, callbacks: impl QueueCallbacks) -> Result<(), StartError> {
        let mut consumer = self.consumer.lock().expect("consumer handle poisoned");
        if consumer.is_some() {
            return Err(StartError::AlreadyStarted);
        }

        let replayed = {
            let store = self.shared.store.lock().expect("store poisoned");
            let mut ops = Vec::new();
            for id in store.keys()? {
                match store.get(id)? {
                    Some(op) => ops.push(op),
                    // A key without a record means the store raced its own
                    // enumeration; nothing to replay for it.
                    None => tracing::warn!(%id, "persisted key vanished during replay"),
                }
            }
            ops
        };

        let replay_count = replayed.len();
        if replay_count > 0 {
            tracing::info!(count = replay_count, "replaying persisted operations");
            self.shared
                .queue
                .lock()
                .expect("queue poisoned")
                .extend(replayed);
        }

        let shared = Arc::clone(&self.shared);
        let mut callbacks = callbacks;
        let handle = thread::Builder::new()
            .name(String::from("gitvfs-bg-consumer"))
            .spawn(move || consumer_loop(&shared, &mut callbacks))
            .map_err(StartError::Spawn)?;
        *consumer = Some(handle);

        if replay_count > 0 {
            self.shared.wakeup.pulse();
        }
        Ok(())
    }

    /// Persists and enqueues one operation.
    ///
    /// The operation is durable before this returns. If the processor is
    /// stopping, the operation stays persisted for the next mount instead
    /// of entering the in-memory queue.
    ///
    /// Callers on the virtualization boundary must hold the reader side of
    /// the acquisition fence across this call.
    ///
    /// # Errors
    /// Propagates store failures; on error nothing was acknowledged.
    pub fn enqueue(&self, op: BackgroundOperation) -> Result<(), StoreError> {
        {
            let mut store = self.shared.store.lock().expect("store poisoned");
            store.put(op.id(), &op)?;
            store.flush()?;
        }

        if self.shared.stopping.load(Ordering::Acquire) {
            tracing::debug!(id = %op.id(), "enqueue while stopping; persisted only");
            return Ok(());
        }

        self.shared.queue.lock().expect("queue poisoned").push_back(op);
        self.shared.wakeup.pulse();
        Ok(())
    }

    /// Enters the producer (reader) side of the acquisition fence.
    pub fn obtain_acquisition_lock(&self) {
        self.shared.fence.enter_reader();
    }

    /// Exits the producer (reader) side of the acquisition fence.
    pub fn release_acquisition_lock(&self) {
        self.shared.fence.exit_reader();
    }

    /// Advisory length of the in-memory queue.
    #[must_use]
    pub fn count(&self) -> usize {
        self.shared.queue.lock().expect("queue poisoned").len()
    }

    /// Total operations processed since `start`.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::Acquire)
    }

    /// Stops the consumer and joins it.
    ///
    /// Idempotent; safe to call whether or not `start` ran.
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.wakeup.pulse();
        let handle = self
            .consumer
            .lock()
            .expect("consumer handle poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("background consumer panicked during shutdown");
            }
        }
    }
}

impl Drop for BackgroundProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Outcome of a retry-until-success phase.
enum Phase {
    Done,
    Stopped,
    Fatal,
}

fn consumer_loop(shared: &Shared, callbacks: &mut dyn QueueCallbacks) {
    loop {
        shared.wakeup.wait();
        if shared.stopping.load(Ordering::Acquire) {
            return;
        }

        // Spin-poll the Git lock; another mutator may hold it for a while.
        let ticket = loop {
            if let Some(ticket) = shared.git_lock.try_acquire(&shared.config.holder_name) {
                break ticket;
            }
            if shared.stopping.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(shared.config.git_lock_poll);
        };

        match drain_sessions(shared, callbacks, ticket) {
            Phase::Done => {}
            Phase::Stopped | Phase::Fatal => return,
        }
    }
}

/// Runs drain sessions until the queue is empty at release time.
///
/// Owns the Git ticket: every exit path either releases it (normal and
/// stopped paths) or deliberately leaves it held (fatal path, where the
/// process is terminating).
fn drain_sessions(shared: &Shared, callbacks: &mut dyn QueueCallbacks, ticket: GitTicket) -> Phase {
    match run_until_success(shared, &mut || callbacks.pre(), "pre-callback") {
        Phase::Done => {}
        Phase::Stopped => {
            shared.git_lock.release(ticket);
            return Phase::Stopped;
        }
        Phase::Fatal => return Phase::Fatal,
    }

    loop {
        match drain_queue(shared, callbacks) {
            Phase::Done => {}
            Phase::Stopped => {
                shared.git_lock.release(ticket);
                return Phase::Stopped;
            }
            Phase::Fatal => return Phase::Fatal,
        }

        // Step 5: queue drained; make deletions durable.
        if let Err(err) = shared.store.lock().expect("store poisoned").flush() {
            fatal::die(
                shared.events.as_ref(),
                shared.exit.as_ref(),
                &format!("durable store flush failed: {err}"),
            );
            return Phase::Fatal;
        }

        match run_until_success(shared, &mut || callbacks.post(), "post-callback") {
            Phase::Done => {}
            Phase::Stopped => {
                shared.git_lock.release(ticket);
                return Phase::Stopped;
            }
            Phase::Fatal => return Phase::Fatal,
        }

        // Step 7: release only if the queue is still empty, checked under
        // the writer side of the fence so no producer is mid-enqueue.
        loop {
            if !shared.queue.lock().expect("queue poisoned").is_empty() {
                break; // re-enter the drain loop
            }
            if !shared
                .fence
                .try_enter_writer(shared.config.writer_fence_timeout)
            {
                // A producer is inside the fence; re-check the queue.
                continue;
            }
            let empty = shared.queue.lock().expect("queue poisoned").is_empty();
            if empty {
                shared.git_lock.release(ticket);
                shared.fence.exit_writer();
                return Phase::Done;
            }
            shared.fence.exit_writer();
            break; // item appeared; re-enter the drain loop
        }
    }
}

/// Step 4: processes queued items until empty.
fn drain_queue(shared: &Shared, callbacks: &mut dyn QueueCallbacks) -> Phase {
    let mut session_processed = 0u64;

    loop {
        let head = shared
            .queue
            .lock()
            .expect("queue poisoned")
            .front()
            .cloned();
        let Some(op) = head else { break };

        if shared.stopping.load(Ordering::Acquire) {
            // Abandon the drain; deletions so far must still become durable.
            if let Err(err) = shared.store.lock().expect("store poisoned").flush() {
                tracing::warn!(error = %err, "flush during shutdown failed; records remain for next mount");
            }
            return Phase::Stopped;
        }

        match callbacks.per_item(&op) {
            CallbackOutcome::Success => {
                {
                    let mut queue = shared.queue.lock().expect("queue poisoned");
                    let dequeued = queue.pop_front();
                    debug_assert!(
                        dequeued.map(|front| front.id()) == Some(op.id()),
                        "single consumer must own the queue head"
                    );
                }
                // Remove from the durable store before touching the next
                // item; a crash here replays only this completed op.
                if let Err(err) = shared.store.lock().expect("store poisoned").delete(op.id()) {
                    fatal::die(
                        shared.events.as_ref(),
                        shared.exit.as_ref(),
                        &format!("durable store delete failed: {err}"),
                    );
                    return Phase::Fatal;
                }
                session_processed += 1;
                let total = shared.processed.fetch_add(1, Ordering::AcqRel) + 1;
                if total % PROGRESS_INTERVAL == 0 {
                    shared.events.emit(&TelemetryEvent::TaskProcessingStatus {
                        processed: total,
                        remaining: shared.queue.lock().expect("queue poisoned").len(),
                    });
                }
            }
            CallbackOutcome::Retryable => {
                if !shared.stopping.load(Ordering::Acquire) {
                    thread::sleep(shared.config.retry_backoff);
                }
            }
            CallbackOutcome::Fatal => {
                fatal::die(
                    shared.events.as_ref(),
                    shared.exit.as_ref(),
                    "per-item callback returned fatal",
                );
                return Phase::Fatal;
            }
        }
    }

    if session_processed >= BATCH_STATUS_THRESHOLD {
        shared.events.emit(&TelemetryEvent::TaskProcessingStatus {
            processed: shared.processed.load(Ordering::Acquire),
            remaining: shared.queue.lock().expect("queue poisoned").len(),
        });
    }
    Phase::Done
}

/// Repeats `op` until it succeeds, backing off on retryable failures.
fn run_until_success(
    shared: &Shared,
    op: &mut dyn FnMut() -> CallbackOutcome,
    what: &str,
) -> Phase {
    loop {
        match op() {
            CallbackOutcome::Success => return Phase::Done,
            CallbackOutcome::Retryable => {
                if shared.stopping.load(Ordering::Acquire) {
                    tracing::debug!(what, "abandoning retry due to shutdown");
                    return Phase::Stopped;
                }
                thread::sleep(shared.config.retry_backoff);
            }
            CallbackOutcome::Fatal => {
                fatal::die(
                    shared.events.as_ref(),
                    shared.exit.as_ref(),
                    &format!("{what} returned fatal"),
                );
                return Phase::Fatal;
            }
        }
    }
}
