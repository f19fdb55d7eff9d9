//! End-to-end behavior of the durable background queue: crash replay,
//! in-place retries, fatal termination, and the enqueue/release race.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gitvfs::background::{
    BackgroundOperation, BackgroundProcessor, CallbackOutcome, InMemoryOperationStore,
    OperationKind, ProcessorConfig, QueueCallbacks,
};
use gitvfs::fatal::{ProcessExit, RecordingExit};
use gitvfs::git_lock::GitLock;
use gitvfs::telemetry::{EventSink, VecSink};

fn fast_config() -> ProcessorConfig {
    ProcessorConfig {
        holder_name: String::from("queue-test"),
        git_lock_poll: Duration::from_millis(1),
        retry_backoff: Duration::from_millis(1),
        writer_fence_timeout: Duration::from_millis(10),
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

struct RecordingCallbacks {
    seen: Arc<Mutex<Vec<String>>>,
}

impl QueueCallbacks for RecordingCallbacks {
    fn per_item(&mut self, op: &BackgroundOperation) -> CallbackOutcome {
        self.seen
            .lock()
            .unwrap()
            .push(op.virtual_path().to_string());
        CallbackOutcome::Success
    }
}

fn processor_over(
    store: Box<dyn gitvfs::background::OperationStore>,
    git_lock: Arc<GitLock>,
) -> (BackgroundProcessor, Arc<VecSink>, Arc<RecordingExit>) {
    let sink = Arc::new(VecSink::new());
    let exit = Arc::new(RecordingExit::new());
    let processor = BackgroundProcessor::new(
        store,
        git_lock,
        Arc::clone(&sink) as Arc<dyn EventSink>,
        Arc::clone(&exit) as Arc<dyn ProcessExit>,
        fast_config(),
    );
    (processor, sink, exit)
}

#[cfg(feature = "rocksdb")]
mod persisted_replay {
    use super::*;
    use gitvfs::background::RocksOperationStore;
    use gitvfs::enlistment::Enlistment;

    /// Enqueue {A,B,C}, "kill" the process (drop without processing),
    /// restart, and expect each operation exactly once with the store
    /// left empty.
    #[test]
    fn replay_after_simulated_kill() {
        let dir = tempfile::tempdir().unwrap();
        let enlistment = Enlistment::new(dir.path(), dir.path().join(".git/objects"));
        let db_path = enlistment.database_dir("background-ops").unwrap();

        // First mount: persist three operations, never start the consumer,
        // then drop everything mid-flight.
        {
            let store = RocksOperationStore::open(&db_path).unwrap();
            let (processor, _sink, _exit) =
                processor_over(Box::new(store), Arc::new(GitLock::new()));
            for name in ["A", "B", "C"] {
                processor
                    .enqueue(BackgroundOperation::new(OperationKind::FileCreated, name))
                    .unwrap();
            }
        }

        // Second mount: replay must surface each operation exactly once.
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let store = RocksOperationStore::open(&db_path).unwrap();
            let (processor, _sink, _exit) =
                processor_over(Box::new(store), Arc::new(GitLock::new()));
            processor
                .start(RecordingCallbacks {
                    seen: Arc::clone(&seen),
                })
                .unwrap();
            assert!(wait_until(Duration::from_secs(10), || processor.processed() == 3));
            processor.shutdown();
        }

        let mut names = seen.lock().unwrap().clone();
        names.sort();
        assert_eq!(names, ["A", "B", "C"]);

        // Third mount: nothing left to replay.
        let store = RocksOperationStore::open(&db_path).unwrap();
        assert!(gitvfs::background::OperationStore::keys(&store)
            .unwrap()
            .is_empty());
    }
}

/// Callback returns retryable four times then success: five invocations,
/// no dequeue before the fifth, and the record gone afterwards.
#[test]
fn retryable_cascade_invokes_five_times() {
    struct Cascade {
        calls: Arc<AtomicUsize>,
        queue_len_at_success: Arc<AtomicUsize>,
        processor: Arc<BackgroundProcessor>,
    }
    impl QueueCallbacks for Cascade {
        fn per_item(&mut self, _op: &BackgroundOperation) -> CallbackOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < 5 {
                CallbackOutcome::Retryable
            } else {
                self.queue_len_at_success
                    .store(self.processor.count(), Ordering::SeqCst);
                CallbackOutcome::Success
            }
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let queue_len_at_success = Arc::new(AtomicUsize::new(usize::MAX));

    let (processor, _sink, _exit) = processor_over(
        Box::new(InMemoryOperationStore::new()),
        Arc::new(GitLock::new()),
    );
    let processor = Arc::new(processor);
    processor
        .start(Cascade {
            calls: Arc::clone(&calls),
            queue_len_at_success: Arc::clone(&queue_len_at_success),
            processor: Arc::clone(&processor),
        })
        .unwrap();

    processor
        .enqueue(BackgroundOperation::new(OperationKind::FileOverwritten, "f"))
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        processor.processed() == 1
    }));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    // The item was still queued when the fifth invocation ran.
    assert_eq!(queue_len_at_success.load(Ordering::SeqCst), 1);
    assert_eq!(processor.count(), 0);
    processor.shutdown();
}

/// A fatal callback result terminates with exit code 1 and leaves the
/// record persisted for the next mount.
#[test]
fn fatal_result_exits_and_preserves_record() {
    struct AlwaysFatal;
    impl QueueCallbacks for AlwaysFatal {
        fn per_item(&mut self, _op: &BackgroundOperation) -> CallbackOutcome {
            CallbackOutcome::Fatal
        }
    }

    let (processor, sink, exit) = processor_over(
        Box::new(InMemoryOperationStore::new()),
        Arc::new(GitLock::new()),
    );
    processor.start(AlwaysFatal).unwrap();
    processor
        .enqueue(BackgroundOperation::new(OperationKind::FileDeleted, "d"))
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || exit.code() == 1));
    assert!(sink.events().iter().any(|event| matches!(
        event,
        gitvfs::telemetry::TelemetryEvent::FatalTermination { .. }
    )));
    assert_eq!(processor.processed(), 0);
    processor.shutdown();
}

/// A producer enqueues inside the acquisition fence while the consumer is
/// trying to release: the writer acquire must fail, the consumer re-enters
/// the drain, and the new item is processed before the lock is released.
#[test]
fn enqueue_during_release_window_is_drained_before_release() {
    let git_lock = Arc::new(GitLock::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (processor, _sink, _exit) = processor_over(
        Box::new(InMemoryOperationStore::new()),
        Arc::clone(&git_lock),
    );
    processor
        .start(RecordingCallbacks {
            seen: Arc::clone(&seen),
        })
        .unwrap();

    // Hold the reader side: the consumer can drain but cannot release.
    processor.obtain_acquisition_lock();

    processor
        .enqueue(BackgroundOperation::new(OperationKind::FileCreated, "one"))
        .unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        processor.processed() == 1
    }));

    // Drained, but release is fenced off; the Git lock must stay held.
    thread::sleep(Duration::from_millis(50));
    assert!(git_lock.is_held());

    // The racing enqueue, still inside the fence.
    processor
        .enqueue(BackgroundOperation::new(OperationKind::FileCreated, "two"))
        .unwrap();
    processor.release_acquisition_lock();

    // The new item is processed and only then does the lock go free.
    assert!(wait_until(Duration::from_secs(10), || {
        processor.processed() == 2
    }));
    assert!(wait_until(Duration::from_secs(10), || !git_lock.is_held()));
    assert_eq!(seen.lock().unwrap().as_slice(), &["one", "two"]);
    processor.shutdown();
}

/// Producers on many threads against one consumer: everything drains and
/// the store ends empty.
#[test]
fn concurrent_producers_fully_drain() {
    let (processor, _sink, _exit) = processor_over(
        Box::new(InMemoryOperationStore::new()),
        Arc::new(GitLock::new()),
    );
    let processor = Arc::new(processor);
    let seen = Arc::new(Mutex::new(Vec::new()));
    processor
        .start(RecordingCallbacks {
            seen: Arc::clone(&seen),
        })
        .unwrap();

    let mut producers = Vec::new();
    for p in 0..4 {
        let processor = Arc::clone(&processor);
        producers.push(thread::spawn(move || {
            for i in 0..25 {
                processor.obtain_acquisition_lock();
                processor
                    .enqueue(BackgroundOperation::new(
                        OperationKind::FileCreated,
                        format!("p{p}-{i}"),
                    ))
                    .unwrap();
                processor.release_acquisition_lock();
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        processor.processed() == 100
    }));
    assert_eq!(processor.count(), 0);
    assert_eq!(seen.lock().unwrap().len(), 100);
    processor.shutdown();
}
