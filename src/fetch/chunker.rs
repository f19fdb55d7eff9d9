//! Bounded batching over a blocking channel.
//!
//! Download workers pull work in batches: block until at least one item is
//! available, then opportunistically drain whatever else has already arrived,
//! up to the batch cap. Kept as free functions on the channel type; the
//! aggregation has no state of its own.

use crossbeam_channel::Receiver;

/// Takes a batch of `1..=max` items from `input`.
///
/// Blocks only for the first item. Returns `None` once the channel is
/// disconnected and fully drained. Order within a batch is arrival order
/// and batches are never empty.
///
/// # Panics
/// Panics if `max` is zero.
pub fn take_batch<T>(input: &Receiver<T>, max: usize) -> Option<Vec<T>> {
    assert!(max > 0, "batch size must be > 0");

    let first = input.recv().ok()?;
    let mut batch = Vec::with_capacity(max.min(64));
    batch.push(first);
    while batch.len() < max {
        match input.try_recv() {
            Ok(item) => batch.push(item),
            Err(_) => break,
        }
    }
    Some(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn drains_up_to_max() {
        let (tx, rx) = unbounded();
        for i in 0..10 {
            tx.send(i).unwrap();
        }

        let batch = take_batch(&rx, 4).unwrap();
        assert_eq!(batch, vec![0, 1, 2, 3]);
        let batch = take_batch(&rx, 4).unwrap();
        assert_eq!(batch, vec![4, 5, 6, 7]);
    }

    #[test]
    fn partial_batch_when_channel_runs_dry() {
        let (tx, rx) = unbounded();
        tx.send(1).unwrap();
        tx.send(2).unwrap();

        let batch = take_batch(&rx, 100).unwrap();
        assert_eq!(batch, vec![1, 2]);
    }

    #[test]
    fn none_after_disconnect_and_drain() {
        let (tx, rx) = unbounded();
        tx.send(7).unwrap();
        drop(tx);

        assert_eq!(take_batch(&rx, 3), Some(vec![7]));
        assert_eq!(take_batch(&rx, 3), None);
    }

    #[test]
    fn blocks_for_first_item() {
        let (tx, rx) = unbounded();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.send(42).unwrap();
        });

        let batch = take_batch(&rx, 8).unwrap();
        assert_eq!(batch, vec![42]);
        producer.join().unwrap();
    }
}
