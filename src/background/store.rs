//! Durable store contract for background operations.
//!
//! The store is a persistent mapping from 16-byte operation ids to encoded
//! operation records with an explicit durability contract: after `put` plus
//! `flush` return, the mapping survives a process kill; after `delete` plus
//! `flush`, it is gone. Enumeration order is unspecified; recovery must
//! tolerate any permutation of the enqueue order.
//!
//! `InMemoryOperationStore` backs unit tests and can inject failures into
//! `put` and `flush` to exercise shutdown-abort paths.

use std::collections::HashMap;
use std::fmt;
use std::io;

use super::operation::{BackgroundOperation, OperationId};

/// Errors from durable-store operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// I/O error from the backing medium.
    Io(io::Error),
    /// Backend-specific error string.
    Backend { detail: String },
    /// A stored record failed to decode.
    CorruptRecord { detail: &'static str },
    /// A record field exceeds its length prefix.
    RecordTooLarge { len: usize, max: usize },
    /// The store was used after `close`.
    Closed,
}

impl StoreError {
    /// Creates a backend error variant.
    #[inline]
    pub fn backend(detail: impl Into<String>) -> Self {
        Self::Backend {
            detail: detail.into(),
        }
    }

    /// Creates a corrupt-record variant.
    #[inline]
    pub fn corrupt(detail: &'static str) -> Self {
        Self::CorruptRecord { detail }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "store I/O error: {err}"),
            Self::Backend { detail } => write!(f, "store backend error: {detail}"),
            Self::CorruptRecord { detail } => write!(f, "corrupt record: {detail}"),
            Self::RecordTooLarge { len, max } => {
                write!(f, "record too large: {len} bytes (max: {max})")
            }
            Self::Closed => write!(f, "store is closed"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Persistent id → operation mapping.
///
/// Implementations need not be thread-safe; the queue serializes access
/// behind its own lock.
pub trait OperationStore: Send {
    /// Records `op` under `id`. Not durable until `flush` returns.
    fn put(&mut self, id: OperationId, op: &BackgroundOperation) -> Result<(), StoreError>;

    /// Removes the record for `id`. Missing ids are not an error.
    fn delete(&mut self, id: OperationId) -> Result<(), StoreError>;

    /// Makes all prior `put`/`delete` calls durable.
    fn flush(&mut self) -> Result<(), StoreError>;

    /// Loads the record for `id`, if present.
    fn get(&self, id: OperationId) -> Result<Option<BackgroundOperation>, StoreError>;

    /// Enumerates all stored ids in unspecified order.
    fn keys(&self) -> Result<Vec<OperationId>, StoreError>;

    /// Flushes and releases the store. Further calls return `Closed`.
    fn close(&mut self) -> Result<(), StoreError>;
}

/// In-memory store for tests and diagnostics.
///
/// Tracks flush counts and supports one-shot fault injection so callers can
/// observe behavior when persistence fails mid-drain.
#[derive(Debug, Default)]
pub struct InMemoryOperationStore {
    records: HashMap<[u8; 16], Vec<u8>>,
    closed: bool,
    flushes: u64,
    fail_next_put: bool,
    fail_next_flush: bool,
}

impl InMemoryOperationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `flush` calls that succeeded.
    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Number of records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Makes the next `put` fail with a backend error.
    pub fn fail_next_put(&mut self) {
        self.fail_next_put = true;
    }

    /// Makes the next `flush` fail with a backend error.
    pub fn fail_next_flush(&mut self) {
        self.fail_next_flush = true;
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl OperationStore for InMemoryOperationStore {
    fn put(&mut self, id: OperationId, op: &BackgroundOperation) -> Result<(), StoreError> {
        self.check_open()?;
        if self.fail_next_put {
            self.fail_next_put = false;
            return Err(StoreError::backend("injected put failure"));
        }
        self.records.insert(*id.as_bytes(), op.encode()?);
        Ok(())
    }

    fn delete(&mut self, id: OperationId) -> Result<(), StoreError> {
        self.check_open()?;
        self.records.remove(id.as_bytes());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        if self.fail_next_flush {
            self.fail_next_flush = false;
            return Err(StoreError::backend("injected flush failure"));
        }
        self.flushes += 1;
        Ok(())
    }

    fn get(&self, id: OperationId) -> Result<Option<BackgroundOperation>, StoreError> {
        self.check_open()?;
        self.records
            .get(id.as_bytes())
            .map(|value| BackgroundOperation::decode(id, value))
            .transpose()
    }

    fn keys(&self) -> Result<Vec<OperationId>, StoreError> {
        self.check_open()?;
        Ok(self
            .records
            .keys()
            .map(|bytes| OperationId::from_bytes(*bytes))
            .collect())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::operation::OperationKind;

    #[test]
    fn put_get_delete_round_trip() {
        let mut store = InMemoryOperationStore::new();
        let op = BackgroundOperation::new(OperationKind::FileCreated, "a.rs");

        store.put(op.id(), &op).unwrap();
        store.flush().unwrap();
        assert_eq!(store.get(op.id()).unwrap(), Some(op.clone()));
        assert_eq!(store.keys().unwrap(), vec![op.id()]);

        store.delete(op.id()).unwrap();
        assert_eq!(store.get(op.id()).unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn missing_delete_is_not_an_error() {
        let mut store = InMemoryOperationStore::new();
        store
            .delete(BackgroundOperation::new(OperationKind::FileDeleted, "x").id())
            .unwrap();
    }

    #[test]
    fn closed_store_rejects_operations() {
        let mut store = InMemoryOperationStore::new();
        store.close().unwrap();

        assert!(matches!(store.flush(), Err(StoreError::Closed)));
        assert!(matches!(store.keys(), Err(StoreError::Closed)));
        assert!(matches!(store.close(), Err(StoreError::Closed)));
    }

    #[test]
    fn injected_faults_fire_once() {
        let mut store = InMemoryOperationStore::new();
        let op = BackgroundOperation::new(OperationKind::FileCreated, "a");

        store.fail_next_put();
        assert!(store.put(op.id(), &op).is_err());
        store.put(op.id(), &op).unwrap();

        store.fail_next_flush();
        assert!(store.flush().is_err());
        store.flush().unwrap();
        assert_eq!(store.flushes(), 1);
    }
}
