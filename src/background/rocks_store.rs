//! RocksDB-backed durable operation store.
//!
//! This module is feature-gated. Enable with `--features rocksdb` (on by
//! default). Records are plain key/value pairs: the 16-byte operation id
//! keys the version-1 record encoding from `operation`. `flush` forces the
//! memtable to disk so an acknowledged enqueue survives a process kill.
//! When the feature is disabled, the constructor and all methods return
//! explicit backend errors.

use std::path::Path;

use super::operation::{BackgroundOperation, OperationId};
use super::store::{OperationStore, StoreError};

#[cfg(feature = "rocksdb")]
use rocksdb::{Options, DB};

/// RocksDB-backed store for the background queue.
///
/// One database per queue instance, located under the enlistment's
/// `databases/` directory. The database may only be open in one process at
/// a time; RocksDB's own lock file enforces this.
pub struct RocksOperationStore {
    #[cfg(feature = "rocksdb")]
    db: Option<DB>,
}

impl std::fmt::Debug for RocksOperationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksOperationStore").finish()
    }
}

impl RocksOperationStore {
    /// Opens or creates the database at `path`.
    ///
    /// # Errors
    /// Returns a backend error when RocksDB cannot be opened or the feature
    /// is disabled.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        #[cfg(feature = "rocksdb")]
        {
            let mut opts = Options::default();
            opts.create_if_missing(true);
            let db = DB::open(&opts, path).map_err(|err| StoreError::backend(err.to_string()))?;
            Ok(Self { db: Some(db) })
        }

        #[cfg(not(feature = "rocksdb"))]
        {
            let _ = path;
            Err(StoreError::backend("rocksdb support not enabled"))
        }
    }

    #[cfg(feature = "rocksdb")]
    fn db(&self) -> Result<&DB, StoreError> {
        self.db.as_ref().ok_or(StoreError::Closed)
    }
}

#[cfg(feature = "rocksdb")]
impl OperationStore for RocksOperationStore {
    fn put(&mut self, id: OperationId, op: &BackgroundOperation) -> Result<(), StoreError> {
        let value = op.encode()?;
        self.db()?
            .put(id.as_bytes(), value)
            .map_err(|err| StoreError::backend(err.to_string()))
    }

    fn delete(&mut self, id: OperationId) -> Result<(), StoreError> {
        self.db()?
            .delete(id.as_bytes())
            .map_err(|err| StoreError::backend(err.to_string()))
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.db()?
            .flush()
            .map_err(|err| StoreError::backend(err.to_string()))
    }

    fn get(&self, id: OperationId) -> Result<Option<BackgroundOperation>, StoreError> {
        let value = self
            .db()?
            .get(id.as_bytes())
            .map_err(|err| StoreError::backend(err.to_string()))?;
        value
            .map(|bytes| BackgroundOperation::decode(id, &bytes))
            .transpose()
    }

    fn keys(&self) -> Result<Vec<OperationId>, StoreError> {
        let db = self.db()?;
        let mut out = Vec::new();
        for entry in db.iterator(rocksdb::IteratorMode::Start) {
            let (key, _value) = entry.map_err(|err| StoreError::backend(err.to_string()))?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::corrupt("store key is not 16 bytes"))?;
            out.push(OperationId::from_bytes(bytes));
        }
        Ok(out)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.flush()?;
        // Dropping the handle releases the RocksDB lock file so the same
        // database can be reopened by a new instance.
        self.db = None;
        Ok(())
    }
}

#[cfg(not(feature = "rocksdb"))]
impl OperationStore for RocksOperationStore {
    fn put(&mut self, _id: OperationId, _op: &BackgroundOperation) -> Result<(), StoreError> {
        Err(StoreError::backend("rocksdb support not enabled"))
    }

    fn delete(&mut self, _id: OperationId) -> Result<(), StoreError> {
        Err(StoreError::backend("rocksdb support not enabled"))
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        Err(StoreError::backend("rocksdb support not enabled"))
    }

    fn get(&self, _id: OperationId) -> Result<Option<BackgroundOperation>, StoreError> {
        Err(StoreError::backend("rocksdb support not enabled"))
    }

    fn keys(&self) -> Result<Vec<OperationId>, StoreError> {
        Err(StoreError::backend("rocksdb support not enabled"))
    }

    fn close(&mut self) -> Result<(), StoreError> {
        Err(StoreError::backend("rocksdb support not enabled"))
    }
}

#[cfg(all(test, feature = "rocksdb"))]
mod tests {
    use super::*;
    use crate::background::operation::OperationKind;

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let op = BackgroundOperation::new(OperationKind::FileOverwritten, "big/file.bin");

        {
            let mut store = RocksOperationStore::open(dir.path()).unwrap();
            store.put(op.id(), &op).unwrap();
            store.flush().unwrap();
            store.close().unwrap();
        }

        let store = RocksOperationStore::open(dir.path()).unwrap();
        assert_eq!(store.get(op.id()).unwrap(), Some(op.clone()));
        assert_eq!(store.keys().unwrap(), vec![op.id()]);
    }

    #[test]
    fn delete_then_reopen_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let op = BackgroundOperation::new(OperationKind::FileDeleted, "x");

        {
            let mut store = RocksOperationStore::open(dir.path()).unwrap();
            store.put(op.id(), &op).unwrap();
            store.flush().unwrap();
            store.delete(op.id()).unwrap();
            store.flush().unwrap();
            store.close().unwrap();
        }

        let store = RocksOperationStore::open(dir.path()).unwrap();
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn closed_store_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RocksOperationStore::open(dir.path()).unwrap();
        store.close().unwrap();

        assert!(matches!(store.flush(), Err(StoreError::Closed)));
    }
}
