//! Atomic loose-object writes.
//!
//! Objects land in the store under `objects/xx/yyyy…` (first hex byte as the
//! fan-out directory). A write streams into a uniquely named temp file in the
//! object store root and renames it into place, so readers never observe a
//! partial object and a crashed download leaves only temp debris.
//!
//! Object content is immutable by address: if the target path already
//! exists, the write is skipped and the temp file removed.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::object_id::OidBytes;

/// Writes loose objects into a Git object store.
#[derive(Debug)]
pub struct LooseObjectStore {
    objects_dir: PathBuf,
    temp_seq: AtomicU64,
}

impl LooseObjectStore {
    /// Creates a store rooted at `objects_dir`.
    ///
    /// The directory itself must exist; fan-out subdirectories are created
    /// on demand.
    #[must_use]
    pub fn new(objects_dir: impl Into<PathBuf>) -> Self {
        Self {
            objects_dir: objects_dir.into(),
            temp_seq: AtomicU64::new(0),
        }
    }

    /// The object store root.
    #[must_use]
    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// Returns the canonical path for `oid`.
    #[must_use]
    pub fn object_path(&self, oid: &OidBytes) -> PathBuf {
        let hex = oid.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    /// Returns true if `oid` is already present as a loose object.
    #[must_use]
    pub fn contains(&self, oid: &OidBytes) -> bool {
        self.object_path(oid).is_file()
    }

    /// Streams `body` into the store under `oid`, atomically.
    ///
    /// Returns the number of bytes written (zero when the object already
    /// existed and the write was skipped).
    ///
    /// # Errors
    /// Propagates I/O failures; on error the canonical path is untouched.
    pub fn write_object(&self, oid: &OidBytes, body: &mut dyn Read) -> io::Result<u64> {
        let target = self.object_path(oid);
        if target.is_file() {
            return Ok(0);
        }
        if let Some(fanout) = target.parent() {
            fs::create_dir_all(fanout)?;
        }

        let temp = self.next_temp_path();
        let bytes = {
            let mut file = File::create(&temp)?;
            let copied = io::copy(body, &mut file)?;
            file.sync_all()?;
            copied
        };

        match fs::rename(&temp, &target) {
            Ok(()) => Ok(bytes),
            Err(err) => {
                let _ = fs::remove_file(&temp);
                // Lost the race to another writer: same address, same bytes.
                if target.is_file() {
                    Ok(0)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Convenience wrapper over `write_object` for in-memory bodies.
    ///
    /// # Errors
    /// Propagates I/O failures; on error the canonical path is untouched.
    pub fn write_object_bytes(&self, oid: &OidBytes, body: &[u8]) -> io::Result<u64> {
        self.write_object(oid, &mut io::Cursor::new(body))
    }

    fn next_temp_path(&self) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        self.objects_dir
            .join(format!("tmp_obj_{}_{}", process::id(), seq))
    }
}
