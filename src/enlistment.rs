//! On-disk layout of a virtualized clone.
//!
//! An enlistment is a working tree whose contents are materialized on demand.
//! Alongside the Git object store it carries a `.gvfs` directory holding the
//! client's own state: embedded databases and scratch space for in-flight
//! downloads. This module only resolves and creates paths; it never reads
//! repository contents.
//!
//! ```text
//! <root>/
//!   .gvfs/
//!     databases/<name>/     durable operation stores
//!     tmp/                  temp packs before indexing
//!   <objects>/
//!     xx/yyyy...            loose objects
//!     pack/                 indexed packs
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the client state directory under the enlistment root.
pub const DOT_GVFS: &str = ".gvfs";

/// Resolved paths for one enlistment.
#[derive(Debug, Clone)]
pub struct Enlistment {
    root: PathBuf,
    dot_root: PathBuf,
    objects_dir: PathBuf,
}

impl Enlistment {
    /// Creates the layout for an enlistment rooted at `root` whose Git
    /// object store lives at `objects_dir`.
    ///
    /// No directories are created until a specific path is requested.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, objects_dir: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dot_root = root.join(DOT_GVFS);
        Self {
            root,
            dot_root,
            objects_dir: objects_dir.into(),
        }
    }

    /// The enlistment root (the virtualized working tree).
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `.gvfs` client state directory.
    #[must_use]
    pub fn dot_root(&self) -> &Path {
        &self.dot_root
    }

    /// The Git loose/pack object store root.
    #[must_use]
    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// The canonical pack directory under the object store.
    #[must_use]
    pub fn pack_dir(&self) -> PathBuf {
        self.objects_dir.join("pack")
    }

    /// Returns the durable database directory for `name`, creating it.
    ///
    /// # Errors
    /// Returns the underlying I/O error when the directory cannot be created.
    pub fn database_dir(&self, name: &str) -> io::Result<PathBuf> {
        let dir = self.dot_root.join("databases").join(name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Returns the temp directory for in-flight packs, creating it.
    ///
    /// Temp packs are written here and renamed into `pack_dir` only after
    /// indexing succeeds, so a crashed download never leaves a partial pack
    /// in the canonical directory.
    ///
    /// # Errors
    /// Returns the underlying I/O error when the directory cannot be created.
    pub fn temp_pack_dir(&self) -> io::Result<PathBuf> {
        let dir = self.dot_root.join("tmp");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}
