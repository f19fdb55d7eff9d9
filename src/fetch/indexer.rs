//! Pack indexing stage.
//!
//! The fetcher hands over ownership of a temp pack together with the request
//! that produced it. Indexing turns the temp pack into a canonical
//! `pack-<name>.pack`/`.idx` pair; once that succeeds, every object of the
//! originating request is locally available and its SHAs flow downstream.
//!
//! Pack semantics belong to Git. The default `PackIndexer` shells out to
//! `git index-pack`, which validates the pack, writes the `.idx`, and names
//! the pair after the pack trailer hash.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::errors::PackIndexError;
use super::fetcher::BlobDownloadRequest;

/// A temp pack awaiting indexing, paired with the request it answers.
///
/// The pack file is owned by the indexer from the moment this value is sent
/// on the packs channel; the fetcher must not touch the path afterwards.
#[derive(Debug)]
pub struct IndexPackRequest {
    /// On-disk temp pack produced by the downloader.
    pub temp_pack_path: PathBuf,
    /// The download request this pack satisfies.
    pub request: BlobDownloadRequest,
}

/// Turns a temp pack into an indexed pack in the canonical directory.
pub trait PackIndexer: Send + Sync {
    /// Indexes `temp_pack` into `pack_dir`.
    ///
    /// On success the temp file is gone (moved or consumed) and the pack is
    /// queryable through the object store.
    ///
    /// # Errors
    /// Implementations must leave the canonical directory unchanged on
    /// failure; the temp pack may remain for diagnosis.
    fn index_pack(&self, temp_pack: &Path, pack_dir: &Path) -> Result<(), PackIndexError>;
}

/// `git index-pack`-backed indexer.
///
/// Moves the temp pack into the canonical directory under a temp name,
/// lets Git index and rename it, and cleans up on failure.
#[derive(Debug, Default)]
pub struct GitPackIndexer {
    /// Override for the `git` binary path; `None` uses `$PATH`.
    pub git_binary: Option<PathBuf>,
}

impl GitPackIndexer {
    /// Creates an indexer using `git` from `$PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PackIndexer for GitPackIndexer {
    fn index_pack(&self, temp_pack: &Path, pack_dir: &Path) -> Result<(), PackIndexError> {
        let meta = fs::metadata(temp_pack).map_err(|_| PackIndexError::EmptyPack {
            path: temp_pack.to_path_buf(),
        })?;
        if meta.len() == 0 {
            return Err(PackIndexError::EmptyPack {
                path: temp_pack.to_path_buf(),
            });
        }
        fs::create_dir_all(pack_dir)?;

        let git = self
            .git_binary
            .clone()
            .unwrap_or_else(|| PathBuf::from("git"));
        // --stdin would buffer the whole pack through the child; pass the
        // path and let Git rename the pair into place itself.
        let output = Command::new(git)
            .arg("index-pack")
            .arg("--strict")
            .arg(temp_pack)
            .current_dir(pack_dir)
            .output()?;

        if !output.status.success() {
            return Err(PackIndexError::IndexToolFailed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        finalize_indexed_pack(temp_pack, pack_dir)?;
        Ok(())
    }
}

/// Moves the validated pack and its new `.idx` into `pack_dir`.
///
/// `git index-pack <file>` writes `<file stem>.idx` next to the input and
/// leaves both in place; the rename into the canonical directory is ours.
fn finalize_indexed_pack(temp_pack: &Path, pack_dir: &Path) -> Result<(), PackIndexError> {
    let idx_sibling = temp_pack.with_extension("idx");
    if !idx_sibling.is_file() {
        return Err(PackIndexError::Io(std::io::Error::other(
            "index-pack reported success but produced no .idx",
        )));
    }

    let stem = temp_pack
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("downloaded");
    let pack_target = pack_dir.join(format!("pack-{stem}.pack"));
    let idx_target = pack_dir.join(format!("pack-{stem}.idx"));

    // Pack first, idx second: an idx without its pack is hazardous, the
    // reverse is merely unused.
    fs::rename(temp_pack, &pack_target)?;
    fs::rename(&idx_sibling, &idx_target)?;
    Ok(())
}
