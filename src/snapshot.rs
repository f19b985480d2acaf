//! Snapshot engine.
//!
//! Materializes one directory tree from another. Each file is hardlinked when the filesystem
//! allows it and copied otherwise; a failure for one file falls back per file, never per tree.
//! Because every later write goes through [`crate::store::atomic::write_atomic`], a shared inode
//! is never edited in place and the two trees stay logically independent.

use crate::error::StorageError;
use crate::store::walker::{self, Entry};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Try hardlinks before copying
    #[serde(default = "default_hardlinks")]
    pub hardlinks: bool,
}

fn default_hardlinks() -> bool {
    true
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            hardlinks: default_hardlinks(),
        }
    }
}

/// Counters for one materialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub files: u64,
    pub bytes: u64,
    pub linked: u64,
    pub copied: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Snapshotter {
    hardlinks: bool,
}

impl Snapshotter {
    pub fn new(config: &SnapshotConfig) -> Self {
        Self {
            hardlinks: config.hardlinks,
        }
    }

    pub fn copy_only() -> Self {
        Self { hardlinks: false }
    }

    /// Build `dest` as a snapshot of `source`, skipping top-level names in `exclude`.
    ///
    /// `source` must be an existing directory and `dest` must not exist. On failure the partial `dest` is removed and the error maps to
    /// `DISK_FULL` or `FILE_WRITE_FAILED`.
    pub fn materialize(
        &self,
        source: &Path,
        dest: &Path,
        exclude: &[&str],
    ) -> Result<SnapshotStats, StorageError> {
        if !source.is_dir() {
            return Err(StorageError::NotFound(source.display().to_string()));
        }
        if dest.exists() {
            return Err(StorageError::AlreadyExists(dest.display().to_string()));
        }
        fs::create_dir_all(dest).map_err(|e| StorageError::write(dest, e))?;

        match self.fill(source, dest, exclude) {
            Ok(stats) => {
                debug!(
                    source = %source.display(),
                    dest = %dest.display(),
                    files = stats.files,
                    linked = stats.linked,
                    copied = stats.copied,
                    "Snapshot materialized"
                );
                Ok(stats)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(dest) {
                    warn!(dest = %dest.display(), error = %cleanup, "Failed to remove partial snapshot");
                }
                Err(e)
            }
        }
    }

    fn fill(
        &self,
        source: &Path,
        dest: &Path,
        exclude: &[&str],
    ) -> Result<SnapshotStats, StorageError> {
        let mut stats = SnapshotStats::default();
        for entry in walker::walk(source, exclude)? {
            match entry {
                Entry::Directory { rel, .. } => {
                    let target = dest.join(&rel);
                    fs::create_dir_all(&target).map_err(|e| StorageError::write(&target, e))?;
                }
                Entry::File { rel, path, size } => {
                    let target = dest.join(&rel);
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent).map_err(|e| StorageError::write(parent, e))?;
                    }
                    if self.place(&path, &target)? {
                        stats.linked += 1;
                    } else {
                        stats.copied += 1;
                    }
                    stats.files += 1;
                    stats.bytes += size;
                }
            }
        }
        Ok(stats)
    }

    /// Returns true when the file was hardlinked, false when copied.
    fn place(&self, source: &Path, target: &Path) -> Result<bool, StorageError> {
        if self.hardlinks {
            match fs::hard_link(source, target) {
                Ok(()) => return Ok(true),
                Err(e) => debug!(
                    source = %source.display(),
                    error = %e,
                    "Hardlink failed, copying"
                ),
            }
        }
        fs::copy(source, target).map_err(|e| StorageError::write(target, e))?;
        Ok(false)
    }
}

/// Snapshot a single file with the same hardlink-or-copy rule.
pub fn snapshot_file(source: &Path, target: &Path) -> Result<(), StorageError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::write(parent, e))?;
    }
    if fs::hard_link(source, target).is_ok() {
        return Ok(());
    }
    fs::copy(source, target)
        .map(|_| ())
        .map_err(|e| StorageError::write(target, e))
}
