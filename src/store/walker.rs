//! Tree walker used by listings, snapshots and fingerprints.

use super::atomic::is_temp_name;
use super::path::relative_to;
use crate::error::StorageError;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Entry under a tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File {
        rel: String,
        path: PathBuf,
        size: u64,
    },
    Directory {
        rel: String,
        path: PathBuf,
    },
}

/// Walk `root` in sorted order.
///
/// Symlinks are neither followed nor reported. Temp files from interrupted atomic writes are
/// skipped, and so is anything whose first path segment is in `exclude`. A missing root yields
/// no entries.
pub fn walk(root: &Path, exclude: &[&str]) -> Result<Vec<Entry>, StorageError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            if e.depth() == 1 && exclude.iter().any(|x| *x == name) {
                return false;
            }
            !is_temp_name(&name)
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            StorageError::read(
                path,
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk failed")),
            )
        })?;
        if entry.depth() == 0 {
            continue;
        }
        let Some(rel) = relative_to(root, entry.path()) else {
            continue;
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            entries.push(Entry::Directory {
                rel,
                path: entry.path().to_path_buf(),
            });
        } else if file_type.is_file() {
            let size = entry
                .metadata()
                .map_err(|e| {
                    StorageError::read(
                        entry.path(),
                        e.into_io_error().unwrap_or_else(|| {
                            std::io::Error::new(std::io::ErrorKind::Other, "metadata failed")
                        }),
                    )
                })?
                .len();
            entries.push(Entry::File {
                rel,
                path: entry.path().to_path_buf(),
                size,
            });
        }
    }
    Ok(entries)
}

/// Only the files of [`walk`], as `(rel, size)`.
pub fn files(root: &Path, exclude: &[&str]) -> Result<Vec<(String, u64)>, StorageError> {
    Ok(walk(root, exclude)?
        .into_iter()
        .filter_map(|e| match e {
            Entry::File { rel, size, .. } => Some((rel, size)),
            Entry::Directory { .. } => None,
        })
        .collect())
}

/// Content fingerprint of a tree: blake3 over sorted relative paths and file contents.
pub fn fingerprint(root: &Path) -> Result<String, StorageError> {
    let mut hasher = blake3::Hasher::new();
    for entry in walk(root, &[])? {
        if let Entry::File { rel, path, .. } = entry {
            let bytes = std::fs::read(&path).map_err(|e| StorageError::read(&path, e))?;
            hasher.update(rel.as_bytes());
            hasher.update(&[0]);
            hasher.update(blake3::hash(&bytes).as_bytes());
        }
    }
    Ok(hasher.finalize().to_hex().to_string())
}
