//! Atomic-replace writes.
//!
//! Bytes always land in a fresh temp file in the target's directory, are fsynced, and are renamed
//! over the target. An existing file is never opened for writing, so a hardlinked inode shared
//! with a snapshot is never modified.

use crate::error::StorageError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Marker embedded in every temp file name.
pub const TEMP_MARKER: &str = ".tmp-";

/// True for temp files left behind by an interrupted [`write_atomic`].
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    target.with_file_name(format!(
        ".{name}{TEMP_MARKER}{}-{seq}",
        std::process::id()
    ))
}

/// Write `bytes` to `target` via temp file, fsync and rename.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = target
        .parent()
        .ok_or_else(|| StorageError::InvalidPath(format!("{target:?} has no parent")))?;
    fs::create_dir_all(parent).map_err(|e| StorageError::write(parent, e))?;

    let temp_path = temp_path_for(target);
    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, target)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(StorageError::write(target, e));
    }

    sync_dir(parent);
    Ok(())
}

/// Copy a file into `target` with the same temp-then-rename discipline.
pub fn copy_atomic(source: &Path, target: &Path) -> Result<u64, StorageError> {
    let parent = target
        .parent()
        .ok_or_else(|| StorageError::InvalidPath(format!("{target:?} has no parent")))?;
    fs::create_dir_all(parent).map_err(|e| StorageError::write(parent, e))?;

    let temp_path = temp_path_for(target);
    let result = (|| {
        let copied = fs::copy(source, &temp_path)?;
        File::open(&temp_path)?.sync_all()?;
        fs::rename(&temp_path, target)?;
        Ok::<u64, std::io::Error>(copied)
    })();

    match result {
        Ok(copied) => {
            sync_dir(parent);
            Ok(copied)
        }
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            Err(StorageError::write(target, e))
        }
    }
}

/// Best-effort fsync of a directory so a completed rename survives a crash.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}

pub fn write_json<T: Serialize>(target: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StorageError::Corrupt {
        path: target.to_path_buf(),
        message: e.to_string(),
    })?;
    write_atomic(target, &bytes)
}

/// Read a JSON record; a missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::read(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StorageError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Append one JSON line; used for the append-only logs.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::write(parent, e))?;
    }
    let mut line = serde_json::to_vec(value).map_err(|e| StorageError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StorageError::write(path, e))?;
    file.write_all(&line)
        .and_then(|_| file.sync_data())
        .map_err(|e| StorageError::write(path, e))
}

/// Read every parseable line of a JSONL file, skipping malformed ones.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::read(path, e)),
    };
    Ok(data
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
