//! Path normalization and containment.
//!
//! Every caller-supplied relative path goes through [`normalize_relative`] and
//! [`resolve_in_root`] before it touches the filesystem.

use crate::error::StorageError;
use std::path::{Component, Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

/// Normalize a caller-supplied relative path to NFC, `/`-separated form.
///
/// Rejects empty paths, absolute paths, drive prefixes, NUL bytes and `..` components. `.` and
/// empty segments are dropped.
pub fn normalize_relative(raw: &str) -> Result<String, StorageError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StorageError::InvalidPath("empty path".to_string()));
    }
    if trimmed.contains('\0') {
        return Err(StorageError::SandboxViolation(format!("{trimmed:?}")));
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') || has_drive_prefix(trimmed) {
        return Err(StorageError::SandboxViolation(trimmed.to_string()));
    }

    let normalized: String = trimmed.nfc().collect();
    let mut parts = Vec::new();
    for segment in normalized.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(StorageError::SandboxViolation(trimmed.to_string())),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(StorageError::InvalidPath(format!(
            "path has no file component: {trimmed}"
        )));
    }
    Ok(parts.join("/"))
}

fn has_drive_prefix(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Resolve a relative path inside `root`, refusing anything that could land outside it.
///
/// The path does not need to exist. Every existing component between `root` and the target must
/// be a real directory (or the final file), never a symlink, and the deepest existing ancestor
/// must canonicalize to a location under the canonical root.
pub fn resolve_in_root(root: &Path, raw: &str) -> Result<PathBuf, StorageError> {
    let rel = normalize_relative(raw)?;
    let target = root.join(&rel);

    let mut current = root.to_path_buf();
    for component in Path::new(&rel).components() {
        let Component::Normal(name) = component else {
            return Err(StorageError::SandboxViolation(raw.to_string()));
        };
        current.push(name);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(StorageError::SandboxViolation(format!(
                    "{raw} traverses a symlink"
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(StorageError::read(&current, e)),
        }
    }

    if root.exists() {
        let canonical_root =
            dunce::canonicalize(root).map_err(|e| StorageError::read(root, e))?;
        let mut ancestor = target.clone();
        while !ancestor.exists() {
            if !ancestor.pop() {
                break;
            }
        }
        let canonical_ancestor =
            dunce::canonicalize(&ancestor).map_err(|e| StorageError::read(&ancestor, e))?;
        if !canonical_ancestor.starts_with(&canonical_root) {
            return Err(StorageError::SandboxViolation(raw.to_string()));
        }
    }

    Ok(target)
}

/// Relative `/`-separated form of `path` under `root`, if it is under `root`.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().nfc().collect::<String>()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
