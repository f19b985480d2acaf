//! Workbench store
//!
//! Owns the on-disk layout of every workbench:
//!
//! ```text
//! workbenches/<id>/published/...      approved tree
//! workbenches/<id>/draft/...          present iff a draft exists
//! workbenches/<id>/meta/...           manifest, draft record, checkpoints, logs
//! ```
//!
//! All file mutations go through [`atomic::write_atomic`] and all caller paths through
//! [`path::resolve_in_root`].

pub mod atomic;
pub mod kind;
pub mod path;
pub mod walker;

use crate::error::StorageError;
use crate::types::{now_rfc3339, WorkbenchId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub use kind::FileKind;

/// Manifest schema written to `meta/files.json`.
pub const MANIFEST_SCHEMA_VERSION: u32 = 2;

/// Limits on what a workbench may hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLimits {
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// Bytes per file
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_max_files() -> usize {
    10
}

fn default_max_file_size() -> u64 {
    25 * 1024 * 1024
}

impl Default for FileLimits {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_file_size: default_max_file_size(),
        }
    }
}

/// Which tree of a workbench an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tree {
    Published,
    Draft,
}

/// Paths of one workbench. Constructed only from a validated [`WorkbenchId`].
#[derive(Debug, Clone)]
pub struct WorkbenchPaths {
    root: PathBuf,
}

impl WorkbenchPaths {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn published(&self) -> PathBuf {
        self.root.join("published")
    }

    pub fn draft(&self) -> PathBuf {
        self.root.join("draft")
    }

    pub fn tree(&self, tree: Tree) -> PathBuf {
        match tree {
            Tree::Published => self.published(),
            Tree::Draft => self.draft(),
        }
    }

    pub fn draft_staging(&self) -> PathBuf {
        self.root.join("draft.tmp")
    }

    pub fn published_prev(&self) -> PathBuf {
        self.root.join("published.prev")
    }

    pub fn published_restore_tmp(&self) -> PathBuf {
        self.root.join("published.restore_tmp")
    }

    pub fn meta(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn workbench_json(&self) -> PathBuf {
        self.meta().join("workbench.json")
    }

    pub fn files_json(&self) -> PathBuf {
        self.meta().join("files.json")
    }

    pub fn draft_json(&self) -> PathBuf {
        self.meta().join("draft.json")
    }

    pub fn consent_json(&self) -> PathBuf {
        self.meta().join("egress_consent.json")
    }

    pub fn conversation(&self) -> PathBuf {
        self.meta().join("conversation.jsonl")
    }

    pub fn egress_events(&self) -> PathBuf {
        self.meta().join("egress_events.jsonl")
    }

    pub fn restore_marker(&self) -> PathBuf {
        self.meta().join("restore.json")
    }

    pub fn meta_restore_tmp(&self) -> PathBuf {
        self.meta().join("restore_tmp")
    }

    pub fn checkpoints(&self) -> PathBuf {
        self.meta().join("checkpoints")
    }

    pub fn revisions(&self) -> PathBuf {
        self.meta().join("workshop").join("draft_revisions")
    }

    pub fn batches(&self) -> PathBuf {
        self.meta().join("workshop").join("batches")
    }
}

/// `meta/workbench.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkbenchMeta {
    pub id: WorkbenchId,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

/// One file of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub kind: FileKind,
    pub mime: String,
    pub opaque: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}

impl FileEntry {
    fn describe(path: String, size: u64, modified_at: Option<String>) -> Self {
        let kind = FileKind::from_path(&path);
        Self {
            mime: kind.mime(&path).to_string(),
            opaque: kind.is_opaque(),
            kind,
            path,
            size,
            modified_at,
        }
    }
}

/// `meta/files.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub files: Vec<FileEntry>,
}

/// Validated `add_files` input: each source with its published name.
#[derive(Debug)]
pub struct AddPlan {
    files: Vec<(PathBuf, String)>,
}

/// Filesystem-backed store for all workbenches under one root.
#[derive(Debug, Clone)]
pub struct WorkbenchStore {
    root: PathBuf,
    limits: FileLimits,
}

impl WorkbenchStore {
    pub fn new(root: impl Into<PathBuf>, limits: FileLimits) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StorageError::write(&root, e))?;
        Ok(Self { root, limits })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> &FileLimits {
        &self.limits
    }

    pub fn paths(&self, id: &WorkbenchId) -> WorkbenchPaths {
        WorkbenchPaths {
            root: self.root.join(id.as_str()),
        }
    }

    pub fn exists(&self, id: &WorkbenchId) -> bool {
        self.paths(id).workbench_json().is_file()
    }

    /// Paths of an existing workbench.
    pub fn require(&self, id: &WorkbenchId) -> Result<WorkbenchPaths, StorageError> {
        if !self.exists(id) {
            return Err(StorageError::NotFound(format!("workbench {id}")));
        }
        Ok(self.paths(id))
    }

    pub fn create(&self, name: &str) -> Result<WorkbenchMeta, StorageError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StorageError::Rejected("workbench name is required".to_string()));
        }
        let id = WorkbenchId::generate();
        let paths = self.paths(&id);
        for dir in [paths.published(), paths.meta()] {
            fs::create_dir_all(&dir).map_err(|e| StorageError::write(&dir, e))?;
        }
        let now = now_rfc3339();
        let meta = WorkbenchMeta {
            id: id.clone(),
            name: name.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };
        atomic::write_json(&paths.workbench_json(), &meta)?;
        self.rebuild_manifest(&id)?;
        info!(workbench_id = %id, "Workbench created");
        Ok(meta)
    }

    pub fn open(&self, id: &WorkbenchId) -> Result<WorkbenchMeta, StorageError> {
        let path = self.paths(id).workbench_json();
        atomic::read_json(&path)?.ok_or_else(|| StorageError::NotFound(format!("workbench {id}")))
    }

    /// Every workbench with a readable record, sorted by creation time.
    pub fn list(&self) -> Result<Vec<WorkbenchMeta>, StorageError> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| StorageError::read(&self.root, e))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(id) = WorkbenchId::parse(&name) else {
                continue;
            };
            if let Ok(meta) = self.open(&id) {
                out.push(meta);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Remove a whole workbench directory.
    pub fn delete(&self, id: &WorkbenchId) -> Result<(), StorageError> {
        let paths = self.require(id)?;
        let root = paths.root();
        let meta = fs::symlink_metadata(root).map_err(|e| StorageError::read(root, e))?;
        if !meta.is_dir() || root.parent() != Some(self.root.as_path()) {
            return Err(StorageError::SandboxViolation(root.display().to_string()));
        }
        fs::remove_dir_all(root).map_err(|e| StorageError::write(root, e))?;
        info!(workbench_id = %id, "Workbench deleted");
        Ok(())
    }

    pub fn touch(&self, id: &WorkbenchId) -> Result<(), StorageError> {
        let mut meta = self.open(id)?;
        meta.updated_at = now_rfc3339();
        atomic::write_json(&self.paths(id).workbench_json(), &meta)
    }

    pub fn read(&self, id: &WorkbenchId, tree: Tree, rel: &str) -> Result<Vec<u8>, StorageError> {
        let root = self.paths(id).tree(tree);
        let path = path::resolve_in_root(&root, rel)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(rel.to_string()))
            }
            Err(e) => Err(StorageError::read(&path, e)),
        }
    }

    pub fn write_atomic(
        &self,
        id: &WorkbenchId,
        tree: Tree,
        rel: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let root = self.existing_tree(id, tree)?;
        let path = path::resolve_in_root(&root, rel)?;
        if path.is_dir() {
            return Err(StorageError::Rejected(format!("{rel} is a directory")));
        }
        atomic::write_atomic(&path, bytes)?;
        debug!(workbench_id = %id, ?tree, path = rel, bytes = bytes.len(), "File written");
        Ok(())
    }

    pub fn delete_file(&self, id: &WorkbenchId, tree: Tree, rel: &str) -> Result<(), StorageError> {
        let root = self.existing_tree(id, tree)?;
        let path = path::resolve_in_root(&root, rel)?;
        if !path.is_file() {
            return Err(StorageError::NotFound(rel.to_string()));
        }
        fs::remove_file(&path).map_err(|e| StorageError::write(&path, e))?;
        debug!(workbench_id = %id, ?tree, path = rel, "File deleted");
        Ok(())
    }

    pub fn rename(
        &self,
        id: &WorkbenchId,
        tree: Tree,
        from: &str,
        to: &str,
    ) -> Result<(), StorageError> {
        let root = self.existing_tree(id, tree)?;
        let source = path::resolve_in_root(&root, from)?;
        let target = path::resolve_in_root(&root, to)?;
        if !source.is_file() {
            return Err(StorageError::NotFound(from.to_string()));
        }
        if target.exists() {
            return Err(StorageError::AlreadyExists(to.to_string()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::write(parent, e))?;
        }
        fs::rename(&source, &target).map_err(|e| StorageError::write(&target, e))?;
        debug!(workbench_id = %id, ?tree, from, to, "File renamed");
        Ok(())
    }

    pub fn list_files(&self, id: &WorkbenchId, tree: Tree) -> Result<Vec<FileEntry>, StorageError> {
        let root = self.paths(id).tree(tree);
        let mut out = Vec::new();
        for entry in walker::walk(&root, &[])? {
            if let walker::Entry::File { rel, path, size } = entry {
                let modified_at = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
                out.push(FileEntry::describe(rel, size, modified_at));
            }
        }
        Ok(out)
    }

    /// Describe one file of a tree.
    pub fn file_info(
        &self,
        id: &WorkbenchId,
        tree: Tree,
        rel: &str,
    ) -> Result<FileEntry, StorageError> {
        let root = self.paths(id).tree(tree);
        let path = path::resolve_in_root(&root, rel)?;
        let meta = fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(rel.to_string())
            } else {
                StorageError::read(&path, e)
            }
        })?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(rel.to_string()));
        }
        let normalized = path::normalize_relative(rel)?;
        let modified_at = meta
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
        Ok(FileEntry::describe(normalized, meta.len(), modified_at))
    }

    /// Current manifest of Published, rebuilding it when missing.
    pub fn manifest(&self, id: &WorkbenchId) -> Result<Manifest, StorageError> {
        let paths = self.require(id)?;
        match atomic::read_json::<Manifest>(&paths.files_json())? {
            Some(manifest) => Ok(manifest),
            None => self.rebuild_manifest(id),
        }
    }

    pub fn rebuild_manifest(&self, id: &WorkbenchId) -> Result<Manifest, StorageError> {
        let manifest = Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            files: self.list_files(id, Tree::Published)?,
        };
        atomic::write_json(&self.paths(id).files_json(), &manifest)?;
        Ok(manifest)
    }

    /// Copy external files into Published.
    ///
    /// Every source is checked before anything is copied: regular files only, unique names, the
    /// per-file size limit, and the per-workbench file count.
    pub fn add_files(
        &self,
        id: &WorkbenchId,
        sources: &[PathBuf],
    ) -> Result<Vec<FileEntry>, StorageError> {
        let plan = self.plan_add(id, sources)?;
        self.commit_add(id, plan)
    }

    /// Validate `sources` against the published tree without copying anything.
    pub fn plan_add(&self, id: &WorkbenchId, sources: &[PathBuf]) -> Result<AddPlan, StorageError> {
        let paths = self.require(id)?;
        if paths.draft().exists() {
            return Err(StorageError::Rejected(
                "files cannot be added while a draft exists".to_string(),
            ));
        }
        if sources.is_empty() {
            return Err(StorageError::Rejected("no files given".to_string()));
        }

        let existing = self.list_files(id, Tree::Published)?;
        if existing.len() + sources.len() > self.limits.max_files {
            return Err(StorageError::Rejected(format!(
                "workbench file limit is {}",
                self.limits.max_files
            )));
        }

        let mut names: HashSet<String> = existing.iter().map(|f| f.path.clone()).collect();
        let mut planned = Vec::with_capacity(sources.len());
        for source in sources {
            let meta = fs::symlink_metadata(source).map_err(|e| StorageError::read(source, e))?;
            if !meta.is_file() {
                return Err(StorageError::Rejected(format!(
                    "{} is not a regular file",
                    source.display()
                )));
            }
            if meta.len() > self.limits.max_file_size {
                return Err(StorageError::Rejected(format!(
                    "{} exceeds the {} byte limit",
                    source.display(),
                    self.limits.max_file_size
                )));
            }
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| StorageError::InvalidPath(source.display().to_string()))?;
            let name = path::normalize_relative(&name)?;
            if !names.insert(name.clone()) {
                return Err(StorageError::AlreadyExists(name));
            }
            planned.push((source.clone(), name));
        }
        Ok(AddPlan { files: planned })
    }

    /// Copy the files of a validated plan into the published tree.
    pub fn commit_add(&self, id: &WorkbenchId, plan: AddPlan) -> Result<Vec<FileEntry>, StorageError> {
        let published = self.require(id)?.published();
        let mut added = Vec::with_capacity(plan.files.len());
        for (source, name) in plan.files {
            let target = path::resolve_in_root(&published, &name)?;
            atomic::copy_atomic(&source, &target)?;
            added.push(self.file_info(id, Tree::Published, &name)?);
        }
        self.rebuild_manifest(id)?;
        self.touch(id)?;
        info!(workbench_id = %id, count = added.len(), "Files added");
        Ok(added)
    }

    fn existing_tree(&self, id: &WorkbenchId, tree: Tree) -> Result<PathBuf, StorageError> {
        let root = self.paths(id).tree(tree);
        if !root.is_dir() {
            return Err(StorageError::NotFound(format!("{tree:?} tree of {id}")));
        }
        Ok(root)
    }
}
