//! Checkpoint store
//!
//! Immutable snapshots of Published plus the restorable meta records, under
//! `meta/checkpoints/`:
//!
//! ```text
//! <id>.json                      visible iff present; written last, deleted first
//! <id>/published_snapshot/...
//! <id>/meta_snapshot/{workbench.json, files.json, conversation.jsonl, egress_consent.json}
//! ```

use crate::conversation::{ConversationEntry, ConversationLog};
use crate::error::StorageError;
use crate::snapshot::{snapshot_file, Snapshotter};
use crate::store::{atomic, walker, WorkbenchPaths, WorkbenchStore};
use crate::types::{new_id, now_rfc3339, WorkbenchId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Meta records captured by every checkpoint and replaced on restore.
pub const RESTORABLE_META: &[&str] = &[
    "workbench.json",
    "files.json",
    "conversation.jsonl",
    "egress_consent.json",
];

const PUBLISHED_SNAPSHOT: &str = "published_snapshot";
const META_SNAPSHOT: &str = "meta_snapshot";
const STAGING_SUFFIX: &str = ".staging";

/// How many checkpoints of each prunable reason survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default = "default_max_auto")]
    pub max_auto: usize,
    #[serde(default = "default_max_manual")]
    pub max_manual: usize,
}

fn default_max_auto() -> usize {
    200
}

fn default_max_manual() -> usize {
    50
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_auto: default_max_auto(),
            max_manual: default_max_manual(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Manual,
    Publish,
    PreRestore,
    Auto,
}

impl CheckpointReason {
    /// Publish and pre-restore checkpoints are never pruned.
    fn retention_limit(&self, policy: &RetentionPolicy) -> Option<usize> {
        match self {
            CheckpointReason::Auto => Some(policy.max_auto),
            CheckpointReason::Manual => Some(policy.max_manual),
            CheckpointReason::Publish | CheckpointReason::PreRestore => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub files: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub reason: CheckpointReason,
    #[serde(default)]
    pub description: String,
    pub created_at: String,
    pub stats: CheckpointStats,
}

/// `meta/restore.json`, present only while a restore is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreMarker {
    pub checkpoint_id: String,
    pub pre_restore_checkpoint_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub checkpoint_id: String,
    pub restored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_restore_checkpoint_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    store: WorkbenchStore,
    snapshotter: Snapshotter,
    retention: RetentionPolicy,
}

impl CheckpointStore {
    pub fn new(store: WorkbenchStore, snapshotter: Snapshotter, retention: RetentionPolicy) -> Self {
        Self {
            store,
            snapshotter,
            retention,
        }
    }

    fn record_path(paths: &WorkbenchPaths, checkpoint_id: &str) -> PathBuf {
        paths.checkpoints().join(format!("{checkpoint_id}.json"))
    }

    fn snapshot_dir(paths: &WorkbenchPaths, checkpoint_id: &str) -> PathBuf {
        paths.checkpoints().join(checkpoint_id)
    }

    /// Snapshot Published and the restorable meta records, then apply retention.
    pub fn create(
        &self,
        id: &WorkbenchId,
        reason: CheckpointReason,
        description: &str,
    ) -> Result<Checkpoint, StorageError> {
        let paths = self.store.require(id)?;
        let checkpoint_id = new_id("cp");
        let final_dir = Self::snapshot_dir(&paths, &checkpoint_id);
        let staging = paths
            .checkpoints()
            .join(format!("{checkpoint_id}{STAGING_SUFFIX}"));
        fs::create_dir_all(paths.checkpoints())
            .map_err(|e| StorageError::write(paths.checkpoints(), e))?;

        let stats = match self.stage(&paths, &staging) {
            Ok(stats) => stats,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&staging, &final_dir) {
            let _ = fs::remove_dir_all(&staging);
            return Err(StorageError::write(&final_dir, e));
        }

        let checkpoint = Checkpoint {
            checkpoint_id: checkpoint_id.clone(),
            reason,
            description: description.to_string(),
            created_at: now_rfc3339(),
            stats: CheckpointStats {
                files: stats.files,
                total_bytes: stats.bytes,
            },
        };
        if let Err(e) = atomic::write_json(&Self::record_path(&paths, &checkpoint_id), &checkpoint)
        {
            let _ = fs::remove_dir_all(&final_dir);
            return Err(e);
        }
        info!(
            workbench_id = %id,
            checkpoint_id = %checkpoint_id,
            reason = ?reason,
            files = stats.files,
            "Checkpoint created"
        );

        if let Err(e) = self.prune(id) {
            warn!(workbench_id = %id, error = %e, "Checkpoint pruning failed");
        }
        Ok(checkpoint)
    }

    fn stage(
        &self,
        paths: &WorkbenchPaths,
        staging: &Path,
    ) -> Result<crate::snapshot::SnapshotStats, StorageError> {
        fs::create_dir_all(staging).map_err(|e| StorageError::write(staging, e))?;
        let published = paths.published();
        if !published.exists() {
            fs::create_dir_all(&published).map_err(|e| StorageError::write(&published, e))?;
        }
        let stats = self.snapshotter.materialize(
            &paths.published(),
            &staging.join(PUBLISHED_SNAPSHOT),
            &[],
        )?;
        let meta_dir = staging.join(META_SNAPSHOT);
        fs::create_dir_all(&meta_dir).map_err(|e| StorageError::write(&meta_dir, e))?;
        for name in RESTORABLE_META {
            let source = paths.meta().join(name);
            if source.is_file() {
                snapshot_file(&source, &meta_dir.join(name))?;
            }
        }
        Ok(stats)
    }

    /// Visible checkpoints, newest first.
    pub fn list(&self, id: &WorkbenchId) -> Result<Vec<Checkpoint>, StorageError> {
        let paths = self.store.require(id)?;
        let dir = paths.checkpoints();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::read(&dir, e)),
        };

        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match atomic::read_json::<Checkpoint>(&path) {
                Ok(Some(checkpoint)) => out.push(checkpoint),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        out.sort_by(|a, b| b.checkpoint_id.cmp(&a.checkpoint_id));
        Ok(out)
    }

    pub fn get(&self, id: &WorkbenchId, checkpoint_id: &str) -> Result<Checkpoint, StorageError> {
        let paths = self.store.require(id)?;
        if !is_checkpoint_id(checkpoint_id) {
            return Err(StorageError::NotFound(format!("checkpoint {checkpoint_id}")));
        }
        atomic::read_json(&Self::record_path(&paths, checkpoint_id))?
            .ok_or_else(|| StorageError::NotFound(format!("checkpoint {checkpoint_id}")))
    }

    /// Delete checkpoints beyond the retention limits. Returns the pruned ids.
    pub fn prune(&self, id: &WorkbenchId) -> Result<Vec<String>, StorageError> {
        let paths = self.store.require(id)?;
        let all = self.list(id)?;
        let mut pruned = Vec::new();
        for reason in [CheckpointReason::Auto, CheckpointReason::Manual] {
            let Some(limit) = reason.retention_limit(&self.retention) else {
                continue;
            };
            for checkpoint in all.iter().filter(|c| c.reason == reason).skip(limit) {
                self.remove(&paths, &checkpoint.checkpoint_id)?;
                pruned.push(checkpoint.checkpoint_id.clone());
            }
        }
        if !pruned.is_empty() {
            info!(workbench_id = %id, count = pruned.len(), "Checkpoints pruned");
        }
        Ok(pruned)
    }

    fn remove(&self, paths: &WorkbenchPaths, checkpoint_id: &str) -> Result<(), StorageError> {
        let record = Self::record_path(paths, checkpoint_id);
        fs::remove_file(&record).map_err(|e| StorageError::write(&record, e))?;
        let dir = Self::snapshot_dir(paths, checkpoint_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| StorageError::write(&dir, e))?;
        }
        debug!(checkpoint_id, "Checkpoint removed");
        Ok(())
    }

    /// Make Published (and the restorable meta records) equal to a checkpoint.
    ///
    /// A no-op when Published already matches the checkpoint content.
    pub fn restore(
        &self,
        id: &WorkbenchId,
        checkpoint_id: &str,
    ) -> Result<RestoreOutcome, StorageError> {
        let paths = self.store.require(id)?;
        self.get(id, checkpoint_id)?;
        let snapshot_dir = Self::snapshot_dir(&paths, checkpoint_id);
        let published_snapshot = snapshot_dir.join(PUBLISHED_SNAPSHOT);
        if !published_snapshot.is_dir() {
            return Err(StorageError::Corrupt {
                path: published_snapshot,
                message: "checkpoint snapshot is missing".to_string(),
            });
        }

        if walker::fingerprint(&paths.published())? == walker::fingerprint(&published_snapshot)? {
            debug!(workbench_id = %id, checkpoint_id, "Published already matches checkpoint");
            return Ok(RestoreOutcome {
                checkpoint_id: checkpoint_id.to_string(),
                restored: false,
                pre_restore_checkpoint_id: None,
            });
        }

        let pre_restore = self.create(id, CheckpointReason::PreRestore, "Before restore")?;

        let published_tmp = paths.published_restore_tmp();
        let meta_tmp = paths.meta_restore_tmp();
        remove_dir_if_exists(&published_tmp)?;
        remove_dir_if_exists(&meta_tmp)?;
        self.snapshotter
            .materialize(&published_snapshot, &published_tmp, &[])?;
        fs::create_dir_all(&meta_tmp).map_err(|e| StorageError::write(&meta_tmp, e))?;
        for name in RESTORABLE_META {
            let source = snapshot_dir.join(META_SNAPSHOT).join(name);
            if source.is_file() {
                snapshot_file(&source, &meta_tmp.join(name))?;
            }
        }

        let marker = RestoreMarker {
            checkpoint_id: checkpoint_id.to_string(),
            pre_restore_checkpoint_id: pre_restore.checkpoint_id.clone(),
            created_at: now_rfc3339(),
        };
        atomic::write_json(&paths.restore_marker(), &marker)?;

        swap_published(&paths)?;
        for name in RESTORABLE_META {
            replace_meta_entry(&paths, name)?;
        }

        remove_dir_if_exists(&meta_tmp)?;
        fs::remove_file(paths.restore_marker())
            .map_err(|e| StorageError::write(paths.restore_marker(), e))?;

        self.store.rebuild_manifest(id)?;
        ConversationLog::new(paths.conversation()).append(
            &ConversationEntry::system_event("checkpoint_restored", "Checkpoint restored")
                .with_checkpoint(checkpoint_id)
                .with_metadata(json!({
                    "pre_restore_checkpoint_id": pre_restore.checkpoint_id,
                })),
        )?;

        info!(
            workbench_id = %id,
            checkpoint_id,
            pre_restore_checkpoint_id = %pre_restore.checkpoint_id,
            "Checkpoint restored"
        );
        Ok(RestoreOutcome {
            checkpoint_id: checkpoint_id.to_string(),
            restored: true,
            pre_restore_checkpoint_id: Some(pre_restore.checkpoint_id),
        })
    }

    /// Finish or roll back an interrupted restore and drop orphaned checkpoint staging.
    ///
    /// Returns true when a restore marker was found.
    pub fn recover(&self, id: &WorkbenchId) -> Result<bool, StorageError> {
        let paths = self.store.require(id)?;
        self.remove_orphans(&paths)?;

        let marker: Option<RestoreMarker> = atomic::read_json(&paths.restore_marker())?;
        let Some(marker) = marker else {
            return Ok(false);
        };
        warn!(
            workbench_id = %id,
            checkpoint_id = %marker.checkpoint_id,
            "Recovering interrupted restore"
        );

        let published = paths.published();
        let prev = paths.published_prev();
        if !published.exists() && prev.exists() {
            fs::rename(&prev, &published).map_err(|e| StorageError::write(&published, e))?;
        }
        for name in RESTORABLE_META {
            let entry = paths.meta().join(name);
            let entry_prev = paths.meta().join(format!("{name}.prev"));
            if !entry.exists() && entry_prev.exists() {
                fs::rename(&entry_prev, &entry).map_err(|e| StorageError::write(&entry, e))?;
            } else if entry_prev.exists() {
                let _ = fs::remove_file(&entry_prev);
            }
        }
        remove_dir_if_exists(&prev)?;
        remove_dir_if_exists(&paths.published_restore_tmp())?;
        remove_dir_if_exists(&paths.meta_restore_tmp())?;
        fs::remove_file(paths.restore_marker())
            .map_err(|e| StorageError::write(paths.restore_marker(), e))?;
        self.store.rebuild_manifest(id)?;
        Ok(true)
    }

    fn remove_orphans(&self, paths: &WorkbenchPaths) -> Result<(), StorageError> {
        let dir = paths.checkpoints();
        let Ok(entries) = fs::read_dir(&dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let orphan = name.ends_with(STAGING_SUFFIX)
                || !Self::record_path(paths, &name).exists();
            if orphan {
                debug!(path = %path.display(), "Removing orphaned checkpoint directory");
                fs::remove_dir_all(&path).map_err(|e| StorageError::write(&path, e))?;
            }
        }
        Ok(())
    }
}

fn is_checkpoint_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn remove_dir_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::write(path, e)),
    }
}

/// `published -> published.prev`, `published.restore_tmp -> published`, rolling back on failure.
fn swap_published(paths: &WorkbenchPaths) -> Result<(), StorageError> {
    let published = paths.published();
    let prev = paths.published_prev();
    remove_dir_if_exists(&prev)?;
    fs::rename(&published, &prev).map_err(|e| StorageError::write(&prev, e))?;
    if let Err(e) = fs::rename(paths.published_restore_tmp(), &published) {
        if let Err(rollback) = fs::rename(&prev, &published) {
            warn!(error = %rollback, "Failed to roll back published swap");
        }
        return Err(StorageError::write(&published, e));
    }
    remove_dir_if_exists(&prev)
}

fn replace_meta_entry(paths: &WorkbenchPaths, name: &str) -> Result<(), StorageError> {
    let entry = paths.meta().join(name);
    let entry_prev = paths.meta().join(format!("{name}.prev"));
    let restored = paths.meta_restore_tmp().join(name);

    if entry.exists() {
        fs::rename(&entry, &entry_prev).map_err(|e| StorageError::write(&entry_prev, e))?;
    }
    if restored.exists() {
        if let Err(e) = fs::rename(&restored, &entry) {
            if entry_prev.exists() {
                let _ = fs::rename(&entry_prev, &entry);
            }
            return Err(StorageError::write(&entry, e));
        }
    }
    if entry_prev.exists() {
        fs::remove_file(&entry_prev).map_err(|e| StorageError::write(&entry_prev, e))?;
    }
    Ok(())
}
