//! Draft revisions: per-message snapshots of the draft for undo.
//!
//! ```text
//! meta/workshop/draft_revisions/log.json             ordered index
//! meta/workshop/draft_revisions/<hex(blake3(id))>/   rev.json, draft.json, draft_snapshot/
//! ```
//!
//! History is linear: rewinding to a message drops every later revision.

use super::DraftRecord;
use crate::error::StorageError;
use crate::snapshot::Snapshotter;
use crate::store::{atomic, WorkbenchPaths};
use crate::types::now_rfc3339;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

const INDEX_FILE: &str = "log.json";
const REV_FILE: &str = "rev.json";
const DRAFT_SNAPSHOT: &str = "draft_snapshot";
const DRAFT_RECORD: &str = "draft.json";
const STAGING_SUFFIX: &str = ".staging";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub revision_id: String,
    pub message_id: String,
    pub created_at: String,
    pub has_draft: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RevisionIndex {
    revisions: Vec<Revision>,
}

pub fn revision_id(message_id: &str) -> String {
    blake3::hash(message_id.as_bytes()).to_hex().to_string()
}

#[derive(Debug, Clone)]
pub struct RevisionLog {
    dir: PathBuf,
}

impl RevisionLog {
    pub fn new(paths: &WorkbenchPaths) -> Self {
        Self {
            dir: paths.revisions(),
        }
    }

    fn revision_dir(&self, message_id: &str) -> PathBuf {
        self.dir.join(revision_id(message_id))
    }

    fn load_index(&self) -> Result<RevisionIndex, StorageError> {
        Ok(atomic::read_json(&self.dir.join(INDEX_FILE))?.unwrap_or_default())
    }

    fn save_index(&self, index: &RevisionIndex) -> Result<(), StorageError> {
        atomic::write_json(&self.dir.join(INDEX_FILE), index)
    }

    /// Revisions in conversation order.
    pub fn list(&self) -> Result<Vec<Revision>, StorageError> {
        Ok(self.load_index()?.revisions)
    }

    pub fn get(&self, message_id: &str) -> Result<Option<Revision>, StorageError> {
        let revision: Option<Revision> =
            atomic::read_json(&self.revision_dir(message_id).join(REV_FILE))?;
        Ok(revision.filter(|r| r.message_id == message_id))
    }

    /// Capture the current draft (or its absence) for `message_id`.
    pub fn record(
        &self,
        paths: &WorkbenchPaths,
        message_id: &str,
        draft: Option<&DraftRecord>,
        snapshotter: &Snapshotter,
    ) -> Result<Revision, StorageError> {
        let revision = Revision {
            revision_id: revision_id(message_id),
            message_id: message_id.to_string(),
            created_at: now_rfc3339(),
            has_draft: draft.is_some(),
            draft_id: draft.map(|d| d.draft_id.clone()),
        };

        let final_dir = self.revision_dir(message_id);
        let staging = self
            .dir
            .join(format!("{}{STAGING_SUFFIX}", revision.revision_id));
        remove_dir_if_exists(&staging)?;
        fs::create_dir_all(&staging).map_err(|e| StorageError::write(&staging, e))?;

        let staged = (|| {
            if let Some(record) = draft {
                snapshotter.materialize(&paths.draft(), &staging.join(DRAFT_SNAPSHOT), &[])?;
                atomic::write_json(&staging.join(DRAFT_RECORD), record)?;
            }
            atomic::write_json(&staging.join(REV_FILE), &revision)?;
            remove_dir_if_exists(&final_dir)?;
            fs::rename(&staging, &final_dir).map_err(|e| StorageError::write(&final_dir, e))
        })();
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let mut index = self.load_index()?;
        index.revisions.retain(|r| r.message_id != message_id);
        index.revisions.push(revision.clone());
        self.save_index(&index)?;
        debug!(message_id, has_draft = revision.has_draft, "Draft revision recorded");
        Ok(revision)
    }

    /// Materialize a revision's draft into `draft.tmp`, returning its record.
    ///
    /// The caller swaps it into place. `None` when the revision holds no draft.
    pub fn stage_draft(
        &self,
        paths: &WorkbenchPaths,
        revision: &Revision,
        snapshotter: &Snapshotter,
    ) -> Result<Option<DraftRecord>, StorageError> {
        if !revision.has_draft {
            return Ok(None);
        }
        let dir = self.revision_dir(&revision.message_id);
        let record: DraftRecord =
            atomic::read_json(&dir.join(DRAFT_RECORD))?.ok_or_else(|| StorageError::Corrupt {
                path: dir.join(DRAFT_RECORD),
                message: "revision has no draft record".to_string(),
            })?;
        let snapshot = dir.join(DRAFT_SNAPSHOT);
        if !snapshot.is_dir() {
            return Err(StorageError::Corrupt {
                path: snapshot,
                message: "revision draft snapshot is missing".to_string(),
            });
        }
        let staging = paths.draft_staging();
        remove_dir_if_exists(&staging)?;
        snapshotter.materialize(&snapshot, &staging, &[])?;
        Ok(Some(record))
    }

    /// Drop every revision recorded after `message_id`. Returns how many were dropped.
    pub fn invalidate_after(&self, message_id: &str) -> Result<usize, StorageError> {
        let mut index = self.load_index()?;
        let Some(pos) = index
            .revisions
            .iter()
            .position(|r| r.message_id == message_id)
        else {
            return Ok(0);
        };
        let dropped: Vec<Revision> = index.revisions.drain(pos + 1..).collect();
        self.save_index(&index)?;
        for revision in &dropped {
            remove_dir_if_exists(&self.revision_dir(&revision.message_id))?;
        }
        Ok(dropped.len())
    }

    /// Remove half-written revisions left by a crash.
    pub fn remove_staging(&self) -> Result<(), StorageError> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().ends_with(STAGING_SUFFIX) {
                remove_dir_if_exists(&entry.path())?;
            }
        }
        Ok(())
    }
}

fn remove_dir_if_exists(path: &std::path::Path) -> Result<(), StorageError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::write(path, e)),
    }
}
