//! Draft/Publish state machine
//!
//! A workbench is in [`DraftState::NoDraft`] or [`DraftState::DraftExists`], derived from the
//! presence of `draft/`. Every transition is checked by [`guard`] before it touches the disk.

pub mod revisions;

use crate::checkpoint::{CheckpointReason, CheckpointStore};
use crate::conversation::{ConversationEntry, ConversationLog};
use crate::error::{Action, ErrorInfo, InPhase, Phase, StorageError};
use crate::snapshot::Snapshotter;
use crate::store::{atomic, walker, WorkbenchPaths, WorkbenchStore};
use crate::types::{new_id, now_millis, now_rfc3339, WorkbenchId};
use revisions::{Revision, RevisionLog};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

pub const SOURCE_KIND_WORKSHOP: &str = "workshop";
pub const SOURCE_REF_AGENT: &str = "agent";

const DISCARDED_PREFIX: &str = "draft.discarded-";

/// `meta/draft.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftRecord {
    pub draft_id: String,
    pub created_at: String,
    pub source_kind: String,
    pub source_ref: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DraftState {
    NoDraft,
    DraftExists(DraftRecord),
}

impl DraftState {
    pub fn has_draft(&self) -> bool {
        matches!(self, DraftState::DraftExists(_))
    }

    pub fn record(&self) -> Option<&DraftRecord> {
        match self {
            DraftState::DraftExists(record) => Some(record),
            DraftState::NoDraft => None,
        }
    }

    pub fn view(&self) -> DraftStateView {
        let record = self.record();
        DraftStateView {
            has_draft: self.has_draft(),
            draft_id: record.map(|r| r.draft_id.clone()),
            created_at: record.map(|r| r.created_at.clone()),
            source_kind: record.map(|r| r.source_kind.clone()),
            source_ref: record.map(|r| r.source_ref.clone()),
        }
    }
}

/// Wire form of [`DraftState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftStateView {
    pub has_draft: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftTransition {
    Create,
    ApplyBatch,
    Publish,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Proceed,
    NoOp,
}

/// Decide whether `transition` may run from `state`.
pub fn guard(state: &DraftState, transition: DraftTransition) -> Result<Guard, ErrorInfo> {
    use DraftTransition::*;
    match (state, transition) {
        (DraftState::NoDraft, Create) => Ok(Guard::Proceed),
        (DraftState::DraftExists(_), Create) => Err(ErrorInfo::validation(
            Phase::Workshop,
            "a draft already exists",
        )
        .with_actions(vec![Action::ReviewDraft])),
        (DraftState::DraftExists(_), ApplyBatch | Publish | Discard) => Ok(Guard::Proceed),
        (DraftState::NoDraft, ApplyBatch) => {
            Err(ErrorInfo::validation(Phase::Workshop, "no draft to apply changes to"))
        }
        (DraftState::NoDraft, Publish) => {
            Err(ErrorInfo::validation(Phase::Publish, "no draft to publish"))
        }
        (DraftState::NoDraft, Discard) => Ok(Guard::NoOp),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub checkpoint_id: String,
    pub files: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoOutcome {
    pub message_id: String,
    pub revision_id: String,
    pub draft: DraftStateView,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_checkpoint_id: Option<String>,
}

/// Drives draft transitions for every workbench of one store.
#[derive(Debug, Clone)]
pub struct DraftManager {
    store: WorkbenchStore,
    checkpoints: CheckpointStore,
    snapshotter: Snapshotter,
}

impl DraftManager {
    pub fn new(store: WorkbenchStore, checkpoints: CheckpointStore, snapshotter: Snapshotter) -> Self {
        Self {
            store,
            checkpoints,
            snapshotter,
        }
    }

    pub fn state(&self, id: &WorkbenchId) -> Result<DraftState, StorageError> {
        let paths = self.store.require(id)?;
        Self::state_at(&paths)
    }

    fn state_at(paths: &WorkbenchPaths) -> Result<DraftState, StorageError> {
        if !paths.draft().is_dir() {
            return Ok(DraftState::NoDraft);
        }
        let record = atomic::read_json::<DraftRecord>(&paths.draft_json())?.ok_or_else(|| {
            StorageError::Corrupt {
                path: paths.draft_json(),
                message: "draft exists without a draft record".to_string(),
            }
        })?;
        Ok(DraftState::DraftExists(record))
    }

    /// Snapshot Published into a new draft.
    pub fn create(
        &self,
        id: &WorkbenchId,
        source_kind: &str,
        source_ref: &str,
    ) -> Result<DraftRecord, ErrorInfo> {
        let paths = self.store.require(id).in_phase(Phase::Workshop)?;
        let state = Self::state_at(&paths).in_phase(Phase::Workshop)?;
        guard(&state, DraftTransition::Create)?;

        let staging = paths.draft_staging();
        remove_dir_if_exists(&staging).in_phase(Phase::Workshop)?;
        self.snapshotter
            .materialize(&paths.published(), &staging, &[])
            .in_phase(Phase::Workshop)?;

        let record = DraftRecord {
            draft_id: new_id("draft"),
            created_at: now_rfc3339(),
            source_kind: source_kind.to_string(),
            source_ref: source_ref.to_string(),
        };
        let committed = atomic::write_json(&paths.draft_json(), &record).and_then(|_| {
            fs::rename(&staging, paths.draft()).map_err(|e| StorageError::write(paths.draft(), e))
        });
        if let Err(e) = committed {
            let _ = fs::remove_dir_all(&staging);
            let _ = fs::remove_file(paths.draft_json());
            return Err(e.into_info(Phase::Workshop));
        }

        info!(workbench_id = %id, draft_id = %record.draft_id, source_kind, "Draft created");
        Ok(record)
    }

    /// Existing draft, or a fresh one. The flag is true when a draft was created.
    pub fn ensure(
        &self,
        id: &WorkbenchId,
        source_kind: &str,
        source_ref: &str,
    ) -> Result<(DraftRecord, bool), ErrorInfo> {
        match self.state(id).in_phase(Phase::Workshop)? {
            DraftState::DraftExists(record) => Ok((record, false)),
            DraftState::NoDraft => Ok((self.create(id, source_kind, source_ref)?, true)),
        }
    }

    /// Published paths that the draft no longer has.
    pub fn deleted_in_draft(&self, id: &WorkbenchId) -> Result<Vec<String>, StorageError> {
        let paths = self.store.require(id)?;
        let draft: HashSet<String> = walker::files(&paths.draft(), &[])?
            .into_iter()
            .map(|(rel, _)| rel)
            .collect();
        Ok(walker::files(&paths.published(), &[])?
            .into_iter()
            .map(|(rel, _)| rel)
            .filter(|rel| !draft.contains(rel))
            .collect())
    }

    /// Replace Published with the draft, checkpointing the old Published first.
    pub fn publish(
        &self,
        id: &WorkbenchId,
        confirm_deletions: bool,
    ) -> Result<PublishOutcome, ErrorInfo> {
        let paths = self.store.require(id).in_phase(Phase::Publish)?;
        let state = Self::state_at(&paths).in_phase(Phase::Publish)?;
        guard(&state, DraftTransition::Publish)?;

        let deleted = self.deleted_in_draft(id).in_phase(Phase::Publish)?;
        if !deleted.is_empty() && !confirm_deletions {
            return Err(ErrorInfo::validation(
                Phase::Publish,
                format!(
                    "publishing would delete {} file(s): {}; confirm deletions to continue",
                    deleted.len(),
                    deleted.join(", ")
                ),
            )
            .with_actions(vec![Action::ReviewDraft])
            .with_workbench(id.as_str()));
        }

        let checkpoint = self
            .checkpoints
            .create(id, CheckpointReason::Publish, "Before publish")
            .in_phase(Phase::Publish)?;

        let published = paths.published();
        let prev = paths.published_prev();
        remove_dir_if_exists(&prev).in_phase(Phase::Publish)?;
        fs::rename(&published, &prev)
            .map_err(|e| StorageError::write(&prev, e))
            .in_phase(Phase::Publish)?;
        if let Err(e) = fs::rename(paths.draft(), &published) {
            if let Err(rollback) = fs::rename(&prev, &published) {
                warn!(workbench_id = %id, error = %rollback, "Failed to roll back publish");
            }
            return Err(StorageError::write(&published, e).into_info(Phase::Publish));
        }
        if let Err(e) = fs::remove_dir_all(&prev) {
            warn!(workbench_id = %id, error = %e, "Failed to remove previous published tree");
        }

        if let Err(e) = fs::remove_file(paths.draft_json()) {
            warn!(workbench_id = %id, error = %e, "Failed to remove draft record");
        }
        if let Err(e) = remove_dir_if_exists(&paths.revisions()) {
            warn!(workbench_id = %id, error = %e, "Failed to clear draft revisions");
        }
        if let Err(e) = remove_dir_if_exists(&paths.batches()) {
            warn!(workbench_id = %id, error = %e, "Failed to clear batch journal");
        }
        let manifest = self.store.rebuild_manifest(id).in_phase(Phase::Publish)?;
        self.store.touch(id).in_phase(Phase::Publish)?;
        ConversationLog::new(paths.conversation())
            .append(
                &ConversationEntry::system_event("publish", "Draft published")
                    .with_checkpoint(&checkpoint.checkpoint_id),
            )
            .in_phase(Phase::Publish)?;

        info!(
            workbench_id = %id,
            checkpoint_id = %checkpoint.checkpoint_id,
            files = manifest.files.len(),
            "Draft published"
        );
        Ok(PublishOutcome {
            checkpoint_id: checkpoint.checkpoint_id,
            files: manifest.files.len(),
        })
    }

    /// Drop the draft. Returns false when there was nothing to discard.
    pub fn discard(&self, id: &WorkbenchId) -> Result<bool, ErrorInfo> {
        let paths = self.store.require(id).in_phase(Phase::Review)?;
        let state = Self::state_at(&paths).unwrap_or_else(|e| {
            warn!(workbench_id = %id, error = %e, "Unreadable draft record, discarding anyway");
            DraftState::NoDraft
        });
        let has_dir = paths.draft().exists();
        if !has_dir && guard(&state, DraftTransition::Discard)? == Guard::NoOp {
            return Ok(false);
        }

        let discarded = paths
            .root()
            .join(format!("{DISCARDED_PREFIX}{}", now_millis()));
        fs::rename(paths.draft(), &discarded)
            .map_err(|e| StorageError::write(&discarded, e))
            .in_phase(Phase::Review)?;

        if let Err(e) = fs::remove_dir_all(&discarded) {
            warn!(workbench_id = %id, error = %e, "Failed to remove discarded draft");
        }
        if let Err(e) = fs::remove_file(paths.draft_json()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(workbench_id = %id, error = %e, "Failed to remove draft record");
            }
        }
        if let Err(e) = remove_dir_if_exists(&paths.revisions()) {
            warn!(workbench_id = %id, error = %e, "Failed to clear draft revisions");
        }
        if let Err(e) = remove_dir_if_exists(&paths.batches()) {
            warn!(workbench_id = %id, error = %e, "Failed to clear batch journal");
        }
        info!(workbench_id = %id, "Draft discarded");
        Ok(true)
    }

    pub fn revisions(&self, id: &WorkbenchId) -> RevisionLog {
        RevisionLog::new(&self.store.paths(id))
    }

    /// Record the current draft for a conversation message.
    pub fn record_revision(
        &self,
        id: &WorkbenchId,
        message_id: &str,
    ) -> Result<Revision, StorageError> {
        let paths = self.store.require(id)?;
        let state = Self::state_at(&paths)?;
        RevisionLog::new(&paths).record(&paths, message_id, state.record(), &self.snapshotter)
    }

    /// Rewind conversation, draft and (if a restore followed) Published to `message_id`.
    ///
    /// The revision's draft is staged before anything else changes, so a damaged revision
    /// leaves the workbench as it was.
    pub fn undo_to_message(
        &self,
        id: &WorkbenchId,
        message_id: &str,
    ) -> Result<UndoOutcome, ErrorInfo> {
        let paths = self.store.require(id).in_phase(Phase::Workshop)?;
        let log = ConversationLog::new(paths.conversation());
        let entries = log.load().in_phase(Phase::Workshop)?;
        let index = entries
            .iter()
            .position(|e| e.message_id == message_id)
            .ok_or_else(|| ErrorInfo::validation(Phase::Workshop, "message not found"))?;

        let revisions = RevisionLog::new(&paths);
        let revision = revisions
            .get(message_id)
            .in_phase(Phase::Workshop)?
            .ok_or_else(|| {
                ErrorInfo::validation(Phase::Workshop, "draft revision not found for message")
            })?;

        let staged = revisions
            .stage_draft(&paths, &revision, &self.snapshotter)
            .in_phase(Phase::Workshop)?;
        let restored_checkpoint_id = rewind_checkpoint(&entries[index + 1..]);
        let rewound = self.rewind(
            id,
            &paths,
            &log,
            &entries[..=index],
            restored_checkpoint_id.as_deref(),
            staged,
        );
        if let Err(e) = rewound {
            if let Err(cleanup) = remove_dir_if_exists(&paths.draft_staging()) {
                warn!(workbench_id = %id, error = %cleanup, "Failed to remove staged draft");
            }
            return Err(e);
        }

        let dropped = revisions
            .invalidate_after(message_id)
            .in_phase(Phase::Workshop)?;

        let state = Self::state_at(&paths).in_phase(Phase::Workshop)?;
        info!(
            workbench_id = %id,
            message_id,
            has_draft = state.has_draft(),
            dropped_revisions = dropped,
            "Undo completed"
        );
        Ok(UndoOutcome {
            message_id: message_id.to_string(),
            revision_id: revision.revision_id,
            draft: state.view(),
            restored_checkpoint_id,
        })
    }

    fn rewind(
        &self,
        id: &WorkbenchId,
        paths: &WorkbenchPaths,
        log: &ConversationLog,
        kept: &[ConversationEntry],
        checkpoint_id: Option<&str>,
        staged: Option<DraftRecord>,
    ) -> Result<(), ErrorInfo> {
        if let Some(checkpoint_id) = checkpoint_id {
            self.checkpoints
                .restore(id, checkpoint_id)
                .in_phase(Phase::Workshop)?;
            info!(workbench_id = %id, checkpoint_id, "Undo restored published");
        }

        log.rewrite(kept).in_phase(Phase::Workshop)?;

        remove_dir_if_exists(&paths.draft()).in_phase(Phase::Workshop)?;
        match staged {
            Some(record) => {
                fs::rename(paths.draft_staging(), paths.draft())
                    .map_err(|e| StorageError::write(paths.draft(), e))
                    .in_phase(Phase::Workshop)?;
                atomic::write_json(&paths.draft_json(), &record).in_phase(Phase::Workshop)?;
            }
            None => {
                if let Err(e) = fs::remove_file(paths.draft_json()) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(StorageError::write(paths.draft_json(), e)
                            .into_info(Phase::Workshop));
                    }
                }
            }
        }
        Ok(())
    }

    /// Clean up after a crash mid-transition.
    pub fn recover(&self, id: &WorkbenchId) -> Result<(), StorageError> {
        let paths = self.store.require(id)?;
        remove_dir_if_exists(&paths.draft_staging())?;

        let published = paths.published();
        let prev = paths.published_prev();
        if prev.exists() && !paths.restore_marker().exists() {
            if published.exists() {
                remove_dir_if_exists(&prev)?;
            } else {
                warn!(workbench_id = %id, "Recovering published tree from interrupted publish");
                fs::rename(&prev, &published).map_err(|e| StorageError::write(&published, e))?;
            }
        }

        if let Ok(entries) = fs::read_dir(paths.root()) {
            for entry in entries.flatten() {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(DISCARDED_PREFIX)
                {
                    debug!(path = %entry.path().display(), "Removing discarded draft");
                    remove_dir_if_exists(&entry.path())?;
                }
            }
        }

        let has_draft = paths.draft().is_dir();
        let has_record = paths.draft_json().is_file();
        if !has_draft && has_record {
            debug!(workbench_id = %id, "Removing stale draft record");
            fs::remove_file(paths.draft_json())
                .map_err(|e| StorageError::write(paths.draft_json(), e))?;
        } else if has_draft && !has_record {
            warn!(workbench_id = %id, "Draft has no record, writing a recovered one");
            let record = DraftRecord {
                draft_id: new_id("draft"),
                created_at: now_rfc3339(),
                source_kind: "recovered".to_string(),
                source_ref: String::new(),
            };
            atomic::write_json(&paths.draft_json(), &record)?;
        }

        RevisionLog::new(&paths).remove_staging()
    }
}

/// The checkpoint that rewinds Published past the first restore in `later`.
///
/// A publish drops every earlier revision, so undo never reaches back across one.
fn rewind_checkpoint(later: &[ConversationEntry]) -> Option<String> {
    later.iter().find_map(|entry| match entry.event_kind.as_deref() {
        Some("checkpoint_restored") => entry
            .metadata
            .as_ref()
            .and_then(|m| m.get("pre_restore_checkpoint_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    })
}

fn remove_dir_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::write(path, e)),
    }
}
