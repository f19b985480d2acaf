//! Atomic batches of write-capable tool calls.
//!
//! A batch is validated as a whole against a virtual copy of the file set before anything runs.
//! Once applying, operations run in order and the first failure stops the batch; whatever was
//! applied before it stays in the draft. Each batch is journaled under `meta/workshop/batches/`.

use crate::draft::{DraftManager, DraftState, SOURCE_KIND_WORKSHOP, SOURCE_REF_AGENT};
use crate::error::{ErrorCode, ErrorInfo, InPhase, Phase, StorageError};
use crate::notify::{Notification, Notifier};
use crate::store::{atomic, path, FileKind, Tree, WorkbenchPaths, WorkbenchStore};
use crate::tools::FileOp;
use crate::toolworker::{apply_ops_params, methods, ToolWorker};
use crate::types::{new_id, now_rfc3339, WorkbenchId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Applying,
    Completed,
    Failed,
    /// Found `applying` after a restart.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: String,
    pub message_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub applied: usize,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// One planned write call.
#[derive(Debug, Clone)]
pub struct BatchCall {
    pub call_id: String,
    pub tool: String,
    pub op: FileOp,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub record: BatchRecord,
    /// One result per call, in order. Calls after a failure carry a skip error.
    pub results: Vec<Result<Value, ErrorInfo>>,
    pub draft_created: bool,
}

#[derive(Clone)]
pub struct BatchExecutor {
    store: WorkbenchStore,
    drafts: DraftManager,
    worker: Arc<dyn ToolWorker>,
    op_timeout: Duration,
}

impl BatchExecutor {
    pub fn new(
        store: WorkbenchStore,
        drafts: DraftManager,
        worker: Arc<dyn ToolWorker>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            store,
            drafts,
            worker,
            op_timeout,
        }
    }

    /// Check every call against the draft (or Published, when no draft exists yet) without
    /// touching the disk.
    pub fn validate(&self, id: &WorkbenchId, calls: &[BatchCall]) -> Result<(), ErrorInfo> {
        let paths = self.store.require(id).in_phase(Phase::Workshop)?;
        let tree = if paths.draft().is_dir() {
            Tree::Draft
        } else {
            Tree::Published
        };
        let root = paths.tree(tree);
        let mut files: HashSet<String> = self
            .store
            .list_files(id, tree)
            .in_phase(Phase::Workshop)?
            .into_iter()
            .map(|f| f.path)
            .collect();
        let limits = self.store.limits();

        for call in calls {
            let reject = |detail: String| {
                ErrorInfo::validation(Phase::Workshop, format!("{}: {detail}", call.tool))
            };
            for rel in op_paths(&call.op) {
                let resolved = path::resolve_in_root(&root, rel).in_phase(Phase::Workshop)?;
                if resolved.is_dir() {
                    return Err(reject(format!("{rel} is a directory")));
                }
            }

            match &call.op {
                FileOp::WriteText { path, content } => {
                    if content.len() as u64 > limits.max_file_size {
                        return Err(reject(format!(
                            "{path} exceeds the {} byte limit",
                            limits.max_file_size
                        )));
                    }
                    files.insert(path.clone());
                }
                FileOp::Delete { path } => {
                    if !files.remove(path) {
                        return Err(reject(format!("{path} does not exist")));
                    }
                }
                FileOp::Rename { from, to } => {
                    if !files.contains(from) {
                        return Err(reject(format!("{from} does not exist")));
                    }
                    if files.contains(to) {
                        return Err(reject(format!("{to} already exists")));
                    }
                    files.remove(from);
                    files.insert(to.clone());
                }
                FileOp::Office {
                    kind,
                    path,
                    create_new,
                    copy_from,
                    ..
                } => {
                    if !kind.accepts_office_writes() {
                        return Err(reject(format!("{path} does not accept office operations")));
                    }
                    match copy_from {
                        Some(source) => {
                            if !files.contains(source) {
                                return Err(reject(format!("{source} does not exist")));
                            }
                            if files.contains(path) {
                                return Err(reject(format!("{path} already exists")));
                            }
                        }
                        None if *create_new => {
                            if files.contains(path) {
                                return Err(reject(format!("{path} already exists")));
                            }
                        }
                        None => {
                            if !files.contains(path) {
                                return Err(reject(format!("{path} does not exist")));
                            }
                        }
                    }
                    files.insert(path.clone());
                }
            }
        }

        if files.len() > limits.max_files {
            return Err(ErrorInfo::validation(
                Phase::Workshop,
                format!("batch would exceed the {} file limit", limits.max_files),
            ));
        }
        Ok(())
    }

    /// Validate, make sure a draft exists, then apply in order.
    ///
    /// `Err` means the batch was rejected (or could not start) and nothing was applied.
    pub async fn apply(
        &self,
        id: &WorkbenchId,
        message_id: &str,
        calls: &[BatchCall],
        notifier: &dyn Notifier,
    ) -> Result<BatchOutcome, ErrorInfo> {
        self.validate(id, calls)?;

        let (draft, draft_created) =
            self.drafts
                .ensure(id, SOURCE_KIND_WORKSHOP, SOURCE_REF_AGENT)?;
        if draft_created {
            notifier.notify(Notification::DraftStateChanged {
                workbench_id: id.to_string(),
                draft: DraftState::DraftExists(draft).view(),
            });
        }

        let paths = self.store.paths(id);
        let mut record = BatchRecord {
            batch_id: new_id("batch"),
            message_id: message_id.to_string(),
            status: BatchStatus::Applying,
            total: calls.len(),
            applied: 0,
            created_at: now_rfc3339(),
            finished_at: None,
            error: None,
        };
        write_record(&paths, &record).in_phase(Phase::Workshop)?;
        debug!(workbench_id = %id, batch_id = %record.batch_id, total = record.total, "Batch applying");

        let mut results = Vec::with_capacity(calls.len());
        let mut failure: Option<ErrorInfo> = None;
        for call in calls {
            if let Some(first) = &failure {
                let skipped = ErrorInfo::new(
                    first.code(),
                    Phase::Workshop,
                    format!("skipped: an earlier operation in this batch failed ({})", first.detail),
                );
                notifier.notify(complete(id, call, Some(&skipped)));
                results.push(Err(skipped));
                continue;
            }

            notifier.notify(Notification::ToolExecuting {
                workbench_id: id.to_string(),
                tool_call_id: call.call_id.clone(),
                tool: call.tool.clone(),
            });
            match self.apply_one(id, &paths, &call.op).await {
                Ok(value) => {
                    record.applied += 1;
                    notifier.notify(complete(id, call, None));
                    results.push(Ok(value));
                }
                Err(e) => {
                    notifier.notify(complete(id, call, Some(&e)));
                    failure = Some(e.clone());
                    results.push(Err(e));
                }
            }
        }

        record.finished_at = Some(now_rfc3339());
        match failure {
            Some(e) => {
                warn!(
                    workbench_id = %id,
                    batch_id = %record.batch_id,
                    applied = record.applied,
                    total = record.total,
                    code = %e.code(),
                    "Batch failed"
                );
                record.status = BatchStatus::Failed;
                record.error = Some(e);
            }
            None => {
                info!(
                    workbench_id = %id,
                    batch_id = %record.batch_id,
                    applied = record.applied,
                    "Batch applied"
                );
                record.status = BatchStatus::Completed;
            }
        }
        if let Err(e) = write_record(&paths, &record) {
            warn!(workbench_id = %id, batch_id = %record.batch_id, error = %e, "Failed to journal batch");
        }

        Ok(BatchOutcome {
            record,
            results,
            draft_created,
        })
    }

    async fn apply_one(
        &self,
        id: &WorkbenchId,
        paths: &WorkbenchPaths,
        op: &FileOp,
    ) -> Result<Value, ErrorInfo> {
        if let FileOp::Office {
            kind,
            path: rel,
            ops,
            create_new,
            copy_from,
        } = op
        {
            let method = match kind {
                FileKind::Xlsx => methods::XLSX_APPLY_OPS,
                FileKind::Docx => methods::DOCX_APPLY_OPS,
                FileKind::Pptx => methods::PPTX_APPLY_OPS,
                _ => {
                    return Err(ErrorInfo::validation(
                        Phase::Workshop,
                        format!("{rel} does not accept office operations"),
                    ))
                }
            };
            // The worker only ever sees paths already contained in draft/.
            path::resolve_in_root(&paths.draft(), rel).in_phase(Phase::Workshop)?;
            if let Some(source) = copy_from {
                path::resolve_in_root(&paths.draft(), source).in_phase(Phase::Workshop)?;
            }
            let params = apply_ops_params(id.as_str(), rel, ops, *create_new, copy_from.as_deref());
            return match tokio::time::timeout(self.op_timeout, self.worker.call(method, params)).await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.into_info(Phase::Workshop, true)),
                Err(_) => Err(ErrorInfo::new(
                    ErrorCode::ToolWorkerUnavailable,
                    Phase::Workshop,
                    format!("{method} timed out after {}ms", self.op_timeout.as_millis()),
                )),
            };
        }

        let store = self.store.clone();
        let workbench = id.clone();
        let owned = op.clone();
        let task = tokio::task::spawn_blocking(move || apply_file_op(&store, &workbench, &owned));
        match tokio::time::timeout(self.op_timeout, task).await {
            Ok(Ok(result)) => result.in_phase(Phase::Workshop),
            Ok(Err(join)) => Err(ErrorInfo::file_write(Phase::Workshop, join.to_string())),
            Err(_) => Err(ErrorInfo::file_write(
                Phase::Workshop,
                format!("{} timed out after {}ms", op.path(), self.op_timeout.as_millis()),
            )),
        }
    }
}

fn op_paths(op: &FileOp) -> Vec<&str> {
    match op {
        FileOp::WriteText { path, .. } | FileOp::Delete { path } => vec![path.as_str()],
        FileOp::Rename { from, to } => vec![from.as_str(), to.as_str()],
        FileOp::Office {
            path, copy_from, ..
        } => std::iter::once(path.as_str())
            .chain(copy_from.as_deref())
            .collect(),
    }
}

fn apply_file_op(store: &WorkbenchStore, id: &WorkbenchId, op: &FileOp) -> Result<Value, StorageError> {
    match op {
        FileOp::WriteText { path, content } => {
            store.write_atomic(id, Tree::Draft, path, content.as_bytes())?;
            Ok(json!({ "path": path, "bytes": content.len() }))
        }
        FileOp::Delete { path } => {
            store.delete_file(id, Tree::Draft, path)?;
            Ok(json!({ "path": path, "deleted": true }))
        }
        FileOp::Rename { from, to } => {
            store.rename(id, Tree::Draft, from, to)?;
            Ok(json!({ "from": from, "to": to }))
        }
        FileOp::Office { path, .. } => Err(StorageError::Rejected(format!(
            "{path} must be applied by the tool worker"
        ))),
    }
}

fn complete(id: &WorkbenchId, call: &BatchCall, error: Option<&ErrorInfo>) -> Notification {
    Notification::ToolComplete {
        workbench_id: id.to_string(),
        tool_call_id: call.call_id.clone(),
        tool: call.tool.clone(),
        ok: error.is_none(),
        error: error.cloned(),
    }
}

fn write_record(paths: &WorkbenchPaths, record: &BatchRecord) -> Result<(), StorageError> {
    atomic::write_json(
        &paths.batches().join(format!("{}.json", record.batch_id)),
        record,
    )
}

/// Journaled batches, oldest first.
pub fn list(paths: &WorkbenchPaths) -> Result<Vec<BatchRecord>, StorageError> {
    let dir = paths.batches();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::read(&dir, e)),
    };
    let mut records = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(record) = atomic::read_json::<BatchRecord>(&path)? {
            records.push(record);
        }
    }
    records.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
    Ok(records)
}

/// Mark batches left `applying` by a crash as `interrupted`.
pub fn mark_interrupted(paths: &WorkbenchPaths) -> Result<usize, StorageError> {
    let mut marked = 0;
    for mut record in list(paths)? {
        if record.status != BatchStatus::Applying {
            continue;
        }
        record.status = BatchStatus::Interrupted;
        record.finished_at = Some(now_rfc3339());
        write_record(paths, &record)?;
        warn!(batch_id = %record.batch_id, applied = record.applied, "Batch interrupted");
        marked += 1;
    }
    Ok(marked)
}
