//! Engine facade
//!
//! Owns every component for one workbenches directory and exposes the operations behind the RPC
//! surface. Mutations of a workbench are serialized behind a per-workbench async mutex, and the
//! destructive ones are refused while an agent run is active on it.

use crate::agent::batch;
use crate::agent::{AgentRunner, CancelToken, RunOutcome};
use crate::checkpoint::{Checkpoint, CheckpointReason, CheckpointStore, RestoreOutcome};
use crate::config::EngineConfig;
use crate::consent::{ConsentGate, ConsentStatus, EgressEvent};
use crate::conversation::{ConversationEntry, ConversationLog};
use crate::draft::{DraftManager, DraftState, DraftStateView, PublishOutcome, UndoOutcome};
use crate::error::{ErrorInfo, InPhase, Phase};
use crate::notify::{Notification, Notifier};
use crate::provider::ProviderRegistry;
use crate::snapshot::Snapshotter;
use crate::store::{FileEntry, Tree, WorkbenchMeta, WorkbenchStore};
use crate::tools::ToolRegistry;
use crate::toolworker::{SubprocessWorker, ToolWorker};
use crate::types::WorkbenchId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

/// Source kind recorded for drafts created on request rather than by the agent.
const SOURCE_KIND_USER: &str = "user";

/// Per-workbench async mutexes, created on first use.
#[derive(Default)]
pub struct WorkbenchLockManager {
    locks: parking_lot::Mutex<HashMap<WorkbenchId, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkbenchLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_lock(&self, id: &WorkbenchId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    pub async fn acquire(&self, id: &WorkbenchId) -> OwnedMutexGuard<()> {
        self.get_lock(id).lock_owned().await
    }

    pub fn forget(&self, id: &WorkbenchId) {
        self.locks.lock().remove(id);
    }
}

/// Active agent runs keyed by workbench.
#[derive(Default)]
struct RunTable {
    runs: parking_lot::Mutex<HashMap<WorkbenchId, CancelToken>>,
}

impl RunTable {
    fn start(&self, id: &WorkbenchId) -> Result<CancelToken, ErrorInfo> {
        let mut runs = self.runs.lock();
        if runs.contains_key(id) {
            return Err(ErrorInfo::validation(
                Phase::Workshop,
                "workshop run already in progress",
            )
            .with_workbench(id.as_str()));
        }
        let token = CancelToken::new();
        runs.insert(id.clone(), token.clone());
        Ok(token)
    }

    fn finish(&self, id: &WorkbenchId) {
        self.runs.lock().remove(id);
    }

    fn cancel(&self, id: &WorkbenchId) -> bool {
        match self.runs.lock().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn is_active(&self, id: &WorkbenchId) -> bool {
        self.runs.lock().contains_key(id)
    }
}

/// Clears the run entry however the run ends.
struct RunGuard<'a> {
    table: &'a RunTable,
    id: WorkbenchId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.table.finish(&self.id);
    }
}

pub struct Engine {
    config: EngineConfig,
    store: WorkbenchStore,
    checkpoints: CheckpointStore,
    drafts: DraftManager,
    consent: Arc<ConsentGate>,
    providers: ProviderRegistry,
    agent: AgentRunner,
    locks: WorkbenchLockManager,
    runs: RunTable,
    notifier: Arc<dyn Notifier>,
}

impl Engine {
    /// Engine with providers and the tool worker built from `config`.
    pub fn from_config(config: EngineConfig, notifier: Arc<dyn Notifier>) -> Result<Self, ErrorInfo> {
        let providers = ProviderRegistry::from_config(&config.providers);
        let worker: Arc<dyn ToolWorker> =
            Arc::new(SubprocessWorker::new(config.tool_worker.clone(), None));
        Self::new(config, providers, worker, notifier)
    }

    pub fn new(
        config: EngineConfig,
        providers: ProviderRegistry,
        worker: Arc<dyn ToolWorker>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ErrorInfo> {
        let store = WorkbenchStore::new(config.resolved_workbenches_dir(), config.limits.clone())
            .in_phase(Phase::Settings)?;
        let snapshotter = Snapshotter::new(&config.snapshot);
        let checkpoints =
            CheckpointStore::new(store.clone(), snapshotter, config.checkpoints.clone());
        let drafts = DraftManager::new(store.clone(), checkpoints.clone(), snapshotter);
        let consent = Arc::new(ConsentGate::new(store.clone(), config.egress.clone()));
        let tools = Arc::new(
            ToolRegistry::builtin().map_err(|e| ErrorInfo::validation(Phase::Settings, e))?,
        );
        let agent = AgentRunner::new(
            store.clone(),
            drafts.clone(),
            tools,
            worker,
            config.agent.clone(),
            config.retry.clone(),
            Arc::clone(&notifier),
        );

        let engine = Self {
            config,
            store,
            checkpoints,
            drafts,
            consent,
            providers,
            agent,
            locks: WorkbenchLockManager::new(),
            runs: RunTable::default(),
            notifier,
        };
        engine.recover_all();
        Ok(engine)
    }

    /// Finish or roll back whatever a previous process left mid-transition.
    fn recover_all(&self) {
        let workbenches = match self.store.list() {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Failed to list workbenches for recovery");
                return;
            }
        };
        for meta in workbenches {
            let id = &meta.id;
            if let Err(e) = self.checkpoints.recover(id) {
                warn!(workbench_id = %id, error = %e, "Checkpoint recovery failed");
            }
            if let Err(e) = self.drafts.recover(id) {
                warn!(workbench_id = %id, error = %e, "Draft recovery failed");
            }
            match batch::mark_interrupted(&self.store.paths(id)) {
                Ok(0) => {}
                Ok(n) => info!(workbench_id = %id, batches = n, "Interrupted batches marked"),
                Err(e) => warn!(workbench_id = %id, error = %e, "Batch journal recovery failed"),
            }
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &WorkbenchStore {
        &self.store
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn drafts(&self) -> &DraftManager {
        &self.drafts
    }

    pub fn consent(&self) -> &Arc<ConsentGate> {
        &self.consent
    }

    pub fn is_running(&self, id: &WorkbenchId) -> bool {
        self.runs.is_active(id)
    }

    fn refuse_while_running(&self, id: &WorkbenchId, phase: Phase) -> Result<(), ErrorInfo> {
        if self.runs.is_active(id) {
            return Err(
                ErrorInfo::validation(phase, "not allowed while a workshop run is active")
                    .with_workbench(id.as_str()),
            );
        }
        Ok(())
    }

    fn checkpoint_created(&self, id: &WorkbenchId, checkpoint: Checkpoint) {
        self.notifier.notify(Notification::CheckpointCreated {
            workbench_id: id.to_string(),
            checkpoint,
        });
    }

    fn draft_changed(&self, id: &WorkbenchId, draft: DraftStateView) {
        self.notifier.notify(Notification::DraftStateChanged {
            workbench_id: id.to_string(),
            draft,
        });
    }

    // Workbenches

    pub fn create_workbench(&self, name: &str) -> Result<WorkbenchMeta, ErrorInfo> {
        self.store.create(name).in_phase(Phase::Workbench)
    }

    pub fn list_workbenches(&self) -> Result<Vec<WorkbenchMeta>, ErrorInfo> {
        self.store.list().in_phase(Phase::Workbench)
    }

    pub async fn delete_workbench(&self, id: &WorkbenchId) -> Result<(), ErrorInfo> {
        self.refuse_while_running(id, Phase::Workbench)?;
        let _guard = self.locks.acquire(id).await;
        self.store.delete(id).in_phase(Phase::Workbench)?;
        self.locks.forget(id);
        Ok(())
    }

    /// Copy files into Published, taking an `auto` checkpoint first when Published has content.
    pub async fn add_files(
        &self,
        id: &WorkbenchId,
        sources: &[PathBuf],
    ) -> Result<Vec<FileEntry>, ErrorInfo> {
        self.refuse_while_running(id, Phase::Workbench)?;
        let _guard = self.locks.acquire(id).await;
        let plan = self
            .store
            .plan_add(id, sources)
            .map_err(|e| e.into_info(Phase::Workbench).with_subphase("add_files"))?;
        let existing = self
            .store
            .list_files(id, Tree::Published)
            .in_phase(Phase::Workbench)?;
        if !existing.is_empty() {
            let checkpoint = self
                .checkpoints
                .create(id, CheckpointReason::Auto, "Before adding files")
                .in_phase(Phase::Workbench)?;
            self.checkpoint_created(id, checkpoint);
        }
        self.store
            .commit_add(id, plan)
            .map_err(|e| e.into_info(Phase::Workbench).with_subphase("add_files"))
    }

    pub fn list_files(&self, id: &WorkbenchId, tree: Tree) -> Result<Vec<FileEntry>, ErrorInfo> {
        self.store.require(id).in_phase(Phase::Workbench)?;
        self.store.list_files(id, tree).in_phase(Phase::Workbench)
    }

    // Drafts

    pub fn draft_state(&self, id: &WorkbenchId) -> Result<DraftStateView, ErrorInfo> {
        Ok(self.drafts.state(id).in_phase(Phase::Review)?.view())
    }

    pub async fn create_draft(&self, id: &WorkbenchId) -> Result<DraftStateView, ErrorInfo> {
        let _guard = self.locks.acquire(id).await;
        let record = self.drafts.create(id, SOURCE_KIND_USER, "")?;
        let view = DraftState::DraftExists(record).view();
        self.draft_changed(id, view.clone());
        Ok(view)
    }

    pub async fn publish(
        &self,
        id: &WorkbenchId,
        confirm_deletions: bool,
    ) -> Result<PublishOutcome, ErrorInfo> {
        self.refuse_while_running(id, Phase::Publish)?;
        let _guard = self.locks.acquire(id).await;
        let outcome = self.drafts.publish(id, confirm_deletions)?;
        if let Ok(checkpoint) = self.checkpoints.get(id, &outcome.checkpoint_id) {
            self.checkpoint_created(id, checkpoint);
        }
        self.draft_changed(id, DraftState::NoDraft.view());
        Ok(outcome)
    }

    pub async fn discard(&self, id: &WorkbenchId) -> Result<bool, ErrorInfo> {
        self.refuse_while_running(id, Phase::Review)?;
        let _guard = self.locks.acquire(id).await;
        let discarded = self.drafts.discard(id)?;
        if discarded {
            self.draft_changed(id, DraftState::NoDraft.view());
        }
        Ok(discarded)
    }

    // Checkpoints

    pub fn list_checkpoints(&self, id: &WorkbenchId) -> Result<Vec<Checkpoint>, ErrorInfo> {
        self.checkpoints.list(id).in_phase(Phase::Review)
    }

    pub fn get_checkpoint(
        &self,
        id: &WorkbenchId,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, ErrorInfo> {
        self.checkpoints.get(id, checkpoint_id).in_phase(Phase::Review)
    }

    pub async fn create_checkpoint(
        &self,
        id: &WorkbenchId,
        description: &str,
    ) -> Result<Checkpoint, ErrorInfo> {
        let _guard = self.locks.acquire(id).await;
        let checkpoint = self
            .checkpoints
            .create(id, CheckpointReason::Manual, description)
            .in_phase(Phase::Review)?;
        self.checkpoint_created(id, checkpoint.clone());
        Ok(checkpoint)
    }

    pub async fn restore_checkpoint(
        &self,
        id: &WorkbenchId,
        checkpoint_id: &str,
    ) -> Result<RestoreOutcome, ErrorInfo> {
        self.refuse_while_running(id, Phase::Review)?;
        let _guard = self.locks.acquire(id).await;
        let outcome = self
            .checkpoints
            .restore(id, checkpoint_id)
            .in_phase(Phase::Review)?;
        if let Some(pre) = &outcome.pre_restore_checkpoint_id {
            if let Ok(checkpoint) = self.checkpoints.get(id, pre) {
                self.checkpoint_created(id, checkpoint);
            }
        }
        Ok(outcome)
    }

    // Workshop

    /// Run the agent for one user message. Consent is checked before anything is recorded.
    pub async fn run_agent(
        &self,
        id: &WorkbenchId,
        provider_id: &str,
        message: &str,
    ) -> Result<RunOutcome, ErrorInfo> {
        self.store.require(id).in_phase(Phase::Workshop)?;
        let inner = self.providers.get(provider_id)?;
        self.consent
            .ensure(id, inner.provider_id(), inner.model_id())?;
        let client = self.consent.client(id, inner)?;

        let cancel = self.runs.start(id)?;
        let _run = RunGuard {
            table: &self.runs,
            id: id.clone(),
        };
        let _guard = self.locks.acquire(id).await;
        self.agent.run(id, &client, message, &cancel).await
    }

    /// Request cancellation of the active run. Returns false when none is active.
    pub fn cancel_run(&self, id: &WorkbenchId) -> bool {
        let canceled = self.runs.cancel(id);
        if canceled {
            info!(workbench_id = %id, "Run cancellation requested");
        }
        canceled
    }

    pub async fn undo_to_message(
        &self,
        id: &WorkbenchId,
        message_id: &str,
    ) -> Result<UndoOutcome, ErrorInfo> {
        self.refuse_while_running(id, Phase::Workshop)?;
        let _guard = self.locks.acquire(id).await;
        let outcome = self.drafts.undo_to_message(id, message_id)?;
        self.notifier.notify(Notification::UndoCompleted {
            workbench_id: id.to_string(),
            message_id: outcome.message_id.clone(),
            revision_id: outcome.revision_id.clone(),
            has_draft: outcome.draft.has_draft,
        });
        self.draft_changed(id, outcome.draft.clone());
        Ok(outcome)
    }

    pub fn conversation(&self, id: &WorkbenchId) -> Result<Vec<ConversationEntry>, ErrorInfo> {
        let paths = self.store.require(id).in_phase(Phase::Workshop)?;
        ConversationLog::new(paths.conversation())
            .load()
            .in_phase(Phase::Workshop)
    }

    // Egress

    fn model_for(&self, provider_id: &str) -> Result<String, ErrorInfo> {
        Ok(self.providers.get(provider_id)?.model_id().to_string())
    }

    pub fn consent_status(
        &self,
        id: &WorkbenchId,
        provider_id: &str,
    ) -> Result<ConsentStatus, ErrorInfo> {
        let model_id = self.model_for(provider_id)?;
        self.consent.status(id, provider_id, &model_id)
    }

    pub fn grant_consent(
        &self,
        id: &WorkbenchId,
        provider_id: &str,
        scope_hash: &str,
        persist: bool,
    ) -> Result<ConsentStatus, ErrorInfo> {
        let model_id = self.model_for(provider_id)?;
        self.consent
            .grant(id, provider_id, &model_id, scope_hash, persist)
    }

    pub fn revoke_consent(&self, id: &WorkbenchId, provider_id: &str) -> Result<bool, ErrorInfo> {
        let model_id = self.model_for(provider_id)?;
        self.consent.revoke(id, provider_id, &model_id)
    }

    pub fn egress_events(&self, id: &WorkbenchId) -> Result<Vec<EgressEvent>, ErrorInfo> {
        self.consent.events(id)
    }
}
