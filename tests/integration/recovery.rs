//! Startup recovery of interrupted restores, drafts and batches.

use crate::integration::test_utils::{
    test_config, tree_files, Bench, ScriptedProvider, ScriptedWorker,
};
use draftbench::agent::batch::{self, BatchStatus};
use draftbench::checkpoint::RestoreMarker;
use draftbench::engine::Engine;
use draftbench::notify::NullNotifier;
use draftbench::provider::ProviderRegistry;
use serde_json::json;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn reopen(dir: &TempDir) -> Engine {
    Engine::new(
        test_config(dir),
        ProviderRegistry::new(),
        Arc::new(ScriptedWorker::ok()),
        Arc::new(NullNotifier),
    )
    .unwrap()
}

#[tokio::test]
async fn test_interrupted_restore_rolls_back() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let bench = Bench::with_config(
        dir,
        config,
        ScriptedProvider::new(Vec::new()),
        ScriptedWorker::ok(),
    );
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;
    let checkpoint = bench.engine.create_checkpoint(&id, "base").await.unwrap();

    // Crash after Published was moved aside but before the checkpoint copy landed.
    let paths = bench.engine.store().paths(&id);
    fs::rename(paths.published(), paths.published_prev()).unwrap();
    fs::create_dir_all(paths.published_restore_tmp()).unwrap();
    let marker = RestoreMarker {
        checkpoint_id: checkpoint.checkpoint_id.clone(),
        pre_restore_checkpoint_id: "cp-missing".into(),
        created_at: "2026-01-01T00:00:00Z".into(),
    };
    fs::write(paths.restore_marker(), serde_json::to_vec(&marker).unwrap()).unwrap();

    let engine = reopen(&bench.dir);
    let paths = engine.store().paths(&id);
    assert!(!paths.restore_marker().exists());
    assert!(!paths.published_prev().exists());
    assert!(!paths.published_restore_tmp().exists());
    assert_eq!(tree_files(&paths.published()), vec!["a.md"]);
    assert_eq!(engine.list_checkpoints(&id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_applying_batches_marked_interrupted() {
    let bench = Bench::new(ScriptedProvider::new(Vec::new()));
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;
    bench.engine.create_draft(&id).await.unwrap();

    let paths = bench.engine.store().paths(&id);
    fs::create_dir_all(paths.batches()).unwrap();
    let record = json!({
        "batch_id": "batch-1",
        "message_id": "msg-1",
        "status": "applying",
        "total": 2,
        "applied": 1,
        "created_at": "2026-01-01T00:00:00Z"
    });
    fs::write(
        paths.batches().join("batch-1.json"),
        serde_json::to_vec(&record).unwrap(),
    )
    .unwrap();

    let engine = reopen(&bench.dir);
    let records = batch::list(&engine.store().paths(&id)).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BatchStatus::Interrupted);
    assert_eq!(records[0].applied, 1);
    assert!(engine.draft_state(&id).unwrap().has_draft);
}
