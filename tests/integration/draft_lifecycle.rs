//! Draft, publish and checkpoint lifecycle through the engine facade.

use crate::integration::test_utils::{
    calls, test_config, text, tool_call, tree_files, Bench, ScriptedProvider, ScriptedWorker,
};
use draftbench::checkpoint::CheckpointReason;
use draftbench::error::ErrorCode;
use draftbench::store::Tree;
use serde_json::json;
use std::fs;
use tempfile::TempDir;

#[tokio::test]
async fn test_add_publish_restore_scenario() {
    let bench = Bench::new(ScriptedProvider::new(vec![
        Ok(calls(vec![tool_call(
            "c1",
            "write_text_file",
            json!({ "path": "report.md", "content": "# Q3 report" }),
        )])),
        Ok(text("Wrote the report.")),
    ]));
    let id = bench
        .workbench_with(&[("a.md", "alpha"), ("b.txt", "bravo")])
        .await;
    bench.grant(&id);

    let view = bench.engine.create_draft(&id).await.unwrap();
    assert!(view.has_draft);
    assert!(bench.draft(&id).is_dir());

    let outcome = bench.engine.run_agent(&id, "openai", "write a report").await.unwrap();
    assert_eq!(outcome.text, "Wrote the report.");
    assert_eq!(outcome.batches, 1);
    assert_eq!(
        fs::read_to_string(bench.draft(&id).join("report.md")).unwrap(),
        "# Q3 report"
    );
    assert!(!bench.published(&id).join("report.md").exists());

    let published = bench.engine.publish(&id, false).await.unwrap();
    assert_eq!(published.files, 3);
    assert!(!bench.draft(&id).exists());
    assert!(!bench.engine.draft_state(&id).unwrap().has_draft);
    assert_eq!(
        tree_files(&bench.published(&id)),
        vec!["a.md", "b.txt", "report.md"]
    );

    let checkpoint = bench
        .engine
        .get_checkpoint(&id, &published.checkpoint_id)
        .unwrap();
    assert_eq!(checkpoint.reason, CheckpointReason::Publish);
    assert_eq!(checkpoint.stats.files, 2);

    let restored = bench
        .engine
        .restore_checkpoint(&id, &published.checkpoint_id)
        .await
        .unwrap();
    assert!(restored.restored);
    assert!(restored.pre_restore_checkpoint_id.is_some());
    assert_eq!(tree_files(&bench.published(&id)), vec!["a.md", "b.txt"]);
    assert_eq!(
        fs::read_to_string(bench.published(&id).join("a.md")).unwrap(),
        "alpha"
    );

    let again = bench
        .engine
        .restore_checkpoint(&id, &published.checkpoint_id)
        .await
        .unwrap();
    assert!(!again.restored);

    let methods = bench.notifier.methods();
    assert!(methods.contains(&"WorkshopToolExecuting"));
    assert!(methods.contains(&"WorkshopToolComplete"));
    assert!(methods.contains(&"CheckpointCreated"));
    assert!(methods.contains(&"WorkbenchDraftStateChanged"));
}

#[tokio::test]
async fn test_draft_transitions() {
    let bench = Bench::new(ScriptedProvider::new(Vec::new()));
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;

    let err = bench.engine.publish(&id, false).await.unwrap_err();
    assert_eq!(err.error_code, ErrorCode::ValidationFailed);

    assert!(!bench.engine.discard(&id).await.unwrap());

    bench.engine.create_draft(&id).await.unwrap();
    let err = bench.engine.create_draft(&id).await.unwrap_err();
    assert_eq!(err.error_code, ErrorCode::ValidationFailed);

    fs::write(bench.draft(&id).join("a.md"), "changed").unwrap();
    assert!(bench.engine.discard(&id).await.unwrap());
    assert!(!bench.draft(&id).exists());
    assert!(!bench.engine.discard(&id).await.unwrap());
    assert_eq!(
        fs::read_to_string(bench.published(&id).join("a.md")).unwrap(),
        "alpha"
    );
}

#[tokio::test]
async fn test_publish_with_deletions_needs_confirmation() {
    let bench = Bench::new(ScriptedProvider::new(Vec::new()));
    let id = bench
        .workbench_with(&[("a.md", "alpha"), ("b.md", "bravo")])
        .await;
    bench.engine.create_draft(&id).await.unwrap();
    fs::remove_file(bench.draft(&id).join("b.md")).unwrap();

    let err = bench.engine.publish(&id, false).await.unwrap_err();
    assert_eq!(err.error_code, ErrorCode::ValidationFailed);
    assert!(bench.draft(&id).exists());
    assert!(bench.published(&id).join("b.md").exists());

    bench.engine.publish(&id, true).await.unwrap();
    assert_eq!(tree_files(&bench.published(&id)), vec!["a.md"]);
}

#[tokio::test]
async fn test_add_files_takes_auto_checkpoint() {
    let bench = Bench::new(ScriptedProvider::new(Vec::new()));
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;
    assert!(bench.engine.list_checkpoints(&id).unwrap().is_empty());

    let extra = bench.source("c.md", "charlie");
    let added = bench.engine.add_files(&id, &[extra]).await.unwrap();
    assert_eq!(added.len(), 1);

    let checkpoints = bench.engine.list_checkpoints(&id).unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].reason, CheckpointReason::Auto);
    assert_eq!(checkpoints[0].stats.files, 1);

    let files = bench.engine.list_files(&id, Tree::Published).unwrap();
    let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["a.md", "c.md"]);
}

#[tokio::test]
async fn test_rejected_add_takes_no_checkpoint() {
    let bench = Bench::new(ScriptedProvider::new(Vec::new()));
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;

    let duplicate = bench.source("a.md", "again");
    let err = bench.engine.add_files(&id, &[duplicate]).await.unwrap_err();
    assert_eq!(err.error_code, ErrorCode::ValidationFailed);

    let missing = bench.source("m.md", "gone");
    fs::remove_file(&missing).unwrap();
    let err = bench.engine.add_files(&id, &[missing]).await.unwrap_err();
    assert_eq!(err.error_code, ErrorCode::FileReadFailed);

    assert!(bench.engine.list_checkpoints(&id).unwrap().is_empty());
    assert_eq!(tree_files(&bench.published(&id)), vec!["a.md"]);
}

#[tokio::test]
async fn test_retention_keeps_publish_checkpoints() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.checkpoints.max_manual = 2;
    let bench = Bench::with_config(
        dir,
        config,
        ScriptedProvider::new(Vec::new()),
        ScriptedWorker::ok(),
    );
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;

    bench.engine.create_draft(&id).await.unwrap();
    bench.engine.publish(&id, false).await.unwrap();
    for n in 0..4 {
        bench
            .engine
            .create_checkpoint(&id, &format!("manual {n}"))
            .await
            .unwrap();
    }

    let checkpoints = bench.engine.list_checkpoints(&id).unwrap();
    let manual: Vec<_> = checkpoints
        .iter()
        .filter(|c| c.reason == CheckpointReason::Manual)
        .collect();
    assert_eq!(manual.len(), 2);
    let descriptions: Vec<&str> = manual.iter().map(|c| c.description.as_str()).collect();
    assert!(descriptions.contains(&"manual 3"));
    assert!(!descriptions.contains(&"manual 0"));
    assert_eq!(
        checkpoints
            .iter()
            .filter(|c| c.reason == CheckpointReason::Publish)
            .count(),
        1
    );
}
