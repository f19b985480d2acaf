//! Agent loop behavior end to end: batches, sandboxing, loop detection, cancellation and undo.

use crate::integration::test_utils::{
    calls, text, tool_call, tree_files, Bench, ScriptedProvider, ScriptedWorker,
};
use draftbench::agent::batch::{self, BatchStatus};
use draftbench::conversation::EntryType;
use draftbench::error::{ErrorCode, ErrorInfo, Phase};
use draftbench::notify::Notification;
use draftbench::provider::Role;
use draftbench::toolworker::ToolWorkerError;
use serde_json::{json, Value};
use std::fs;

fn tool_results(bench: &Bench, request: usize) -> Vec<Value> {
    bench.provider.requests()[request]
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| serde_json::from_str(&m.content).unwrap())
        .collect()
}

#[tokio::test]
async fn test_batch_failure_stops_at_first_error() {
    let worker = ScriptedWorker::with(|_, _| {
        Err(ToolWorkerError::Remote {
            code: "FILE_WRITE_FAILED".into(),
            message: "workbook is corrupt".into(),
        })
    });
    let provider = ScriptedProvider::new(vec![
        Ok(calls(vec![
            tool_call(
                "c1",
                "write_text_file",
                json!({ "path": "notes.md", "content": "one" }),
            ),
            tool_call(
                "c2",
                "xlsx_operations",
                json!({ "path": "book.xlsx", "ops": [{ "op": "set_cell", "cell": "A1", "value": 1 }] }),
            ),
            tool_call(
                "c3",
                "write_text_file",
                json!({ "path": "later.md", "content": "three" }),
            ),
        ])),
        Ok(text("The spreadsheet could not be changed.")),
    ]);
    let bench = Bench::with_worker(provider, worker);
    let id = bench
        .workbench_with(&[("a.md", "alpha"), ("book.xlsx", "PK")])
        .await;
    bench.grant(&id);

    let outcome = bench.engine.run_agent(&id, "openai", "update the book").await.unwrap();
    assert_eq!(outcome.batches, 1);

    let draft = bench.draft(&id);
    assert_eq!(fs::read_to_string(draft.join("notes.md")).unwrap(), "one");
    assert!(!draft.join("later.md").exists());

    let records = batch::list(&bench.engine.store().paths(&id)).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BatchStatus::Failed);
    assert_eq!(records[0].applied, 1);
    assert_eq!(records[0].total, 3);

    let results = tool_results(&bench, 1);
    assert_eq!(results.len(), 3);
    assert!(results[0].get("error").is_none());
    assert_eq!(results[1]["error"]["error_code"], "FILE_WRITE_FAILED");
    assert_eq!(results[2]["error"]["error_code"], "FILE_WRITE_FAILED");

    let worker_calls = bench.worker.calls();
    assert_eq!(worker_calls.len(), 1);
    assert_eq!(worker_calls[0].0, "XlsxApplyOps");
    assert_eq!(worker_calls[0].1["root"], "draft");
    assert_eq!(fs::read_to_string(bench.published(&id).join("book.xlsx")).unwrap(), "PK");
}

#[tokio::test]
async fn test_escaping_batch_is_rejected_wholesale() {
    let provider = ScriptedProvider::new(vec![
        Ok(calls(vec![
            tool_call(
                "c1",
                "write_text_file",
                json!({ "path": "fine.md", "content": "ok" }),
            ),
            tool_call(
                "c2",
                "write_text_file",
                json!({ "path": "../outside.txt", "content": "escape" }),
            ),
        ])),
        Ok(text("Could not write.")),
    ]);
    let bench = Bench::new(provider);
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;
    bench.grant(&id);

    bench.engine.run_agent(&id, "openai", "write files").await.unwrap();

    let root = bench.engine.store().paths(&id).root().to_path_buf();
    assert!(!root.join("outside.txt").exists());
    assert!(!root.parent().unwrap().join("outside.txt").exists());
    assert!(!bench.draft(&id).exists());
    assert!(!bench.engine.draft_state(&id).unwrap().has_draft);

    let results = tool_results(&bench, 1);
    assert_eq!(results[0]["error"]["error_code"], "SANDBOX_VIOLATION");
    assert_eq!(results[1]["error"]["error_code"], "SANDBOX_VIOLATION");
}

#[tokio::test]
async fn test_repeated_calls_stop_before_cap() {
    let bench = Bench::new(ScriptedProvider::repeating(calls(vec![tool_call(
        "c1",
        "read_file",
        json!({ "path": "a.md" }),
    )])));
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;
    bench.grant(&id);

    let err = bench.engine.run_agent(&id, "openai", "read it").await.unwrap_err();
    assert_eq!(err.error_code, ErrorCode::AgentLoopDetected);
    assert_eq!(bench.provider.call_count(), 5);

    let warnings: Vec<Notification> = bench
        .notifier
        .all()
        .into_iter()
        .filter(|n| matches!(n, Notification::AgentLoopWarning { .. }))
        .collect();
    assert_eq!(warnings.len(), 1);

    let conversation = bench.engine.conversation(&id).unwrap();
    let events: Vec<&str> = conversation
        .iter()
        .filter(|e| e.entry_type == EntryType::SystemEvent)
        .map(|e| e.text.as_str())
        .collect();
    assert_eq!(events.len(), 2);
    let failed = conversation.last().unwrap();
    assert_eq!(failed.event_kind.as_deref(), Some("run_failed"));
    let metadata = failed.metadata.as_ref().unwrap();
    assert_eq!(metadata["error_code"], "AGENT_LOOP_DETECTED");
    assert_eq!(metadata["aborted_from"], "executing_tools");
    assert!(!bench.engine.is_running(&id));
}

#[tokio::test]
async fn test_cancel_keeps_completed_batches_only() {
    let bench = Bench::new(ScriptedProvider::new(vec![
        Ok(calls(vec![tool_call(
            "c1",
            "write_text_file",
            json!({ "path": "first.md", "content": "1" }),
        )])),
        Ok(calls(vec![tool_call(
            "c2",
            "write_text_file",
            json!({ "path": "second.md", "content": "2" }),
        )])),
        Ok(text("unreachable")),
    ]));
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;
    bench.grant(&id);
    bench.cancel_on_call(&id, 2);

    let err = bench.engine.run_agent(&id, "openai", "write two").await.unwrap_err();
    assert_eq!(err.error_code, ErrorCode::UserCanceled);

    assert_eq!(
        tree_files(&bench.draft(&id)),
        vec!["a.md", "first.md"]
    );
    let records = batch::list(&bench.engine.store().paths(&id)).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BatchStatus::Completed);

    let conversation = bench.engine.conversation(&id).unwrap();
    let last = conversation.last().unwrap();
    assert_eq!(last.entry_type, EntryType::SystemEvent);
    assert!(!bench.engine.is_running(&id));
    assert!(!bench.engine.cancel_run(&id));
}

#[tokio::test]
async fn test_undo_to_message_rewinds_draft_and_conversation() {
    let bench = Bench::new(ScriptedProvider::new(vec![
        Ok(calls(vec![tool_call(
            "c1",
            "write_text_file",
            json!({ "path": "notes.md", "content": "v1" }),
        )])),
        Ok(text("first")),
        Ok(calls(vec![tool_call(
            "c2",
            "write_text_file",
            json!({ "path": "notes.md", "content": "v2" }),
        )])),
        Ok(text("second")),
    ]));
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;
    bench.grant(&id);

    let first = bench.engine.run_agent(&id, "openai", "draft notes").await.unwrap();
    let second = bench.engine.run_agent(&id, "openai", "revise notes").await.unwrap();
    assert_eq!(
        fs::read_to_string(bench.draft(&id).join("notes.md")).unwrap(),
        "v2"
    );

    let undo = bench
        .engine
        .undo_to_message(&id, &second.user_message_id)
        .await
        .unwrap();
    assert!(undo.draft.has_draft);
    assert_eq!(
        fs::read_to_string(bench.draft(&id).join("notes.md")).unwrap(),
        "v1"
    );
    let conversation = bench.engine.conversation(&id).unwrap();
    assert_eq!(conversation.len(), 3);
    assert_eq!(
        conversation.last().unwrap().message_id,
        second.user_message_id
    );

    let undo = bench
        .engine
        .undo_to_message(&id, &first.user_message_id)
        .await
        .unwrap();
    assert!(!undo.draft.has_draft);
    assert!(!bench.draft(&id).exists());
    assert_eq!(bench.engine.conversation(&id).unwrap().len(), 1);

    let err = bench
        .engine
        .undo_to_message(&id, &second.assistant_message_id)
        .await
        .unwrap_err();
    assert_eq!(err.error_code, ErrorCode::ValidationFailed);
    assert!(bench
        .notifier
        .methods()
        .contains(&"WorkshopUndoCompleted"));
}

#[tokio::test]
async fn test_transient_provider_errors_are_retried() {
    let bench = Bench::new(ScriptedProvider::new(vec![
        Err(ErrorInfo::new(
            ErrorCode::ProviderUnavailable,
            Phase::Workshop,
            "provider returned 503",
        )),
        Ok(text("Hello")),
    ]));
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;
    bench.grant(&id);

    let outcome = bench.engine.run_agent(&id, "openai", "hi").await.unwrap();
    assert_eq!(outcome.text, "Hello");
    assert_eq!(outcome.round_trips, 1);
    assert_eq!(bench.provider.call_count(), 2);

    let conversation = bench.engine.conversation(&id).unwrap();
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation[1].entry_type, EntryType::AssistantMessage);
    assert_eq!(conversation[1].text, "Hello");
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let bench = Bench::new(ScriptedProvider::new(vec![Err(ErrorInfo::new(
        ErrorCode::ProviderAuthFailed,
        Phase::Workshop,
        "provider returned 401",
    ))]));
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;
    bench.grant(&id);

    let err = bench.engine.run_agent(&id, "openai", "hi").await.unwrap_err();
    assert_eq!(err.error_code, ErrorCode::ProviderAuthFailed);
    assert_eq!(bench.provider.call_count(), 1);
    let conversation = bench.engine.conversation(&id).unwrap();
    assert_eq!(conversation.last().unwrap().entry_type, EntryType::SystemEvent);
}
