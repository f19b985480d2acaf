//! JSON-RPC surface driven line by line.

use crate::integration::test_utils::{calls, text, tool_call, Bench, ScriptedProvider};
use draftbench::rpc::{handle_line, ENGINE_ERROR, METHOD_NOT_FOUND};
use serde_json::{json, Value};

async fn call(bench: &Bench, id: u64, method: &str, params: Value) -> Value {
    let line = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }).to_string();
    let reply = handle_line(&bench.engine, &line).await.unwrap();
    assert_eq!(reply["jsonrpc"], "2.0");
    assert_eq!(reply["id"], id);
    reply
}

async fn ok(bench: &Bench, id: u64, method: &str, params: Value) -> Value {
    let reply = call(bench, id, method, params).await;
    assert!(reply.get("error").is_none(), "{method} failed: {reply}");
    reply["result"].clone()
}

#[tokio::test]
async fn test_workshop_round_trip() {
    let bench = Bench::new(ScriptedProvider::new(vec![
        Ok(calls(vec![
            tool_call("c1", "list_files", json!({})),
            tool_call(
                "c2",
                "write_text_file",
                json!({ "path": "summary.md", "content": "done" }),
            ),
        ])),
        Ok(text("Summary written.")),
    ]));
    let source = bench.source("a.md", "alpha");

    let created = ok(&bench, 1, "WorkbenchCreate", json!({ "name": "Q3" })).await;
    let wb = created["id"].as_str().unwrap().to_string();

    let added = ok(
        &bench,
        2,
        "WorkbenchFilesAdd",
        json!({ "workbench_id": wb, "paths": [source] }),
    )
    .await;
    assert_eq!(added[0]["path"], "a.md");

    let denied = call(
        &bench,
        3,
        "WorkshopRunAgent",
        json!({ "workbench_id": wb, "provider_id": "openai", "message": "summarize" }),
    )
    .await;
    assert_eq!(denied["error"]["code"], ENGINE_ERROR);
    assert_eq!(denied["error"]["data"]["error_code"], "EGRESS_CONSENT_REQUIRED");
    assert_eq!(denied["error"]["data"]["retryable"], true);
    let scope_hash = denied["error"]["data"]["scope_hash"].as_str().unwrap().to_string();

    let status = ok(
        &bench,
        4,
        "EgressGrantWorkshopConsent",
        json!({ "workbench_id": wb, "provider_id": "openai", "scope_hash": scope_hash }),
    )
    .await;
    assert_eq!(status["consented"], true);

    let run = ok(
        &bench,
        5,
        "WorkshopRunAgent",
        json!({ "workbench_id": wb, "provider_id": "openai", "message": "summarize" }),
    )
    .await;
    assert_eq!(run["text"], "Summary written.");

    let draft = ok(&bench, 6, "DraftGetState", json!({ "workbench_id": wb })).await;
    assert_eq!(draft["has_draft"], true);
    assert_eq!(draft["source_kind"], "workshop");

    let files = ok(
        &bench,
        7,
        "WorkbenchFilesList",
        json!({ "workbench_id": wb, "tree": "draft" }),
    )
    .await;
    let paths: Vec<&str> = files
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec!["a.md", "summary.md"]);

    let published = ok(&bench, 8, "DraftPublish", json!({ "workbench_id": wb })).await;
    let checkpoints = ok(&bench, 9, "CheckpointsList", json!({ "workbench_id": wb })).await;
    assert_eq!(checkpoints[0]["checkpoint_id"], published["checkpoint_id"]);
    assert_eq!(checkpoints[0]["reason"], "publish");

    let conversation = ok(
        &bench,
        10,
        "WorkshopGetConversation",
        json!({ "workbench_id": wb }),
    )
    .await;
    let types: Vec<&str> = conversation
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["entry_type"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["user_message", "assistant_message", "system_event"]);

    let events = ok(&bench, 11, "EgressListEvents", json!({ "workbench_id": wb })).await;
    assert_eq!(events.as_array().unwrap().len(), 3);

    let canceled = ok(&bench, 12, "WorkshopCancelRun", json!({ "workbench_id": wb })).await;
    assert_eq!(canceled["canceled"], false);

    let methods = bench.notifier.methods();
    let first_exec = methods
        .iter()
        .position(|m| *m == "WorkshopToolExecuting")
        .unwrap();
    let text_at = methods
        .iter()
        .position(|m| *m == "WorkshopAssistantText")
        .unwrap();
    assert!(first_exec < text_at);
}

#[tokio::test]
async fn test_error_mapping() {
    let bench = Bench::new(ScriptedProvider::new(Vec::new()));

    let unknown = call(&bench, 1, "WorkbenchExplode", json!({})).await;
    assert_eq!(unknown["error"]["code"], METHOD_NOT_FOUND);

    let missing = call(&bench, 2, "DraftPublish", json!({})).await;
    assert_eq!(missing["error"]["data"]["error_code"], "VALIDATION_FAILED");
    assert_eq!(missing["error"]["data"]["detail"], "invalid params");

    let nowhere = call(
        &bench,
        3,
        "CheckpointsList",
        json!({ "workbench_id": "wb-does-not-exist" }),
    )
    .await;
    assert_eq!(nowhere["error"]["code"], ENGINE_ERROR);

    let created = call(&bench, 4, "WorkbenchCreate", json!({ "name": "x" })).await;
    let wb = created["result"]["id"].as_str().unwrap();
    let no_draft = call(&bench, 5, "DraftPublish", json!({ "workbench_id": wb })).await;
    assert_eq!(no_draft["error"]["data"]["error_code"], "VALIDATION_FAILED");
    assert_eq!(no_draft["error"]["data"]["phase"], "publish");

    let discard = call(&bench, 6, "DraftDiscard", json!({ "workbench_id": wb })).await;
    assert_eq!(discard["result"]["discarded"], false);
}
