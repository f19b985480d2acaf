//! Read-only tools: `list_files`, `get_file_info`, `read_file`.

use super::{str_arg, ReadTool, ToolContext, ToolHandler};
use crate::error::{ErrorInfo, InPhase, Phase};
use crate::provider::ToolDefinition;
use crate::store::FileKind;
use crate::toolworker::methods;
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_MAX_CHARS: usize = 50_000;

pub(super) fn builtin() -> Vec<(ToolDefinition, ToolHandler)> {
    vec![
        (
            ToolDefinition {
                name: "list_files".to_string(),
                description: "List the files in the workbench (the draft when one exists)."
                    .to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            ToolHandler::Read(Box::new(ListFiles)),
        ),
        (
            ToolDefinition {
                name: "get_file_info".to_string(),
                description: "Size, type and writability of one file.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {"path": {"type": "string"}},
                    "required": ["path"]
                }),
            },
            ToolHandler::Read(Box::new(GetFileInfo)),
        ),
        (
            ToolDefinition {
                name: "read_file".to_string(),
                description: "Read a file as text. Office documents and PDFs are extracted."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "max_chars": {"type": "integer"}
                    },
                    "required": ["path"]
                }),
            },
            ToolHandler::Read(Box::new(ReadFile)),
        ),
    ]
}

struct ListFiles;

#[async_trait]
impl ReadTool for ListFiles {
    async fn run(&self, ctx: &ToolContext, _args: &Value) -> Result<Value, ErrorInfo> {
        let tree = ctx.read_tree();
        let files = ctx
            .store
            .list_files(&ctx.workbench_id, tree)
            .in_phase(Phase::Workshop)?;
        Ok(json!({ "tree": tree, "files": files }))
    }
}

struct GetFileInfo;

#[async_trait]
impl ReadTool for GetFileInfo {
    async fn run(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ErrorInfo> {
        let path = str_arg(args, "path")?;
        let entry = ctx
            .store
            .file_info(&ctx.workbench_id, ctx.read_tree(), path)
            .in_phase(Phase::Workshop)?;
        let read_only = entry.kind.is_read_only();
        let mut value = serde_json::to_value(&entry).unwrap_or_else(|_| json!({}));
        value["read_only"] = json!(read_only);
        Ok(value)
    }
}

struct ReadFile;

#[async_trait]
impl ReadTool for ReadFile {
    async fn run(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ErrorInfo> {
        let path = str_arg(args, "path")?;
        let max_chars = args
            .get("max_chars")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_CHARS);
        let tree = ctx.read_tree();
        let entry = ctx
            .store
            .file_info(&ctx.workbench_id, tree, path)
            .in_phase(Phase::Workshop)?;

        let method = match entry.kind {
            FileKind::Text => {
                let bytes = ctx
                    .store
                    .read(&ctx.workbench_id, tree, &entry.path)
                    .in_phase(Phase::Workshop)?;
                let text = String::from_utf8_lossy(&bytes);
                let (text, truncated) = truncate_chars(&text, max_chars);
                return Ok(json!({
                    "path": entry.path,
                    "text": text,
                    "truncated": truncated,
                }));
            }
            FileKind::Docx => methods::DOCX_EXTRACT_TEXT,
            FileKind::Pptx => methods::PPTX_EXTRACT_TEXT,
            FileKind::Pdf => methods::PDF_EXTRACT_TEXT,
            FileKind::Xlsx => methods::XLSX_GET_INFO,
            FileKind::Odt | FileKind::Image | FileKind::Binary => {
                return Err(ErrorInfo::validation(
                    Phase::Workshop,
                    format!("{} cannot be read as text", entry.path),
                ));
            }
        };

        let root = match tree {
            crate::store::Tree::Draft => "draft",
            crate::store::Tree::Published => "published",
        };
        let result = ctx
            .worker
            .call(
                method,
                json!({
                    "workbench_id": ctx.workbench_id.as_str(),
                    "path": entry.path,
                    "root": root,
                }),
            )
            .await
            .map_err(|e| e.into_info(Phase::Workshop, false))?;
        Ok(json!({ "path": entry.path, "content": result }))
    }
}

fn truncate_chars(text: &str, max: usize) -> (&str, bool) {
    match text.char_indices().nth(max) {
        Some((idx, _)) => (&text[..idx], true),
        None => (text, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileLimits, Tree, WorkbenchStore};
    use crate::toolworker::{ToolWorker, ToolWorkerError};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct ExtractWorker;

    #[async_trait]
    impl ToolWorker for ExtractWorker {
        async fn call(&self, method: &str, params: Value) -> Result<Value, ToolWorkerError> {
            Ok(json!({"method": method, "root": params["root"]}))
        }
    }

    fn context() -> (ToolContext, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = WorkbenchStore::new(dir.path(), FileLimits::default()).unwrap();
        let id = store.create("wb").unwrap().id;
        store
            .write_atomic(&id, Tree::Published, "notes.md", "héllo wörld".as_bytes())
            .unwrap();
        store
            .write_atomic(&id, Tree::Published, "deck.pptx", b"PK")
            .unwrap();
        store
            .write_atomic(&id, Tree::Published, "photo.png", b"\x89PNG")
            .unwrap();
        let ctx = ToolContext {
            store,
            worker: Arc::new(ExtractWorker),
            workbench_id: id,
        };
        (ctx, dir)
    }

    #[tokio::test]
    async fn test_list_and_info() {
        let (ctx, _dir) = context();
        let listed = ListFiles.run(&ctx, &json!({})).await.unwrap();
        assert_eq!(listed["tree"], "published");
        assert_eq!(listed["files"].as_array().unwrap().len(), 3);

        let info = GetFileInfo
            .run(&ctx, &json!({"path": "photo.png"}))
            .await
            .unwrap();
        assert_eq!(info["kind"], "image");
        assert_eq!(info["read_only"], true);
    }

    #[tokio::test]
    async fn test_read_text_truncates() {
        let (ctx, _dir) = context();
        let full = ReadFile
            .run(&ctx, &json!({"path": "notes.md"}))
            .await
            .unwrap();
        assert_eq!(full["text"], "héllo wörld");
        assert_eq!(full["truncated"], false);

        let short = ReadFile
            .run(&ctx, &json!({"path": "notes.md", "max_chars": 5}))
            .await
            .unwrap();
        assert_eq!(short["text"], "héllo");
        assert_eq!(short["truncated"], true);
    }

    #[tokio::test]
    async fn test_read_delegates_office_and_rejects_images() {
        let (ctx, _dir) = context();
        let deck = ReadFile
            .run(&ctx, &json!({"path": "deck.pptx"}))
            .await
            .unwrap();
        assert_eq!(deck["content"]["method"], "PptxExtractText");
        assert_eq!(deck["content"]["root"], "published");

        assert!(ReadFile
            .run(&ctx, &json!({"path": "photo.png"}))
            .await
            .is_err());
        assert!(ReadFile
            .run(&ctx, &json!({"path": "../etc/passwd"}))
            .await
            .is_err());
    }
}
