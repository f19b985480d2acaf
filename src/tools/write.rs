//! Write-capable tools. Each one plans a [`FileOp`]; nothing here touches the disk.

use super::{str_arg, FileOp, ToolHandler, WriteTool};
use crate::error::{ErrorInfo, InPhase, Phase};
use crate::provider::ToolDefinition;
use crate::store::path::normalize_relative;
use crate::store::{FileKind, FileLimits};
use serde_json::{json, Value};

pub(super) fn builtin() -> Vec<(ToolDefinition, ToolHandler)> {
    let path_only = json!({
        "type": "object",
        "properties": {"path": {"type": "string"}},
        "required": ["path"]
    });
    let office = |kind: &str| {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "ops": {"type": "array", "description": format!("{kind} operations applied in order")},
                "create_new": {"type": "boolean"},
                "copy_from": {"type": "string"}
            },
            "required": ["path", "ops"]
        })
    };

    vec![
        (
            ToolDefinition {
                name: "write_text_file".to_string(),
                description: "Create or replace a text file in the draft.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["path", "content"]
                }),
            },
            ToolHandler::Write(Box::new(WriteTextFile)),
        ),
        (
            ToolDefinition {
                name: "delete_file".to_string(),
                description: "Delete a file from the draft.".to_string(),
                parameters: path_only,
            },
            ToolHandler::Write(Box::new(DeleteFile)),
        ),
        (
            ToolDefinition {
                name: "rename_file".to_string(),
                description: "Rename or move a file within the draft.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "from": {"type": "string"},
                        "to": {"type": "string"}
                    },
                    "required": ["from", "to"]
                }),
            },
            ToolHandler::Write(Box::new(RenameFile)),
        ),
        (
            ToolDefinition {
                name: "xlsx_operations".to_string(),
                description: "Apply spreadsheet operations to an .xlsx file in the draft."
                    .to_string(),
                parameters: office("spreadsheet"),
            },
            ToolHandler::Write(Box::new(OfficeOperations(FileKind::Xlsx))),
        ),
        (
            ToolDefinition {
                name: "docx_operations".to_string(),
                description: "Apply document operations to a .docx file in the draft.".to_string(),
                parameters: office("document"),
            },
            ToolHandler::Write(Box::new(OfficeOperations(FileKind::Docx))),
        ),
        (
            ToolDefinition {
                name: "pptx_operations".to_string(),
                description: "Apply slide operations to a .pptx file in the draft.".to_string(),
                parameters: office("presentation"),
            },
            ToolHandler::Write(Box::new(OfficeOperations(FileKind::Pptx))),
        ),
    ]
}

fn path_arg(args: &Value, key: &str) -> Result<String, ErrorInfo> {
    normalize_relative(str_arg(args, key)?).in_phase(Phase::Workshop)
}

struct WriteTextFile;

impl WriteTool for WriteTextFile {
    fn plan(&self, args: &Value, limits: &FileLimits) -> Result<FileOp, ErrorInfo> {
        let path = path_arg(args, "path")?;
        let content = str_arg(args, "content")?;
        if !FileKind::from_path(&path).accepts_text_writes() {
            return Err(ErrorInfo::validation(
                Phase::Workshop,
                format!("{path} is not a text file"),
            ));
        }
        if content.len() as u64 > limits.max_file_size {
            return Err(ErrorInfo::validation(
                Phase::Workshop,
                format!("{path} exceeds the {} byte limit", limits.max_file_size),
            ));
        }
        Ok(FileOp::WriteText {
            path,
            content: content.to_string(),
        })
    }
}

struct DeleteFile;

impl WriteTool for DeleteFile {
    fn plan(&self, args: &Value, _limits: &FileLimits) -> Result<FileOp, ErrorInfo> {
        Ok(FileOp::Delete {
            path: path_arg(args, "path")?,
        })
    }
}

struct RenameFile;

impl WriteTool for RenameFile {
    fn plan(&self, args: &Value, _limits: &FileLimits) -> Result<FileOp, ErrorInfo> {
        let from = path_arg(args, "from")?;
        let to = path_arg(args, "to")?;
        if from == to {
            return Err(ErrorInfo::validation(
                Phase::Workshop,
                "rename source and target are the same",
            ));
        }
        if FileKind::from_path(&from) != FileKind::from_path(&to) {
            return Err(ErrorInfo::validation(
                Phase::Workshop,
                format!("renaming {from} to {to} would change its file type"),
            ));
        }
        Ok(FileOp::Rename { from, to })
    }
}

struct OfficeOperations(FileKind);

impl WriteTool for OfficeOperations {
    fn plan(&self, args: &Value, _limits: &FileLimits) -> Result<FileOp, ErrorInfo> {
        let path = path_arg(args, "path")?;
        if FileKind::from_path(&path) != self.0 {
            return Err(ErrorInfo::validation(
                Phase::Workshop,
                format!("{path} is not a {:?} file", self.0),
            ));
        }
        let ops = args
            .get("ops")
            .filter(|v| v.as_array().is_some_and(|a| !a.is_empty()))
            .cloned()
            .ok_or_else(|| ErrorInfo::validation(Phase::Workshop, "ops must be a non-empty array"))?;
        let copy_from = match args.get("copy_from").and_then(Value::as_str) {
            Some(source) => {
                let source = normalize_relative(source).in_phase(Phase::Workshop)?;
                if FileKind::from_path(&source) != self.0 {
                    return Err(ErrorInfo::validation(
                        Phase::Workshop,
                        format!("{source} is not a {:?} file", self.0),
                    ));
                }
                Some(source)
            }
            None => None,
        };
        Ok(FileOp::Office {
            kind: self.0,
            path,
            ops,
            create_new: args
                .get("create_new")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            copy_from,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_write_text_plans() {
        let limits = FileLimits::default();
        let op = WriteTextFile
            .plan(&json!({"path": "./notes//a.md", "content": "x"}), &limits)
            .unwrap();
        assert_eq!(
            op,
            FileOp::WriteText {
                path: "notes/a.md".to_string(),
                content: "x".to_string()
            }
        );

        let escape = WriteTextFile
            .plan(&json!({"path": "../outside.txt", "content": "x"}), &limits)
            .unwrap_err();
        assert_eq!(escape.code(), ErrorCode::SandboxViolation);

        let pdf = WriteTextFile
            .plan(&json!({"path": "scan.pdf", "content": "x"}), &limits)
            .unwrap_err();
        assert_eq!(pdf.code(), ErrorCode::ValidationFailed);

        let tiny = FileLimits {
            max_files: 10,
            max_file_size: 2,
        };
        assert!(WriteTextFile
            .plan(&json!({"path": "a.txt", "content": "too big"}), &tiny)
            .is_err());
    }

    #[test]
    fn test_rename_keeps_kind() {
        let limits = FileLimits::default();
        assert!(RenameFile
            .plan(&json!({"from": "a.md", "to": "b/a.md"}), &limits)
            .is_ok());
        assert!(RenameFile
            .plan(&json!({"from": "a.md", "to": "a.pdf"}), &limits)
            .is_err());
        assert!(RenameFile
            .plan(&json!({"from": "a.md", "to": "a.md"}), &limits)
            .is_err());
    }

    #[test]
    fn test_office_plans() {
        let limits = FileLimits::default();
        let tool = OfficeOperations(FileKind::Xlsx);
        let op = tool
            .plan(
                &json!({"path": "b.xlsx", "ops": [{"op": "set_cell"}], "copy_from": "a.xlsx"}),
                &limits,
            )
            .unwrap();
        assert!(matches!(op, FileOp::Office { copy_from: Some(_), create_new: false, .. }));

        assert!(tool
            .plan(&json!({"path": "b.docx", "ops": [{}]}), &limits)
            .is_err());
        assert!(tool.plan(&json!({"path": "b.xlsx", "ops": []}), &limits).is_err());
    }
}
