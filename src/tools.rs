//! Agent tool registry
//!
//! A table from tool name to a typed handler. Read handlers run immediately and return a result.
//! Write handlers only *plan*: they turn arguments into a [`FileOp`] that the batch executor
//! validates against the draft and applies. Schemas are validated when a tool is registered and
//! call arguments are checked against them before dispatch.

pub mod read;
pub mod write;

use crate::error::{ErrorInfo, Phase};
use crate::provider::ToolDefinition;
use crate::store::{FileKind, FileLimits, Tree, WorkbenchStore};
use crate::toolworker::ToolWorker;
use crate::types::WorkbenchId;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a read handler may touch.
#[derive(Clone)]
pub struct ToolContext {
    pub store: WorkbenchStore,
    pub worker: Arc<dyn ToolWorker>,
    pub workbench_id: WorkbenchId,
}

impl ToolContext {
    /// Reads see the draft when one exists, Published otherwise.
    pub fn read_tree(&self) -> Tree {
        if self.store.paths(&self.workbench_id).draft().is_dir() {
            Tree::Draft
        } else {
            Tree::Published
        }
    }
}

/// One planned mutation of the draft.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOp {
    WriteText {
        path: String,
        content: String,
    },
    Delete {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Office {
        kind: FileKind,
        path: String,
        ops: Value,
        create_new: bool,
        copy_from: Option<String>,
    },
}

impl FileOp {
    /// Primary path the operation affects.
    pub fn path(&self) -> &str {
        match self {
            FileOp::WriteText { path, .. }
            | FileOp::Delete { path }
            | FileOp::Office { path, .. } => path,
            FileOp::Rename { to, .. } => to,
        }
    }
}

#[async_trait]
pub trait ReadTool: Send + Sync {
    async fn run(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ErrorInfo>;
}

pub trait WriteTool: Send + Sync {
    /// Lexical validation and planning; no filesystem access.
    fn plan(&self, args: &Value, limits: &FileLimits) -> Result<FileOp, ErrorInfo>;
}

pub enum ToolHandler {
    Read(Box<dyn ReadTool>),
    Write(Box<dyn WriteTool>),
}

impl ToolHandler {
    pub fn is_write(&self) -> bool {
        matches!(self, ToolHandler::Write(_))
    }
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: ToolHandler,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in tool.
    pub fn builtin() -> Result<Self, String> {
        let mut registry = Self::new();
        for (definition, handler) in read::builtin().into_iter().chain(write::builtin()) {
            registry.register(definition, handler)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, definition: ToolDefinition, handler: ToolHandler) -> Result<(), String> {
        if definition.name.trim().is_empty() {
            return Err("tool name is required".to_string());
        }
        if self.index.contains_key(&definition.name) {
            return Err(format!("duplicate tool {:?}", definition.name));
        }
        validate_schema(&definition.name, &definition.parameters)?;
        self.index.insert(definition.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            definition,
            handler,
        });
        Ok(())
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ToolHandler> {
        self.index.get(name).map(|&i| &self.tools[i].handler)
    }

    pub fn is_write(&self, name: &str) -> bool {
        self.get(name).is_some_and(ToolHandler::is_write)
    }

    /// Check required keys and primitive types against the registered schema.
    pub fn check_args(&self, name: &str, args: &Value) -> Result<(), ErrorInfo> {
        let tool = self
            .index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| ErrorInfo::validation(Phase::Workshop, format!("unknown tool {name:?}")))?;
        let object = args.as_object().ok_or_else(|| {
            ErrorInfo::validation(Phase::Workshop, format!("{name}: arguments must be an object"))
        })?;
        let schema = &tool.definition.parameters;

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    return Err(ErrorInfo::validation(
                        Phase::Workshop,
                        format!("{name}: missing required argument {key:?}"),
                    ));
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (key, value) in object {
                let Some(expected) = properties
                    .get(key)
                    .and_then(|p| p.get("type"))
                    .and_then(Value::as_str)
                else {
                    continue;
                };
                if !matches_type(value, expected) {
                    return Err(ErrorInfo::validation(
                        Phase::Workshop,
                        format!("{name}: argument {key:?} must be of type {expected}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn validate_schema(name: &str, schema: &Value) -> Result<(), String> {
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Err(format!("{name}: schema type must be \"object\""));
    }
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .ok_or_else(|| format!("{name}: schema needs a properties object"))?;
    if let Some(required) = schema.get("required") {
        let required = required
            .as_array()
            .ok_or_else(|| format!("{name}: required must be an array"))?;
        for key in required {
            let key = key
                .as_str()
                .ok_or_else(|| format!("{name}: required entries must be strings"))?;
            if !properties.contains_key(key) {
                return Err(format!("{name}: required key {key:?} is not a property"));
            }
        }
    }
    Ok(())
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

/// Required string argument.
pub(crate) fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, ErrorInfo> {
    args.get(key).and_then(Value::as_str).ok_or_else(|| {
        ErrorInfo::validation(Phase::Workshop, format!("argument {key:?} must be a string"))
    })
}
