//! Engine-to-client notifications.
//!
//! The engine emits these while it works; the RPC layer turns each into a JSON-RPC notification
//! whose method is [`Notification::method`].

use crate::checkpoint::Checkpoint;
use crate::draft::DraftStateView;
use crate::error::ErrorInfo;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Notification {
    ToolExecuting {
        workbench_id: String,
        tool_call_id: String,
        tool: String,
    },
    ToolComplete {
        workbench_id: String,
        tool_call_id: String,
        tool: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    AssistantText {
        workbench_id: String,
        text: String,
    },
    AgentLoopWarning {
        workbench_id: String,
        tool: String,
        repeats: usize,
    },
    DraftStateChanged {
        workbench_id: String,
        draft: DraftStateView,
    },
    CheckpointCreated {
        workbench_id: String,
        checkpoint: Checkpoint,
    },
    UndoCompleted {
        workbench_id: String,
        message_id: String,
        revision_id: String,
        has_draft: bool,
    },
}

impl Notification {
    pub fn method(&self) -> &'static str {
        match self {
            Notification::ToolExecuting { .. } => "WorkshopToolExecuting",
            Notification::ToolComplete { .. } => "WorkshopToolComplete",
            Notification::AssistantText { .. } => "WorkshopAssistantText",
            Notification::AgentLoopWarning { .. } => "WorkshopAgentLoopWarning",
            Notification::DraftStateChanged { .. } => "WorkbenchDraftStateChanged",
            Notification::CheckpointCreated { .. } => "CheckpointCreated",
            Notification::UndoCompleted { .. } => "WorkshopUndoCompleted",
        }
    }

    pub fn params(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notification: Notification) {}
}
