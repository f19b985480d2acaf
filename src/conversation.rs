//! Conversation log (`meta/conversation.jsonl`).
//!
//! Append-only, except for explicit rewinds through [`ConversationLog::truncate_after`].

use crate::error::StorageError;
use crate::store::atomic;
use crate::types::{new_id, now_rfc3339};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    UserMessage,
    AssistantMessage,
    SystemEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub message_id: String,
    pub role: String,
    #[serde(default)]
    pub text: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ConversationEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self::message(EntryType::UserMessage, "user", "u", text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::message(EntryType::AssistantMessage, "assistant", "a", text)
    }

    pub fn system_event(event_kind: &str, text: impl Into<String>) -> Self {
        Self {
            event_kind: Some(event_kind.to_string()),
            ..Self::message(EntryType::SystemEvent, "system", "e", text)
        }
    }

    pub fn with_checkpoint(mut self, checkpoint_id: &str) -> Self {
        self.checkpoint_id = Some(checkpoint_id.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// User and assistant messages carry draft revisions; system events do not.
    pub fn is_message(&self) -> bool {
        self.entry_type != EntryType::SystemEvent
    }

    fn message(entry_type: EntryType, role: &str, prefix: &str, text: impl Into<String>) -> Self {
        Self {
            entry_type,
            message_id: new_id(prefix),
            role: role.to_string(),
            text: text.into(),
            created_at: now_rfc3339(),
            event_kind: None,
            checkpoint_id: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationLog {
    path: PathBuf,
}

impl ConversationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &ConversationEntry) -> Result<(), StorageError> {
        atomic::append_jsonl(&self.path, entry)
    }

    pub fn load(&self) -> Result<Vec<ConversationEntry>, StorageError> {
        atomic::read_jsonl(&self.path)
    }

    /// Replace the log with `entries`.
    pub fn rewrite(&self, entries: &[ConversationEntry]) -> Result<(), StorageError> {
        let mut data = Vec::new();
        for entry in entries {
            let line = serde_json::to_vec(entry).map_err(|e| StorageError::Corrupt {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
            data.extend_from_slice(&line);
            data.push(b'\n');
        }
        atomic::write_atomic(&self.path, &data)
    }

    /// Keep entries up to and including `message_id`. Returns false when the id is unknown.
    pub fn truncate_after(&self, message_id: &str) -> Result<bool, StorageError> {
        let entries = self.load()?;
        match entries.iter().position(|e| e.message_id == message_id) {
            Some(index) => {
                self.rewrite(&entries[..=index])?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
