//! Error types for the draftbench engine.
//!
//! Layer-local failures (`StorageError`, `ConfigError`) are converted exactly once into the
//! wire-level [`ErrorInfo`], which callers match on by [`ErrorCode`] and never by message text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// ENOSPC on Linux and macOS.
const ENOSPC: i32 = 28;

/// Stable error codes exposed over RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    EgressConsentRequired,
    EgressBlockedByPolicy,
    SandboxViolation,
    ValidationFailed,
    AgentLoopDetected,
    DiskFull,
    FileReadFailed,
    FileWriteFailed,
    ToolWorkerUnavailable,
    ProviderAuthFailed,
    ProviderUnavailable,
    ProviderNotConfigured,
    NetworkUnavailable,
    UserCanceled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::EgressConsentRequired => "EGRESS_CONSENT_REQUIRED",
            ErrorCode::EgressBlockedByPolicy => "EGRESS_BLOCKED_BY_POLICY",
            ErrorCode::SandboxViolation => "SANDBOX_VIOLATION",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::AgentLoopDetected => "AGENT_LOOP_DETECTED",
            ErrorCode::DiskFull => "DISK_FULL",
            ErrorCode::FileReadFailed => "FILE_READ_FAILED",
            ErrorCode::FileWriteFailed => "FILE_WRITE_FAILED",
            ErrorCode::ToolWorkerUnavailable => "TOOL_WORKER_UNAVAILABLE",
            ErrorCode::ProviderAuthFailed => "PROVIDER_AUTH_FAILED",
            ErrorCode::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            ErrorCode::ProviderNotConfigured => "PROVIDER_NOT_CONFIGURED",
            ErrorCode::NetworkUnavailable => "NETWORK_UNAVAILABLE",
            ErrorCode::UserCanceled => "USER_CANCELED",
        }
    }

    /// Whether the user (or caller) may simply try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::EgressConsentRequired
                | ErrorCode::ToolWorkerUnavailable
                | ErrorCode::ProviderUnavailable
                | ErrorCode::NetworkUnavailable
        )
    }

    /// Provider/network transients the engine retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::ProviderUnavailable | ErrorCode::NetworkUnavailable
        )
    }

    fn default_actions(&self) -> Vec<Action> {
        match self {
            ErrorCode::EgressConsentRequired
            | ErrorCode::ToolWorkerUnavailable
            | ErrorCode::ProviderUnavailable
            | ErrorCode::NetworkUnavailable => vec![Action::Retry],
            ErrorCode::ProviderAuthFailed
            | ErrorCode::ProviderNotConfigured
            | ErrorCode::EgressBlockedByPolicy => vec![Action::OpenSettings],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine phase in which an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Workbench,
    Workshop,
    Review,
    Publish,
    Settings,
}

/// Suggested follow-up for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Retry,
    OpenSettings,
    ReviewDraft,
    DiscardDraft,
}

/// Structured error returned to RPC callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{error_code}: {detail}")]
pub struct ErrorInfo {
    pub error_code: ErrorCode,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subphase: Option<String>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workbench_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_hash: Option<String>,
    #[serde(default)]
    pub detail: String,
    /// Provider-supplied back-off hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, phase: Phase, detail: impl Into<String>) -> Self {
        Self {
            error_code: code,
            phase,
            subphase: None,
            retryable: code.is_retryable(),
            actions: code.default_actions(),
            provider_id: None,
            model_id: None,
            workbench_id: None,
            scope_hash: None,
            detail: detail.into(),
            retry_after_ms: None,
        }
    }

    pub fn validation(phase: Phase, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, phase, detail)
    }

    pub fn sandbox(phase: Phase, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::SandboxViolation, phase, detail)
    }

    pub fn file_read(phase: Phase, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::FileReadFailed, phase, detail)
    }

    pub fn file_write(phase: Phase, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::FileWriteFailed, phase, detail)
    }

    pub fn canceled(phase: Phase) -> Self {
        Self::new(ErrorCode::UserCanceled, phase, "canceled by user")
    }

    pub fn loop_detected(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::AgentLoopDetected, Phase::Workshop, detail)
    }

    pub fn with_subphase(mut self, subphase: impl Into<String>) -> Self {
        self.subphase = Some(subphase.into());
        self
    }

    pub fn with_provider(mut self, provider_id: &str, model_id: &str) -> Self {
        self.provider_id = Some(provider_id.to_string());
        self.model_id = Some(model_id.to_string());
        self
    }

    pub fn with_workbench(mut self, workbench_id: &str) -> Self {
        self.workbench_id = Some(workbench_id.to_string());
        self
    }

    pub fn with_scope_hash(mut self, scope_hash: &str) -> Self {
        self.scope_hash = Some(scope_hash.to_string());
        self
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_retry_after(mut self, hint: Duration) -> Self {
        self.retry_after_ms = Some(hint.as_millis() as u64);
        self
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }

    pub fn code(&self) -> ErrorCode {
        self.error_code
    }
}

/// Filesystem and path errors raised below the engine facade.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid workbench id: {0:?}")]
    InvalidWorkbenchId(String),

    #[error("Path escapes its root: {0}")]
    SandboxViolation(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("{0}")]
    Rejected(String),

    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt record {path:?}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

impl StorageError {
    pub fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Read {
            path: path.into(),
            source,
        }
    }

    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Write {
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::InvalidWorkbenchId(_) | StorageError::SandboxViolation(_) => {
                ErrorCode::SandboxViolation
            }
            StorageError::InvalidPath(_)
            | StorageError::NotFound(_)
            | StorageError::AlreadyExists(_)
            | StorageError::Rejected(_) => ErrorCode::ValidationFailed,
            StorageError::Read { .. } | StorageError::Corrupt { .. } => ErrorCode::FileReadFailed,
            StorageError::Write { source, .. } => {
                if source.raw_os_error() == Some(ENOSPC) {
                    ErrorCode::DiskFull
                } else {
                    ErrorCode::FileWriteFailed
                }
            }
        }
    }

    pub fn into_info(self, phase: Phase) -> ErrorInfo {
        ErrorInfo::new(self.code(), phase, self.to_string())
    }
}

/// Attach a phase while converting a storage result into an [`ErrorInfo`] result.
pub trait InPhase<T> {
    fn in_phase(self, phase: Phase) -> Result<T, ErrorInfo>;
}

impl<T> InPhase<T> for Result<T, StorageError> {
    fn in_phase(self, phase: Phase) -> Result<T, ErrorInfo> {
        self.map_err(|e| e.into_info(phase))
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}
