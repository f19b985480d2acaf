//! Tool Worker client
//!
//! Format-specific work (office documents, PDFs) is delegated to a local child process speaking
//! line-delimited JSON-RPC 2.0 over stdio. Calls are serialized over the one pipe. A crashed or
//! unresponsive worker is restarted on the next call; after repeated failures it is disabled.

use crate::error::{ErrorCode, ErrorInfo, Phase};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const JSONRPC_VERSION: &str = "2.0";
const MAX_RESTARTS: u32 = 3;
const UNAVAILABLE_CODE: &str = "TOOL_WORKER_UNAVAILABLE";

pub mod methods {
    pub const XLSX_APPLY_OPS: &str = "XlsxApplyOps";
    pub const DOCX_APPLY_OPS: &str = "DocxApplyOps";
    pub const PPTX_APPLY_OPS: &str = "PptxApplyOps";
    pub const DOCX_EXTRACT_TEXT: &str = "DocxExtractText";
    pub const PPTX_EXTRACT_TEXT: &str = "PptxExtractText";
    pub const PDF_EXTRACT_TEXT: &str = "PdfExtractText";
    pub const XLSX_GET_INFO: &str = "XlsxGetInfo";
    pub const WORKER_GET_INFO: &str = "WorkerGetInfo";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolWorkerConfig {
    /// Worker executable; without one every call is `TOOL_WORKER_UNAVAILABLE`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_call_timeout_ms() -> u64 {
    60_000
}

impl Default for ToolWorkerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ToolWorkerError {
    #[error("tool worker unavailable: {0}")]
    Unavailable(String),

    #[error("{code}: {message}")]
    Remote { code: String, message: String },

    #[error("tool worker protocol error: {0}")]
    Protocol(String),
}

impl ToolWorkerError {
    /// Map to the engine taxonomy. Unclassified remote failures count as read or write failures
    /// depending on the operation.
    pub fn into_info(self, phase: Phase, writing: bool) -> ErrorInfo {
        match self {
            ToolWorkerError::Unavailable(detail) | ToolWorkerError::Protocol(detail) => {
                ErrorInfo::new(ErrorCode::ToolWorkerUnavailable, phase, detail)
            }
            ToolWorkerError::Remote { code, message } => {
                let mapped = match code.as_str() {
                    "VALIDATION_FAILED" => ErrorCode::ValidationFailed,
                    "SANDBOX_VIOLATION" => ErrorCode::SandboxViolation,
                    "FILE_READ_FAILED" => ErrorCode::FileReadFailed,
                    "FILE_WRITE_FAILED" => ErrorCode::FileWriteFailed,
                    _ if writing => ErrorCode::FileWriteFailed,
                    _ => ErrorCode::FileReadFailed,
                };
                ErrorInfo::new(mapped, phase, message)
            }
        }
    }
}

#[async_trait]
pub trait ToolWorker: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, ToolWorkerError>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

fn map_rpc_error(error: RpcError) -> ToolWorkerError {
    let mut code = error
        .data
        .as_ref()
        .and_then(|d| d.get("error_code"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if code.is_empty() && error.message.eq_ignore_ascii_case(UNAVAILABLE_CODE) {
        code = UNAVAILABLE_CODE.to_string();
    }
    if code == UNAVAILABLE_CODE {
        return ToolWorkerError::Unavailable(error.message);
    }
    ToolWorkerError::Remote {
        code,
        message: error.message,
    }
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

#[derive(Default)]
struct WorkerState {
    running: Option<Running>,
    failures: u32,
    disabled: bool,
    next_id: u64,
}

/// Child-process worker speaking JSON-RPC over stdio.
pub struct SubprocessWorker {
    config: ToolWorkerConfig,
    workdir: Option<PathBuf>,
    state: Mutex<WorkerState>,
}

impl SubprocessWorker {
    pub fn new(config: ToolWorkerConfig, workdir: Option<PathBuf>) -> Self {
        Self {
            config,
            workdir,
            state: Mutex::new(WorkerState::default()),
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.call_timeout_ms)
    }

    fn spawn(&self) -> Result<Running, ToolWorkerError> {
        let command = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| ToolWorkerError::Unavailable("tool worker is not configured".into()))?;
        let mut cmd = Command::new(command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| ToolWorkerError::Unavailable(format!("failed to start {command}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolWorkerError::Unavailable("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolWorkerError::Unavailable("worker stdout unavailable".into()))?;
        info!(command, "Tool worker started");
        Ok(Running {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    /// Clear the disabled state so the next call may start the worker again.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.failures = 0;
        state.disabled = false;
        info!("Tool worker failure state cleared");
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut running) = state.running.take() {
            let _ = running.child.kill().await;
        }
    }

    fn record_failure(state: &mut WorkerState, reason: &str) {
        state.running = None;
        state.failures += 1;
        if state.failures > MAX_RESTARTS {
            state.disabled = true;
            warn!(failures = state.failures, reason, "Tool worker disabled");
        } else {
            warn!(failures = state.failures, reason, "Tool worker failed, will restart");
        }
    }
}

async fn exchange(
    running: &mut Running,
    id: u64,
    line: &[u8],
) -> Result<Result<Value, ToolWorkerError>, String> {
    running
        .stdin
        .write_all(line)
        .await
        .map_err(|e| format!("write failed: {e}"))?;
    running
        .stdin
        .flush()
        .await
        .map_err(|e| format!("flush failed: {e}"))?;

    loop {
        let next = running
            .stdout
            .next_line()
            .await
            .map_err(|e| format!("read failed: {e}"))?;
        let Some(text) = next else {
            return Err("worker exited".to_string());
        };
        if text.trim().is_empty() {
            continue;
        }
        let response: RpcResponse = match serde_json::from_str(&text) {
            Ok(response) => response,
            Err(_) => {
                debug!(line = %text, "Ignoring non-protocol worker output");
                continue;
            }
        };
        if response.id != Some(id) {
            continue;
        }
        if let Some(error) = response.error {
            return Ok(Err(map_rpc_error(error)));
        }
        return Ok(Ok(response.result.unwrap_or(Value::Null)));
    }
}

#[async_trait]
impl ToolWorker for SubprocessWorker {
    async fn call(&self, method: &str, params: Value) -> Result<Value, ToolWorkerError> {
        let mut state = self.state.lock().await;
        if state.disabled {
            return Err(ToolWorkerError::Unavailable(
                "tool worker disabled after repeated failures".into(),
            ));
        }
        if state.running.is_none() {
            match self.spawn() {
                Ok(running) => state.running = Some(running),
                Err(e) => {
                    if self.config.command.is_some() {
                        Self::record_failure(&mut state, "spawn failed");
                    }
                    return Err(e);
                }
            }
        }

        state.next_id += 1;
        let id = state.next_id;
        let mut line = serde_json::to_vec(&RpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        })
        .map_err(|e| ToolWorkerError::Protocol(e.to_string()))?;
        line.push(b'\n');

        let timeout = self.call_timeout();
        let outcome = match state.running.as_mut() {
            Some(running) => tokio::time::timeout(timeout, exchange(running, id, &line)).await,
            None => return Err(ToolWorkerError::Unavailable("worker not running".into())),
        };

        match outcome {
            Ok(Ok(result)) => {
                state.failures = 0;
                debug!(method, id, ok = result.is_ok(), "Tool worker call finished");
                result
            }
            Ok(Err(reason)) => {
                Self::record_failure(&mut state, &reason);
                Err(ToolWorkerError::Unavailable(reason))
            }
            Err(_) => {
                if let Some(mut running) = state.running.take() {
                    let _ = running.child.kill().await;
                }
                Self::record_failure(&mut state, "call timed out");
                Err(ToolWorkerError::Unavailable(format!(
                    "{method} timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }
}

/// Parameters shared by the `*ApplyOps` methods.
pub fn apply_ops_params(
    workbench_id: &str,
    path: &str,
    ops: &Value,
    create_new: bool,
    copy_from: Option<&str>,
) -> Value {
    let mut params = json!({
        "workbench_id": workbench_id,
        "path": path,
        "ops": ops,
        "root": "draft",
        "create_new": create_new,
    });
    if let Some(source) = copy_from {
        params["copy_from"] = json!(source);
    }
    params
}
